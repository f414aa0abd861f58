//! C8 - the lifecycle controller and `Device` handle.
//!
//! States: `Constructing -> Active -> PreSuspending -> Suspended ->
//! Destroyed`. `Device` itself is the host-facing object the crate's
//! external interface is a set of methods on.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::warn;

use crate::allocator::SpareAllocator;
use crate::bio::Bio;
use crate::dispatcher::{Dispatcher, DispatcherPolicy, MapOutcome};
use crate::error::ConstructError;
use crate::io::SectorIo;
use crate::metadata::{self, MetadataEngine};
use crate::remap_index::RemapIndex;
use crate::stats::{Stats, StatsSnapshot};
use crate::writer::AsyncWriter;

/// Construction and runtime tuning parameters. Generalizes the classic
/// positional `(main_device_path, spare_device_path)` constructor into a
/// struct an embedder can build piecemeal; this crate takes already-opened
/// [`SectorIo`] handles rather than path strings, since opening a device
/// from a path is a host-integration concern outside this crate's scope.
pub struct DeviceConfig {
    /// The primary data device.
    pub main: Arc<dyn SectorIo>,
    /// The replacement-capacity-plus-metadata device.
    pub spare: Arc<dyn SectorIo>,
    /// Stable identifier stamped into every metadata frame's main-UUID field.
    pub main_uuid: String,
    /// Stable identifier stamped into every metadata frame's spare-UUID field.
    pub spare_uuid: String,
    /// Remap-index bucket-count override, for tests that want to observe
    /// resize behavior without inserting hundreds of entries. `None` uses
    /// [`crate::remap_index::MIN_BUCKETS`].
    pub initial_bucket_count: Option<u32>,
    /// Consecutive `MediaError`s on an LSec required before a remap is
    /// installed.
    pub remap_threshold: u32,
    /// Bounded budget `PreSuspending -> Suspended` waits for `in_flight`
    /// to drain before proceeding anyway with a logged warning.
    pub drain_timeout: Duration,
    /// Bounded budget for waiting on the writer's in-flight write group
    /// during the same transition.
    pub writer_wait_timeout: Duration,
}

impl DeviceConfig {
    /// Builds a config from just the two required device handles, with
    /// every other field at its documented default.
    pub fn new(main: Arc<dyn SectorIo>, spare: Arc<dyn SectorIo>) -> Self {
        Self {
            main,
            spare,
            main_uuid: String::new(),
            spare_uuid: String::new(),
            initial_bucket_count: None,
            remap_threshold: 1,
            drain_timeout: Duration::from_secs(5),
            writer_wait_timeout: Duration::from_secs(2),
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Constructing = 0,
    Active = 1,
    PreSuspending = 2,
    Suspended = 3,
    Destroyed = 4,
}

impl From<u8> for LifecycleState {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::Constructing,
            1 => Self::Active,
            2 => Self::PreSuspending,
            3 => Self::Suspended,
            _ => Self::Destroyed,
        }
    }
}

/// The runtime device instance: owns every other component and coordinates
/// their lifetimes.
pub struct Device {
    state: AtomicU8,
    shutdown: Arc<AtomicBool>,
    in_flight: Arc<AtomicU64>,
    dispatcher: Dispatcher,
    writer: Arc<AsyncWriter>,
    stats: Arc<Stats>,
    drain_timeout: Duration,
    writer_wait_timeout: Duration,
}

impl Device {
    /// `Constructing -> Active`.
    pub fn construct(config: DeviceConfig) -> Result<Arc<Device>, ConstructError> {
        let main_sectors = config.main.total_sectors();
        let spare_sectors = config.spare.total_sectors();

        let allocator = Arc::new(SpareAllocator::new(spare_sectors));
        for sec in metadata::reserved_sectors() {
            allocator.reserve(sec);
        }

        let engine = Arc::new(MetadataEngine::new(
            config.spare.clone(),
            &config.main_uuid,
            &config.spare_uuid,
        ));
        let outcome = engine.recover()?;

        if let (Some(recorded_main), Some(recorded_spare)) =
            (outcome.recorded_main_sectors, outcome.recorded_spare_sectors)
        {
            if recorded_main != main_sectors || recorded_spare != spare_sectors {
                return Err(ConstructError::IncompatibleFormat);
            }
        }

        let index = Arc::new(match config.initial_bucket_count {
            Some(n) => RemapIndex::with_bucket_count(n),
            None => RemapIndex::new(),
        });
        for entry in &outcome.entries {
            allocator.mark_allocated(entry.spare);
            index.insert(*entry);
        }

        if !outcome.needs_repair.is_empty() {
            let repair_engine = engine.clone();
            let sequence = outcome.sequence;
            let entries = outcome.entries.clone();
            let needs_repair = outcome.needs_repair.clone();
            std::thread::Builder::new()
                .name("blockremap-metadata-repair".into())
                .spawn(move || {
                    if repair_engine
                        .write_copies(&needs_repair, sequence, &entries, main_sectors, spare_sectors)
                        .is_err()
                    {
                        warn!("metadata repair-on-recovery failed for copies {needs_repair:?}");
                    }
                })
                .ok();
        }

        let stats = Arc::new(Stats::default());
        let writer = AsyncWriter::spawn(engine, stats.clone());
        let shutdown = Arc::new(AtomicBool::new(false));
        let in_flight = Arc::new(AtomicU64::new(0));

        let dispatcher = Dispatcher::new(
            config.main,
            config.spare,
            index,
            allocator,
            writer.clone(),
            stats.clone(),
            DispatcherPolicy { remap_threshold: config.remap_threshold },
            shutdown.clone(),
            in_flight.clone(),
            main_sectors,
            spare_sectors,
            outcome.sequence,
        );

        Ok(Arc::new(Device {
            state: AtomicU8::new(LifecycleState::Active as u8),
            shutdown,
            in_flight,
            dispatcher,
            writer,
            stats,
            drain_timeout: config.drain_timeout,
            writer_wait_timeout: config.writer_wait_timeout,
        }))
    }

    fn state(&self) -> LifecycleState {
        LifecycleState::from(self.state.load(Ordering::Acquire))
    }

    /// Routes, submits, and fully completes `bio` before returning;
    /// delegates to the dispatcher. There is no separate completion method:
    /// this crate's reference I/O backends are synchronous, so by the time
    /// `map` returns the bio is already done.
    pub fn map(&self, bio: &mut Bio) -> MapOutcome {
        self.dispatcher.map(bio)
    }

    /// `Active -> PreSuspending`. Rejects new `map` calls with `Kill`;
    /// signals the writer to cancel any in-flight write *before* returning,
    /// so a caller waiting in `postsuspend` can never deadlock against a
    /// write the writer hasn't been told to abandon yet.
    pub fn presuspend(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.state.store(LifecycleState::PreSuspending as u8, Ordering::Release);
        if let Some(handle) = self.dispatcher.last_handle() {
            self.writer.cancel(&handle);
        }
    }

    /// `PreSuspending -> Suspended`. Waits, with a bounded budget, for
    /// `in_flight` to reach zero and for the writer to observe cancellation.
    pub fn postsuspend(&self) {
        let deadline = Instant::now() + self.drain_timeout;
        while self.in_flight.load(Ordering::Acquire) != 0 {
            if Instant::now() >= deadline {
                warn!("postsuspend: drain timed out with in_flight != 0, proceeding anyway");
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        if let Some(handle) = self.dispatcher.last_handle() {
            let _ = self.writer.wait(&handle, self.writer_wait_timeout);
        }

        self.state.store(LifecycleState::Suspended as u8, Ordering::Release);
    }

    /// `Suspended -> Destroyed`. Joins the writer thread; the work queue is
    /// empty by construction at this point.
    pub fn destruct(&self) {
        if self.state() != LifecycleState::Suspended {
            self.presuspend();
            self.postsuspend();
        }
        self.writer.shutdown();
        self.state.store(LifecycleState::Destroyed as u8, Ordering::Release);
    }

    /// Returns a point-in-time snapshot of this device's statistics.
    pub fn status(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Test hook: installs a remap directly, bypassing the failure path
    /// (used by hit-path and bulk-resize scenarios).
    pub fn install_remap_for_test(&self, lsec: u64, ssec: u64) {
        self.dispatcher.install_remap_for_test(lsec, ssec);
    }

    /// Looks up the current remap for `lsec`, if any.
    pub fn dispatcher_lookup(&self, lsec: u64) -> Option<u64> {
        self.dispatcher.lookup_remap(lsec)
    }

    /// Current remap-index bucket count.
    pub fn bucket_count(&self) -> u32 {
        self.dispatcher.bucket_count()
    }

    /// Test hook: forces a write group through the ordinary async-writer
    /// path without waiting on a real I/O failure to trigger one.
    pub fn force_write_group(&self) -> crate::writer::Handle {
        self.dispatcher.force_write_group()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bio::{Bio, Route};
    use crate::io::{FaultInjector, IoErrorKind, MemSectorIo};

    fn config() -> DeviceConfig {
        let main: Arc<dyn SectorIo> = Arc::new(MemSectorIo::new(1 << 20));
        let spare: Arc<dyn SectorIo> = Arc::new(MemSectorIo::new(1 << 16));
        DeviceConfig::new(main, spare)
    }

    #[test]
    fn construct_then_map_miss_goes_to_main() {
        let device = Device::construct(config()).unwrap();
        let mut bio = Bio::read(10, 1);
        assert_eq!(device.map(&mut bio), MapOutcome::Remapped);
        assert_eq!(bio.route, Some(Route::Main));
    }

    #[test]
    fn presuspend_rejects_new_bios() {
        let device = Device::construct(config()).unwrap();
        device.presuspend();
        let mut bio = Bio::read(10, 1);
        assert_eq!(device.map(&mut bio), MapOutcome::Kill);
    }

    #[test]
    fn full_lifecycle_does_not_hang() {
        let device = Device::construct(config()).unwrap();
        device.presuspend();
        device.postsuspend();
        device.destruct();
    }

    #[test]
    fn recovery_after_restart_preserves_remaps() {
        let faulted_main = Arc::new(FaultInjector::new(MemSectorIo::new(1 << 20)));
        faulted_main.fail_reads(777, 1, IoErrorKind::Media);
        let main: Arc<dyn SectorIo> = faulted_main;
        let spare: Arc<dyn SectorIo> = Arc::new(MemSectorIo::new(1 << 16));

        let installed_spare_sector = {
            let mut cfg = DeviceConfig::new(main.clone(), spare.clone());
            cfg.main_uuid = "main-1".into();
            cfg.spare_uuid = "spare-1".into();
            let device = Device::construct(cfg).unwrap();

            let mut bio = Bio::read(777, 1);
            device.map(&mut bio); // triggers lazy remap installation + async write group

            // Wait for the background write group to land before destruct,
            // so recovery on the next construct has something to find.
            std::thread::sleep(Duration::from_millis(100));

            device.presuspend();
            device.postsuspend();
            device.destruct();

            device.dispatcher_lookup(777).expect("remap installed")
        };

        let mut cfg2 = DeviceConfig::new(main, spare);
        cfg2.main_uuid = "main-1".into();
        cfg2.spare_uuid = "spare-1".into();
        let device2 = Device::construct(cfg2).unwrap();
        assert_eq!(device2.dispatcher_lookup(777), Some(installed_spare_sector));
    }
}
