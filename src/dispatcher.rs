//! C7 - the per-request hot path: `Dispatcher::map`.
//!
//! **The bio-redirection trap.** A remapped bio is never mutated in place
//! and resubmitted against a different device while still carrying its
//! original device binding. `map` decides the route once and stamps it
//! onto the bio (`Bio::route`); the actual I/O is always issued through
//! the target device's own `SectorIo::read`/`write`, never by patching a
//! pointer on an in-flight request. The source repository this design is
//! drawn from recorded 17 separate crashes from exactly that shortcut.
//!
//! This crate's reference `SectorIo` backends are synchronous, so `map`
//! both issues the I/O and runs its own completion handling before
//! returning; there is no separate, externally-callable completion entry
//! point to race against it.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;

use crate::allocator::SpareAllocator;
use crate::bio::{Bio, Direction, Route};
use crate::error::{AllocError, IoError};
use crate::io::SectorIo;
use crate::remap_index::{RemapEntry, RemapFlags, RemapIndex};
use crate::stats::Stats;
use crate::writer::AsyncWriter;

/// Outcome of [`Dispatcher::map`], translated by the host integration into
/// its own platform conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapOutcome {
    /// The bio was routed (to main or spare), submitted, and fully
    /// completed (including any lazy-remap bookkeeping) before `map`
    /// returned.
    Remapped,
    /// The device is shutting down; the caller must drop the bio.
    Kill,
}

/// Policy knobs for the dispatcher's failure-handling path.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherPolicy {
    /// Consecutive `MediaError`s on a given LSec required before a remap is
    /// installed. Default `1`: the first failure is sufficient.
    pub remap_threshold: u32,
}

impl Default for DispatcherPolicy {
    fn default() -> Self {
        Self { remap_threshold: 1 }
    }
}

/// Per-LSec failure counts the dispatcher tracks between bios so a
/// configurable number of consecutive failures, not just the first, can be
/// required before a remap is installed. Kept out of `Bio` itself so `Bio`
/// stays a plain request shape; this bookkeeping is dispatcher-internal
/// accounting, not part of the bio's device binding.
struct PendingFailureCounts {
    inner: std::sync::Mutex<std::collections::HashMap<u64, u32>>,
}

impl PendingFailureCounts {
    fn new() -> Self {
        Self { inner: std::sync::Mutex::new(std::collections::HashMap::new()) }
    }

    fn bump(&self, lsec: u64) -> u32 {
        let mut map = self.inner.lock().unwrap();
        let count = map.entry(lsec).or_insert(0);
        *count += 1;
        *count
    }

    fn clear(&self, lsec: u64) {
        self.inner.lock().unwrap().remove(&lsec);
    }
}

/// The per-bio fast path: consults the remap index, routes to main or
/// spare, and on failure decides whether to install a new remap.
pub struct Dispatcher {
    main: Arc<dyn SectorIo>,
    spare: Arc<dyn SectorIo>,
    index: Arc<RemapIndex>,
    allocator: Arc<SpareAllocator>,
    writer: Arc<AsyncWriter>,
    stats: Arc<Stats>,
    policy: DispatcherPolicy,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
    in_flight: Arc<std::sync::atomic::AtomicU64>,
    pending_failures: PendingFailureCounts,
    main_sectors: u64,
    spare_sectors: u64,
    last_handle: std::sync::Mutex<Option<crate::writer::Handle>>,
    sequence: std::sync::atomic::AtomicU64,
}

impl Dispatcher {
    /// Builds a dispatcher over already-constructed components; owned by
    /// [`crate::device::Device`]. `recovered_sequence` seeds the write-group
    /// sequence counter so it continues strictly increasing across restarts
    /// rather than resetting to zero.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        main: Arc<dyn SectorIo>,
        spare: Arc<dyn SectorIo>,
        index: Arc<RemapIndex>,
        allocator: Arc<SpareAllocator>,
        writer: Arc<AsyncWriter>,
        stats: Arc<Stats>,
        policy: DispatcherPolicy,
        shutdown: Arc<std::sync::atomic::AtomicBool>,
        in_flight: Arc<std::sync::atomic::AtomicU64>,
        main_sectors: u64,
        spare_sectors: u64,
        recovered_sequence: u64,
    ) -> Self {
        Self {
            main,
            spare,
            index,
            allocator,
            writer,
            stats,
            policy,
            shutdown,
            in_flight,
            pending_failures: PendingFailureCounts::new(),
            main_sectors,
            spare_sectors,
            last_handle: std::sync::Mutex::new(None),
            sequence: std::sync::atomic::AtomicU64::new(recovered_sequence),
        }
    }

    /// The most recently submitted write-group handle, if any. The
    /// lifecycle controller cancels/waits on this during teardown.
    pub fn last_handle(&self) -> Option<crate::writer::Handle> {
        self.last_handle.lock().unwrap().clone()
    }

    /// Routes and submits `bio` against whichever device it resolves to,
    /// then runs completion handling (statistics, lazy-remap installation)
    /// before returning. This crate's reference `SectorIo` backends are
    /// synchronous, so there is no point at which a host could legitimately
    /// observe `bio` as still in flight after `map` returns; completion is
    /// therefore folded into `map` itself rather than exposed as a second
    /// public entry point a caller might invoke separately.
    pub fn map(&self, bio: &mut Bio) -> MapOutcome {
        if self.shutdown.load(Ordering::Acquire) {
            return MapOutcome::Kill;
        }
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.stats.observe_in_flight(now_in_flight);

        let route = match self.index.lookup(bio.sector) {
            Some(spare_sector) => Route::Spare(spare_sector),
            None => Route::Main,
        };
        bio.route = Some(route);

        let direction = bio.direction;
        let len_sectors = bio.len_sectors;
        let status = match route {
            Route::Spare(spare_sector) => {
                debug!("dispatcher: bio {} hit remap, routing to spare {}", bio.id, spare_sector);
                issue(&self.spare, spare_sector, len_sectors, direction, &mut bio.buffer)
            }
            Route::Main => issue(&self.main, bio.sector, len_sectors, direction, &mut bio.buffer),
        };

        match direction {
            Direction::Read => self.stats.total_reads.fetch_add(1, Ordering::Relaxed),
            Direction::Write => self.stats.total_writes.fetch_add(1, Ordering::Relaxed),
        };

        self.complete(bio, status);
        MapOutcome::Remapped
    }

    /// Completion handling: decrements `in_flight`, updates statistics, and
    /// on a qualifying read failure installs a lazy remap. Private: this
    /// reference implementation's I/O is synchronous, so `map` is the only
    /// caller and there is no legitimate out-of-line completion path.
    fn complete(&self, bio: &Bio, status: Result<(), IoError>) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);

        let Err(err) = status else {
            if bio.direction == Direction::Read {
                self.pending_failures.clear(bio.sector);
            }
            return;
        };

        if matches!(err, IoError::Closed) {
            return;
        }

        self.stats.total_io_errors.fetch_add(1, Ordering::Relaxed);

        let is_remap_trigger = matches!(err, IoError::MediaError(_))
            && bio.direction == Direction::Read
            && bio.route == Some(Route::Main)
            && self.index.lookup(bio.sector).is_none();

        if !is_remap_trigger {
            return;
        }

        let count = self.pending_failures.bump(bio.sector);
        if count < self.policy.remap_threshold {
            return;
        }
        self.pending_failures.clear(bio.sector);

        self.install_remap(bio.sector);
    }

    /// Direct index manipulation for integration tests that need to seed
    /// remaps without going through the failure path (the "via test hook"
    /// scenarios: hit-path and bulk-resize tests).
    pub fn install_remap_for_test(&self, lsec: u64, ssec: u64) {
        self.index.insert(RemapEntry {
            logical: lsec,
            spare: ssec,
            created_at_nanos: now_nanos(),
            error_count: 0,
            flags: RemapFlags::VALID | RemapFlags::PERSISTED,
        });
    }

    /// Looks up the current remap for `lsec`, if any.
    pub fn lookup_remap(&self, lsec: u64) -> Option<u64> {
        self.index.lookup(lsec)
    }

    /// Current remap-index bucket count.
    pub fn bucket_count(&self) -> u32 {
        self.index.bucket_count()
    }

    /// Test hook: snapshots the index and submits a write group through the
    /// ordinary async writer path, exactly as the failure path in
    /// [`Self::install_remap`] does. Used by tests that need a
    /// deterministic point at which to force persistence without waiting
    /// on a real I/O failure (the "force a write group" scenario step).
    pub fn force_write_group(&self) -> crate::writer::Handle {
        let snapshot = self.index.snapshot();
        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        let handle = self.writer.submit(sequence, snapshot, self.main_sectors, self.spare_sectors);
        *self.last_handle.lock().unwrap() = Some(handle.clone());
        handle
    }

    fn install_remap(&self, lsec: u64) {
        let spare_sector = match self.allocator.alloc() {
            Ok(s) => s,
            Err(AllocError::Exhausted) => {
                // total_io_errors was already bumped for the triggering MediaError;
                // spare exhaustion is counted under the same counter, not a new one.
                return;
            }
        };

        let entry = RemapEntry {
            logical: lsec,
            spare: spare_sector,
            created_at_nanos: now_nanos(),
            error_count: self.policy.remap_threshold,
            flags: RemapFlags::VALID | RemapFlags::PENDING_PERSIST,
        };

        let buckets_before = self.index.bucket_count();
        if self.index.insert(entry) != crate::error::InsertResult::Inserted {
            return;
        }
        if self.index.bucket_count() != buckets_before {
            self.stats.resize_events.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.total_remaps_installed.fetch_add(1, Ordering::Relaxed);

        let snapshot = self.index.snapshot();
        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        let handle = self.writer.submit(sequence, snapshot, self.main_sectors, self.spare_sectors);
        *self.last_handle.lock().unwrap() = Some(handle);
    }
}

fn issue(
    device: &Arc<dyn SectorIo>,
    sector: u64,
    len_sectors: u32,
    direction: Direction,
    buffer: &mut [u8],
) -> Result<(), IoError> {
    match direction {
        Direction::Read => device.read(sector, len_sectors, buffer),
        Direction::Write => device.write(sector, len_sectors, buffer),
    }
}

fn now_nanos() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0)
}
