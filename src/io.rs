//! C1 - sector I/O port.
//!
//! Abstracts a single block device down to two operations, synchronous
//! read/write plus an asynchronous write used only by the metadata writer.
//! One instance is bound to the main device, a second to the spare device;
//! [`crate::device::Device`] owns both.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read as _, Seek, SeekFrom, Write as _};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::bio::SECTOR_SIZE;
use crate::error::IoError;

/// Completion callback for [`SectorIo::submit_write`]; invoked exactly once.
pub type WriteCompletion = Box<dyn FnOnce(Result<(), IoError>) + Send>;

/// A block device, reduced to the operations this crate needs.
///
/// Implementors must not return `Ok` from `write` until the write is
/// ordered before subsequent reads of the same sectors on this device.
pub trait SectorIo: Send + Sync {
    /// Total addressable sectors on this device.
    fn total_sectors(&self) -> u64;

    /// Fills `buf` from `sec..sec+len_sectors`. `buf.len()` must equal
    /// `len_sectors * 512`.
    fn read(&self, sec: u64, len_sectors: u32, buf: &mut [u8]) -> Result<(), IoError>;

    /// Durably writes `buf` to `sec..sec+len_sectors`.
    fn write(&self, sec: u64, len_sectors: u32, buf: &[u8]) -> Result<(), IoError>;

    /// Submits a write without blocking the caller, invoking `completion`
    /// exactly once with the result. The default implementation performs
    /// the write synchronously before invoking the callback; implementors
    /// backed by real asynchronous I/O should override this to return
    /// before the write lands.
    fn submit_write(&self, sec: u64, len_sectors: u32, buf: &[u8], completion: WriteCompletion) {
        let result = self.write(sec, len_sectors, buf);
        completion(result);
    }

    /// Marks the device closed; subsequent operations should fail fast with
    /// [`IoError::Closed`] rather than touch the medium. Idempotent.
    fn close(&self);
}

/// In-memory sector device, the reference backend used by unit tests and
/// property tests. Not durable across process restarts by itself; see
/// [`FileSectorIo`] for that.
pub struct MemSectorIo {
    sectors: Mutex<Vec<u8>>,
    total_sectors: u64,
    closed: AtomicBool,
}

impl MemSectorIo {
    /// Creates a zeroed device of `total_sectors` sectors.
    pub fn new(total_sectors: u64) -> Self {
        Self {
            sectors: Mutex::new(vec![0u8; total_sectors as usize * SECTOR_SIZE]),
            total_sectors,
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<(), IoError> {
        if self.closed.load(Ordering::Acquire) {
            Err(IoError::Closed)
        } else {
            Ok(())
        }
    }

    fn bounds_ok(&self, sec: u64, len_sectors: u32, buf_len: usize) -> bool {
        buf_len == len_sectors as usize * SECTOR_SIZE
            && sec.saturating_add(len_sectors as u64) <= self.total_sectors
    }
}

impl SectorIo for MemSectorIo {
    fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    fn read(&self, sec: u64, len_sectors: u32, buf: &mut [u8]) -> Result<(), IoError> {
        self.check_open()?;
        if !self.bounds_ok(sec, len_sectors, buf.len()) {
            return Err(IoError::MediaError(sec));
        }
        let data = self.sectors.lock().unwrap();
        let start = sec as usize * SECTOR_SIZE;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write(&self, sec: u64, len_sectors: u32, buf: &[u8]) -> Result<(), IoError> {
        self.check_open()?;
        if !self.bounds_ok(sec, len_sectors, buf.len()) {
            return Err(IoError::MediaError(sec));
        }
        let mut data = self.sectors.lock().unwrap();
        let start = sec as usize * SECTOR_SIZE;
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// File-backed sector device using positioned reads/writes, for integration
/// tests that exercise real persistence across a simulated restart.
pub struct FileSectorIo {
    file: Mutex<File>,
    total_sectors: u64,
    closed: AtomicBool,
}

impl FileSectorIo {
    /// Opens `file`, which must already be at least `total_sectors * 512`
    /// bytes (callers typically `set_len` a fresh [`tempfile`] before this).
    pub fn new(file: File, total_sectors: u64) -> Self {
        Self {
            file: Mutex::new(file),
            total_sectors,
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<(), IoError> {
        if self.closed.load(Ordering::Acquire) {
            Err(IoError::Closed)
        } else {
            Ok(())
        }
    }
}

impl SectorIo for FileSectorIo {
    fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    fn read(&self, sec: u64, len_sectors: u32, buf: &mut [u8]) -> Result<(), IoError> {
        self.check_open()?;
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(sec * SECTOR_SIZE as u64))
            .map_err(|_| IoError::MediaError(sec))?;
        file.read_exact(buf).map_err(|_| IoError::MediaError(sec))
    }

    fn write(&self, sec: u64, len_sectors: u32, buf: &[u8]) -> Result<(), IoError> {
        self.check_open()?;
        debug_assert_eq!(buf.len(), len_sectors as usize * SECTOR_SIZE);
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(sec * SECTOR_SIZE as u64))
            .map_err(|_| IoError::MediaError(sec))?;
        file.write_all(buf).map_err(|_| IoError::MediaError(sec))?;
        file.flush().map_err(|_| IoError::MediaError(sec))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// What a [`FaultInjector`] should do the next time the given sector is hit.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// Fail the next N reads with the given error, then behave normally.
    FailReadsThenHeal(u32, IoErrorKind),
}

/// A small, serializable subset of [`IoError`] used to configure faults
/// without requiring the injector to know about sector numbers baked into
/// `IoError::MediaError`.
#[derive(Debug, Clone, Copy)]
pub enum IoErrorKind {
    /// See [`IoError::MediaError`].
    Media,
    /// See [`IoError::Transient`].
    Transient,
}

/// Wraps a [`SectorIo`] and injects configured failures, for exercising the
/// lazy-remap trigger path deterministically in tests.
pub struct FaultInjector<D: SectorIo> {
    inner: D,
    faults: Mutex<HashMap<u64, Fault>>,
}

impl<D: SectorIo> FaultInjector<D> {
    /// Wraps `inner` with no faults configured.
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            faults: Mutex::new(HashMap::new()),
        }
    }

    /// Configures `sector` to fail reads `count` times with `kind`, then
    /// heal (pass through to the inner device) on subsequent access.
    pub fn fail_reads(&self, sector: u64, count: u32, kind: IoErrorKind) {
        self.faults.lock().unwrap().insert(sector, Fault::FailReadsThenHeal(count, kind));
    }
}

impl<D: SectorIo> SectorIo for FaultInjector<D> {
    fn total_sectors(&self) -> u64 {
        self.inner.total_sectors()
    }

    fn read(&self, sec: u64, len_sectors: u32, buf: &mut [u8]) -> Result<(), IoError> {
        let mut faults = self.faults.lock().unwrap();
        if let Some(Fault::FailReadsThenHeal(remaining, kind)) = faults.get_mut(&sec) {
            if *remaining > 0 {
                *remaining -= 1;
                let kind = *kind;
                if *remaining == 0 {
                    faults.remove(&sec);
                }
                drop(faults);
                return Err(match kind {
                    IoErrorKind::Media => IoError::MediaError(sec),
                    IoErrorKind::Transient => IoError::Transient(sec),
                });
            }
        }
        drop(faults);
        self.inner.read(sec, len_sectors, buf)
    }

    fn write(&self, sec: u64, len_sectors: u32, buf: &[u8]) -> Result<(), IoError> {
        self.inner.write(sec, len_sectors, buf)
    }

    fn close(&self) {
        self.inner.close();
    }
}
