//! C9 - lock-free statistics and health counters.
//!
//! Every field is an independently monotonic atomic; no cross-counter
//! consistency is promised or required.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, safe to share across threads without locking.
#[derive(Default)]
pub struct Stats {
    /// Reads dispatched through `map`, hit or miss.
    pub total_reads: AtomicU64,
    /// Writes dispatched through `map`, hit or miss.
    pub total_writes: AtomicU64,
    /// Remaps successfully installed via the lazy-remap path.
    pub total_remaps_installed: AtomicU64,
    /// I/O errors observed while completing a bio, excluding `IoError::Closed`.
    pub total_io_errors: AtomicU64,
    /// Write groups that failed on all five copies.
    pub total_persistence_failures: AtomicU64,
    /// Remap-index resize operations (grow or shrink).
    pub resize_events: AtomicU64,
    /// High-water mark of concurrently in-flight bios.
    pub in_flight_max: AtomicU64,
}

/// A point-in-time, read-only copy of [`Stats`] for external consumers,
/// returned by [`crate::device::Device::status`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// See [`Stats::total_reads`].
    pub total_reads: u64,
    /// See [`Stats::total_writes`].
    pub total_writes: u64,
    /// See [`Stats::total_remaps_installed`].
    pub total_remaps_installed: u64,
    /// See [`Stats::total_io_errors`].
    pub total_io_errors: u64,
    /// See [`Stats::total_persistence_failures`].
    pub total_persistence_failures: u64,
    /// See [`Stats::resize_events`].
    pub resize_events: u64,
    /// See [`Stats::in_flight_max`].
    pub in_flight_max: u64,
}

impl Stats {
    /// Creates a zeroed counter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new `in_flight` observation against the running maximum.
    /// Lock-free via a compare-and-swap retry loop.
    pub fn observe_in_flight(&self, current: u64) {
        let mut max = self.in_flight_max.load(Ordering::Relaxed);
        while current > max {
            match self.in_flight_max.compare_exchange_weak(
                max,
                current,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => max = observed,
            }
        }
    }

    /// Takes a consistent-enough snapshot for reporting; individual
    /// counters may be mid-update relative to each other but each value is
    /// itself a real, once-observed count.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_reads: self.total_reads.load(Ordering::Relaxed),
            total_writes: self.total_writes.load(Ordering::Relaxed),
            total_remaps_installed: self.total_remaps_installed.load(Ordering::Relaxed),
            total_io_errors: self.total_io_errors.load(Ordering::Relaxed),
            total_persistence_failures: self.total_persistence_failures.load(Ordering::Relaxed),
            resize_events: self.resize_events.load(Ordering::Relaxed),
            in_flight_max: self.in_flight_max.load(Ordering::Relaxed),
        }
    }
}
