//! C3 - the concurrent remap index: `LSec -> RemapEntry` with load-factor
//! driven resize.
//!
//! An array of `num_buckets` singly-linked bucket chains (`Vec<Vec<usize>>`
//! of indices into a flat entry list), plus the flat list itself for cheap
//! snapshotting and iteration. A single `RwLock` guards both; readers take
//! the shared side, `insert` (and the resize it may trigger) takes the
//! exclusive side. Finer-grained schemes (sharded locks, lock-free buckets)
//! would scale better under heavy insert contention, but remap installation
//! is rare enough relative to steady-state I/O that the simpler design
//! suffices.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use bitflags::bitflags;

use crate::error::InsertResult;

/// Minimum (and initial) bucket count. Always a power of two.
pub const MIN_BUCKETS: u32 = 64;
/// Scaled load factor above which the next successful insert doubles the
/// bucket count.
const GROW_THRESHOLD_SCALED: u64 = 150;
/// Scaled load factor below which the next successful insert halves the
/// bucket count (floor `MIN_BUCKETS`).
const SHRINK_THRESHOLD_SCALED: u64 = 50;
/// Maximum live entry count; an insert beyond this returns
/// [`InsertResult::WouldExceedCapacity`].
pub const MAX_ENTRIES: u64 = u32::MAX as u64;

bitflags! {
    /// Per-entry status bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RemapFlags: u32 {
        /// The entry is live and should be consulted by the dispatcher.
        const VALID = 0b001;
        /// The entry has been durably written to at least one metadata copy.
        const PERSISTED = 0b010;
        /// The entry is live but has not yet been durably persisted.
        const PENDING_PERSIST = 0b100;
    }
}

/// One logical-sector-to-spare-sector redirection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemapEntry {
    /// Logical sector on the main device.
    pub logical: u64,
    /// Spare sector on the spare device.
    pub spare: u64,
    /// Creation timestamp, nanoseconds.
    pub created_at_nanos: u64,
    /// Consecutive failure count observed for `logical` before this entry
    /// was installed; used by the configurable remap-threshold policy.
    pub error_count: u32,
    /// Status bits.
    pub flags: RemapFlags,
}

fn hash(lsec: u64) -> u64 {
    lsec ^ (lsec >> 32)
}

struct Inner {
    buckets: Vec<Vec<usize>>,
    entries: Vec<RemapEntry>,
}

impl Inner {
    fn new(num_buckets: u32) -> Self {
        Self { buckets: vec![Vec::new(); num_buckets as usize], entries: Vec::new() }
    }

    fn bucket_for(&self, lsec: u64) -> usize {
        (hash(lsec) & (self.buckets.len() as u64 - 1)) as usize
    }

    fn find(&self, lsec: u64) -> Option<usize> {
        let bucket = &self.buckets[self.bucket_for(lsec)];
        bucket.iter().copied().find(|&idx| self.entries[idx].logical == lsec)
    }

    fn rebucket(&mut self, new_num_buckets: u32) {
        let mut new_buckets = vec![Vec::new(); new_num_buckets as usize];
        let mask = new_num_buckets as u64 - 1;
        for (idx, entry) in self.entries.iter().enumerate() {
            let b = (hash(entry.logical) & mask) as usize;
            new_buckets[b].push(idx);
        }
        self.buckets = new_buckets;
    }
}

/// The remap index itself. Cheap to construct, expensive-ish to resize
/// (O(count)), never expensive to read.
pub struct RemapIndex {
    inner: RwLock<Inner>,
    version: AtomicU64,
}

impl RemapIndex {
    /// Creates an empty index with [`MIN_BUCKETS`] buckets.
    pub fn new() -> Self {
        Self::with_bucket_count(MIN_BUCKETS)
    }

    /// Creates an empty index with a caller-chosen initial bucket count.
    /// Intended for tests that want to observe resize behavior without
    /// inserting hundreds of entries; `num_buckets` is rounded up to the
    /// next power of two and floored at [`MIN_BUCKETS`].
    pub fn with_bucket_count(num_buckets: u32) -> Self {
        let n = num_buckets.max(MIN_BUCKETS).next_power_of_two();
        Self { inner: RwLock::new(Inner::new(n)), version: AtomicU64::new(0) }
    }

    /// Looks up the spare sector redirecting `lsec`, if any. Lock-free with
    /// respect to other readers; blocks only behind an in-progress `insert`.
    pub fn lookup(&self, lsec: u64) -> Option<u64> {
        let inner = self.inner.read().unwrap();
        inner.find(lsec).map(|idx| inner.entries[idx].spare)
    }

    /// Inserts `entry`, keyed by `entry.logical`. Idempotent: re-inserting
    /// an already-present logical sector is a no-op that reports
    /// [`InsertResult::AlreadyPresent`].
    pub fn insert(&self, entry: RemapEntry) -> InsertResult {
        let mut inner = self.inner.write().unwrap();
        if inner.find(entry.logical).is_some() {
            return InsertResult::AlreadyPresent;
        }
        if inner.entries.len() as u64 >= MAX_ENTRIES {
            return InsertResult::WouldExceedCapacity;
        }

        let idx = inner.entries.len();
        inner.entries.push(entry);
        let bucket = inner.bucket_for(entry.logical);
        inner.buckets[bucket].push(idx);
        self.version.fetch_add(1, Ordering::AcqRel);

        self.maybe_resize(&mut inner);
        InsertResult::Inserted
    }

    fn maybe_resize(&self, inner: &mut Inner) {
        let count = inner.entries.len() as u64;
        let num_buckets = inner.buckets.len() as u64;
        let load_scaled = (count * 100) / num_buckets;

        let new_num_buckets = if load_scaled > GROW_THRESHOLD_SCALED {
            Some(num_buckets * 2)
        } else if load_scaled < SHRINK_THRESHOLD_SCALED && num_buckets > MIN_BUCKETS as u64 {
            Some((num_buckets / 2).max(MIN_BUCKETS as u64))
        } else {
            None
        };

        if let Some(new_n) = new_num_buckets {
            inner.rebucket(new_n as u32);
            self.version.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Returns a stable copy of every live entry, suitable for persistence.
    pub fn snapshot(&self) -> Vec<RemapEntry> {
        self.inner.read().unwrap().entries.clone()
    }

    /// Number of live entries.
    pub fn len(&self) -> u32 {
        self.inner.read().unwrap().entries.len() as u32
    }

    /// `true` if the index has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current bucket count.
    pub fn bucket_count(&self) -> u32 {
        self.inner.read().unwrap().buckets.len() as u32
    }

    /// Monotonic version, incremented on every mutating operation
    /// (insert and resize); used by callers that need to detect a
    /// concurrent mutation across a multi-step read.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Updates an existing entry's flags in place (used by the metadata
    /// engine to flip `PENDING_PERSIST` to `PERSISTED` after a successful
    /// write group). No-op if `lsec` is not present.
    pub fn mark_flags(&self, lsec: u64, flags: RemapFlags) {
        let mut inner = self.inner.write().unwrap();
        if let Some(idx) = inner.find(lsec) {
            inner.entries[idx].flags = flags;
            self.version.fetch_add(1, Ordering::AcqRel);
        }
    }
}

impl Default for RemapIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(lsec: u64, ssec: u64) -> RemapEntry {
        RemapEntry {
            logical: lsec,
            spare: ssec,
            created_at_nanos: 0,
            error_count: 0,
            flags: RemapFlags::VALID | RemapFlags::PENDING_PERSIST,
        }
    }

    #[test]
    fn insert_then_lookup() {
        let idx = RemapIndex::new();
        assert_eq!(idx.insert(entry(10, 20)), InsertResult::Inserted);
        assert_eq!(idx.lookup(10), Some(20));
        assert_eq!(idx.lookup(11), None);
    }

    #[test]
    fn duplicate_insert_is_no_op() {
        let idx = RemapIndex::new();
        assert_eq!(idx.insert(entry(10, 20)), InsertResult::Inserted);
        assert_eq!(idx.insert(entry(10, 99)), InsertResult::AlreadyPresent);
        assert_eq!(idx.lookup(10), Some(20));
    }

    #[test]
    fn minimum_bucket_count_holds() {
        let idx = RemapIndex::new();
        assert_eq!(idx.bucket_count(), MIN_BUCKETS);
    }

    #[test]
    fn resize_at_100_entries_reaches_128_buckets() {
        let idx = RemapIndex::new();
        for i in 0..100 {
            idx.insert(entry(i, i * 2));
        }
        assert!(idx.bucket_count() >= 128);
        for i in 0..100 {
            assert_eq!(idx.lookup(i), Some(i * 2));
        }
    }

    #[test]
    fn snapshot_matches_inserted_set_across_resizes() {
        let idx = RemapIndex::new();
        for i in 0..300 {
            idx.insert(entry(i, i + 1000));
        }
        let mut snap = idx.snapshot();
        snap.sort_by_key(|e| e.logical);
        assert_eq!(snap.len(), 300);
        for (i, e) in snap.iter().enumerate() {
            assert_eq!(e.logical, i as u64);
            assert_eq!(e.spare, i as u64 + 1000);
        }
    }

    #[test]
    fn version_advances_on_insert() {
        let idx = RemapIndex::new();
        let v0 = idx.version();
        idx.insert(entry(1, 2));
        assert!(idx.version() > v0);
    }
}
