//! Crate-wide error taxonomy.
//!
//! Every fallible operation in this crate returns one of these enums rather
//! than a boxed `dyn Error`: callers on the hot path (the dispatcher) need
//! to match on specific variants without downcasting.

use thiserror::Error;

/// Failure reported by a [`crate::io::SectorIo`] operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IoError {
    /// The underlying medium reported a hard error at the given sector.
    #[error("media error at sector {0}")]
    MediaError(u64),
    /// A transient condition (e.g. a retryable bus error); not a remap trigger.
    #[error("transient I/O error at sector {0}")]
    Transient(u64),
    /// The device is being torn down; the caller must not retry.
    #[error("device closed")]
    Closed,
}

/// Failure decoding a [`crate::codec`] frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The magic number did not match `DMR4`.
    #[error("bad magic number")]
    Magic,
    /// The format version is not one this codec understands.
    #[error("unsupported format version")]
    Version,
    /// The CRC32 over the frame (minus the trailing CRC) did not match.
    #[error("CRC mismatch")]
    Crc,
    /// The entry count in the header is inconsistent with the frame size.
    #[error("entry count out of bounds for frame size")]
    Framing,
}

/// Outcome of [`crate::remap_index::RemapIndex::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    /// The entry was newly inserted.
    Inserted,
    /// An entry for this logical sector already exists; the call was a no-op.
    AlreadyPresent,
    /// Inserting would overflow the index's maximum entry count.
    WouldExceedCapacity,
}

/// Failure from [`crate::allocator::SpareAllocator::alloc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// No unreserved spare sector remains.
    #[error("spare device exhausted")]
    Exhausted,
}

/// Failure from a [`crate::metadata::MetadataEngine`] write group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MetadataError {
    /// All five copies failed to write; the remap stays `PENDING_PERSIST`.
    #[error("all metadata copies failed to write")]
    AllCopiesFailed,
}

/// Failure from [`crate::writer::AsyncWriter::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WaitError {
    /// The wait exceeded its deadline; the underlying I/O may still complete.
    #[error("wait timed out")]
    Timeout,
    /// The write was cancelled before it completed.
    #[error("write cancelled")]
    Cancelled,
    /// The write completed, but failed.
    #[error("write failed: {0}")]
    Failed(#[source] MetadataError),
}

/// Failure constructing a [`crate::device::Device`].
#[derive(Debug, Error)]
pub enum ConstructError {
    /// Opening the main or spare device failed.
    #[error("failed to open {which} device")]
    DeviceOpenFailed {
        /// Which of the two devices failed to open.
        which: DeviceKind,
        /// The underlying I/O failure.
        #[source]
        source: IoError,
    },
    /// Metadata recovery could not establish a usable state.
    #[error("metadata recovery failed")]
    MetadataRecoveryFailed,
    /// The on-disk format is not one this engine understands.
    #[error("incompatible on-disk format")]
    IncompatibleFormat,
}

/// Identifies which backing device an error pertains to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// The primary data device.
    Main,
    /// The spare/replacement device, which also carries metadata.
    Spare,
}

impl core::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            DeviceKind::Main => write!(f, "main"),
            DeviceKind::Spare => write!(f, "spare"),
        }
    }
}
