//! Block I/O request representation shared by [`crate::dispatcher`] and
//! [`crate::io`].
//!
//! This is deliberately far smaller than a kernel `struct bio`: there is no
//! scatter-gather list and no splitting/merging, because every request here
//! is already a single contiguous run of sectors against one of exactly two
//! devices. What it keeps from that ancestry is the shape: a monotonic id,
//! an explicit direction, and a buffer sized to the sector count.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::IoError;

static BIO_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// 512-byte sector size assumed throughout this crate.
pub const SECTOR_SIZE: usize = 512;

/// Direction of a block I/O request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Read from the device into the bio's buffer.
    Read,
    /// Write the bio's buffer to the device.
    Write,
}

/// Which device a bio was ultimately routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Delivered directly to the main device (no remap present).
    Main,
    /// Redirected to the spare device at the given spare sector.
    Spare(u64),
}

/// A single block I/O request against a logical sector range on the main
/// device, as seen by the host submission path.
pub struct Bio {
    /// Unique, monotonically increasing identifier (diagnostics only).
    pub id: u64,
    /// Starting logical sector on the main device.
    pub sector: u64,
    /// Number of 512-byte sectors covered by this request.
    pub len_sectors: u32,
    /// Read or write.
    pub direction: Direction,
    /// Data buffer; `len() == len_sectors * SECTOR_SIZE`.
    pub buffer: Vec<u8>,
    /// Set by [`crate::dispatcher::Dispatcher::map`] once the routing
    /// decision has been made; `None` before `map` runs.
    pub route: Option<Route>,
}

impl Bio {
    /// Creates a read bio with a zeroed buffer of the given sector length.
    pub fn read(sector: u64, len_sectors: u32) -> Self {
        Self::new(sector, len_sectors, Direction::Read, vec![0u8; len_sectors as usize * SECTOR_SIZE])
    }

    /// Creates a write bio carrying the given buffer.
    ///
    /// # Panics
    ///
    /// Panics if `buffer.len()` is not a multiple of [`SECTOR_SIZE`].
    pub fn write(sector: u64, buffer: Vec<u8>) -> Self {
        assert_eq!(buffer.len() % SECTOR_SIZE, 0, "bio buffer must be sector-aligned");
        let len_sectors = (buffer.len() / SECTOR_SIZE) as u32;
        Self::new(sector, len_sectors, Direction::Write, buffer)
    }

    fn new(sector: u64, len_sectors: u32, direction: Direction, buffer: Vec<u8>) -> Self {
        Self {
            id: BIO_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            sector,
            len_sectors,
            direction,
            buffer,
            route: None,
        }
    }

    /// Ending logical sector (exclusive).
    pub fn end_sector(&self) -> u64 {
        self.sector + self.len_sectors as u64
    }
}

impl core::fmt::Debug for Bio {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Bio")
            .field("id", &self.id)
            .field("sector", &self.sector)
            .field("len_sectors", &self.len_sectors)
            .field("direction", &self.direction)
            .field("route", &self.route)
            .finish()
    }
}

/// Outcome of completing a bio, as observed by the dispatcher's completion
/// handling inside `map`.
pub type BioStatus = Result<(), IoError>;
