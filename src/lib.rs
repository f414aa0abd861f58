//! A bad-sector remapping block engine.
//!
//! Sits between a filesystem and a pair of block devices: a *main* device
//! carrying primary data and a *spare* device carrying replacement capacity
//! plus this crate's own metadata. When a read from the main device fails,
//! the engine allocates a substitute sector on the spare device, records
//! the redirection, and persists it across restarts; subsequent reads of
//! the failed logical sector are served from the spare transparently.
//!
//! The pieces, leaves first:
//!
//! - [`io`] - the [`io::SectorIo`] port abstracting a single block device.
//! - [`codec`] - CRC32 and the 4 KiB on-disk metadata frame.
//! - [`remap_index`] - the concurrent logical-to-spare-sector table.
//! - [`allocator`] - spare-sector allocation honoring metadata reservations.
//! - [`metadata`] - five-copy recovery and write-group persistence.
//! - [`writer`] - the cancellable async writer built on [`metadata`].
//! - [`dispatcher`] - the per-request `map` hot path.
//! - [`device`] - [`device::Device`], the lifecycle-managed handle tying
//!   everything together.
//! - [`stats`] - lock-free counters and a read-only snapshot.
//!
//! Most embedders only need [`device::Device`] and [`device::DeviceConfig`];
//! the component modules are public so the pieces can be tested and reused
//! independently.

pub mod allocator;
pub mod bio;
pub mod codec;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod io;
pub mod metadata;
pub mod remap_index;
pub mod stats;
pub mod writer;

pub use bio::{Bio, Direction, Route, SECTOR_SIZE};
pub use device::{Device, DeviceConfig};
pub use dispatcher::{DispatcherPolicy, MapOutcome};
pub use stats::StatsSnapshot;
