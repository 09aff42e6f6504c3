#![warn(missing_docs)]

//! Shingle translation layer: a randomly writable block volume on top of
//! append-only zoned (SMR) devices.
//!
//! Host writes are appended to a per-group frontier band with a trailer
//! that records where the data landed. An in-memory extent map translates
//! logical sectors to physical ones; it is made durable by checkpoints in
//! dedicated metadata bands and rebuilt on open by replaying the latest
//! checkpoint and chasing the frontiers. Cleaning reclaims bands full of
//! overwritten data, and defragmentation keeps logical ranges contiguous.

pub mod band;
pub mod config;
pub mod error;
pub mod map;
pub mod record;
pub mod superblock;
pub mod types;
pub mod volume;
pub mod zone;
pub mod zone_file;

mod checkpoint;
mod clean;
mod defrag;
mod maintenance;
mod read;
mod recovery;
mod write;

pub use band::{Band, BandTable, Group};
pub use config::{FormatConfig, MaintenanceConfig, VolumeConfig};
pub use error::{StlError, StlResult};
pub use map::{Extent, ExtentId, ExtentMap, MapOrigin};
pub use record::{BandRecord, LogHeader, MapRecord, RecordKind};
pub use superblock::{Superblock, SUPERBLOCK_VERSION};
pub use types::{BandType, CheckpointKind, Lba, Pba, Priority, SECTOR_SIZE, STL_MAGIC};
pub use volume::{GroupStatus, Volume, VolumeStats};
pub use zone::{MemZoneDevice, ZoneDevice, ZoneIoStats};
pub use zone_file::FileZoneDevice;
