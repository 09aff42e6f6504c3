//! Error types for the volume engine.

use thiserror::Error;

/// Result type alias for volume operations.
pub type StlResult<T> = Result<T, StlError>;

/// Error variants for volume operations.
#[derive(Debug, Error)]
pub enum StlError {
    /// Wraps standard I/O errors from file-backed devices.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// The zoned device rejected or failed a request.
    #[error("Device error on band {band}: {reason}")]
    DeviceError {
        /// Band the request targeted.
        band: u32,
        /// Description of the failure.
        reason: String,
    },

    /// A write did not start at the band's write pointer.
    #[error("Write pointer mismatch on band {band}: expected {expected}, got {actual}")]
    WritePointerMismatch {
        /// Band the write targeted.
        band: u32,
        /// The device write pointer.
        expected: u32,
        /// The offset the caller asked for.
        actual: u32,
    },

    /// No free band could be obtained for the group, even after cleaning.
    #[error("Out of space in group {group}")]
    OutOfSpace {
        /// Group that ran out of bands.
        group: u32,
    },

    /// A cleaning pass could not reach its free-band target.
    #[error("Cleaning failed for group {group}: {reason}")]
    CleaningFailed {
        /// Group being cleaned.
        group: u32,
        /// Why the pass gave up.
        reason: String,
    },

    /// Superblock is missing, corrupted or incompatible with the device.
    #[error("Corrupted superblock: {reason}")]
    CorruptedSuperblock {
        /// Description of the corruption.
        reason: String,
    },

    /// A metadata log record could not be decoded or broke the chain.
    #[error("Corrupted log at band {band} offset {offset}: {reason}")]
    CorruptedLog {
        /// Band holding the record.
        band: u32,
        /// Sector offset of the record.
        offset: u32,
        /// Description of the corruption.
        reason: String,
    },

    /// No metadata band holds a usable checkpoint.
    #[error("No valid checkpoint found in {map_bands} metadata bands")]
    NoValidCheckpoint {
        /// Number of metadata bands searched.
        map_bands: u32,
    },

    /// The request extends beyond the volume.
    #[error("Out of range: lba {lba} + {sectors} sectors exceeds volume size {size}")]
    OutOfRange {
        /// First sector of the request.
        lba: u64,
        /// Sector count of the request.
        sectors: u64,
        /// Volume size in sectors.
        size: u64,
    },

    /// In-memory map or band table state broke one of its invariants.
    #[error("Invariant violated: {reason}")]
    InvariantViolation {
        /// Which invariant and where.
        reason: String,
    },

    /// Format or volume parameters are unusable.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {reason}")]
    SerializationError {
        /// Description of the error.
        reason: String,
    },
}

impl From<bincode::Error> for StlError {
    fn from(err: bincode::Error) -> Self {
        StlError::SerializationError {
            reason: err.to_string(),
        }
    }
}
