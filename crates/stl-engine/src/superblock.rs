//! Superblock: volume identity and band layout, stored in sector 0 of band 0.
//!
//! Layout of the device:
//! - Band 0: superblock
//! - Bands 1..=map_bands: checkpoint log
//! - Remaining bands: `n_groups` groups of `group_size` data bands each

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::FormatConfig;
use crate::error::{StlError, StlResult};
use crate::types::{Lba, SECTOR_SIZE, STL_MAGIC};

/// Current superblock version.
pub const SUPERBLOCK_VERSION: u8 = 1;

/// Volume identity and geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Superblock {
    /// Magic number (`STL_MAGIC`).
    pub magic: u32,
    /// Format version.
    pub version: u8,
    /// Random identifier assigned at format time.
    pub volume_uuid: [u8; 16],
    /// Bands used by the volume (superblock + map + groups).
    pub n_bands: u32,
    /// Sectors per band.
    pub band_size: u32,
    /// Bands per group.
    pub group_size: u32,
    /// Logical sectors per group.
    pub group_span: u64,
    /// Number of groups.
    pub n_groups: u32,
    /// Number of metadata bands.
    pub map_bands: u32,
    /// Physical sectors covered by `n_bands`.
    pub disk_size: u64,
    /// Format timestamp (seconds since epoch).
    pub created_at_secs: u64,
    /// CRC32 of the encoded superblock with this field zeroed.
    pub checksum: u32,
}

impl Superblock {
    /// Lays out a volume on a device of `band_count` bands of `band_size`
    /// sectors.
    pub fn new(band_count: u32, band_size: u32, config: &FormatConfig) -> StlResult<Self> {
        if config.map_bands < 2 {
            return Err(StlError::InvalidConfig(format!(
                "need at least 2 map bands, got {}",
                config.map_bands
            )));
        }
        if config.group_bands < 4 {
            return Err(StlError::InvalidConfig(format!(
                "need at least 4 bands per group, got {}",
                config.group_bands
            )));
        }
        if !(config.over_provisioning > 1.0) {
            return Err(StlError::InvalidConfig(format!(
                "over-provisioning must exceed 1.0, got {}",
                config.over_provisioning
            )));
        }
        if band_size < 64 {
            return Err(StlError::InvalidConfig(format!(
                "band size {} is too small",
                band_size
            )));
        }
        let reserved = 1 + config.map_bands;
        if band_count < reserved + config.group_bands {
            return Err(StlError::InvalidConfig(format!(
                "device has {} bands, need at least {}",
                band_count,
                reserved + config.group_bands
            )));
        }

        let n_groups = (band_count - reserved) / config.group_bands;
        let group_span =
            ((config.group_bands as u64 * band_size as u64) as f64 / config.over_provisioning) as u64;
        let n_bands = reserved + n_groups * config.group_bands;
        let created_at_secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let mut sb = Self {
            magic: STL_MAGIC,
            version: SUPERBLOCK_VERSION,
            volume_uuid: *uuid::Uuid::new_v4().as_bytes(),
            n_bands,
            band_size,
            group_size: config.group_bands,
            group_span,
            n_groups,
            map_bands: config.map_bands,
            disk_size: n_bands as u64 * band_size as u64,
            created_at_secs,
            checksum: 0,
        };
        sb.update_checksum();
        Ok(sb)
    }

    /// Validates magic, version and checksum.
    pub fn validate(&self) -> StlResult<()> {
        if self.magic != STL_MAGIC {
            debug!(
                expected = STL_MAGIC,
                actual = self.magic,
                "invalid superblock magic"
            );
            return Err(StlError::CorruptedSuperblock {
                reason: format!(
                    "invalid magic: expected {:#x}, got {:#x}",
                    STL_MAGIC, self.magic
                ),
            });
        }
        if self.version != SUPERBLOCK_VERSION {
            return Err(StlError::CorruptedSuperblock {
                reason: format!(
                    "unsupported version: expected {}, got {}",
                    SUPERBLOCK_VERSION, self.version
                ),
            });
        }
        let computed = self.compute_checksum();
        if computed != self.checksum {
            debug!(
                expected = self.checksum,
                actual = computed,
                "superblock checksum mismatch"
            );
            return Err(StlError::CorruptedSuperblock {
                reason: format!(
                    "checksum mismatch: expected {:#x}, got {:#x}",
                    self.checksum, computed
                ),
            });
        }
        if self.n_bands != 1 + self.map_bands + self.n_groups * self.group_size {
            return Err(StlError::CorruptedSuperblock {
                reason: format!(
                    "band count {} disagrees with layout ({} map bands, {} x {} group bands)",
                    self.n_bands, self.map_bands, self.n_groups, self.group_size
                ),
            });
        }
        Ok(())
    }

    /// Checks the superblock against the device it was read from.
    pub fn validate_device(&self, band_count: u32, band_size: u32) -> StlResult<()> {
        if self.band_size != band_size {
            return Err(StlError::CorruptedSuperblock {
                reason: format!(
                    "band size {} does not match device band size {}",
                    self.band_size, band_size
                ),
            });
        }
        if self.n_bands > band_count {
            return Err(StlError::CorruptedSuperblock {
                reason: format!(
                    "volume needs {} bands, device has {}",
                    self.n_bands, band_count
                ),
            });
        }
        Ok(())
    }

    /// CRC32 over the encoded superblock with the checksum zeroed.
    pub fn compute_checksum(&self) -> u32 {
        let mut copy = self.clone();
        copy.checksum = 0;
        let bytes = bincode::serialize(&copy).unwrap_or_default();
        crc32fast::hash(&bytes)
    }

    /// Recomputes and stores the checksum.
    pub fn update_checksum(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// Serializes into one zero-padded sector.
    pub fn to_bytes(&self) -> StlResult<Vec<u8>> {
        let mut bytes = bincode::serialize(self)?;
        if bytes.len() > SECTOR_SIZE {
            return Err(StlError::SerializationError {
                reason: format!("superblock too large: {} bytes", bytes.len()),
            });
        }
        bytes.resize(SECTOR_SIZE, 0);
        Ok(bytes)
    }

    /// Decodes and validates a superblock sector.
    pub fn from_bytes(data: &[u8]) -> StlResult<Self> {
        let sb: Superblock =
            bincode::deserialize(data).map_err(|e| StlError::CorruptedSuperblock {
                reason: format!("deserialization failed: {}", e),
            })?;
        sb.validate()?;
        Ok(sb)
    }

    /// Logical capacity in sectors.
    pub fn size_sectors(&self) -> u64 {
        self.group_span * self.n_groups as u64
    }

    /// First band of group `group`.
    pub fn group_first_band(&self, group: u32) -> u32 {
        1 + self.map_bands + group * self.group_size
    }

    /// Group owning data band `band`, or `None` for the superblock and map
    /// bands.
    pub fn group_of_band(&self, band: u32) -> Option<u32> {
        if band <= self.map_bands || band >= self.n_bands {
            return None;
        }
        Some((band - 1 - self.map_bands) / self.group_size)
    }

    /// Group owning logical sector `lba`.
    pub fn group_of_lba(&self, lba: Lba) -> u32 {
        (lba / self.group_span) as u32
    }

    /// Logical range `[start, end)` of group `group`.
    pub fn group_lba_range(&self, group: u32) -> (Lba, Lba) {
        let start = group as u64 * self.group_span;
        (start, start + self.group_span)
    }

    /// True for the metadata bands.
    pub fn is_map_band(&self, band: u32) -> bool {
        band >= 1 && band <= self.map_bands
    }

    /// Map band following `band`, wrapping after the last one.
    pub fn next_map_band(&self, band: u32) -> u32 {
        if band >= self.map_bands {
            1
        } else {
            band + 1
        }
    }
}
