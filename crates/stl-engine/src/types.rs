//! Core address and state types shared across the engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sector size in bytes. Every device transfer is a whole number of sectors.
pub const SECTOR_SIZE: usize = 4096;

/// Magic stamped on the superblock and on every log header ("\x7fSTL").
pub const STL_MAGIC: u32 = 0x4c54537f;

/// Logical sector address.
pub type Lba = u64;

/// Physical sector address: a band and a sector offset within it.
///
/// Ordering is by band, then offset, which is the order the reverse map
/// index walks a band in. The default is [`Pba::NULL`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pba {
    /// Band (zone) index on the device.
    pub band: u32,
    /// Sector offset within the band.
    pub offset: u32,
}

impl Pba {
    /// Marks a trimmed (unmapped) extent.
    pub const INVALID: Pba = Pba {
        band: u32::MAX,
        offset: u32::MAX,
    };

    /// "Not yet checkpointed" location marker. Band 0 holds only the
    /// superblock, so no log record ever lives here.
    pub const NULL: Pba = Pba { band: 0, offset: 0 };

    /// Creates a physical address.
    pub const fn new(band: u32, offset: u32) -> Self {
        Self { band, offset }
    }

    /// Returns true unless this is the trim-hole sentinel.
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    /// Returns the address `n` sectors further into the same band.
    /// Holes stay holes.
    pub fn add(self, n: u32) -> Self {
        if self.is_valid() {
            Self::new(self.band, self.offset + n)
        } else {
            self
        }
    }
}

impl fmt::Display for Pba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}:{}", self.band, self.offset)
        } else {
            write!(f, "invalid")
        }
    }
}

/// State of a data band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum BandType {
    /// Empty and available for allocation.
    #[default]
    Free,
    /// Sealed; holds data but takes no more appends.
    Full,
    /// The group's active append target.
    Frontier,
}

impl BandType {
    /// Index into per-group count arrays.
    pub fn index(self) -> usize {
        match self {
            BandType::Free => 0,
            BandType::Full => 1,
            BandType::Frontier => 2,
        }
    }
}

/// Allocation priority. High priority may claim the last free bands of a
/// group, normal priority must leave a reserve behind for cleaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Priority {
    /// Host writes and background maintenance.
    #[default]
    Normal,
    /// Writes issued by a forced cleaning pass.
    High,
}

/// Kind of checkpoint to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckpointKind {
    /// Only dirty bands and extents; `base` stays put.
    Incremental,
    /// Every band and extent; `base` advances to this checkpoint.
    Full,
}

/// Number of sectors needed to hold `bytes` bytes.
pub fn sectors_for(bytes: usize) -> usize {
    bytes.div_ceil(SECTOR_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pba_ordering() {
        let a = Pba::new(3, 900);
        let b = Pba::new(4, 0);
        let c = Pba::new(4, 1);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_pba_add_keeps_holes() {
        assert_eq!(Pba::new(5, 10).add(6), Pba::new(5, 16));
        assert_eq!(Pba::INVALID.add(6), Pba::INVALID);
    }

    #[test]
    fn test_pba_sentinels() {
        assert!(!Pba::INVALID.is_valid());
        assert!(Pba::NULL.is_valid());
        assert_ne!(Pba::NULL, Pba::INVALID);
    }

    #[test]
    fn test_pba_default_is_null() {
        assert_eq!(Pba::default(), Pba::NULL);
    }

    #[test]
    fn test_pba_display() {
        assert_eq!(Pba::new(2, 7).to_string(), "2:7");
        assert_eq!(Pba::INVALID.to_string(), "invalid");
    }

    #[test]
    fn test_band_type_index() {
        assert_eq!(BandType::Free.index(), 0);
        assert_eq!(BandType::Full.index(), 1);
        assert_eq!(BandType::Frontier.index(), 2);
        assert_eq!(BandType::default(), BandType::Free);
    }

    #[test]
    fn test_sectors_for() {
        assert_eq!(sectors_for(0), 0);
        assert_eq!(sectors_for(1), 1);
        assert_eq!(sectors_for(SECTOR_SIZE), 1);
        assert_eq!(sectors_for(SECTOR_SIZE + 1), 2);
    }
}
