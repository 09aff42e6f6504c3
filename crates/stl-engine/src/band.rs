//! Band and group state.
//!
//! Each data band is FREE, FULL or FRONTIER; each group aggregates the
//! counts of its bands and owns exactly one FRONTIER at a time. The table
//! is pure bookkeeping; device I/O happens in the volume.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::superblock::Superblock;
use crate::types::{BandType, Pba};

/// Per-band state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Band {
    /// FREE, FULL or FRONTIER.
    pub kind: BandType,
    /// Next sector to allocate. Runs ahead of the device pointer while an
    /// append is in flight.
    pub write_pointer: u32,
    /// Changed since the last checkpoint.
    pub dirty: bool,
}

/// Per-group state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Band counts indexed by [`BandType::index`].
    pub counts: [u32; 3],
    /// The current frontier band.
    pub frontier: u32,
    /// End of the last append in the frontier whose map update is applied.
    /// Logged as the frontier's write pointer; recovery chases from here.
    pub frontier_offset: u32,
    /// Most recently written log header in this group.
    pub prev: Pba,
    /// A cleaning pass owns this group.
    pub cleaning: bool,
}

impl Group {
    /// Free bands in the group.
    pub fn free(&self) -> u32 {
        self.counts[BandType::Free.index()]
    }

    /// Full bands in the group.
    pub fn full(&self) -> u32 {
        self.counts[BandType::Full.index()]
    }
}

/// Band table plus group table.
#[derive(Debug, Clone)]
pub struct BandTable {
    bands: Vec<Band>,
    groups: Vec<Group>,
    first_data_band: u32,
    group_size: u32,
}

impl BandTable {
    /// Creates a table with every data band FREE and no frontiers. Callers
    /// fill it from a checkpoint or from [`BandTable::formatted`].
    pub fn new(sb: &Superblock) -> Self {
        Self {
            bands: vec![Band::default(); sb.n_bands as usize],
            groups: vec![Group::default(); sb.n_groups as usize],
            first_data_band: 1 + sb.map_bands,
            group_size: sb.group_size,
        }
    }

    /// State of a freshly formatted volume: the first band of each group is
    /// the frontier, everything else is free.
    pub fn formatted(sb: &Superblock) -> Self {
        let mut table = Self::new(sb);
        for g in 0..sb.n_groups {
            let first = table.group_bands(g).start;
            table.bands[first as usize].kind = BandType::Frontier;
            table.groups[g as usize].frontier = first;
        }
        table.recount();
        table
    }

    /// Number of bands in the table (superblock and map bands included).
    pub fn band_count(&self) -> u32 {
        self.bands.len() as u32
    }

    /// Number of groups.
    pub fn group_count(&self) -> u32 {
        self.groups.len() as u32
    }

    /// Band indices owned by group `g`.
    pub fn group_bands(&self, g: u32) -> std::ops::Range<u32> {
        let start = self.first_data_band + g * self.group_size;
        start..start + self.group_size
    }

    /// Group owning a data band.
    pub fn group_of(&self, band: u32) -> Option<u32> {
        if band < self.first_data_band || band >= self.band_count() {
            return None;
        }
        Some((band - self.first_data_band) / self.group_size)
    }

    /// Band state.
    pub fn band(&self, band: u32) -> &Band {
        &self.bands[band as usize]
    }

    /// Mutable band state.
    pub fn band_mut(&mut self, band: u32) -> &mut Band {
        &mut self.bands[band as usize]
    }

    /// Group state.
    pub fn group(&self, g: u32) -> &Group {
        &self.groups[g as usize]
    }

    /// Mutable group state.
    pub fn group_mut(&mut self, g: u32) -> &mut Group {
        &mut self.groups[g as usize]
    }

    /// Changes a band's type, keeping group counts and the frontier in step
    /// and marking the band dirty.
    pub fn set_kind(&mut self, band: u32, kind: BandType) {
        let old = self.bands[band as usize].kind;
        self.bands[band as usize].kind = kind;
        self.bands[band as usize].dirty = true;
        if let Some(g) = self.group_of(band) {
            let group = &mut self.groups[g as usize];
            group.counts[old.index()] -= 1;
            group.counts[kind.index()] += 1;
            if kind == BandType::Frontier {
                group.frontier = band;
            }
        }
        debug!(band, from = ?old, to = ?kind, "band state change");
    }

    /// Picks the lowest FREE band of group `g`, provided more than
    /// `reserve` free bands remain. The reserve is what lets high-priority
    /// callers (reserve 0) claim bands normal allocation may not.
    pub fn find_free_band(&self, g: u32, reserve: u32) -> Option<u32> {
        if self.groups[g as usize].free() <= reserve {
            return None;
        }
        self.group_bands(g)
            .find(|&band| self.bands[band as usize].kind == BandType::Free)
    }

    /// Rebuilds every group's counts and frontier from the band types.
    pub fn recount(&mut self) {
        for g in 0..self.group_count() {
            let mut counts = [0u32; 3];
            let mut frontier = None;
            for band in self.group_bands(g) {
                let kind = self.bands[band as usize].kind;
                counts[kind.index()] += 1;
                if kind == BandType::Frontier {
                    frontier = Some(band);
                }
            }
            let group = &mut self.groups[g as usize];
            group.counts = counts;
            if let Some(band) = frontier {
                group.frontier = band;
            }
        }
    }

    /// Bands changed since the last checkpoint.
    pub fn dirty_bands(&self) -> impl Iterator<Item = u32> + '_ {
        (self.first_data_band..self.band_count()).filter(move |&b| self.bands[b as usize].dirty)
    }

    /// Every data band.
    pub fn data_bands(&self) -> std::ops::Range<u32> {
        self.first_data_band..self.band_count()
    }

    /// Checks the per-group invariants: counts add up and there is
    /// exactly one frontier, which is the one recorded.
    pub fn check_invariants(&self) -> Result<(), String> {
        for g in 0..self.group_count() {
            let group = &self.groups[g as usize];
            let total: u32 = group.counts.iter().sum();
            if total != self.group_size {
                return Err(format!("group {} counts {:?} do not add up", g, group.counts));
            }
            let frontiers: Vec<u32> = self
                .group_bands(g)
                .filter(|&b| self.bands[b as usize].kind == BandType::Frontier)
                .collect();
            if frontiers != [group.frontier] {
                return Err(format!(
                    "group {} frontier {} but frontier bands {:?}",
                    g, group.frontier, frontiers
                ));
            }
        }
        Ok(())
    }
}
