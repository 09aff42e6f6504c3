//! Address map: ordered, non-overlapping logical-to-physical extents.
//!
//! Extents live in an arena and are referenced by stable [`ExtentId`]
//! handles. Two B-tree indices sit on top of the arena: one keyed by
//! starting LBA, one keyed by starting physical address. Trim holes
//! (`Pba::INVALID`) appear only in the logical index.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};

use crate::types::{Lba, Pba};

/// Stable handle of an extent in the arena.
pub type ExtentId = usize;

/// A contiguous logical range mapped to a contiguous physical range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// First logical sector.
    pub lba: Lba,
    /// First physical sector, or `Pba::INVALID` for a trimmed hole.
    pub pba: Pba,
    /// Length in sectors.
    pub len: u32,
    /// Not yet checkpointed.
    pub dirty: bool,
}

impl Extent {
    /// One past the last logical sector.
    pub fn end(&self) -> Lba {
        self.lba + self.len as u64
    }

    /// True for a trim placeholder.
    pub fn is_hole(&self) -> bool {
        !self.pba.is_valid()
    }
}

/// Where a mapping comes from. Decides dirtiness of the new extent and
/// whether a hole placeholder is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapOrigin {
    /// Host write or trim that no checkpoint has seen yet.
    Live,
    /// Replayed from a checkpoint MAP record.
    Checkpoint,
    /// Replayed from a DATA trailer found after the last checkpoint.
    Log,
}

/// The address map.
#[derive(Debug, Default)]
pub struct ExtentMap {
    slots: Vec<Option<Extent>>,
    free_slots: Vec<ExtentId>,
    by_lba: BTreeMap<Lba, ExtentId>,
    by_pba: BTreeMap<Pba, ExtentId>,
}

impl ExtentMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of extents, holes included.
    pub fn count(&self) -> usize {
        self.by_lba.len()
    }

    /// True when nothing is mapped.
    pub fn is_empty(&self) -> bool {
        self.by_lba.is_empty()
    }

    /// Extent behind a handle.
    ///
    /// Panics on a stale handle; handles are only valid until the extent
    /// is removed.
    pub fn get(&self, id: ExtentId) -> &Extent {
        match self.slots.get(id).and_then(Option::as_ref) {
            Some(extent) => extent,
            None => panic!("stale extent handle {}", id),
        }
    }

    /// Sets or clears the dirty flag.
    pub fn set_dirty(&mut self, id: ExtentId, dirty: bool) {
        if let Some(Some(extent)) = self.slots.get_mut(id) {
            extent.dirty = dirty;
        }
    }

    /// Adds an extent. The caller guarantees it overlaps nothing.
    pub fn insert(&mut self, lba: Lba, pba: Pba, len: u32, dirty: bool) -> ExtentId {
        debug_assert!(len > 0, "zero-length extent at lba {}", lba);
        let extent = Extent { lba, pba, len, dirty };
        let id = match self.free_slots.pop() {
            Some(id) => {
                self.slots[id] = Some(extent);
                id
            }
            None => {
                self.slots.push(Some(extent));
                self.slots.len() - 1
            }
        };
        let prior = self.by_lba.insert(lba, id);
        debug_assert!(prior.is_none(), "duplicate lba key {}", lba);
        if pba.is_valid() {
            let prior = self.by_pba.insert(pba, id);
            debug_assert!(prior.is_none(), "duplicate pba key {}", pba);
        }
        id
    }

    /// Removes an extent and returns it.
    pub fn remove(&mut self, id: ExtentId) -> Extent {
        let extent = *self.get(id);
        self.by_lba.remove(&extent.lba);
        if extent.pba.is_valid() {
            self.by_pba.remove(&extent.pba);
        }
        self.slots[id] = None;
        self.free_slots.push(id);
        extent
    }

    /// Re-keys an extent in place and marks it dirty.
    pub fn update(&mut self, id: ExtentId, lba: Lba, pba: Pba, len: u32) {
        debug_assert!(len > 0, "zero-length extent at lba {}", lba);
        let old = *self.get(id);
        if old.lba != lba {
            self.by_lba.remove(&old.lba);
            self.by_lba.insert(lba, id);
        }
        if old.pba != pba {
            if old.pba.is_valid() {
                self.by_pba.remove(&old.pba);
            }
            if pba.is_valid() {
                self.by_pba.insert(pba, id);
            }
        }
        self.slots[id] = Some(Extent {
            lba,
            pba,
            len,
            dirty: true,
        });
    }

    /// First extent containing `lba` or starting after it.
    pub fn lba_geq(&self, lba: Lba) -> Option<ExtentId> {
        if let Some((_, &id)) = self.by_lba.range(..=lba).next_back() {
            if self.get(id).end() > lba {
                return Some(id);
            }
        }
        self.by_lba.range((Excluded(lba), Unbounded)).next().map(|(_, &id)| id)
    }

    /// First live extent containing `pba` or starting after it, in band
    /// then offset order.
    pub fn pba_geq(&self, pba: Pba) -> Option<ExtentId> {
        if let Some((&start, &id)) = self.by_pba.range(..=pba).next_back() {
            if start.band == pba.band && start.offset as u64 + self.get(id).len as u64 > pba.offset as u64 {
                return Some(id);
            }
        }
        self.by_pba.range((Excluded(pba), Unbounded)).next().map(|(_, &id)| id)
    }

    /// Logical successor.
    pub fn lba_next(&self, id: ExtentId) -> Option<ExtentId> {
        let lba = self.get(id).lba;
        self.by_lba.range((Excluded(lba), Unbounded)).next().map(|(_, &id)| id)
    }

    /// Physical successor.
    pub fn pba_next(&self, id: ExtentId) -> Option<ExtentId> {
        let pba = self.get(id).pba;
        self.by_pba.range((Excluded(pba), Unbounded)).next().map(|(_, &id)| id)
    }

    /// Extents in logical order.
    pub fn iter(&self) -> impl Iterator<Item = (ExtentId, &Extent)> + '_ {
        self.by_lba.values().map(move |&id| (id, self.get(id)))
    }

    /// Live extents physically inside `band`, in offset order.
    pub fn extents_in_band(&self, band: u32) -> Vec<Extent> {
        self.by_pba
            .range(Pba::new(band, 0)..=Pba::new(band, u32::MAX - 1))
            .map(|(_, &id)| *self.get(id))
            .collect()
    }

    /// Live (non-hole) sectors physically inside `band`.
    pub fn live_sectors_in_band(&self, band: u32) -> u64 {
        self.extents_in_band(band).iter().map(|e| e.len as u64).sum()
    }

    /// Extents overlapping the logical range `[start, end)`.
    pub fn extents_in_range(&self, start: Lba, end: Lba) -> Vec<Extent> {
        let mut out = Vec::new();
        let mut cur = self.lba_geq(start);
        while let Some(id) = cur {
            let extent = self.get(id);
            if extent.lba >= end {
                break;
            }
            out.push(*extent);
            cur = self.lba_next(id);
        }
        out
    }

    /// Maps `[lba, lba + len)` to `pba`, overwriting whatever was there.
    ///
    /// Neighbours are fixed up in a strict order: split a containing
    /// extent, truncate a tail overlap, drop covered extents, then advance
    /// a head overlap. Every touched extent becomes dirty. A hole replayed
    /// from the log only clears the range; a live one leaves a placeholder
    /// for the next checkpoint to record.
    pub fn update_range(&mut self, lba: Lba, len: u32, pba: Pba, origin: MapOrigin) {
        debug_assert!(len > 0, "zero-length mapping at lba {}", lba);
        let end = lba + len as u64;
        let mut cur = self.lba_geq(lba);

        if let Some(id) = cur {
            let e = *self.get(id);
            if e.lba < lba && e.end() > end {
                let right_len = (e.end() - end) as u32;
                let right_pba = e.pba.add(e.len - right_len);
                self.update(id, e.lba, e.pba, (lba - e.lba) as u32);
                cur = Some(self.insert(end, right_pba, right_len, true));
            } else if e.lba < lba {
                self.update(id, e.lba, e.pba, (lba - e.lba) as u32);
                cur = self.lba_next(id);
            }
        }

        while let Some(id) = cur {
            if self.get(id).end() > end {
                break;
            }
            cur = self.lba_next(id);
            self.remove(id);
        }

        if let Some(id) = cur {
            let e = *self.get(id);
            if end > e.lba {
                let n = (end - e.lba) as u32;
                self.update(id, e.lba + n as u64, e.pba.add(n), e.len - n);
            }
        }

        if pba.is_valid() || origin == MapOrigin::Live {
            self.insert(lba, pba, len, origin != MapOrigin::Checkpoint);
        }
        debug_assert!(self.check_invariants().is_ok());
    }

    /// Verifies both orderings are strictly non-overlapping.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut prev_end: Option<Lba> = None;
        for (_, e) in self.iter() {
            if let Some(end) = prev_end {
                if e.lba < end {
                    return Err(format!("extent at lba {} overlaps previous end {}", e.lba, end));
                }
            }
            prev_end = Some(e.end());
        }
        let mut prev: Option<(Pba, u32)> = None;
        for (&start, &id) in &self.by_pba {
            let len = self.get(id).len;
            if let Some((p, plen)) = prev {
                if p.band == start.band && p.offset as u64 + plen as u64 > start.offset as u64 {
                    return Err(format!("extent at {} overlaps previous at {}", start, p));
                }
            }
            prev = Some((start, len));
        }
        Ok(())
    }
}
