//! Write path and frontier allocation.
//!
//! Every append is one device write of `header | data | trailer`. The
//! header links back to the group's previous record and forward to the
//! trailer; the trailer carries the inline map record and links to where
//! the next record will go. The address map only learns about the data
//! once the device write has returned.

use tracing::{debug, info};

use crate::error::{StlError, StlResult};
use crate::map::MapOrigin;
use crate::record::{LogHeader, MapRecord, RecordKind};
use crate::types::{BandType, CheckpointKind, Lba, Pba, Priority, SECTOR_SIZE};
use crate::volume::{VolumeInner, VolumeState};
use crate::zone::ZoneDevice;

/// A reserved run in the frontier: header at `at`, `sectors` data sectors,
/// trailer behind them.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Grant {
    pub(crate) at: Pba,
    pub(crate) sectors: u32,
    pub(crate) seq: u64,
    pub(crate) prev: Pba,
    pub(crate) base: Pba,
}

impl Grant {
    /// First data sector.
    pub(crate) fn data(&self) -> Pba {
        self.at.add(1)
    }

    /// Trailer location.
    pub(crate) fn trailer(&self) -> Pba {
        self.at.add(self.sectors + 1)
    }

    /// Where the next record in this band goes.
    pub(crate) fn end(&self) -> Pba {
        self.at.add(self.sectors + 2)
    }
}

/// How an append updates the address map once its data is on disk.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Commit {
    /// Map the written range unconditionally.
    Overwrite,
    /// Cleaning relocation: the data was copied from `from`; only remap
    /// sectors that still point there.
    Relocate { from: Pba },
}

impl<D: ZoneDevice> VolumeInner<D> {
    pub(crate) fn write_at(&self, offset: u64, data: &[u8]) -> StlResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let (first, sectors) = self.byte_span(offset, data.len())?;
        let head = (offset % SECTOR_SIZE as u64) as usize;
        if head == 0 && data.len() % SECTOR_SIZE == 0 {
            return self.write_sectors(first, data);
        }

        // Partial edge sectors are merged with what is there now. The append
        // locks of every group involved stay held from the edge reads to the
        // append, so a concurrent merge into the same sector cannot be lost.
        let last = first + sectors - 1;
        let groups = self.sb.group_of_lba(first)..=self.sb.group_of_lba(last);
        let _append: Vec<_> = groups.map(|g| self.append[g as usize].lock()).collect();

        let mut buf = vec![0u8; sectors as usize * SECTOR_SIZE];
        if head != 0 {
            self.read_sectors(first, &mut buf[..SECTOR_SIZE])?;
        }
        let tail = (head + data.len()) % SECTOR_SIZE;
        if tail != 0 && (sectors > 1 || head == 0) {
            let at = buf.len() - SECTOR_SIZE;
            self.read_sectors(last, &mut buf[at..])?;
        }
        buf[head..head + data.len()].copy_from_slice(data);

        for (g, lba, chunk) in self.group_pieces(first, &buf) {
            self.append_locked(g, lba, chunk, Priority::Normal, Commit::Overwrite)?;
        }
        self.state.lock().stats.rmw_requests += 1;
        self.finish_write(sectors)
    }

    /// Writes whole sectors, one group at a time.
    fn write_sectors(&self, lba: Lba, data: &[u8]) -> StlResult<()> {
        for (g, cur, chunk) in self.group_pieces(lba, data) {
            self.wait_for_group(g, cur, (chunk.len() / SECTOR_SIZE) as u64);
            let _append = self.append[g as usize].lock();
            self.append_locked(g, cur, chunk, Priority::Normal, Commit::Overwrite)?;
        }
        self.finish_write((data.len() / SECTOR_SIZE) as u64)
    }

    /// Splits whole sectors at `lba` at group boundaries.
    fn group_pieces<'a>(&self, lba: Lba, data: &'a [u8]) -> Vec<(u32, Lba, &'a [u8])> {
        let total = (data.len() / SECTOR_SIZE) as u64;
        let mut pieces = Vec::new();
        let mut done = 0u64;
        while done < total {
            let cur = lba + done;
            let g = self.sb.group_of_lba(cur);
            let (_, group_end) = self.sb.group_lba_range(g);
            let take = (total - done).min(group_end - cur);
            let chunk = &data[done as usize * SECTOR_SIZE..(done + take) as usize * SECTOR_SIZE];
            pieces.push((g, cur, chunk));
            done += take;
        }
        pieces
    }

    /// Host write accounting, plus the periodic checkpoint.
    fn finish_write(&self, sectors: u64) -> StlResult<()> {
        let mut state = self.state.lock();
        state.stats.writes += 1;
        state.stats.sectors_written += sectors;
        state.last_io = std::time::Instant::now();
        state.writes_since_checkpoint += 1;
        if state.writes_since_checkpoint > self.config.checkpoint_interval_writes {
            self.auto_checkpoint(&mut state)?;
        }
        Ok(())
    }

    /// Blocks while the group is being cleaned by someone else or the range
    /// overlaps the defrag window.
    fn wait_for_group(&self, g: u32, lba: Lba, sectors: u64) {
        let mut state = self.state.lock();
        while state.bands.group(g).cleaning || state.in_defrag_window(lba, sectors) {
            self.cond.wait(&mut state);
        }
    }

    /// Writes a checkpoint, upgrading every n-th one to full.
    pub(crate) fn auto_checkpoint(&self, state: &mut VolumeState) -> StlResult<()> {
        let every = self.config.full_checkpoint_every.max(1);
        let kind = if (state.checkpoints + 1) % every == 0 {
            CheckpointKind::Full
        } else {
            CheckpointKind::Incremental
        };
        state.checkpoint(&self.device, kind)
    }

    /// Appends `data` for `lba` into group `g`. The caller holds the
    /// group's append lock.
    pub(crate) fn append_locked(
        &self,
        g: u32,
        lba: Lba,
        data: &[u8],
        priority: Priority,
        commit: Commit,
    ) -> StlResult<()> {
        let total = (data.len() / SECTOR_SIZE) as u32;
        let mut done = 0u32;
        while done < total {
            let grant = self.reserve(g, total - done, priority)?;
            let start = lba + done as u64;
            let chunk =
                &data[done as usize * SECTOR_SIZE..(done + grant.sectors) as usize * SECTOR_SIZE];

            let header = LogHeader::new(RecordKind::Data, grant.seq, grant.prev, grant.trailer(), grant.base);
            let trailer = LogHeader::new(RecordKind::Data, grant.seq + 1, grant.at, grant.end(), grant.base)
                .with_inline(MapRecord {
                    lba: start,
                    pba: grant.data(),
                    len: grant.sectors,
                });
            let mut buf = Vec::with_capacity((grant.sectors as usize + 2) * SECTOR_SIZE);
            buf.extend_from_slice(&header.encode()?);
            buf.extend_from_slice(chunk);
            buf.extend_from_slice(&trailer.encode()?);

            if let Err(e) = self.device.write(grant.at.band, grant.at.offset, &buf) {
                self.release(g, &grant);
                return Err(e);
            }

            let mut state = self.state.lock();
            match commit {
                Commit::Overwrite => {
                    state
                        .map
                        .update_range(start, grant.sectors, grant.data(), MapOrigin::Live);
                }
                Commit::Relocate { from } => {
                    let moved = relocate_pieces(&mut state, start, grant.sectors, from.add(done), grant.data());
                    state.stats.sectors_relocated += moved;
                }
            }
            let group = state.bands.group_mut(g);
            if group.frontier == grant.at.band {
                group.frontier_offset = grant.end().offset;
                state.bands.band_mut(grant.at.band).dirty = true;
            }
            drop(state);

            debug!(group = g, lba = start, at = %grant.at, sectors = grant.sectors, "append committed");
            done += grant.sectors;
        }
        Ok(())
    }

    /// Hands back a grant whose device write failed. Nothing else can have
    /// been reserved behind it while the append lock is held.
    fn release(&self, g: u32, grant: &Grant) {
        let mut state = self.state.lock();
        state.bands.band_mut(grant.at.band).write_pointer = grant.at.offset;
        state.bands.group_mut(g).prev = grant.prev;
    }

    /// Reserves up to `want` data sectors plus two header sectors in the
    /// group's frontier, rotating to a fresh band (and cleaning to get one)
    /// when the frontier is nearly full.
    pub(crate) fn reserve(&self, g: u32, want: u32, priority: Priority) -> StlResult<Grant> {
        let band_size = self.sb.band_size;
        let low_water = self.low_water();
        let mut tries = self.config.alloc_retries;
        loop {
            let mut state = self.state.lock();
            let frontier = state.bands.group(g).frontier;
            let wp = state.bands.band(frontier).write_pointer;
            let left = band_size - wp;

            if left >= low_water {
                let sectors = want.min(left - 3);
                let at = Pba::new(frontier, wp);
                let seq = state.seq;
                state.seq += 2;
                let base = state.base;
                let group = state.bands.group_mut(g);
                let prev = group.prev;
                group.prev = at.add(sectors + 1);
                state.bands.band_mut(frontier).write_pointer = wp + sectors + 2;
                return Ok(Grant {
                    at,
                    sectors,
                    seq,
                    prev,
                    base,
                });
            }

            let reserve = match priority {
                Priority::High => 0,
                Priority::Normal => self.config.min_free_foreground,
            };
            if let Some(next) = state.bands.find_free_band(g, reserve) {
                self.rotate(&mut state, g, frontier, next)?;
                continue;
            }
            drop(state);

            if tries == 0 {
                return Err(StlError::OutOfSpace { group: g });
            }
            tries -= 1;
            debug!(group = g, ?priority, tries, "no free band, forcing cleaning");
            if let Err(e) = self.clean_group_locked(g, self.config.min_free_foreground, Priority::High) {
                debug!(group = g, error = %e, "forced cleaning failed");
                if matches!(e, StlError::CleaningFailed { .. }) {
                    continue;
                }
                return Err(e);
            }
        }
    }

    /// Seals `old` with a bridging record pointing at `new` and makes
    /// `new` the group's frontier.
    fn rotate(&self, state: &mut VolumeState, g: u32, old: u32, new: u32) -> StlResult<()> {
        if self.device.write_pointer(new)? != 0 {
            self.device.reset_pointer(new)?;
        }
        let wp = state.bands.band(old).write_pointer;
        let at = Pba::new(old, wp);
        let bridge = LogHeader::new(
            RecordKind::Data,
            state.seq,
            state.bands.group(g).prev,
            Pba::new(new, 0),
            state.base,
        );
        self.device.write(old, wp, &bridge.encode()?)?;

        state.seq += 1;
        state.bands.band_mut(old).write_pointer = wp + 1;
        state.bands.set_kind(old, BandType::Full);
        state.bands.set_kind(new, BandType::Frontier);
        state.bands.band_mut(new).write_pointer = 0;
        let group = state.bands.group_mut(g);
        group.prev = at;
        group.frontier_offset = 0;
        state.stats.frontier_rotations += 1;
        info!(group = g, old, new, "frontier rotated");
        Ok(())
    }

    /// Unmaps a range, one group at a time. Trims serialize with appends
    /// so a relocation never resurrects trimmed data.
    pub(crate) fn trim(&self, lba: Lba, sectors: u64) -> StlResult<()> {
        self.check_range(lba, sectors)?;
        let end = lba + sectors;
        let mut cur = lba;
        while cur < end {
            let g = self.sb.group_of_lba(cur);
            let (_, group_end) = self.sb.group_lba_range(g);
            let take = (end - cur).min(group_end - cur).min(u32::MAX as u64);
            self.wait_for_group(g, cur, take);
            let _append = self.append[g as usize].lock();
            self.state
                .lock()
                .map
                .update_range(cur, take as u32, Pba::INVALID, MapOrigin::Live);
            cur += take;
        }
        let mut state = self.state.lock();
        state.stats.trims += 1;
        state.last_io = std::time::Instant::now();
        state.writes_since_checkpoint += 1;
        debug!(lba, sectors, "trimmed");
        Ok(())
    }
}

/// Remaps the parts of `[lba, lba + len)` that still point at the
/// relocation source `from`; anything overwritten or trimmed since the
/// copy was taken is left alone. Returns the sectors remapped.
fn relocate_pieces(state: &mut VolumeState, lba: Lba, len: u32, from: Pba, to: Pba) -> u64 {
    let end = lba + len as u64;
    let mut pieces = Vec::new();
    for extent in state.map.extents_in_range(lba, end) {
        if extent.is_hole() {
            continue;
        }
        let a = extent.lba.max(lba);
        let b = extent.end().min(end);
        let current = extent.pba.add((a - extent.lba) as u32);
        if current == from.add((a - lba) as u32) {
            pieces.push((a, (b - a) as u32));
        }
    }
    let mut moved = 0;
    for (a, n) in pieces {
        state
            .map
            .update_range(a, n, to.add((a - lba) as u32), MapOrigin::Live);
        moved += n as u64;
    }
    moved
}
