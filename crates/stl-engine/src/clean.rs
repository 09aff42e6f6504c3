//! Band cleaning (garbage collection).
//!
//! A pass selects the FULL band with the fewest live sectors, rewrites its
//! live extents through the group's frontier, then recycles it: mark FREE,
//! checkpoint, wait for in-flight reads, reset the write pointer.
//!
//! Cleaning holds the group's append lock for the whole pass, so host
//! writes and trims to the group wait and the victim's extents cannot
//! change underneath the copy.

use tracing::{debug, info};

use crate::error::{StlError, StlResult};
use crate::types::{BandType, CheckpointKind, Priority, SECTOR_SIZE};
use crate::volume::{VolumeInner, VolumeState};
use crate::write::Commit;
use crate::zone::ZoneDevice;

impl<D: ZoneDevice> VolumeInner<D> {
    /// Cleans group `g` until more than `min_free` bands are free. Returns
    /// the number of bands recycled.
    pub(crate) fn clean_group(&self, g: u32, min_free: u32, priority: Priority) -> StlResult<u32> {
        let _append = self.append[g as usize].lock();
        self.clean_group_locked(g, min_free, priority)
    }

    /// [`clean_group`](Self::clean_group) for a caller that already holds
    /// the group's append lock.
    pub(crate) fn clean_group_locked(&self, g: u32, min_free: u32, priority: Priority) -> StlResult<u32> {
        {
            let mut state = self.state.lock();
            let group = state.bands.group_mut(g);
            if group.cleaning {
                return Err(StlError::CleaningFailed {
                    group: g,
                    reason: "cleaning already in progress".to_string(),
                });
            }
            group.cleaning = true;
        }
        let result = self.clean_passes(g, min_free, priority);
        self.state.lock().bands.group_mut(g).cleaning = false;
        self.cond.notify_all();
        result
    }

    fn clean_passes(&self, g: u32, min_free: u32, priority: Priority) -> StlResult<u32> {
        let mut cleaned = 0;
        for _ in 0..self.config.clean_max_iterations {
            let victim = {
                let state = self.state.lock();
                if state.bands.group(g).free() > min_free {
                    return Ok(cleaned);
                }
                self.select_victim(&state, g)
            };
            let Some(victim) = victim else {
                break;
            };
            let moved = self.relocate_band(g, victim, priority)?;
            self.recycle(g, victim)?;
            cleaned += 1;
            info!(group = g, band = victim, sectors = moved, "band cleaned");
        }

        let free = self.state.lock().bands.group(g).free();
        if free > min_free {
            return Ok(cleaned);
        }
        Err(StlError::CleaningFailed {
            group: g,
            reason: format!(
                "{} free bands after recycling {}, wanted more than {}",
                free, cleaned, min_free
            ),
        })
    }

    /// FULL band of `g` with the fewest live sectors, lowest index first.
    /// Bands whose live data plus rewrite overhead would fill a band are
    /// not worth cleaning.
    pub(crate) fn select_victim(&self, state: &VolumeState, g: u32) -> Option<u32> {
        let band_size = self.sb.band_size as u64;
        let low_water = self.low_water() as u64;
        let mut best: Option<(u64, u32)> = None;
        for band in state.bands.group_bands(g) {
            if state.bands.band(band).kind != BandType::Full {
                continue;
            }
            let extents = state.map.extents_in_band(band);
            let live: u64 = extents.iter().map(|e| e.len as u64).sum();
            if live + 2 * extents.len() as u64 + low_water >= band_size {
                continue;
            }
            if best.map_or(true, |(cost, _)| live < cost) {
                best = Some((live, band));
            }
        }
        if let Some((live, band)) = best {
            debug!(group = g, band, live, "cleaning victim selected");
        }
        best.map(|(_, band)| band)
    }

    /// Copies every live extent out of `victim` into the frontier. The map
    /// keeps pointing at the victim until each copy is committed.
    fn relocate_band(&self, g: u32, victim: u32, priority: Priority) -> StlResult<u64> {
        let extents = self.state.lock().map.extents_in_band(victim);
        let mut moved = 0u64;
        for extent in extents {
            let mut buf = vec![0u8; extent.len as usize * SECTOR_SIZE];
            self.device.read(extent.pba.band, extent.pba.offset, &mut buf)?;
            self.append_locked(g, extent.lba, &buf, priority, Commit::Relocate { from: extent.pba })?;
            moved += extent.len as u64;
        }
        Ok(moved)
    }

    /// Returns a drained band to the free pool.
    pub(crate) fn recycle(&self, g: u32, victim: u32) -> StlResult<()> {
        let mut state = self.state.lock();
        let left = state.map.extents_in_band(victim).len();
        if left > 0 {
            return Err(StlError::CleaningFailed {
                group: g,
                reason: format!("{} extents still mapped into band {}", left, victim),
            });
        }

        // The relocated map must be durable before the old copies go away.
        state.bands.set_kind(victim, BandType::Free);
        if let Err(e) = state.checkpoint(&self.device, CheckpointKind::Incremental) {
            state.bands.set_kind(victim, BandType::Full);
            return Err(e);
        }
        while state.read_pins[victim as usize] > 0 {
            self.cond.wait(&mut state);
        }
        self.device.reset_pointer(victim)?;
        state.bands.band_mut(victim).write_pointer = 0;
        state.stats.bands_cleaned += 1;
        Ok(())
    }
}
