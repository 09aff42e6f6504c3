//! Read path.
//!
//! Reads resolve the address map under the volume lock, pin the bands they
//! are about to touch and then go to the device without the lock. Cleaning
//! waits for a band's pins to drain before resetting it, so a planned read
//! never sees a recycled band.

use std::time::Instant;

use tracing::trace;

use crate::error::StlResult;
use crate::types::{Lba, Pba, SECTOR_SIZE};
use crate::volume::{VolumeInner, VolumeState};
use crate::zone::ZoneDevice;

/// A mapped piece of a read: `len` sectors at `lba` live at `pba`.
#[derive(Debug, Clone, Copy)]
struct Segment {
    lba: Lba,
    pba: Pba,
    len: u32,
}

impl<D: ZoneDevice> VolumeInner<D> {
    pub(crate) fn read_at(&self, offset: u64, buf: &mut [u8]) -> StlResult<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let (first, sectors) = self.byte_span(offset, buf.len())?;
        let head = (offset % SECTOR_SIZE as u64) as usize;
        if head == 0 && buf.len() % SECTOR_SIZE == 0 {
            return self.read_sectors(first, buf);
        }
        let mut tmp = vec![0u8; sectors as usize * SECTOR_SIZE];
        self.read_sectors(first, &mut tmp)?;
        let len = buf.len();
        buf.copy_from_slice(&tmp[head..head + len]);
        Ok(())
    }

    /// Reads whole sectors. Unmapped and trimmed sectors read as zeros.
    pub(crate) fn read_sectors(&self, lba: Lba, buf: &mut [u8]) -> StlResult<()> {
        let sectors = (buf.len() / SECTOR_SIZE) as u64;
        let segments = {
            let mut state = self.state.lock();
            while state.in_defrag_window(lba, sectors) {
                self.cond.wait(&mut state);
            }
            plan(&mut state, lba, sectors)
        };
        self.fetch(lba, &segments, buf)?;

        let mut state = self.state.lock();
        state.stats.reads += 1;
        state.stats.sectors_read += sectors;
        state.last_io = Instant::now();
        Ok(())
    }

    /// Reads the current contents of `[lba, lba + sectors)` on behalf of a
    /// maintenance pass, ignoring the defrag window and host counters.
    pub(crate) fn read_for_maintenance(&self, lba: Lba, buf: &mut [u8]) -> StlResult<()> {
        let sectors = (buf.len() / SECTOR_SIZE) as u64;
        let segments = plan(&mut self.state.lock(), lba, sectors);
        self.fetch(lba, &segments, buf)
    }

    /// Device reads for planned segments. Always drops the pins taken by
    /// [`plan`], even when a read fails.
    fn fetch(&self, lba: Lba, segments: &[Segment], buf: &mut [u8]) -> StlResult<()> {
        buf.fill(0);
        let mut result = Ok(());
        for seg in segments {
            let at = (seg.lba - lba) as usize * SECTOR_SIZE;
            let dst = &mut buf[at..at + seg.len as usize * SECTOR_SIZE];
            trace!(lba = seg.lba, pba = %seg.pba, len = seg.len, "read segment");
            if let Err(e) = self.device.read(seg.pba.band, seg.pba.offset, dst) {
                result = Err(e);
                break;
            }
        }

        let mut state = self.state.lock();
        for seg in segments {
            state.read_pins[seg.pba.band as usize] -= 1;
        }
        drop(state);
        self.cond.notify_all();
        result
    }
}

/// Resolves `[lba, lba + sectors)` into mapped segments and pins their bands.
fn plan(state: &mut VolumeState, lba: Lba, sectors: u64) -> Vec<Segment> {
    let end = lba + sectors;
    let segments: Vec<Segment> = state
        .map
        .extents_in_range(lba, end)
        .into_iter()
        .filter(|e| !e.is_hole())
        .map(|e| {
            let a = e.lba.max(lba);
            let b = e.end().min(end);
            Segment {
                lba: a,
                pba: e.pba.add((a - e.lba) as u32),
                len: (b - a) as u32,
            }
        })
        .collect();
    for seg in &segments {
        state.read_pins[seg.pba.band as usize] += 1;
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FormatConfig, VolumeConfig};
    use crate::volume::Volume;
    use crate::zone::MemZoneDevice;
    use std::sync::Arc;

    fn volume() -> Volume<Arc<MemZoneDevice>> {
        let dev = Arc::new(MemZoneDevice::new(13, 64));
        Volume::format(
            &dev,
            &FormatConfig {
                group_bands: 4,
                map_bands: 2,
                over_provisioning: 2.0,
            },
        )
        .unwrap();
        Volume::open(dev, VolumeConfig::foreground_only()).unwrap()
    }

    #[test]
    fn test_read_gaps_are_zero() {
        let vol = volume();
        vol.write(2, &vec![7u8; 2 * SECTOR_SIZE]).unwrap();
        let mut buf = vec![0xffu8; 6 * SECTOR_SIZE];
        vol.read(0, &mut buf).unwrap();
        assert!(buf[..2 * SECTOR_SIZE].iter().all(|&b| b == 0));
        assert!(buf[2 * SECTOR_SIZE..4 * SECTOR_SIZE].iter().all(|&b| b == 7));
        assert!(buf[4 * SECTOR_SIZE..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_read_releases_pins() {
        let vol = volume();
        vol.write(0, &vec![1u8; 4 * SECTOR_SIZE]).unwrap();
        let mut buf = vec![0u8; 4 * SECTOR_SIZE];
        vol.read(0, &mut buf).unwrap();
        let state = vol.inner().state.lock();
        assert!(state.read_pins.iter().all(|&p| p == 0));
        assert_eq!(state.stats.reads, 1);
        assert_eq!(state.stats.sectors_read, 4);
    }

    #[test]
    fn test_unaligned_read_does_not_count_rmw() {
        let vol = volume();
        vol.write(0, &vec![3u8; SECTOR_SIZE]).unwrap();
        let mut small = [0u8; 16];
        vol.read_at(100, &mut small).unwrap();
        assert_eq!(small, [3u8; 16]);
        assert_eq!(vol.stats().rmw_requests, 0);
    }

    #[test]
    fn test_plan_splits_at_extent_edges() {
        let vol = volume();
        vol.write(0, &vec![1u8; 8 * SECTOR_SIZE]).unwrap();
        vol.write(3, &vec![2u8; 2 * SECTOR_SIZE]).unwrap();
        let mut state = vol.inner().state.lock();
        let segments = plan(&mut state, 2, 4);
        let pieces: Vec<(Lba, u32)> = segments.iter().map(|s| (s.lba, s.len)).collect();
        assert_eq!(pieces, vec![(2, 1), (3, 2), (5, 1)]);
        assert_eq!(state.read_pins[3], 3);
    }
}
