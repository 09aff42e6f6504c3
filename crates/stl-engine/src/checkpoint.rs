//! Checkpoint writer.
//!
//! A checkpoint is a BAND section followed by a MAP section, appended to
//! the active metadata band in one device write. Each section is an
//! opening header with its packed records and an empty closing header.
//! Closing headers are the only places recovery may stop; the last one of
//! a checkpoint carries the replay base.
//!
//! Full checkpoints log every data band and every mapped extent and move
//! the base to themselves. Incremental ones log only what changed since
//! the previous checkpoint. When the metadata band cannot take the next
//! checkpoint, a NULL record links it to the next metadata band and the
//! checkpoint is upgraded to full.

use tracing::{debug, info};

use crate::error::{StlError, StlResult};
use crate::map::ExtentId;
use crate::record::{encode_records, payload_sectors, BandRecord, LogHeader, MapRecord, RecordKind};
use crate::types::{BandType, CheckpointKind, Pba, SECTOR_SIZE};
use crate::volume::VolumeState;
use crate::zone::ZoneDevice;

/// What one checkpoint will log.
struct Plan {
    full: bool,
    bands: Vec<BandRecord>,
    extents: Vec<MapRecord>,
    /// Extents to mark clean once logged.
    logged: Vec<ExtentId>,
    /// Trim placeholders to drop once logged.
    holes: Vec<ExtentId>,
}

impl Plan {
    fn collect(state: &VolumeState, full: bool) -> Self {
        let band_ids: Vec<u32> = if full {
            state.bands.data_bands().collect()
        } else {
            state.bands.dirty_bands().collect()
        };
        let bands = band_ids
            .into_iter()
            .map(|band| {
                let entry = state.bands.band(band);
                let write_pointer = match (entry.kind, state.bands.group_of(band)) {
                    (BandType::Frontier, Some(g)) => state.bands.group(g).frontier_offset,
                    _ => entry.write_pointer,
                };
                BandRecord {
                    band,
                    kind: entry.kind,
                    write_pointer,
                }
            })
            .collect();

        let mut extents = Vec::new();
        let mut logged = Vec::new();
        let mut holes = Vec::new();
        for (id, extent) in state.map.iter() {
            if extent.is_hole() {
                // A full checkpoint starts replay from an empty map, so
                // holes only matter to incremental ones.
                if extent.dirty && !full {
                    extents.push(to_record(extent.lba, extent.pba, extent.len));
                }
                holes.push(id);
            } else if full || extent.dirty {
                extents.push(to_record(extent.lba, extent.pba, extent.len));
                logged.push(id);
            }
        }
        Self {
            full,
            bands,
            extents,
            logged,
            holes,
        }
    }

    fn is_empty(&self) -> bool {
        self.bands.is_empty() && self.extents.is_empty() && self.holes.is_empty()
    }

    fn writes_band_section(&self) -> bool {
        self.full || !self.bands.is_empty()
    }

    fn writes_map_section(&self) -> bool {
        self.full || !self.extents.is_empty() || !self.writes_band_section()
    }

    /// Sectors the checkpoint occupies in the metadata band.
    fn sectors(&self) -> u32 {
        let mut sectors = 0;
        if self.writes_band_section() {
            sectors += section_sectors(payload_sectors::<BandRecord>(self.bands.len()));
        }
        if self.writes_map_section() {
            sectors += section_sectors(payload_sectors::<MapRecord>(self.extents.len()));
        }
        sectors
    }
}

fn to_record(lba: u64, pba: Pba, len: u32) -> MapRecord {
    MapRecord { lba, pba, len }
}

/// An empty section is its own closing header.
fn section_sectors(payload: u32) -> u32 {
    if payload == 0 {
        1
    } else {
        payload + 2
    }
}

impl VolumeState {
    /// Writes a checkpoint of the requested kind. The caller holds the
    /// volume lock, so nothing changes while the plan is written.
    ///
    /// An incremental checkpoint with nothing to log writes nothing.
    pub(crate) fn checkpoint<D: ZoneDevice + ?Sized>(
        &mut self,
        device: &D,
        kind: CheckpointKind,
    ) -> StlResult<()> {
        let band_size = self.sb.band_size;
        let mut plan = Plan::collect(self, kind == CheckpointKind::Full || self.need_full_checkpoint);
        if !plan.full && plan.is_empty() {
            self.writes_since_checkpoint = 0;
            return Ok(());
        }

        // One sector always stays free for the NULL link.
        let wp = self.bands.band(self.map_band).write_pointer;
        if wp + plan.sectors() + 1 > band_size {
            self.rotate_map_band(device)?;
            plan = Plan::collect(self, true);
        }
        let sectors = plan.sectors();
        if sectors + 1 > band_size {
            return Err(StlError::InvalidConfig(format!(
                "checkpoint of {} sectors does not fit a {}-sector metadata band",
                sectors, band_size
            )));
        }

        let m = self.map_band;
        let start = Pba::new(m, self.bands.band(m).write_pointer);
        let new_base = if plan.full { start } else { self.base };
        let mut writer = SectionWriter {
            buf: Vec::with_capacity(sectors as usize * SECTOR_SIZE),
            at: start,
            prev: self.map_prev,
            seq: self.seq,
            base: self.base,
        };
        let map_section = plan.writes_map_section();
        if plan.writes_band_section() {
            let payload = encode_records(&plan.bands)?;
            let base = if map_section { self.base } else { new_base };
            writer.section(RecordKind::Band, plan.bands.len() as u32, &payload, base)?;
        }
        if map_section {
            let payload = encode_records(&plan.extents)?;
            writer.section(RecordKind::Map, plan.extents.len() as u32, &payload, new_base)?;
        }
        debug_assert_eq!(writer.buf.len(), sectors as usize * SECTOR_SIZE);
        device.write(m, start.offset, &writer.buf)?;

        self.seq = writer.seq;
        self.map_prev = writer.prev;
        self.base = new_base;
        self.bands.band_mut(m).write_pointer = start.offset + sectors;
        for band in plan.bands.iter().map(|r| r.band) {
            self.bands.band_mut(band).dirty = false;
        }
        for &id in &plan.logged {
            self.map.set_dirty(id, false);
        }
        for &id in &plan.holes {
            self.map.remove(id);
        }
        self.writes_since_checkpoint = 0;
        self.checkpoints += 1;
        if plan.full {
            self.need_full_checkpoint = false;
            self.stats.checkpoints_full += 1;
        } else {
            self.stats.checkpoints_incremental += 1;
        }
        debug!(
            full = plan.full,
            at = %start,
            sectors,
            bands = plan.bands.len(),
            extents = plan.extents.len(),
            "checkpoint written"
        );
        Ok(())
    }

    /// Links the active metadata band to the next one and switches to it.
    pub(crate) fn rotate_map_band<D: ZoneDevice + ?Sized>(&mut self, device: &D) -> StlResult<()> {
        let old = self.map_band;
        let next = self.sb.next_map_band(old);
        if self.base.band == next {
            // The last full checkpoint never landed in `old`; resetting
            // `next` would lose the replay base.
            return Err(StlError::InvalidConfig(format!(
                "metadata band {} still holds the replay base",
                next
            )));
        }
        if device.write_pointer(next)? != 0 {
            device.reset_pointer(next)?;
        }
        let wp = self.bands.band(old).write_pointer;
        let link = LogHeader::new(RecordKind::Null, self.seq, self.map_prev, Pba::new(next, 0), self.base);
        device.write(old, wp, &link.encode()?)?;

        self.seq += 1;
        self.map_prev = Pba::new(old, wp);
        self.bands.band_mut(old).write_pointer = wp + 1;
        self.bands.band_mut(next).write_pointer = 0;
        self.map_band = next;
        self.need_full_checkpoint = true;
        self.stats.map_band_rotations += 1;
        info!(old, next, "metadata band rotated");
        Ok(())
    }
}

/// Lays out consecutive sections, chaining their headers.
struct SectionWriter {
    buf: Vec<u8>,
    at: Pba,
    prev: Pba,
    seq: u64,
    base: Pba,
}

impl SectionWriter {
    /// Appends an opening header with `records` records (unless there are
    /// none) and a closing header carrying `closing_base`.
    fn section(&mut self, kind: RecordKind, records: u32, payload: &[u8], closing_base: Pba) -> StlResult<()> {
        if records > 0 {
            let payload_len = (payload.len() / SECTOR_SIZE) as u32;
            let closing_at = self.at.add(1 + payload_len);
            let header = LogHeader::new(kind, self.seq, self.prev, closing_at, self.base).with_records(records);
            self.buf.extend_from_slice(&header.encode()?);
            self.buf.extend_from_slice(payload);
            self.prev = self.at;
            self.at = closing_at;
            self.seq += 1;
        }
        let closing = LogHeader::new(kind, self.seq, self.prev, self.at.add(1), closing_base);
        self.buf.extend_from_slice(&closing.encode()?);
        self.prev = self.at;
        self.at = self.at.add(1);
        self.seq += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FormatConfig, VolumeConfig};
    use crate::volume::Volume;
    use crate::zone::MemZoneDevice;
    use std::sync::Arc;

    fn small_volume() -> (Arc<MemZoneDevice>, Volume<Arc<MemZoneDevice>>) {
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
        let vol = Volume::open(Arc::clone(&dev), VolumeConfig::foreground_only()).unwrap();
        (dev, vol)
    }

    fn header_at(dev: &MemZoneDevice, at: Pba) -> LogHeader {
        let mut sector = vec![0u8; SECTOR_SIZE];
        dev.read(at.band, at.offset, &mut sector).unwrap();
        LogHeader::decode(&sector).unwrap()
    }

    #[test]
    fn test_format_writes_full_checkpoint() {
        let (dev, _vol) = small_volume();
        // 8 band records fit one sector: BAND header, payload, closing,
        // then an empty MAP section.
        assert_eq!(dev.write_pointer(1).unwrap(), 4);
        let band = header_at(&dev, Pba::new(1, 0));
        assert_eq!(band.kind, RecordKind::Band);
        assert_eq!(band.records, 8);
        let closing = header_at(&dev, Pba::new(1, 3));
        assert_eq!(closing.kind, RecordKind::Map);
        assert!(closing.is_closing());
        assert_eq!(closing.base, Pba::new(1, 0));
        assert_eq!(closing.next, Pba::new(1, 4));
    }

    #[test]
    fn test_incremental_logs_only_dirty_state() {
        let (_dev, vol) = small_volume();
        vol.write(0, &vec![1u8; 4 * SECTOR_SIZE]).unwrap();
        vol.checkpoint(CheckpointKind::Full).unwrap();
        vol.write(10, &vec![2u8; 4 * SECTOR_SIZE]).unwrap();

        let state = vol.inner().state.lock();
        let plan = Plan::collect(&state, false);
        assert_eq!(plan.extents.len(), 1);
        assert_eq!(plan.extents[0].lba, 10);
        // Only the frontier moved.
        assert_eq!(plan.bands.len(), 1);
        assert_eq!(plan.bands[0].band, 3);
        assert_eq!(plan.bands[0].write_pointer, 12);
    }

    #[test]
    fn test_empty_incremental_is_noop() {
        let (dev, vol) = small_volume();
        let wp = dev.write_pointer(1).unwrap();
        vol.checkpoint(CheckpointKind::Incremental).unwrap();
        assert_eq!(dev.write_pointer(1).unwrap(), wp);
        assert_eq!(vol.stats().checkpoints_incremental, 0);
    }

    #[test]
    fn test_incremental_keeps_base() {
        let (dev, vol) = small_volume();
        vol.write(0, &vec![1u8; SECTOR_SIZE]).unwrap();
        vol.checkpoint(CheckpointKind::Incremental).unwrap();
        let state = vol.inner().state.lock();
        assert_eq!(state.base, Pba::new(1, 0));
        let last = header_at(&dev, state.map_prev);
        assert!(last.is_closing());
        assert_eq!(last.base, Pba::new(1, 0));
        assert_eq!(state.map.iter().filter(|(_, e)| e.dirty).count(), 0);
    }

    #[test]
    fn test_metadata_band_rotation() {
        let (dev, vol) = small_volume();
        // Each full checkpoint takes 6 sectors once a MAP record exists.
        vol.write(0, &vec![1u8; SECTOR_SIZE]).unwrap();
        for _ in 0..12 {
            vol.checkpoint(CheckpointKind::Full).unwrap();
        }
        let stats = vol.stats();
        assert_eq!(stats.map_band_rotations, 1);
        let state = vol.inner().state.lock();
        assert_eq!(state.map_band, 2);
        assert_eq!(state.base.band, 2);
        assert!(!state.need_full_checkpoint);
        let link = header_at(&dev, Pba::new(1, dev.write_pointer(1).unwrap() - 1));
        assert_eq!(link.kind, RecordKind::Null);
        assert_eq!(link.next, Pba::new(2, 0));
    }

    #[test]
    fn test_rotation_upgrades_to_full() {
        let (_dev, vol) = small_volume();
        let mut i = 0u64;
        while vol.stats().map_band_rotations == 0 {
            vol.write(i % 100, &vec![1u8; SECTOR_SIZE]).unwrap();
            vol.checkpoint(CheckpointKind::Incremental).unwrap();
            i += 1;
        }
        // Format takes 4 sectors of band 1 and each incremental here takes
        // 6, so the tenth no longer fits and becomes a full one in band 2.
        let stats = vol.stats();
        assert_eq!(stats.checkpoints_incremental, 9);
        assert_eq!(stats.checkpoints_full, 1);
        assert_eq!(vol.inner().state.lock().base, Pba::new(2, 0));
    }
}
