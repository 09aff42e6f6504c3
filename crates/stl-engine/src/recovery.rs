//! Mount-time recovery.
//!
//! Rebuilds volume state from the device alone:
//! 1. Read and validate the superblock.
//! 2. Find the newest closing checkpoint header (the anchor).
//! 3. Replay checkpoint records from the anchor's base up to the anchor.
//! 4. Chase each group's frontier through DATA records appended after the
//!    checkpoint, following rotations into fresh bands.
//! 5. Reset bands the checkpoint calls FREE that still hold data.

use tracing::{debug, info, warn};

use crate::band::BandTable;
use crate::error::{StlError, StlResult};
use crate::map::MapOrigin;
use crate::record::{decode_records, BandRecord, LogHeader, MapRecord, RecordKind};
use crate::superblock::Superblock;
use crate::types::{BandType, CheckpointKind, Pba, SECTOR_SIZE};
use crate::volume::VolumeState;
use crate::zone::ZoneDevice;

/// Reads the header sector at `at`. `Ok(None)` when the sector holds no
/// intact header.
fn read_header<D: ZoneDevice + ?Sized>(device: &D, at: Pba) -> StlResult<Option<LogHeader>> {
    let mut sector = vec![0u8; SECTOR_SIZE];
    device.read(at.band, at.offset, &mut sector)?;
    Ok(LogHeader::decode(&sector))
}

/// The closing header recovery replays up to.
#[derive(Debug)]
struct Anchor {
    at: Pba,
    header: LogHeader,
}

/// Picks the metadata band whose first header is newest, then the last
/// closing header written into it.
fn find_anchor<D: ZoneDevice + ?Sized>(device: &D, sb: &Superblock) -> StlResult<Anchor> {
    let mut best: Option<(u32, u64)> = None;
    for band in 1..=sb.map_bands {
        if device.write_pointer(band)? == 0 {
            continue;
        }
        if let Some(header) = read_header(device, Pba::new(band, 0))? {
            if best.map_or(true, |(_, seq)| header.seq > seq) {
                best = Some((band, header.seq));
            }
        }
    }
    let (band, first_seq) = best.ok_or(StlError::NoValidCheckpoint {
        map_bands: sb.map_bands,
    })?;

    let wp = device.write_pointer(band)?;
    for offset in (0..wp).rev() {
        let at = Pba::new(band, offset);
        if let Some(header) = read_header(device, at)? {
            if header.is_closing() && header.seq >= first_seq && header.next.band == band {
                debug!(at = %at, seq = header.seq, base = %header.base, "checkpoint anchor");
                return Ok(Anchor { at, header });
            }
        }
    }
    Err(StlError::NoValidCheckpoint {
        map_bands: sb.map_bands,
    })
}

/// Applies checkpoint records from `base` through the anchor. Returns the
/// highest sequence number seen.
fn replay<D: ZoneDevice + ?Sized>(device: &D, state: &mut VolumeState, anchor: &Anchor) -> StlResult<u64> {
    let sb = state.sb.clone();
    let limit = sb.map_bands as u64 * sb.band_size as u64;
    let mut at = anchor.header.base;
    let mut max_seq = anchor.header.seq;
    let mut steps = 0u64;
    loop {
        if steps > limit || !sb.is_map_band(at.band) || at.offset >= sb.band_size {
            return Err(StlError::CorruptedLog {
                band: at.band,
                offset: at.offset,
                reason: "checkpoint chain does not reach the anchor".to_string(),
            });
        }
        let header = read_header(device, at)?.ok_or_else(|| StlError::CorruptedLog {
            band: at.band,
            offset: at.offset,
            reason: "expected a checkpoint header".to_string(),
        })?;
        max_seq = max_seq.max(header.seq);

        if header.records > 0 {
            let sectors = header.payload_sectors();
            if at.offset as u64 + 1 + sectors as u64 > sb.band_size as u64 {
                return Err(StlError::CorruptedLog {
                    band: at.band,
                    offset: at.offset,
                    reason: format!("{} payload sectors cross the band end", sectors),
                });
            }
            let mut payload = vec![0u8; sectors as usize * SECTOR_SIZE];
            device.read(at.band, at.offset + 1, &mut payload)?;
            match header.kind {
                RecordKind::Band => {
                    for record in decode_records::<BandRecord>(&payload, header.records as usize)? {
                        apply_band_record(state, &record);
                    }
                }
                RecordKind::Map => {
                    for record in decode_records::<MapRecord>(&payload, header.records as usize)? {
                        state
                            .map
                            .update_range(record.lba, record.len, record.pba, MapOrigin::Checkpoint);
                    }
                }
                RecordKind::Data | RecordKind::Null => {}
            }
        }
        if header.kind == RecordKind::Data {
            return Err(StlError::CorruptedLog {
                band: at.band,
                offset: at.offset,
                reason: "data record in a metadata band".to_string(),
            });
        }

        if at == anchor.at {
            return Ok(max_seq);
        }
        at = header.next;
        steps += 1;
    }
}

fn apply_band_record(state: &mut VolumeState, record: &BandRecord) {
    let Some(g) = state.bands.group_of(record.band) else {
        warn!(band = record.band, "band record for a non-data band ignored");
        return;
    };
    state.bands.band_mut(record.band).kind = record.kind;
    if record.kind == BandType::Frontier {
        let group = state.bands.group_mut(g);
        group.frontier = record.band;
        group.frontier_offset = record.write_pointer;
    }
}

/// Follows group `g`'s frontier through DATA records newer than the
/// checkpoint. Returns (records applied, highest seq, settled), where
/// settled means the chase changed no band types and ended exactly at the
/// device write pointer.
fn chase_frontier<D: ZoneDevice + ?Sized>(
    device: &D,
    state: &mut VolumeState,
    g: u32,
) -> StlResult<(u64, u64, bool)> {
    let mut band = state.bands.group(g).frontier;
    let mut offset = state.bands.group(g).frontier_offset;
    let mut last_seq: Option<u64> = None;
    let mut applied = 0u64;
    let mut rotated = false;

    loop {
        if offset >= state.bands.band(band).write_pointer {
            break;
        }
        let at = Pba::new(band, offset);
        let Some(header) = read_header(device, at)? else {
            break;
        };
        if header.kind != RecordKind::Data || last_seq.is_some_and(|seq| header.seq <= seq) {
            break;
        }
        last_seq = Some(header.seq);
        for record in &header.inline {
            state
                .map
                .update_range(record.lba, record.len, record.pba, MapOrigin::Log);
            applied += 1;
        }
        state.bands.group_mut(g).prev = at;

        if header.next.band != band {
            let new = header.next.band;
            if state.bands.group_of(new) != Some(g) || state.bands.band(new).kind != BandType::Free {
                warn!(group = g, at = %at, next = %header.next, "rotation to a band that is not free");
                break;
            }
            state.bands.set_kind(band, BandType::Full);
            state.bands.set_kind(new, BandType::Frontier);
            debug!(group = g, old = band, new, "replayed frontier rotation");
            rotated = true;
            band = new;
            offset = header.next.offset;
        } else if header.next.offset <= offset {
            break;
        } else {
            offset = header.next.offset;
        }
    }

    let wp = state.bands.band(band).write_pointer;
    state.bands.group_mut(g).frontier_offset = wp;
    Ok((applied, last_seq.unwrap_or(0), offset == wp && !rotated))
}

/// Rebuilds volume state from `device`.
pub(crate) fn recover<D: ZoneDevice + ?Sized>(device: &D) -> StlResult<VolumeState> {
    let mut sector = vec![0u8; SECTOR_SIZE];
    device.read(0, 0, &mut sector)?;
    let sb = Superblock::from_bytes(&sector)?;
    sb.validate_device(device.band_count(), device.band_size())?;

    let anchor = find_anchor(device, &sb)?;
    let mut state = VolumeState::new(sb.clone(), BandTable::new(&sb));
    let mut max_seq = replay(device, &mut state, &anchor)?;
    state.bands.recount();
    for band in 0..sb.n_bands {
        let entry = state.bands.band_mut(band);
        entry.write_pointer = device.write_pointer(band)?;
        entry.dirty = false;
    }

    let mut force_full = false;
    let mut recovered = 0u64;
    for g in 0..sb.n_groups {
        let (applied, seq, settled) = chase_frontier(device, &mut state, g)?;
        recovered += applied;
        max_seq = max_seq.max(seq);
        if applied > 0 || !settled {
            force_full = true;
        }
    }

    // Only after the chase: a band freshly claimed by a rotation is still
    // FREE in the checkpoint.
    for band in state.bands.data_bands() {
        let entry = state.bands.band(band);
        if entry.kind == BandType::Free && entry.write_pointer != 0 {
            debug!(band, write_pointer = entry.write_pointer, "resetting stale free band");
            device.reset_pointer(band)?;
            state.bands.band_mut(band).write_pointer = 0;
        }
    }

    state.bands.check_invariants().map_err(|reason| StlError::CorruptedLog {
        band: anchor.at.band,
        offset: anchor.at.offset,
        reason,
    })?;

    state.seq = max_seq + 1;
    state.base = anchor.header.base;
    state.map_band = anchor.at.band;
    state.map_prev = anchor.at;
    state.stats.recovered_records = recovered;

    // Anything behind the anchor in its band (an interrupted map band
    // rotation leaves a link there) would sit between the anchor and the
    // next incremental checkpoint. A full checkpoint restarts the chain.
    let map_end = Pba::new(anchor.at.band, state.bands.band(anchor.at.band).write_pointer);
    if anchor.header.next != map_end {
        warn!(anchor = %anchor.at, next = %anchor.header.next, end = %map_end, "map band has records past the anchor");
        force_full = true;
    }

    if force_full {
        state.checkpoint(device, CheckpointKind::Full)?;
    }
    info!(
        anchor = %anchor.at,
        extents = state.map.count(),
        recovered_records = recovered,
        checkpointed = force_full,
        "recovery complete"
    );
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FormatConfig, VolumeConfig};
    use crate::volume::Volume;
    use crate::zone::MemZoneDevice;
    use std::sync::Arc;

    fn format(dev: &Arc<MemZoneDevice>) {
        Volume::format(
            dev,
            &FormatConfig {
                group_bands: 4,
                map_bands: 2,
                over_provisioning: 2.0,
            },
        )
        .unwrap();
    }

    fn open(dev: &Arc<MemZoneDevice>) -> Volume<Arc<MemZoneDevice>> {
        Volume::open(Arc::clone(dev), VolumeConfig::foreground_only()).unwrap()
    }

    fn sector(fill: u8) -> Vec<u8> {
        vec![fill; SECTOR_SIZE]
    }

    #[test]
    fn test_recover_formatted_volume() {
        let dev = Arc::new(MemZoneDevice::new(13, 64));
        format(&dev);
        let state = recover(&dev).unwrap();
        assert_eq!(state.map.count(), 0);
        assert_eq!(state.bands.group(0).frontier, 3);
        assert_eq!(state.bands.group(1).frontier, 7);
        assert_eq!(state.map_band, 1);
        assert_eq!(state.map_prev, Pba::new(1, 3));
        assert_eq!(state.stats.checkpoints_full, 0);
    }

    #[test]
    fn test_interrupted_map_rotation_restarts_chain() {
        let dev = Arc::new(MemZoneDevice::new(13, 64));
        format(&dev);
        let vol = open(&dev);
        vol.write(0, &vec![7u8; 4 * SECTOR_SIZE]).unwrap();
        vol.checkpoint(CheckpointKind::Full).unwrap();
        // Crash between the link to band 2 and the full checkpoint there.
        let inner = vol.inner();
        inner.state.lock().rotate_map_band(&inner.device).unwrap();
        drop(vol);

        let vol = open(&dev);
        assert_eq!(vol.stats().checkpoints_full, 1);
        vol.trim(2, 2).unwrap();
        vol.checkpoint(CheckpointKind::Incremental).unwrap();
        drop(vol);

        let vol = open(&dev);
        let mut buf = vec![0xeeu8; 4 * SECTOR_SIZE];
        vol.read(0, &mut buf).unwrap();
        assert!(buf[..2 * SECTOR_SIZE].iter().all(|&b| b == 7));
        assert!(buf[2 * SECTOR_SIZE..].iter().all(|&b| b == 0));
        vol.check().unwrap();
    }

    #[test]
    fn test_chase_replays_uncheckpointed_writes() {
        let dev = Arc::new(MemZoneDevice::new(13, 64));
        format(&dev);
        let vol = open(&dev);
        vol.write(5, &sector(1)).unwrap();
        vol.write(6, &sector(2)).unwrap();
        drop(vol);

        let vol = open(&dev);
        assert_eq!(vol.stats().recovered_records, 2);
        assert_eq!(vol.stats().checkpoints_full, 1);
        let mut buf = sector(0);
        vol.read(6, &mut buf).unwrap();
        assert_eq!(buf, sector(2));
    }

    #[test]
    fn test_chase_follows_rotation() {
        let dev = Arc::new(MemZoneDevice::new(13, 64));
        format(&dev);
        let vol = open(&dev);
        vol.write(0, &vec![4u8; 100 * SECTOR_SIZE]).unwrap();
        drop(vol);

        let vol = open(&dev);
        assert_eq!(vol.band_type(3), Some(BandType::Full));
        assert_eq!(vol.band_type(4), Some(BandType::Frontier));
        let mut buf = vec![0u8; 100 * SECTOR_SIZE];
        vol.read(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 4));
        vol.check().unwrap();
    }

    #[test]
    fn test_incremental_chain_replayed() {
        let dev = Arc::new(MemZoneDevice::new(13, 64));
        format(&dev);
        let vol = open(&dev);
        vol.write(0, &vec![1u8; 8 * SECTOR_SIZE]).unwrap();
        vol.checkpoint(CheckpointKind::Full).unwrap();
        vol.trim(2, 2).unwrap();
        vol.checkpoint(CheckpointKind::Incremental).unwrap();
        vol.write(20, &sector(9)).unwrap();
        vol.checkpoint(CheckpointKind::Incremental).unwrap();
        drop(vol);

        let vol = open(&dev);
        assert_eq!(vol.stats().recovered_records, 0);
        let extents: Vec<(u64, u32)> = vol.extents().iter().map(|e| (e.lba, e.len)).collect();
        assert_eq!(extents, vec![(0, 2), (4, 4), (20, 1)]);
    }

    #[test]
    fn test_torn_append_ignored() {
        let dev = Arc::new(MemZoneDevice::new(13, 64));
        format(&dev);
        let vol = open(&dev);
        vol.write(0, &sector(1)).unwrap();
        drop(vol);
        // A header whose trailer never made it.
        let header = LogHeader::new(RecordKind::Data, 1000, Pba::new(3, 2), Pba::new(3, 5), Pba::new(1, 0));
        dev.write(3, 3, &header.encode().unwrap()).unwrap();
        dev.write(3, 4, &sector(7)).unwrap();

        let vol = open(&dev);
        assert_eq!(vol.extent_count(), 1);
        assert_eq!(vol.group_status(0).unwrap().frontier_write_pointer, 5);
        vol.write(1, &sector(2)).unwrap();
        let mut buf = vec![0u8; 2 * SECTOR_SIZE];
        vol.read(0, &mut buf).unwrap();
        assert_eq!(&buf[..SECTOR_SIZE], &sector(1)[..]);
        assert_eq!(&buf[SECTOR_SIZE..], &sector(2)[..]);
    }

    #[test]
    fn test_stale_free_band_reset() {
        let dev = Arc::new(MemZoneDevice::new(13, 64));
        format(&dev);
        dev.write(5, 0, &sector(3)).unwrap();
        let vol = open(&dev);
        assert_eq!(dev.write_pointer(5).unwrap(), 0);
        assert_eq!(vol.band_type(5), Some(BandType::Free));
    }

    #[test]
    fn test_blank_metadata_fails() {
        let dev = Arc::new(MemZoneDevice::new(13, 64));
        format(&dev);
        dev.reset_pointer(1).unwrap();
        assert!(matches!(recover(&dev), Err(StlError::NoValidCheckpoint { map_bands: 2 })));
    }

    #[test]
    fn test_recovery_across_metadata_rotation() {
        let dev = Arc::new(MemZoneDevice::new(13, 64));
        format(&dev);
        let vol = open(&dev);
        vol.write(0, &sector(5)).unwrap();
        for _ in 0..12 {
            vol.checkpoint(CheckpointKind::Full).unwrap();
        }
        vol.write(1, &sector(6)).unwrap();
        vol.checkpoint(CheckpointKind::Incremental).unwrap();
        drop(vol);

        let state = recover(&dev).unwrap();
        assert_eq!(state.map_band, 2);
        assert_eq!(state.map.count(), 2);
    }
}
