//! The volume: host-facing entry points and shared state.
//!
//! All metadata (address map, band table, sequence counter, checkpoint
//! anchor) lives in one [`VolumeState`] behind a single mutex. Device I/O
//! for host data runs with that mutex released; a per-group append mutex
//! keeps appends into a group in write-pointer order instead.
//!
//! Lock order: a group's append mutex, then the state mutex.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{info, warn};

use crate::band::BandTable;
use crate::config::{FormatConfig, VolumeConfig};
use crate::error::{StlError, StlResult};
use crate::map::{Extent, ExtentMap};
use crate::maintenance;
use crate::recovery;
use crate::superblock::Superblock;
use crate::types::{sectors_for, BandType, CheckpointKind, Lba, Pba, Priority, SECTOR_SIZE};
use crate::zone::ZoneDevice;

/// Volume counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeStats {
    /// Host read requests.
    pub reads: u64,
    /// Host write requests.
    pub writes: u64,
    /// Host trim requests.
    pub trims: u64,
    /// Sectors returned to the host.
    pub sectors_read: u64,
    /// Sectors accepted from the host.
    pub sectors_written: u64,
    /// Unaligned requests serviced by read-modify-write.
    pub rmw_requests: u64,
    /// Full checkpoints written.
    pub checkpoints_full: u64,
    /// Incremental checkpoints written.
    pub checkpoints_incremental: u64,
    /// Frontier band rotations.
    pub frontier_rotations: u64,
    /// Metadata band rotations.
    pub map_band_rotations: u64,
    /// Bands returned to the free pool by cleaning.
    pub bands_cleaned: u64,
    /// Sectors moved by cleaning.
    pub sectors_relocated: u64,
    /// Defrag windows rewritten.
    pub defrag_passes: u64,
    /// Sectors rewritten by defrag.
    pub sectors_defragmented: u64,
    /// Log records applied while chasing frontiers on open.
    pub recovered_records: u64,
}

/// Snapshot of one group's allocation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStatus {
    /// Group index.
    pub group: u32,
    /// FREE bands.
    pub free: u32,
    /// FULL bands.
    pub full: u32,
    /// Current frontier band.
    pub frontier: u32,
    /// Allocation offset within the frontier.
    pub frontier_write_pointer: u32,
}

/// Mutable volume metadata, guarded by the volume lock.
pub(crate) struct VolumeState {
    pub(crate) sb: Superblock,
    pub(crate) map: ExtentMap,
    pub(crate) bands: BandTable,
    /// Next log sequence number.
    pub(crate) seq: u64,
    /// Oldest checkpoint record recovery needs.
    pub(crate) base: Pba,
    /// Active metadata band.
    pub(crate) map_band: u32,
    /// Last metadata header written.
    pub(crate) map_prev: Pba,
    /// Set after a metadata band rotation until a full checkpoint lands.
    pub(crate) need_full_checkpoint: bool,
    pub(crate) writes_since_checkpoint: u64,
    pub(crate) checkpoints: u64,
    /// Logical window `[begin, end)` a defrag pass is rewriting.
    pub(crate) defrag_window: Option<(Lba, Lba)>,
    /// In-flight device reads per band.
    pub(crate) read_pins: Vec<u32>,
    pub(crate) last_io: Instant,
    pub(crate) defrag_cursor: u32,
    pub(crate) stats: VolumeStats,
}

impl VolumeState {
    pub(crate) fn new(sb: Superblock, bands: BandTable) -> Self {
        let n_bands = sb.n_bands as usize;
        Self {
            sb,
            map: ExtentMap::new(),
            bands,
            seq: 0,
            base: Pba::new(1, 0),
            map_band: 1,
            map_prev: Pba::NULL,
            need_full_checkpoint: false,
            writes_since_checkpoint: 0,
            checkpoints: 0,
            defrag_window: None,
            read_pins: vec![0; n_bands],
            last_io: Instant::now(),
            defrag_cursor: 0,
            stats: VolumeStats::default(),
        }
    }

    /// True when `[lba, lba + sectors)` intersects the defrag window.
    pub(crate) fn in_defrag_window(&self, lba: Lba, sectors: u64) -> bool {
        match self.defrag_window {
            Some((begin, end)) => lba < end && lba + sectors > begin,
            None => false,
        }
    }

    pub(crate) fn group_status(&self, g: u32) -> GroupStatus {
        let group = self.bands.group(g);
        GroupStatus {
            group: g,
            free: group.free(),
            full: group.full(),
            frontier: group.frontier,
            frontier_write_pointer: self.bands.band(group.frontier).write_pointer,
        }
    }
}

/// State shared between the volume handle and its maintenance threads.
pub(crate) struct VolumeInner<D> {
    pub(crate) device: D,
    pub(crate) sb: Superblock,
    pub(crate) config: VolumeConfig,
    pub(crate) state: Mutex<VolumeState>,
    /// Signals cleaning finished, defrag window cleared, read pins dropped.
    pub(crate) cond: Condvar,
    /// One per group; held from allocation until the map update.
    pub(crate) append: Vec<Mutex<()>>,
    pub(crate) shutdown: Mutex<bool>,
    pub(crate) shutdown_cond: Condvar,
}

impl<D: ZoneDevice> VolumeInner<D> {
    pub(crate) fn new(device: D, config: VolumeConfig, state: VolumeState) -> Self {
        let sb = state.sb.clone();
        let append = (0..sb.n_groups).map(|_| Mutex::new(())).collect();
        Self {
            device,
            sb,
            config,
            state: Mutex::new(state),
            cond: Condvar::new(),
            append,
            shutdown: Mutex::new(false),
            shutdown_cond: Condvar::new(),
        }
    }

    /// Rejects requests that reach past the end of the volume.
    pub(crate) fn check_range(&self, lba: Lba, sectors: u64) -> StlResult<()> {
        let size = self.sb.size_sectors();
        if lba.checked_add(sectors).map_or(true, |end| end > size) {
            return Err(StlError::OutOfRange { lba, sectors, size });
        }
        Ok(())
    }

    /// Byte offset of sector `lba` for a request of `len` bytes.
    pub(crate) fn sector_offset(&self, lba: Lba, len: usize) -> StlResult<u64> {
        lba.checked_mul(SECTOR_SIZE as u64)
            .ok_or_else(|| StlError::OutOfRange {
                lba,
                sectors: sectors_for(len) as u64,
                size: self.sb.size_sectors(),
            })
    }

    /// Sectors `(first, count)` touched by `len` bytes at byte `offset`,
    /// checked against the volume size.
    pub(crate) fn byte_span(&self, offset: u64, len: usize) -> StlResult<(Lba, u64)> {
        let ss = SECTOR_SIZE as u64;
        let first = offset / ss;
        let Some(end) = offset.checked_add(len as u64) else {
            return Err(StlError::OutOfRange {
                lba: first,
                sectors: sectors_for(len) as u64,
                size: self.sb.size_sectors(),
            });
        };
        let sectors = end.div_ceil(ss) - first;
        self.check_range(first, sectors)?;
        Ok((first, sectors))
    }

    pub(crate) fn low_water(&self) -> u32 {
        self.config.frontier_low_water.max(4)
    }

    pub(crate) fn is_idle(&self, state: &VolumeState) -> bool {
        state.last_io.elapsed() >= self.config.maintenance.idle_after
    }
}

/// An open volume.
///
/// Dropping a volume without [`Volume::close`] stops its maintenance
/// threads but writes no checkpoint; the next open recovers from the log.
pub struct Volume<D: ZoneDevice + 'static> {
    inner: Arc<VolumeInner<D>>,
    workers: Vec<JoinHandle<()>>,
}

impl<D: ZoneDevice + 'static> Volume<D> {
    /// Lays out a fresh volume on `device`, discarding its contents.
    pub fn format(device: &D, config: &FormatConfig) -> StlResult<Superblock> {
        let sb = Superblock::new(device.band_count(), device.band_size(), config)?;
        for band in 0..sb.n_bands {
            if device.write_pointer(band)? != 0 {
                device.reset_pointer(band)?;
            }
        }
        device.write(0, 0, &sb.to_bytes()?)?;

        let mut state = VolumeState::new(sb.clone(), BandTable::formatted(&sb));
        state.bands.band_mut(0).write_pointer = 1;
        state.checkpoint(device, CheckpointKind::Full)?;
        device.flush()?;

        info!(
            groups = sb.n_groups,
            group_bands = sb.group_size,
            map_bands = sb.map_bands,
            size_sectors = sb.size_sectors(),
            "formatted volume"
        );
        Ok(sb)
    }

    /// Opens a formatted device, recovering state from the checkpoint log
    /// and any appends written after the last checkpoint.
    pub fn open(device: D, config: VolumeConfig) -> StlResult<Self> {
        let state = recovery::recover(&device)?;
        let inner = Arc::new(VolumeInner::new(device, config, state));
        let workers = maintenance::spawn_workers(&inner)?;
        info!(
            size_sectors = inner.sb.size_sectors(),
            workers = workers.len(),
            "volume opened"
        );
        Ok(Self { inner, workers })
    }

    /// Reads `buf.len()` bytes starting at sector `lba`.
    pub fn read(&self, lba: Lba, buf: &mut [u8]) -> StlResult<()> {
        let offset = self.inner.sector_offset(lba, buf.len())?;
        self.inner.read_at(offset, buf)
    }

    /// Writes `data` starting at sector `lba`. A partial last sector is
    /// merged with the existing contents.
    pub fn write(&self, lba: Lba, data: &[u8]) -> StlResult<()> {
        let offset = self.inner.sector_offset(lba, data.len())?;
        self.inner.write_at(offset, data)
    }

    /// Reads at an arbitrary byte offset.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> StlResult<()> {
        self.inner.read_at(offset, buf)
    }

    /// Writes at an arbitrary byte offset.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> StlResult<()> {
        self.inner.write_at(offset, data)
    }

    /// Unmaps `sectors` sectors at `lba`; they read back as zeros.
    pub fn trim(&self, lba: Lba, sectors: u64) -> StlResult<()> {
        self.inner.trim(lba, sectors)
    }

    /// Durability barrier for everything written so far.
    pub fn flush(&self) -> StlResult<()> {
        self.inner.device.flush()
    }

    /// Logical capacity in sectors.
    pub fn size_sectors(&self) -> u64 {
        self.inner.sb.size_sectors()
    }

    /// The volume superblock.
    pub fn superblock(&self) -> &Superblock {
        &self.inner.sb
    }

    /// Writes a checkpoint now.
    pub fn checkpoint(&self, kind: CheckpointKind) -> StlResult<()> {
        let mut state = self.inner.state.lock();
        state.checkpoint(&self.inner.device, kind)
    }

    /// Cleans group `group` until more than `min_free` bands are free.
    /// Returns the number of bands recycled.
    pub fn clean_group(&self, group: u32, min_free: u32, priority: Priority) -> StlResult<u32> {
        self.check_group(group)?;
        self.inner.clean_group(group, min_free, priority)
    }

    /// Runs one defrag pass over `group`. Returns the rewritten window, if
    /// any window was fragmented enough to be worth it.
    pub fn defrag_group(&self, group: u32) -> StlResult<Option<(Lba, Lba)>> {
        self.check_group(group)?;
        let idle = {
            let state = self.inner.state.lock();
            self.inner.is_idle(&state)
        };
        self.inner.defrag_group(group, idle)
    }

    /// Allocation state of `group`.
    pub fn group_status(&self, group: u32) -> StlResult<GroupStatus> {
        self.check_group(group)?;
        Ok(self.inner.state.lock().group_status(group))
    }

    /// Number of extents in the address map, trim placeholders included.
    pub fn extent_count(&self) -> usize {
        self.inner.state.lock().map.count()
    }

    /// Copy of every extent in logical order.
    pub fn extents(&self) -> Vec<Extent> {
        self.inner.state.lock().map.iter().map(|(_, e)| *e).collect()
    }

    /// Type of a data band.
    pub fn band_type(&self, band: u32) -> Option<BandType> {
        let state = self.inner.state.lock();
        state.bands.group_of(band).map(|_| state.bands.band(band).kind)
    }

    /// Volume counters.
    pub fn stats(&self) -> VolumeStats {
        self.inner.state.lock().stats.clone()
    }

    /// Verifies map and band table invariants.
    pub fn check(&self) -> StlResult<()> {
        let state = self.inner.state.lock();
        state
            .map
            .check_invariants()
            .and_then(|_| state.bands.check_invariants())
            .map_err(|reason| StlError::InvariantViolation { reason })
    }

    /// Stops maintenance, writes a full checkpoint and flushes the device.
    pub fn close(mut self) -> StlResult<()> {
        self.stop_workers();
        {
            let mut state = self.inner.state.lock();
            state.checkpoint(&self.inner.device, CheckpointKind::Full)?;
        }
        self.inner.device.flush()?;
        info!("volume closed");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<VolumeInner<D>> {
        &self.inner
    }

    fn check_group(&self, group: u32) -> StlResult<()> {
        if group >= self.inner.sb.n_groups {
            return Err(StlError::InvalidConfig(format!(
                "group {} does not exist (volume has {})",
                group, self.inner.sb.n_groups
            )));
        }
        Ok(())
    }

    fn stop_workers(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        *self.inner.shutdown.lock() = true;
        self.inner.shutdown_cond.notify_all();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("maintenance thread panicked");
            }
        }
    }
}

impl<D: ZoneDevice + 'static> Drop for Volume<D> {
    fn drop(&mut self) {
        self.stop_workers();
    }
}
