//! Background maintenance threads.
//!
//! `stl-cleaner` keeps the most starved group above the background free
//! band target. `stl-defrag` writes idle or overdue checkpoints and
//! defragments a share of the groups on each tick, round robin. Both wake
//! on a fixed interval and exit as soon as shutdown is signalled.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::error::{StlError, StlResult};
use crate::types::Priority;
use crate::volume::VolumeInner;
use crate::zone::ZoneDevice;

/// Starts the maintenance threads if the volume config enables them.
pub(crate) fn spawn_workers<D: ZoneDevice + 'static>(
    inner: &Arc<VolumeInner<D>>,
) -> StlResult<Vec<JoinHandle<()>>> {
    if !inner.config.maintenance.enabled {
        return Ok(Vec::new());
    }
    let cleaner = Arc::clone(inner);
    let cleaner = thread::Builder::new()
        .name("stl-cleaner".to_string())
        .spawn(move || cleaner_loop(&cleaner))?;

    let defrag = Arc::clone(inner);
    let spawned = thread::Builder::new()
        .name("stl-defrag".to_string())
        .spawn(move || defrag_loop(&defrag));
    match spawned {
        Ok(defrag) => Ok(vec![cleaner, defrag]),
        Err(e) => {
            *inner.shutdown.lock() = true;
            inner.shutdown_cond.notify_all();
            let _ = cleaner.join();
            Err(e.into())
        }
    }
}

/// Sleeps one interval. Returns false once shutdown is requested.
fn wait_tick<D>(inner: &VolumeInner<D>) -> bool {
    let mut stop = inner.shutdown.lock();
    if !*stop {
        inner
            .shutdown_cond
            .wait_for(&mut stop, inner.config.maintenance.interval);
    }
    !*stop
}

fn stopping<D>(inner: &VolumeInner<D>) -> bool {
    *inner.shutdown.lock()
}

fn cleaner_loop<D: ZoneDevice>(inner: &VolumeInner<D>) {
    info!("cleaner started");
    while wait_tick(inner) {
        let (g, free) = {
            let state = inner.state.lock();
            (0..inner.sb.n_groups)
                .map(|g| (g, state.bands.group(g).free()))
                .min_by_key(|&(g, free)| (free, g))
                .unwrap_or((0, u32::MAX))
        };
        if free > inner.config.min_free_background {
            continue;
        }
        // Starved groups may spend the foreground reserve on relocation.
        let priority = if free <= inner.config.min_free_foreground {
            Priority::High
        } else {
            Priority::Normal
        };
        match inner.clean_group(g, inner.config.min_free_background, priority) {
            Ok(cleaned) => debug!(group = g, cleaned, "background cleaning done"),
            Err(StlError::CleaningFailed { reason, .. }) => {
                debug!(group = g, %reason, "background cleaning made no progress")
            }
            Err(e) => warn!(group = g, error = %e, "background cleaning failed"),
        }
    }
    info!("cleaner stopped");
}

fn defrag_loop<D: ZoneDevice>(inner: &VolumeInner<D>) {
    info!("defragmenter started");
    while wait_tick(inner) {
        let (idle, extents) = {
            let mut state = inner.state.lock();
            let idle = inner.is_idle(&state);
            let pending = state.writes_since_checkpoint;
            if pending > inner.config.checkpoint_interval_writes || (idle && pending > 0) {
                if let Err(e) = inner.auto_checkpoint(&mut state) {
                    warn!(error = %e, "background checkpoint failed");
                }
            }
            (idle, state.map.count() as u64)
        };

        let n_groups = inner.sb.n_groups;
        let mut budget = extents * 1536 / inner.sb.size_sectors().max(1);
        if !idle {
            budget /= 2;
        }
        for _ in 0..budget.min(n_groups as u64) {
            if stopping(inner) {
                break;
            }
            let g = {
                let mut state = inner.state.lock();
                let g = state.defrag_cursor % n_groups;
                state.defrag_cursor = (g + 1) % n_groups;
                g
            };
            match inner.defrag_group(g, idle) {
                Ok(Some((begin, end))) => debug!(group = g, begin, end, "background defrag pass"),
                Ok(None) => {}
                Err(e) => warn!(group = g, error = %e, "background defrag failed"),
            }
        }
    }
    info!("defragmenter stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FormatConfig, MaintenanceConfig, VolumeConfig};
    use crate::types::SECTOR_SIZE;
    use crate::volume::Volume;
    use crate::zone::MemZoneDevice;
    use std::time::{Duration, Instant};

    fn busy_config() -> VolumeConfig {
        VolumeConfig {
            maintenance: MaintenanceConfig {
                enabled: true,
                interval: Duration::from_millis(5),
                idle_after: Duration::ZERO,
            },
            ..VolumeConfig::default()
        }
    }

    fn open(config: VolumeConfig) -> (Arc<MemZoneDevice>, Volume<Arc<MemZoneDevice>>) {
        let dev = Arc::new(MemZoneDevice::new(11, 64));
        Volume::format(
            &dev,
            &FormatConfig {
                group_bands: 8,
                map_bands: 2,
                over_provisioning: 2.0,
            },
        )
        .unwrap();
        let vol = Volume::open(Arc::clone(&dev), config).unwrap();
        (dev, vol)
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_idle_checkpoint() {
        let (_dev, vol) = open(busy_config());
        vol.write(0, &vec![1u8; SECTOR_SIZE]).unwrap();
        assert!(wait_until(|| vol.stats().checkpoints_incremental > 0));
        vol.close().unwrap();
    }

    #[test]
    fn test_background_cleaning() {
        let mut config = busy_config();
        config.min_free_background = 6;
        let (_dev, vol) = open(config);
        for i in 0..5u64 {
            vol.write(i * 10, &vec![1u8; 10 * SECTOR_SIZE]).unwrap();
        }
        vol.write(50, &vec![2u8; 2 * SECTOR_SIZE]).unwrap();
        vol.write(0, &vec![3u8; 40 * SECTOR_SIZE]).unwrap();

        assert!(wait_until(|| vol.stats().bands_cleaned > 0));
        let mut buf = vec![0u8; 10 * SECTOR_SIZE];
        vol.read(40, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 1));
        vol.close().unwrap();
    }

    #[test]
    fn test_workers_stop_on_drop() {
        let (dev, vol) = open(busy_config());
        drop(vol);
        // Threads are joined; the device is no longer shared with them.
        assert_eq!(Arc::strong_count(&dev), 1);
    }

    #[test]
    fn test_disabled_spawns_nothing() {
        let (_dev, vol) = open(VolumeConfig::foreground_only());
        assert_eq!(Arc::strong_count(vol.inner()), 1);
    }
}
