//! Volume and format configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Layout parameters chosen when a device is formatted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatConfig {
    /// Bands per group.
    pub group_bands: u32,
    /// Number of metadata (checkpoint log) bands.
    pub map_bands: u32,
    /// Physical to logical capacity ratio of each group. Must exceed 1.0
    /// so cleaning always has garbage to reclaim.
    pub over_provisioning: f64,
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self {
            group_bands: 32,
            map_bands: 4,
            over_provisioning: 1.25,
        }
    }
}

/// Background maintenance cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Spawn the cleaner and defragmenter threads on open.
    pub enabled: bool,
    /// How often each background thread wakes up.
    pub interval: Duration,
    /// Host inactivity after which the volume counts as idle.
    pub idle_after: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(1),
            idle_after: Duration::from_secs(2),
        }
    }
}

impl MaintenanceConfig {
    /// No background threads; maintenance only runs when called directly.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Runtime tunables for an open volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Free bands a forced cleaning pass restores, and the reserve that
    /// normal-priority allocation must leave untouched.
    pub min_free_foreground: u32,
    /// Free bands background cleaning aims to keep per group.
    pub min_free_background: u32,
    /// Rotate the frontier once fewer than this many sectors remain.
    pub frontier_low_water: u32,
    /// Cleaning attempts an allocation makes before reporting out-of-space.
    pub alloc_retries: u32,
    /// Bands one cleaning pass may recycle before giving up.
    pub clean_max_iterations: u32,
    /// Host writes between automatic checkpoints.
    pub checkpoint_interval_writes: u64,
    /// Every n-th automatic checkpoint is a full one.
    pub full_checkpoint_every: u64,
    /// Upper bound on the defrag window in sectors.
    pub defrag_window_max: u32,
    /// Minimum extents in a window before it is worth defragmenting.
    pub defrag_min_extents: usize,
    /// Background thread settings.
    pub maintenance: MaintenanceConfig,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            min_free_foreground: 2,
            min_free_background: 4,
            frontier_low_water: 8,
            alloc_retries: 8,
            clean_max_iterations: 10,
            checkpoint_interval_writes: 2000,
            full_checkpoint_every: 10,
            defrag_window_max: 2045,
            defrag_min_extents: 4,
            maintenance: MaintenanceConfig::default(),
        }
    }
}

impl VolumeConfig {
    /// Default tunables with background threads turned off.
    pub fn foreground_only() -> Self {
        Self {
            maintenance: MaintenanceConfig::disabled(),
            ..Self::default()
        }
    }

    /// Defrag window for a given band size. A window plus its two header
    /// sectors fits comfortably inside one band.
    pub fn defrag_window(&self, band_size: u32) -> u32 {
        self.defrag_window_max.min((band_size / 2).saturating_sub(3)).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_defaults() {
        let config = VolumeConfig::default();
        assert_eq!(config.min_free_foreground, 2);
        assert_eq!(config.min_free_background, 4);
        assert_eq!(config.frontier_low_water, 8);
        assert_eq!(config.checkpoint_interval_writes, 2000);
        assert_eq!(config.full_checkpoint_every, 10);
        assert!(config.maintenance.enabled);
    }

    #[test]
    fn test_foreground_only() {
        let config = VolumeConfig::foreground_only();
        assert!(!config.maintenance.enabled);
        assert_eq!(config.alloc_retries, 8);
    }

    #[test]
    fn test_defrag_window_bounded_by_band() {
        let config = VolumeConfig::default();
        assert_eq!(config.defrag_window(1024), 509);
        assert_eq!(config.defrag_window(65536), 2045);
        assert_eq!(config.defrag_window(4), 1);
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = VolumeConfig::default();
        let bytes = bincode::serialize(&config).unwrap();
        let back: VolumeConfig = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.alloc_retries, config.alloc_retries);
        assert_eq!(back.maintenance.interval, config.maintenance.interval);
    }
}
