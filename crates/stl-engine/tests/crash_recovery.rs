//! Crash and reopen scenarios against the public volume API.
//!
//! A crash is simulated by dropping the volume without `close`, which
//! stops maintenance but writes no checkpoint.

use std::sync::Arc;

use stl_engine::{
    BandType, CheckpointKind, FileZoneDevice, FormatConfig, MemZoneDevice, Priority, StlError,
    Volume, VolumeConfig, ZoneDevice, SECTOR_SIZE,
};
use tempfile::TempDir;

fn format_config() -> FormatConfig {
    FormatConfig {
        group_bands: 8,
        map_bands: 4,
        over_provisioning: 1.5,
    }
}

/// Every sector carries its own address and a salt.
fn pattern(lba: u64, sectors: usize, salt: u8) -> Vec<u8> {
    let mut data = vec![salt; sectors * SECTOR_SIZE];
    for (i, chunk) in data.chunks_mut(SECTOR_SIZE).enumerate() {
        chunk[..8].copy_from_slice(&(lba + i as u64).to_le_bytes());
    }
    data
}

fn open<D: ZoneDevice + 'static>(dev: D) -> Volume<D> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    Volume::open(dev, VolumeConfig::foreground_only()).unwrap()
}

fn verify<D: ZoneDevice + 'static>(vol: &Volume<D>, lba: u64, sectors: usize, salt: u8) {
    let mut buf = vec![0u8; sectors * SECTOR_SIZE];
    vol.read(lba, &mut buf).unwrap();
    for (i, (got, want)) in buf
        .chunks(SECTOR_SIZE)
        .zip(pattern(lba, sectors, salt).chunks(SECTOR_SIZE))
        .enumerate()
    {
        assert!(got == want, "sector {} differs", lba + i as u64);
    }
}

fn verify_zero<D: ZoneDevice + 'static>(vol: &Volume<D>, lba: u64, sectors: usize) {
    let mut buf = vec![0xffu8; sectors * SECTOR_SIZE];
    vol.read(lba, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0), "range at {} is not zero", lba);
}

#[test]
fn test_crash_after_checkpoint_recovers_everything() {
    let dev = Arc::new(MemZoneDevice::new(21, 1024));
    Volume::format(&dev, &format_config()).unwrap();
    let vol = open(Arc::clone(&dev));
    assert_eq!(vol.size_sectors(), 10922);

    for lba in (0..6000u64).step_by(100) {
        vol.write(lba, &pattern(lba, 100, 0x5a)).unwrap();
    }
    vol.checkpoint(CheckpointKind::Full).unwrap();
    // The fifth write crosses from band 13 into band 14.
    for lba in (6000..6500u64).step_by(100) {
        vol.write(lba, &pattern(lba, 100, 0x5a)).unwrap();
    }
    let before: Vec<_> = (0..2).map(|g| vol.group_status(g).unwrap()).collect();
    drop(vol);

    let vol = open(Arc::clone(&dev));
    assert_eq!(vol.stats().recovered_records, 6);
    verify(&vol, 0, 6500, 0x5a);
    let after: Vec<_> = (0..2).map(|g| vol.group_status(g).unwrap()).collect();
    assert_eq!(before, after);
    vol.check().unwrap();
}

#[test]
fn test_crash_without_any_checkpoint() {
    let dev = Arc::new(MemZoneDevice::new(21, 1024));
    Volume::format(&dev, &format_config()).unwrap();
    let vol = open(Arc::clone(&dev));
    // Enough to rotate group 0's frontier a few times.
    for lba in (0..3000u64).step_by(250) {
        vol.write(lba, &pattern(lba, 250, 1)).unwrap();
    }
    vol.write(100, &pattern(100, 50, 2)).unwrap();
    let rotations = vol.stats().frontier_rotations;
    assert!(rotations >= 2);
    drop(vol);

    let vol = open(Arc::clone(&dev));
    verify(&vol, 0, 100, 1);
    verify(&vol, 100, 50, 2);
    verify(&vol, 150, 2850, 1);
    assert_eq!(vol.stats().checkpoints_full, 1);
    vol.check().unwrap();
}

#[test]
fn test_repeated_crashes_keep_latest_data() {
    let dev = Arc::new(MemZoneDevice::new(21, 1024));
    Volume::format(&dev, &format_config()).unwrap();
    for round in 0..4u8 {
        let vol = open(Arc::clone(&dev));
        if round > 0 {
            verify(&vol, 0, 64, round);
        }
        vol.write(0, &pattern(0, 64, round + 1)).unwrap();
        vol.write(5500, &pattern(5500, 8, round + 1)).unwrap();
        if round % 2 == 0 {
            vol.checkpoint(CheckpointKind::Incremental).unwrap();
        }
        drop(vol);
    }
    let vol = open(Arc::clone(&dev));
    verify(&vol, 0, 64, 4);
    verify(&vol, 5500, 8, 4);
    vol.close().unwrap();
}

#[test]
fn test_trim_survives_checkpoint_and_crash() {
    let dev = Arc::new(MemZoneDevice::new(21, 1024));
    Volume::format(&dev, &format_config()).unwrap();
    let vol = open(Arc::clone(&dev));
    vol.write(0, &pattern(0, 32, 7)).unwrap();
    vol.checkpoint(CheckpointKind::Full).unwrap();
    vol.trim(8, 16).unwrap();
    vol.checkpoint(CheckpointKind::Incremental).unwrap();
    drop(vol);

    let vol = open(Arc::clone(&dev));
    verify_zero(&vol, 8, 16);
    verify(&vol, 0, 8, 7);
    verify(&vol, 24, 8, 7);
}

#[test]
fn test_cleaning_conserves_data() {
    let dev = Arc::new(MemZoneDevice::new(21, 1024));
    Volume::format(&dev, &format_config()).unwrap();
    let vol = open(Arc::clone(&dev));
    // Fill band 5 and move on, then overwrite or trim most of what it holds.
    for lba in (0..1000u64).step_by(100) {
        vol.write(lba, &pattern(lba, 100, 1)).unwrap();
    }
    vol.write(1000, &pattern(1000, 10, 1)).unwrap();
    vol.write(0, &pattern(0, 400, 2)).unwrap();
    vol.trim(400, 500).unwrap();
    assert_eq!(vol.band_type(5), Some(BandType::Full));

    let free = vol.group_status(0).unwrap().free;
    assert_eq!(vol.clean_group(0, free, Priority::High).unwrap(), 1);
    assert_eq!(vol.group_status(0).unwrap().free, free + 1);
    assert_eq!(vol.band_type(5), Some(BandType::Free));
    assert_eq!(vol.stats().sectors_relocated, 100);
    verify(&vol, 0, 400, 2);
    verify_zero(&vol, 400, 500);
    verify(&vol, 900, 110, 1);

    drop(vol);
    let vol = open(Arc::clone(&dev));
    verify(&vol, 0, 400, 2);
    verify_zero(&vol, 400, 500);
    verify(&vol, 900, 110, 1);
    vol.check().unwrap();
}

#[test]
fn test_corrupted_superblock_rejected() {
    let dev = Arc::new(MemZoneDevice::new(21, 1024));
    Volume::format(&dev, &format_config()).unwrap();
    dev.reset_pointer(0).unwrap();
    dev.write(0, 0, &vec![0xab; SECTOR_SIZE]).unwrap();
    assert!(matches!(
        Volume::open(Arc::clone(&dev), VolumeConfig::foreground_only()),
        Err(StlError::CorruptedSuperblock { .. })
    ));
}

#[test]
fn test_file_device_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("smr.img");
    {
        let dev = FileZoneDevice::create(&path, 21, 256).unwrap();
        Volume::format(&dev, &format_config()).unwrap();
        let vol = open(dev);
        vol.write(10, &pattern(10, 20, 3)).unwrap();
        vol.close().unwrap();
    }
    {
        let vol = open(FileZoneDevice::open(&path).unwrap());
        verify(&vol, 10, 20, 3);
        vol.write(500, &pattern(500, 4, 4)).unwrap();
        // Crash: no close.
    }
    let vol = open(FileZoneDevice::open(&path).unwrap());
    verify(&vol, 10, 20, 3);
    verify(&vol, 500, 4, 4);
    assert_eq!(vol.stats().recovered_records, 1);
    vol.close().unwrap();
}
