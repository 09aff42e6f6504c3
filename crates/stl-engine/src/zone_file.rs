//! File-backed zoned device.
//!
//! Emulates an SMR drive inside a regular (sparse) image file:
//!
//! ```text
//! [ band 0 | band 1 | ... | band N-1 | write pointer table | geometry ]
//! ```
//!
//! The write pointer table holds one little-endian `u32` per band and is
//! padded to whole sectors. The last sector holds the geometry so an image
//! can be reopened without being told its shape.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{StlError, StlResult};
use crate::types::{sectors_for, SECTOR_SIZE, STL_MAGIC};
use crate::zone::{check_transfer, ZoneDevice, ZoneIoStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct ImageGeometry {
    magic: u32,
    band_count: u32,
    band_size: u32,
}

/// Zoned device emulated by an image file.
pub struct FileZoneDevice {
    path: PathBuf,
    file: File,
    band_count: u32,
    band_size: u32,
    write_pointers: Mutex<Vec<u32>>,
    stats: Mutex<ZoneIoStats>,
}

impl FileZoneDevice {
    /// Creates (or truncates) an image with the given geometry. All bands
    /// start empty.
    pub fn create(path: impl AsRef<Path>, band_count: u32, band_size: u32) -> StlResult<Self> {
        if band_count == 0 || band_size == 0 {
            return Err(StlError::InvalidConfig(format!(
                "image geometry {} x {} is empty",
                band_count, band_size
            )));
        }
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let dev = Self {
            path,
            file,
            band_count,
            band_size,
            write_pointers: Mutex::new(vec![0; band_count as usize]),
            stats: Mutex::new(ZoneIoStats::default()),
        };
        dev.file.set_len(dev.image_len())?;
        dev.file
            .write_all_at(&vec![0u8; dev.table_sectors() * SECTOR_SIZE], dev.table_offset())?;

        let geometry = ImageGeometry {
            magic: STL_MAGIC,
            band_count,
            band_size,
        };
        let mut trailer = bincode::serialize(&geometry)?;
        trailer.resize(SECTOR_SIZE, 0);
        dev.file.write_all_at(&trailer, dev.image_len() - SECTOR_SIZE as u64)?;
        dev.file.sync_all()?;

        info!(
            path = %dev.path.display(),
            band_count,
            band_size,
            "created zoned device image"
        );
        Ok(dev)
    }

    /// Opens an existing image and loads its write pointers.
    pub fn open(path: impl AsRef<Path>) -> StlResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        if len < SECTOR_SIZE as u64 {
            return Err(StlError::DeviceError {
                band: 0,
                reason: format!("image {} is too small", path.display()),
            });
        }

        let mut trailer = vec![0u8; SECTOR_SIZE];
        file.read_exact_at(&mut trailer, len - SECTOR_SIZE as u64)?;
        let geometry: ImageGeometry = bincode::deserialize(&trailer)?;
        if geometry.magic != STL_MAGIC {
            return Err(StlError::DeviceError {
                band: 0,
                reason: format!("image {} has no geometry trailer", path.display()),
            });
        }

        let mut dev = Self {
            path,
            file,
            band_count: geometry.band_count,
            band_size: geometry.band_size,
            write_pointers: Mutex::new(Vec::new()),
            stats: Mutex::new(ZoneIoStats::default()),
        };
        if dev.image_len() != len {
            return Err(StlError::DeviceError {
                band: 0,
                reason: format!(
                    "image length {} does not match geometry {} x {}",
                    len, geometry.band_count, geometry.band_size
                ),
            });
        }

        let mut table = vec![0u8; geometry.band_count as usize * 4];
        dev.file.read_exact_at(&mut table, dev.table_offset())?;
        let pointers: Vec<u32> = table
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        if let Some(bad) = pointers.iter().position(|&wp| wp > geometry.band_size) {
            return Err(StlError::DeviceError {
                band: bad as u32,
                reason: "persisted write pointer beyond band end".to_string(),
            });
        }
        dev.write_pointers = Mutex::new(pointers);

        debug!(
            path = %dev.path.display(),
            band_count = dev.band_count,
            band_size = dev.band_size,
            "opened zoned device image"
        );
        Ok(dev)
    }

    /// Path of the backing image.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn band_bytes(&self) -> u64 {
        self.band_size as u64 * SECTOR_SIZE as u64
    }

    fn table_offset(&self) -> u64 {
        self.band_count as u64 * self.band_bytes()
    }

    fn table_sectors(&self) -> usize {
        sectors_for(self.band_count as usize * 4)
    }

    fn image_len(&self) -> u64 {
        self.table_offset() + ((self.table_sectors() + 1) * SECTOR_SIZE) as u64
    }

    fn sector_offset(&self, band: u32, offset: u32) -> u64 {
        band as u64 * self.band_bytes() + offset as u64 * SECTOR_SIZE as u64
    }

    fn persist_pointer(&self, band: u32, wp: u32) -> StlResult<()> {
        self.file
            .write_all_at(&wp.to_le_bytes(), self.table_offset() + band as u64 * 4)?;
        Ok(())
    }

    fn update_stats<F>(&self, f: F)
    where
        F: FnOnce(&mut ZoneIoStats),
    {
        f(&mut self.stats.lock());
    }
}

impl ZoneDevice for FileZoneDevice {
    fn band_count(&self) -> u32 {
        self.band_count
    }

    fn band_size(&self) -> u32 {
        self.band_size
    }

    fn write_pointer(&self, band: u32) -> StlResult<u32> {
        self.write_pointers
            .lock()
            .get(band as usize)
            .copied()
            .ok_or(StlError::DeviceError {
                band,
                reason: "band out of range".to_string(),
            })
    }

    fn read(&self, band: u32, offset: u32, buf: &mut [u8]) -> StlResult<()> {
        let sectors = check_transfer(band, offset, buf.len(), self.band_count, self.band_size)?;
        let wp = self.write_pointer(band)?;
        let valid = wp.saturating_sub(offset).min(sectors) as usize * SECTOR_SIZE;
        if valid > 0 {
            if let Err(e) = self
                .file
                .read_exact_at(&mut buf[..valid], self.sector_offset(band, offset))
            {
                self.update_stats(|s| s.errors += 1);
                return Err(e.into());
            }
        }
        buf[valid..].fill(0);
        self.update_stats(|s| {
            s.reads += 1;
            s.sectors_read += sectors as u64;
        });
        Ok(())
    }

    fn write(&self, band: u32, offset: u32, buf: &[u8]) -> StlResult<()> {
        let sectors = check_transfer(band, offset, buf.len(), self.band_count, self.band_size)?;
        let mut pointers = self.write_pointers.lock();
        let wp = pointers[band as usize];
        if wp != offset {
            drop(pointers);
            self.update_stats(|s| s.errors += 1);
            return Err(StlError::WritePointerMismatch {
                band,
                expected: wp,
                actual: offset,
            });
        }
        if let Err(e) = self.file.write_all_at(buf, self.sector_offset(band, offset)) {
            drop(pointers);
            self.update_stats(|s| s.errors += 1);
            return Err(e.into());
        }
        let next = offset + sectors;
        self.persist_pointer(band, next)?;
        pointers[band as usize] = next;
        drop(pointers);
        self.update_stats(|s| {
            s.writes += 1;
            s.sectors_written += sectors as u64;
        });
        Ok(())
    }

    fn reset_pointer(&self, band: u32) -> StlResult<()> {
        let mut pointers = self.write_pointers.lock();
        if band as usize >= pointers.len() {
            return Err(StlError::DeviceError {
                band,
                reason: "band out of range".to_string(),
            });
        }
        self.persist_pointer(band, 0)?;
        pointers[band as usize] = 0;
        drop(pointers);
        debug!(band, "band write pointer reset");
        self.update_stats(|s| s.resets += 1);
        Ok(())
    }

    fn flush(&self) -> StlResult<()> {
        self.file.sync_data()?;
        self.update_stats(|s| s.flushes += 1);
        Ok(())
    }

    fn stats(&self) -> ZoneIoStats {
        self.stats.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn image(dir: &TempDir) -> PathBuf {
        dir.path().join("disk.img")
    }

    #[test]
    fn test_create_and_reopen_geometry() {
        let dir = TempDir::new().unwrap();
        let dev = FileZoneDevice::create(image(&dir), 5, 16).unwrap();
        assert_eq!(dev.band_count(), 5);
        drop(dev);

        let dev = FileZoneDevice::open(image(&dir)).unwrap();
        assert_eq!(dev.band_count(), 5);
        assert_eq!(dev.band_size(), 16);
        assert_eq!(dev.write_pointer(4).unwrap(), 0);
    }

    #[test]
    fn test_write_pointers_persist() {
        let dir = TempDir::new().unwrap();
        let dev = FileZoneDevice::create(image(&dir), 3, 16).unwrap();
        dev.write(2, 0, &vec![0x5a; 3 * SECTOR_SIZE]).unwrap();
        dev.flush().unwrap();
        drop(dev);

        let dev = FileZoneDevice::open(image(&dir)).unwrap();
        assert_eq!(dev.write_pointer(2).unwrap(), 3);
        let mut buf = vec![0u8; 4 * SECTOR_SIZE];
        dev.read(2, 0, &mut buf).unwrap();
        assert!(buf[..3 * SECTOR_SIZE].iter().all(|&b| b == 0x5a));
        assert!(buf[3 * SECTOR_SIZE..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_reset_hides_old_contents() {
        let dir = TempDir::new().unwrap();
        let dev = FileZoneDevice::create(image(&dir), 2, 8).unwrap();
        dev.write(1, 0, &vec![1u8; SECTOR_SIZE]).unwrap();
        dev.reset_pointer(1).unwrap();
        let mut buf = vec![9u8; SECTOR_SIZE];
        dev.read(1, 0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(dev.write_pointer(1).unwrap(), 0);
    }

    #[test]
    fn test_sequential_write_enforced() {
        let dir = TempDir::new().unwrap();
        let dev = FileZoneDevice::create(image(&dir), 2, 8).unwrap();
        let err = dev.write(0, 1, &vec![0u8; SECTOR_SIZE]).unwrap_err();
        assert!(matches!(err, StlError::WritePointerMismatch { .. }));
    }

    #[test]
    fn test_open_rejects_foreign_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(image(&dir), vec![0u8; 3 * SECTOR_SIZE]).unwrap();
        assert!(FileZoneDevice::open(image(&dir)).is_err());
    }
}
