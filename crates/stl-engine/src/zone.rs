//! Zoned device contract.
//!
//! A zoned device is a set of equally sized bands, each with a write
//! pointer. Writes must start exactly at the pointer and advance it; the
//! only way back is a pointer reset, which discards the band's contents.
//! The engine consumes devices through [`ZoneDevice`] and never learns
//! which back end it is talking to.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::error::{StlError, StlResult};
use crate::types::SECTOR_SIZE;

/// Per-device I/O counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZoneIoStats {
    /// Read requests completed.
    pub reads: u64,
    /// Write requests completed.
    pub writes: u64,
    /// Sectors read.
    pub sectors_read: u64,
    /// Sectors written.
    pub sectors_written: u64,
    /// Write pointer resets.
    pub resets: u64,
    /// Flushes issued.
    pub flushes: u64,
    /// Failed requests.
    pub errors: u64,
}

/// Sector I/O against an append-only zoned device.
///
/// Buffers are whole sectors; the sector count of a transfer is
/// `buf.len() / SECTOR_SIZE`.
pub trait ZoneDevice: Send + Sync {
    /// Number of bands on the device.
    fn band_count(&self) -> u32;

    /// Sectors per band.
    fn band_size(&self) -> u32;

    /// Next writable sector offset of `band`.
    fn write_pointer(&self, band: u32) -> StlResult<u32>;

    /// Reads `buf.len() / SECTOR_SIZE` sectors starting at `offset`.
    /// Sectors at or beyond the write pointer read as zeros.
    fn read(&self, band: u32, offset: u32, buf: &mut [u8]) -> StlResult<()>;

    /// Appends sectors at `offset`, which must equal the write pointer.
    fn write(&self, band: u32, offset: u32, buf: &[u8]) -> StlResult<()>;

    /// Rewinds the band to empty.
    fn reset_pointer(&self, band: u32) -> StlResult<()>;

    /// Durability barrier.
    fn flush(&self) -> StlResult<()>;

    /// I/O counters.
    fn stats(&self) -> ZoneIoStats;
}

impl<T: ZoneDevice + ?Sized> ZoneDevice for Arc<T> {
    fn band_count(&self) -> u32 {
        (**self).band_count()
    }

    fn band_size(&self) -> u32 {
        (**self).band_size()
    }

    fn write_pointer(&self, band: u32) -> StlResult<u32> {
        (**self).write_pointer(band)
    }

    fn read(&self, band: u32, offset: u32, buf: &mut [u8]) -> StlResult<()> {
        (**self).read(band, offset, buf)
    }

    fn write(&self, band: u32, offset: u32, buf: &[u8]) -> StlResult<()> {
        (**self).write(band, offset, buf)
    }

    fn reset_pointer(&self, band: u32) -> StlResult<()> {
        (**self).reset_pointer(band)
    }

    fn flush(&self) -> StlResult<()> {
        (**self).flush()
    }

    fn stats(&self) -> ZoneIoStats {
        (**self).stats()
    }
}

/// Validates a transfer against the device geometry and returns its
/// length in sectors.
pub(crate) fn check_transfer(
    band: u32,
    offset: u32,
    len: usize,
    band_count: u32,
    band_size: u32,
) -> StlResult<u32> {
    if band >= band_count {
        return Err(StlError::DeviceError {
            band,
            reason: format!("band out of range (device has {} bands)", band_count),
        });
    }
    if len % SECTOR_SIZE != 0 {
        return Err(StlError::DeviceError {
            band,
            reason: format!("transfer of {} bytes is not sector aligned", len),
        });
    }
    let sectors = (len / SECTOR_SIZE) as u64;
    if offset as u64 + sectors > band_size as u64 {
        return Err(StlError::DeviceError {
            band,
            reason: format!(
                "transfer of {} sectors at offset {} crosses band end {}",
                sectors, offset, band_size
            ),
        });
    }
    Ok(sectors as u32)
}

struct MemBand {
    data: Vec<u8>,
}

impl MemBand {
    fn write_pointer(&self) -> u32 {
        (self.data.len() / SECTOR_SIZE) as u32
    }
}

/// In-memory zoned device.
///
/// Band contents grow lazily as they are written, so large geometries cost
/// only what is actually stored. Clones of an `Arc<MemZoneDevice>` share the
/// same media, which lets tests drop a volume without closing it and reopen
/// the "disk" afterwards.
pub struct MemZoneDevice {
    band_size: u32,
    bands: Mutex<Vec<MemBand>>,
    fail_writes: Mutex<u32>,
    stats: Mutex<ZoneIoStats>,
}

impl MemZoneDevice {
    /// Creates an empty device.
    pub fn new(band_count: u32, band_size: u32) -> Self {
        let bands = (0..band_count).map(|_| MemBand { data: Vec::new() }).collect();
        Self {
            band_size,
            bands: Mutex::new(bands),
            fail_writes: Mutex::new(0),
            stats: Mutex::new(ZoneIoStats::default()),
        }
    }

    /// Makes the next `count` writes fail with a device error without
    /// touching the media.
    pub fn fail_next_writes(&self, count: u32) {
        *self.fail_writes.lock() = count;
    }

    fn update_stats<F>(&self, f: F)
    where
        F: FnOnce(&mut ZoneIoStats),
    {
        f(&mut self.stats.lock());
    }
}

impl ZoneDevice for MemZoneDevice {
    fn band_count(&self) -> u32 {
        self.bands.lock().len() as u32
    }

    fn band_size(&self) -> u32 {
        self.band_size
    }

    fn write_pointer(&self, band: u32) -> StlResult<u32> {
        let bands = self.bands.lock();
        bands
            .get(band as usize)
            .map(MemBand::write_pointer)
            .ok_or(StlError::DeviceError {
                band,
                reason: "band out of range".to_string(),
            })
    }

    fn read(&self, band: u32, offset: u32, buf: &mut [u8]) -> StlResult<()> {
        let bands = self.bands.lock();
        let sectors = check_transfer(band, offset, buf.len(), bands.len() as u32, self.band_size)?;
        let stored = &bands[band as usize].data;
        let start = offset as usize * SECTOR_SIZE;
        let avail = stored.len().saturating_sub(start).min(buf.len());
        buf[..avail].copy_from_slice(&stored[start..start + avail]);
        buf[avail..].fill(0);
        drop(bands);
        self.update_stats(|s| {
            s.reads += 1;
            s.sectors_read += sectors as u64;
        });
        Ok(())
    }

    fn write(&self, band: u32, offset: u32, buf: &[u8]) -> StlResult<()> {
        {
            let mut pending = self.fail_writes.lock();
            if *pending > 0 {
                *pending -= 1;
                drop(pending);
                self.update_stats(|s| s.errors += 1);
                return Err(StlError::DeviceError {
                    band,
                    reason: "injected write failure".to_string(),
                });
            }
        }
        let mut bands = self.bands.lock();
        let sectors = check_transfer(band, offset, buf.len(), bands.len() as u32, self.band_size)?;
        let target = &mut bands[band as usize];
        let wp = target.write_pointer();
        if wp != offset {
            drop(bands);
            self.update_stats(|s| s.errors += 1);
            return Err(StlError::WritePointerMismatch {
                band,
                expected: wp,
                actual: offset,
            });
        }
        target.data.extend_from_slice(buf);
        drop(bands);
        self.update_stats(|s| {
            s.writes += 1;
            s.sectors_written += sectors as u64;
        });
        Ok(())
    }

    fn reset_pointer(&self, band: u32) -> StlResult<()> {
        let mut bands = self.bands.lock();
        let target = bands.get_mut(band as usize).ok_or(StlError::DeviceError {
            band,
            reason: "band out of range".to_string(),
        })?;
        target.data = Vec::new();
        drop(bands);
        debug!(band, "band write pointer reset");
        self.update_stats(|s| s.resets += 1);
        Ok(())
    }

    fn flush(&self) -> StlResult<()> {
        self.update_stats(|s| s.flushes += 1);
        Ok(())
    }

    fn stats(&self) -> ZoneIoStats {
        self.stats.lock().clone()
    }
}
