//! On-disk log records.
//!
//! Every appended region starts with a one-sector [`LogHeader`]. Headers
//! chain through `next`/`prev` links and carry a monotonically increasing
//! sequence number, which is all recovery needs to walk the log.
//!
//! BAND and MAP checkpoint records are followed by `records` entries packed
//! at a fixed number per sector. DATA headers bracket host data: the
//! trailing one carries a single inline [`MapRecord`] describing the data.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{StlError, StlResult};
use crate::types::{BandType, Lba, Pba, SECTOR_SIZE, STL_MAGIC};

/// Type of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    /// Band table snapshot.
    Band,
    /// Address map snapshot.
    Map,
    /// Host data header or trailer.
    Data,
    /// Padding link to another metadata band.
    Null,
}

/// One extent as logged: `len` sectors at `lba` live at `pba`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapRecord {
    /// First logical sector.
    pub lba: Lba,
    /// First physical sector, or `Pba::INVALID` for a trimmed range.
    pub pba: Pba,
    /// Length in sectors.
    pub len: u32,
}

/// One band table entry as logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandRecord {
    /// Band index.
    pub band: u32,
    /// Band state.
    pub kind: BandType,
    /// Write pointer; for the frontier, the committed append offset.
    pub write_pointer: u32,
}

/// Fixed-size payload records packed into whole sectors.
pub trait PackedRecord: Serialize + DeserializeOwned {
    /// Encoded size in bytes.
    const SIZE: usize;
    /// Records that fit in one sector.
    const PER_SECTOR: usize = SECTOR_SIZE / Self::SIZE;
}

impl PackedRecord for MapRecord {
    const SIZE: usize = 20;
}

impl PackedRecord for BandRecord {
    const SIZE: usize = 12;
}

/// Sectors needed for `count` packed records.
pub fn payload_sectors<T: PackedRecord>(count: usize) -> u32 {
    count.div_ceil(T::PER_SECTOR) as u32
}

/// Most inline map records a header sector can carry.
pub const MAX_INLINE_RECORDS: usize = 64;

/// Header sector of every log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogHeader {
    /// `STL_MAGIC`.
    pub magic: u32,
    /// Sequence number.
    pub seq: u64,
    /// Record type.
    pub kind: RecordKind,
    /// Payload records in the sectors that follow.
    pub records: u32,
    /// Location of the next record in this chain.
    pub next: Pba,
    /// Location of the previous record in this chain.
    pub prev: Pba,
    /// Oldest checkpoint record recovery must replay from.
    pub base: Pba,
    /// Map records carried in the header sector itself.
    pub inline: Vec<MapRecord>,
    /// CRC32 of the encoded header with this field zeroed.
    pub checksum: u32,
}

impl LogHeader {
    /// Creates a header with no records.
    pub fn new(kind: RecordKind, seq: u64, prev: Pba, next: Pba, base: Pba) -> Self {
        Self {
            magic: STL_MAGIC,
            seq,
            kind,
            records: 0,
            next,
            prev,
            base,
            inline: Vec::new(),
            checksum: 0,
        }
    }

    /// Sets the payload record count.
    pub fn with_records(mut self, records: u32) -> Self {
        self.records = records;
        self
    }

    /// Attaches one inline map record.
    pub fn with_inline(mut self, record: MapRecord) -> Self {
        self.inline.push(record);
        self
    }

    /// Sectors of payload following this header.
    pub fn payload_sectors(&self) -> u32 {
        match self.kind {
            RecordKind::Band => payload_sectors::<BandRecord>(self.records as usize),
            RecordKind::Map => payload_sectors::<MapRecord>(self.records as usize),
            RecordKind::Data | RecordKind::Null => 0,
        }
    }

    /// True for the empty record that closes a BAND or MAP section.
    pub fn is_closing(&self) -> bool {
        matches!(self.kind, RecordKind::Band | RecordKind::Map) && self.records == 0
    }

    fn compute_checksum(&self) -> StlResult<u32> {
        let mut copy = self.clone();
        copy.checksum = 0;
        Ok(crc32fast::hash(&bincode::serialize(&copy)?))
    }

    /// Encodes into one zero-padded sector.
    pub fn encode(&self) -> StlResult<Vec<u8>> {
        if self.inline.len() > MAX_INLINE_RECORDS {
            return Err(StlError::SerializationError {
                reason: format!("{} inline records do not fit a header", self.inline.len()),
            });
        }
        let mut sealed = self.clone();
        sealed.checksum = self.compute_checksum()?;
        let mut bytes = bincode::serialize(&sealed)?;
        bytes.resize(SECTOR_SIZE, 0);
        Ok(bytes)
    }

    /// Decodes a header sector. Returns `None` for anything that is not an
    /// intact header: blank media, payload sectors, torn writes.
    pub fn decode(sector: &[u8]) -> Option<LogHeader> {
        if sector.len() < 4 || sector[..4] != STL_MAGIC.to_le_bytes() {
            return None;
        }
        let header: LogHeader = bincode::deserialize(sector).ok()?;
        if header.inline.len() > MAX_INLINE_RECORDS {
            return None;
        }
        match header.compute_checksum() {
            Ok(sum) if sum == header.checksum => Some(header),
            _ => None,
        }
    }
}

/// Packs records into whole sectors.
pub fn encode_records<T: PackedRecord>(records: &[T]) -> StlResult<Vec<u8>> {
    let mut out = Vec::with_capacity(payload_sectors::<T>(records.len()) as usize * SECTOR_SIZE);
    for chunk in records.chunks(T::PER_SECTOR) {
        let start = out.len();
        for record in chunk {
            bincode::serialize_into(&mut out, record)?;
        }
        out.resize(start + SECTOR_SIZE, 0);
    }
    Ok(out)
}

/// Unpacks `count` records from payload sectors.
pub fn decode_records<T: PackedRecord>(payload: &[u8], count: usize) -> StlResult<Vec<T>> {
    let needed = payload_sectors::<T>(count) as usize * SECTOR_SIZE;
    if payload.len() < needed {
        return Err(StlError::SerializationError {
            reason: format!(
                "payload of {} bytes too short for {} records",
                payload.len(),
                count
            ),
        });
    }
    let mut records = Vec::with_capacity(count);
    for sector in payload.chunks(SECTOR_SIZE) {
        let mut cursor = sector;
        let take = (count - records.len()).min(T::PER_SECTOR);
        for _ in 0..take {
            records.push(bincode::deserialize_from(&mut cursor)?);
        }
        if records.len() == count {
            break;
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_record(i: u64) -> MapRecord {
        MapRecord {
            lba: i * 10,
            pba: Pba::new(5, i as u32),
            len: 10,
        }
    }

    #[test]
    fn test_record_sizes_match_packing() {
        assert_eq!(bincode::serialize(&map_record(1)).unwrap().len(), MapRecord::SIZE);
        let band = BandRecord {
            band: 3,
            kind: BandType::Frontier,
            write_pointer: 17,
        };
        assert_eq!(bincode::serialize(&band).unwrap().len(), BandRecord::SIZE);
        assert_eq!(MapRecord::PER_SECTOR, 204);
        assert_eq!(BandRecord::PER_SECTOR, 341);
    }

    #[test]
    fn test_header_encode_decode() {
        let header = LogHeader::new(RecordKind::Data, 42, Pba::new(5, 0), Pba::new(5, 9), Pba::new(1, 0))
            .with_inline(map_record(3));
        let sector = header.encode().unwrap();
        assert_eq!(sector.len(), SECTOR_SIZE);
        let back = LogHeader::decode(&sector).unwrap();
        assert_eq!(back.seq, 42);
        assert_eq!(back.kind, RecordKind::Data);
        assert_eq!(back.inline, vec![map_record(3)]);
        assert_eq!(back.next, Pba::new(5, 9));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(LogHeader::decode(&vec![0u8; SECTOR_SIZE]).is_none());
        let mut sector = LogHeader::new(RecordKind::Null, 1, Pba::NULL, Pba::NULL, Pba::NULL)
            .encode()
            .unwrap();
        sector[12] ^= 0x01;
        assert!(LogHeader::decode(&sector).is_none());
    }

    #[test]
    fn test_payload_sectors() {
        let header = LogHeader::new(RecordKind::Map, 1, Pba::NULL, Pba::NULL, Pba::NULL).with_records(205);
        assert_eq!(header.payload_sectors(), 2);
        let header = LogHeader::new(RecordKind::Band, 1, Pba::NULL, Pba::NULL, Pba::NULL).with_records(341);
        assert_eq!(header.payload_sectors(), 1);
        let header = LogHeader::new(RecordKind::Data, 1, Pba::NULL, Pba::NULL, Pba::NULL);
        assert_eq!(header.payload_sectors(), 0);
    }

    #[test]
    fn test_closing_header() {
        let closing = LogHeader::new(RecordKind::Map, 1, Pba::NULL, Pba::NULL, Pba::NULL);
        assert!(closing.is_closing());
        assert!(!closing.clone().with_records(1).is_closing());
        let data = LogHeader::new(RecordKind::Data, 1, Pba::NULL, Pba::NULL, Pba::NULL);
        assert!(!data.is_closing());
    }

    #[test]
    fn test_records_span_sectors() {
        let records: Vec<MapRecord> = (0..450).map(map_record).collect();
        let payload = encode_records(&records).unwrap();
        assert_eq!(payload.len(), 3 * SECTOR_SIZE);
        let back: Vec<MapRecord> = decode_records(&payload, records.len()).unwrap();
        assert_eq!(back, records);
    }

    #[test]
    fn test_decode_records_short_payload() {
        let payload = vec![0u8; SECTOR_SIZE];
        assert!(decode_records::<MapRecord>(&payload, 300).is_err());
    }

    #[test]
    fn test_too_many_inline_records() {
        let mut header = LogHeader::new(RecordKind::Data, 1, Pba::NULL, Pba::NULL, Pba::NULL);
        header.inline = (0..(MAX_INLINE_RECORDS as u64 + 1)).map(map_record).collect();
        assert!(header.encode().is_err());
    }
}
