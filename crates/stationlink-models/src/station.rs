//! Station records and their fixed-width binary layout.
//!
//! Every station occupies exactly [`RECORD_SIZE`] bytes in the device table,
//! station `i` starting at byte offset `i * RECORD_SIZE`.

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Size in bytes of one station record in the device table.
pub const RECORD_SIZE: usize = 10;

/// Largest station table that fits a 16-bit register address space of
/// two-byte registers.
pub const MAX_STATIONS: u32 = (0x1_0000 * 2 / RECORD_SIZE) as u32;

/// One undecoded station block exactly as it sits in the device table.
pub type RawRecord = [u8; RECORD_SIZE];

const OCCUPIED_BIT: u8 = 0x01;
const CALL_STATION_BIT: u8 = 0x02;

// ---------------------------------------------------------------------------
// StationRecord
// ---------------------------------------------------------------------------

/// The decoded state of one physical station.
///
/// Serialises to the batch-chunk entry layout:
/// `{ "index", "Occupied", "CallStation", "Field3", "Type", "OldStation", "Reserve2" }`.
///
/// # Examples
///
/// ```
/// use stationlink_models::StationRecord;
///
/// let raw = [0x01, 0x00, 0x00, 0x05, 0x00, 0x2A, 0xFF, 0xFF, 0x00, 0x00];
/// let record = StationRecord::decode(3, &raw);
/// assert!(record.occupied);
/// assert_eq!(record.kind, 42);
/// assert_eq!(record.old_station, -1);
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "PascalCase")]
pub struct StationRecord {
    /// Position of the station in the device table.
    #[serde(rename = "index")]
    pub index: u32,
    /// Bit 0 of byte 0.
    pub occupied: bool,
    /// Bit 1 of byte 0.
    pub call_station: bool,
    /// Bytes 2–3.
    pub field3: i16,
    /// Bytes 4–5, the station type.
    #[serde(rename = "Type")]
    pub kind: i16,
    /// Bytes 6–7.
    pub old_station: i16,
    /// Bytes 8–9.
    pub reserve2: i16,
}

impl StationRecord {
    /// Decode a raw block read for station `index`.
    ///
    /// Pure and deterministic: the result depends on `index` and the ten
    /// input bytes only. Byte 1 and bits 2–7 of byte 0 are ignored.
    pub fn decode(index: u32, raw: &RawRecord) -> Self {
        let word = |at: usize| i16::from_be_bytes([raw[at], raw[at + 1]]);
        Self {
            index,
            occupied: raw[0] & OCCUPIED_BIT != 0,
            call_station: raw[0] & CALL_STATION_BIT != 0,
            field3: word(2),
            kind: word(4),
            old_station: word(6),
            reserve2: word(8),
        }
    }

    /// Decode from an arbitrary slice, rejecting anything that is not
    /// exactly [`RECORD_SIZE`] bytes long.
    pub fn try_decode(index: u32, bytes: &[u8]) -> Result<Self, ModelError> {
        let raw: &RawRecord = bytes.try_into().map_err(|_| ModelError::RecordLength {
            index,
            expected: RECORD_SIZE,
            actual: bytes.len(),
        })?;
        Ok(Self::decode(index, raw))
    }

    /// Encode back into the device layout.
    pub fn encode(&self) -> RawRecord {
        let mut raw = [0u8; RECORD_SIZE];
        if self.occupied {
            raw[0] |= OCCUPIED_BIT;
        }
        if self.call_station {
            raw[0] |= CALL_STATION_BIT;
        }
        raw[2..4].copy_from_slice(&self.field3.to_be_bytes());
        raw[4..6].copy_from_slice(&self.kind.to_be_bytes());
        raw[6..8].copy_from_slice(&self.old_station.to_be_bytes());
        raw[8..10].copy_from_slice(&self.reserve2.to_be_bytes());
        raw
    }

    /// Byte offset of station `index` within the device table.
    ///
    /// Widened to `u64` so every `u32` index has an offset; devices address
    /// tables with `u32` offsets and must reject anything larger.
    pub fn byte_offset(index: u32) -> u64 {
        u64::from(index) * RECORD_SIZE as u64
    }

    /// The record's field values without the index, as published in
    /// single-station messages.
    pub fn data(&self) -> StationData {
        StationData {
            occupied: self.occupied,
            call_station: self.call_station,
            field3: self.field3,
            kind: self.kind,
            old_station: self.old_station,
            reserve2: self.reserve2,
        }
    }
}

// ---------------------------------------------------------------------------
// StationData
// ---------------------------------------------------------------------------

/// Field values of a station, without its index.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct StationData {
    /// Station is occupied.
    pub occupied: bool,
    /// Station is calling.
    pub call_station: bool,
    /// Spare word.
    pub field3: i16,
    /// Station type.
    #[serde(rename = "Type")]
    pub kind: i16,
    /// Previous station.
    pub old_station: i16,
    /// Spare word.
    pub reserve2: i16,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: RawRecord = [0x01, 0x00, 0x00, 0x05, 0x00, 0x2A, 0xFF, 0xFF, 0x00, 0x00];

    #[test]
    fn decode_reference_block() {
        let record = StationRecord::decode(0, &SAMPLE);
        assert_eq!(
            record,
            StationRecord {
                index: 0,
                occupied: true,
                call_station: false,
                field3: 5,
                kind: 42,
                old_station: -1,
                reserve2: 0,
            }
        );
    }

    #[test]
    fn decode_is_deterministic() {
        assert_eq!(StationRecord::decode(4, &SAMPLE), StationRecord::decode(4, &SAMPLE));
    }

    #[test]
    fn decode_flag_bits() {
        let mut raw = [0u8; RECORD_SIZE];
        raw[0] = 0b0000_0010;
        let record = StationRecord::decode(1, &raw);
        assert!(!record.occupied);
        assert!(record.call_station);

        raw[0] = 0b1111_1100;
        let record = StationRecord::decode(1, &raw);
        assert!(!record.occupied);
        assert!(!record.call_station);
    }

    #[test]
    fn decode_ignores_padding_byte() {
        let mut padded = SAMPLE;
        padded[1] = 0xAB;
        assert_eq!(StationRecord::decode(2, &padded), StationRecord::decode(2, &SAMPLE));
    }

    #[test]
    fn decode_negative_words() {
        let raw = [0, 0, 0x80, 0x00, 0xFF, 0xFE, 0x7F, 0xFF, 0x00, 0x01];
        let record = StationRecord::decode(0, &raw);
        assert_eq!(record.field3, i16::MIN);
        assert_eq!(record.kind, -2);
        assert_eq!(record.old_station, i16::MAX);
        assert_eq!(record.reserve2, 1);
    }

    #[test]
    fn try_decode_rejects_short_block() {
        let err = StationRecord::try_decode(9, &SAMPLE[..8]).unwrap_err();
        assert_eq!(
            err,
            ModelError::RecordLength {
                index: 9,
                expected: RECORD_SIZE,
                actual: 8,
            }
        );
    }

    #[test]
    fn try_decode_accepts_exact_block() {
        let record = StationRecord::try_decode(5, &SAMPLE).unwrap();
        assert_eq!(record.index, 5);
        assert_eq!(record.field3, 5);
    }

    #[test]
    fn encode_matches_layout() {
        let record = StationRecord::decode(0, &SAMPLE);
        assert_eq!(record.encode(), SAMPLE);
    }

    #[test]
    fn byte_offset_is_index_times_record_size() {
        assert_eq!(StationRecord::byte_offset(0), 0);
        assert_eq!(StationRecord::byte_offset(39), 390);
    }

    #[test]
    fn byte_offset_does_not_wrap() {
        assert_eq!(StationRecord::byte_offset(500_000_000), 5_000_000_000);
        assert_eq!(StationRecord::byte_offset(u32::MAX), u64::from(u32::MAX) * 10);
    }

    #[test]
    fn largest_table_fits_register_space() {
        let end = StationRecord::byte_offset(MAX_STATIONS);
        assert!(end <= 0x1_0000 * 2);
        assert!(end + RECORD_SIZE as u64 > 0x1_0000 * 2);
    }

    #[test]
    fn batch_entry_json_keys() {
        let record = StationRecord::decode(12, &SAMPLE);
        let json = serde_json::to_value(record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "index": 12,
                "Occupied": true,
                "CallStation": false,
                "Field3": 5,
                "Type": 42,
                "OldStation": -1,
                "Reserve2": 0,
            })
        );
    }

    #[test]
    fn data_drops_index() {
        let json = serde_json::to_value(StationRecord::decode(12, &SAMPLE).data()).unwrap();
        assert!(json.get("index").is_none());
        assert_eq!(json["Type"], 42);
    }
}
