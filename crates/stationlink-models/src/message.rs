//! Outbound message schemas.
//!
//! Batch mode publishes plain JSON arrays of [`StationRecord`]s (one array
//! per chunk). Single-station mode wraps one record in a
//! [`SingleStationMessage`] carrying a wall-clock timestamp.
//!
//! Timestamps are attached here, when the message is built, and never take
//! part in change detection.

use chrono::{DateTime, TimeZone};
use serde::{Deserialize, Serialize};

use crate::station::{StationData, StationRecord};

/// `strftime` layout of [`SingleStationMessage::timestamp`].
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Default device identifier for a station of a table.
///
/// ```
/// assert_eq!(stationlink_models::default_device_id(3003, 0), "PLC_DB3003_Station0");
/// ```
pub fn default_device_id(table_id: u16, index: u32) -> String {
    format!("PLC_DB{table_id}_Station{index}")
}

/// Message published for one station in single-station mode.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SingleStationMessage {
    /// Local time at which the message was built, see [`TIMESTAMP_FORMAT`].
    pub timestamp: String,
    /// Identifier of the device / station pair.
    pub device_id: String,
    /// Index of the station in the table.
    pub station_index: u32,
    /// Byte offset of the station in the table.
    pub base_offset: u64,
    /// The station's field values.
    pub data: StationData,
}

impl SingleStationMessage {
    /// Wrap `record` into a message stamped with `at`.
    pub fn new<Tz>(record: &StationRecord, device_id: impl Into<String>, at: &DateTime<Tz>) -> Self
    where
        Tz: TimeZone,
        Tz::Offset: std::fmt::Display,
    {
        Self {
            timestamp: at.format(TIMESTAMP_FORMAT).to_string(),
            device_id: device_id.into(),
            station_index: record.index,
            base_offset: StationRecord::byte_offset(record.index),
            data: record.data(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record() -> StationRecord {
        StationRecord {
            index: 4,
            occupied: true,
            call_station: true,
            field3: 0,
            kind: 7,
            old_station: 3,
            reserve2: 0,
        }
    }

    #[test]
    fn single_message_layout() {
        let at = Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap();
        let msg = SingleStationMessage::new(&record(), default_device_id(3003, 4), &at);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "timestamp": "2025-03-14 09:26:53",
                "device_id": "PLC_DB3003_Station4",
                "station_index": 4,
                "base_offset": 40,
                "data": {
                    "Occupied": true,
                    "CallStation": true,
                    "Field3": 0,
                    "Type": 7,
                    "OldStation": 3,
                    "Reserve2": 0,
                },
            })
        );
    }

    #[test]
    fn batch_chunk_is_plain_array() {
        let chunk = vec![record(), StationRecord { index: 5, ..record() }];
        let json = serde_json::to_value(&chunk).unwrap();
        let entries = json.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["index"], 4);
        assert_eq!(entries[1]["index"], 5);
    }

    #[test]
    fn device_id_format() {
        assert_eq!(default_device_id(1, 12), "PLC_DB1_Station12");
    }
}
