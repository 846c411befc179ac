//! Station reads on top of a [`DeviceLink`].

use stationlink_models::{ModelError, RawRecord, StationRecord, MAX_STATIONS, RECORD_SIZE};
use stationlink_sdk::{DeviceCapability, DeviceError};
use tracing::{debug, warn};

use crate::link_manager::DeviceLink;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    /// A single-station read named a station outside the configured table.
    #[error("station {index} is outside the configured table of {station_count}")]
    IndexOutOfRange { index: u32, station_count: u32 },

    /// The station's byte offset does not fit a device address.
    #[error("station {index} lies beyond the addressable table")]
    Unaddressable { index: u32 },

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Decode(#[from] ModelError),
}

impl ReadError {
    /// Whether the device link was closed when the read was attempted.
    pub fn is_not_connected(&self) -> bool {
        matches!(self, ReadError::Device(DeviceError::NotConnected))
    }
}

/// Result of reading the whole table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableRead {
    /// Decoded records in ascending index order.
    pub records: Vec<StationRecord>,
    /// Indices whose block could not be decoded.
    pub dropped: Vec<u32>,
    /// Index at which the device reported the end of its table, if it came
    /// before the configured station count.
    pub end_of_table: Option<u32>,
}

/// Reads station blocks from one table.
#[derive(Debug, Clone, Copy)]
pub struct DeviceReader {
    table_id: u16,
    station_count: u32,
}

impl DeviceReader {
    pub fn new(table_id: u16, station_count: u32) -> Self {
        Self {
            table_id,
            station_count,
        }
    }

    pub fn table_id(&self) -> u16 {
        self.table_id
    }

    pub fn station_count(&self) -> u32 {
        self.station_count
    }

    /// Read the raw block of station `index`.
    pub async fn read_station<D: DeviceCapability>(
        &self,
        link: &mut DeviceLink<D>,
        index: u32,
    ) -> Result<RawRecord, ReadError> {
        let offset =
            u32::try_from(StationRecord::byte_offset(index)).map_err(|_| ReadError::Unaddressable { index })?;
        let bytes = link.read(self.table_id, offset, RECORD_SIZE).await?;
        let raw: RawRecord = bytes.as_slice().try_into().map_err(|_| ModelError::RecordLength {
            index,
            expected: RECORD_SIZE,
            actual: bytes.len(),
        })?;
        Ok(raw)
    }

    /// Read and decode one configured station.
    pub async fn read_record<D: DeviceCapability>(
        &self,
        link: &mut DeviceLink<D>,
        index: u32,
    ) -> Result<StationRecord, ReadError> {
        if index >= self.station_count {
            return Err(ReadError::IndexOutOfRange {
                index,
                station_count: self.station_count,
            });
        }
        let raw = self.read_station(link, index).await?;
        Ok(StationRecord::decode(index, &raw))
    }

    /// Read stations `0..max_count` in order.
    ///
    /// The device reporting an out-of-range address ends the table early and
    /// still counts as success. Undecodable blocks are skipped. Any other
    /// failure aborts the whole read.
    pub async fn read_all_stations<D: DeviceCapability>(
        &self,
        link: &mut DeviceLink<D>,
        max_count: u32,
    ) -> Result<TableRead, ReadError> {
        let mut table = TableRead {
            records: Vec::with_capacity(max_count.min(MAX_STATIONS) as usize),
            ..TableRead::default()
        };
        for index in 0..max_count {
            match self.read_station(link, index).await {
                Ok(raw) => table.records.push(StationRecord::decode(index, &raw)),
                Err(ReadError::Device(DeviceError::AddressOutOfRange { .. })) => {
                    debug!(index, "end of device table");
                    table.end_of_table = Some(index);
                    break;
                }
                Err(ReadError::Decode(e)) => {
                    warn!(index, error = %e, "dropping undecodable station block");
                    table.dropped.push(index);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use stationlink_sdk::device::{SimulatedDevice, SimulatedTable};

    use crate::config::RetryPolicy;

    fn station(index: u32) -> StationRecord {
        StationRecord {
            index,
            occupied: true,
            call_station: index % 3 == 0,
            field3: 0,
            kind: i16::try_from(index).unwrap(),
            old_station: -1,
            reserve2: 0,
        }
    }

    async fn connected(table: &SimulatedTable) -> DeviceLink<SimulatedDevice> {
        let retry = RetryPolicy {
            attempts: 1,
            delay: Duration::ZERO,
        };
        let mut link = DeviceLink::new(SimulatedDevice::new(table.clone()), "sim", retry);
        link.connect_with_retry().await.unwrap();
        link
    }

    #[tokio::test]
    async fn reads_full_table() {
        let records: Vec<_> = (0..5).map(station).collect();
        let table = SimulatedTable::with_records(&records);
        let mut link = connected(&table).await;

        let read = DeviceReader::new(1, 5).read_all_stations(&mut link, 5).await.unwrap();
        assert_eq!(read.records, records);
        assert!(read.dropped.is_empty());
        assert_eq!(read.end_of_table, None);
    }

    #[tokio::test]
    async fn short_table_is_soft_end() {
        let table = SimulatedTable::with_records(&(0..3).map(station).collect::<Vec<_>>());
        let mut link = connected(&table).await;

        let read = DeviceReader::new(1, 40).read_all_stations(&mut link, 40).await.unwrap();
        assert_eq!(read.records.len(), 3);
        assert_eq!(read.end_of_table, Some(3));
    }

    #[tokio::test]
    async fn undecodable_block_is_skipped() {
        let table = SimulatedTable::with_records(&(0..4).map(station).collect::<Vec<_>>());
        table.short_read(1);
        let mut link = connected(&table).await;

        let read = DeviceReader::new(1, 4).read_all_stations(&mut link, 4).await.unwrap();
        let indices: Vec<u32> = read.records.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 2, 3]);
        assert_eq!(read.dropped, vec![1]);
    }

    #[tokio::test]
    async fn transport_failure_aborts_without_partial_data() {
        let table = SimulatedTable::with_records(&(0..4).map(station).collect::<Vec<_>>());
        let mut link = connected(&table).await;
        let reader = DeviceReader::new(1, 4);

        reader.read_station(&mut link, 0).await.unwrap();
        table.inject_read_fault(DeviceError::Io("broken pipe".into()));
        let err = reader.read_all_stations(&mut link, 4).await.unwrap_err();
        assert_eq!(err, ReadError::Device(DeviceError::Io("broken pipe".into())));
        assert_eq!(link.state(), stationlink_models::LinkState::Disconnected);
    }

    #[tokio::test]
    async fn disconnected_read_reports_not_connected() {
        let table = SimulatedTable::zeroed(2);
        let mut link = connected(&table).await;
        table.sever();

        let err = DeviceReader::new(1, 2).read_all_stations(&mut link, 2).await.unwrap_err();
        assert!(err.is_not_connected());
    }

    #[tokio::test]
    async fn single_read_rejects_index_before_io() {
        let table = SimulatedTable::zeroed(2);
        let mut link = connected(&table).await;
        let reads_before = table.reads();

        let err = DeviceReader::new(1, 2).read_record(&mut link, 2).await.unwrap_err();
        assert_eq!(
            err,
            ReadError::IndexOutOfRange {
                index: 2,
                station_count: 2,
            }
        );
        assert_eq!(table.reads(), reads_before);
    }

    #[tokio::test]
    async fn station_past_address_space_is_not_read() {
        let table = SimulatedTable::zeroed(2);
        let mut link = connected(&table).await;
        let reads_before = table.reads();

        let err = DeviceReader::new(1, u32::MAX)
            .read_record(&mut link, 500_000_000)
            .await
            .unwrap_err();
        assert_eq!(err, ReadError::Unaddressable { index: 500_000_000 });
        assert_eq!(table.reads(), reads_before);
        assert_eq!(link.state(), stationlink_models::LinkState::Connected);
    }

    #[tokio::test]
    async fn single_read_decodes() {
        let table = SimulatedTable::with_records(&(0..3).map(station).collect::<Vec<_>>());
        let mut link = connected(&table).await;

        let record = DeviceReader::new(1, 3).read_record(&mut link, 2).await.unwrap();
        assert_eq!(record, station(2));
    }
}
