//! In-memory device for dry runs and tests.
//!
//! A [`SimulatedTable`] is a shared handle to the bytes of one table. The
//! [`SimulatedDevice`] reads from it; whoever holds another clone of the
//! handle can change station values, shrink the table or inject faults while
//! the device is in use.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use stationlink_models::{StationRecord, RECORD_SIZE};

use super::DeviceCapability;
use crate::error::DeviceError;

#[derive(Debug, Default)]
struct TableState {
    bytes: Vec<u8>,
    refuse_connects: u32,
    read_faults: VecDeque<DeviceError>,
    short_reads: HashSet<u64>,
    severed: bool,
    connect_attempts: u32,
    reads: u32,
}

/// Shared handle to a simulated table.
#[derive(Debug, Clone, Default)]
pub struct SimulatedTable {
    inner: Arc<Mutex<TableState>>,
}

impl SimulatedTable {
    /// A table holding `records`, laid out back to back by position.
    pub fn with_records(records: &[StationRecord]) -> Self {
        let table = Self::default();
        table.replace(records);
        table
    }

    /// A table of `count` all-zero stations.
    pub fn zeroed(count: usize) -> Self {
        let table = Self::default();
        table.state().bytes = vec![0; count * RECORD_SIZE];
        table
    }

    fn state(&self) -> MutexGuard<'_, TableState> {
        // A panic while holding the lock cannot leave the table half-written.
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Replace the whole table with `records`.
    pub fn replace(&self, records: &[StationRecord]) {
        self.state().bytes = records.iter().flat_map(StationRecord::encode).collect();
    }

    /// Overwrite one station at `record.index`, growing the table if needed.
    /// Stations beyond the `u32` address space are ignored.
    pub fn set(&self, record: StationRecord) {
        let Ok(start) = u32::try_from(StationRecord::byte_offset(record.index)) else {
            return;
        };
        let start = start as usize;
        let mut state = self.state();
        if state.bytes.len() < start + RECORD_SIZE {
            state.bytes.resize(start + RECORD_SIZE, 0);
        }
        state.bytes[start..start + RECORD_SIZE].copy_from_slice(&record.encode());
    }

    /// Number of whole stations in the table.
    pub fn station_count(&self) -> usize {
        self.state().bytes.len() / RECORD_SIZE
    }

    /// Refuse the next `count` connect attempts.
    pub fn refuse_connects(&self, count: u32) {
        self.state().refuse_connects = count;
    }

    /// Fail the next read with `error` (faults queue up in order).
    pub fn inject_read_fault(&self, error: DeviceError) {
        self.state().read_faults.push_back(error);
    }

    /// Reads of station `index` return a truncated block.
    pub fn short_read(&self, index: u32) {
        self.state().short_reads.insert(StationRecord::byte_offset(index));
    }

    /// Drop the connection from the device side: the next read reports
    /// [`DeviceError::NotConnected`] and the device stays closed until
    /// reconnected.
    pub fn sever(&self) {
        self.state().severed = true;
    }

    /// Total connect attempts seen so far.
    pub fn connect_attempts(&self) -> u32 {
        self.state().connect_attempts
    }

    /// Total read calls seen so far.
    pub fn reads(&self) -> u32 {
        self.state().reads
    }
}

/// A [`DeviceCapability`] backed by a [`SimulatedTable`].
///
/// The table id passed to [`read`](DeviceCapability::read) is ignored.
#[derive(Debug)]
pub struct SimulatedDevice {
    table: SimulatedTable,
    connected: bool,
}

impl SimulatedDevice {
    /// Create a disconnected device reading from `table`.
    pub fn new(table: SimulatedTable) -> Self {
        Self {
            table,
            connected: false,
        }
    }
}

impl DeviceCapability for SimulatedDevice {
    async fn connect(&mut self, address: &str) -> Result<(), DeviceError> {
        let mut state = self.table.state();
        state.connect_attempts += 1;
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(DeviceError::Connect {
                address: address.to_string(),
                reason: "connection refused".into(),
            });
        }
        state.severed = false;
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    async fn read(&mut self, table_id: u16, offset: u32, length: usize) -> Result<Vec<u8>, DeviceError> {
        let mut state = self.table.state();
        state.reads += 1;
        if state.severed {
            self.connected = false;
        }
        if !self.connected {
            return Err(DeviceError::NotConnected);
        }
        if let Some(fault) = state.read_faults.pop_front() {
            return Err(fault);
        }

        let start = offset as usize;
        let end = start + length;
        if end > state.bytes.len() {
            return Err(DeviceError::AddressOutOfRange {
                table_id,
                offset,
                length,
            });
        }
        if state.short_reads.contains(&u64::from(offset)) {
            return Ok(state.bytes[start..start + length / 2].to_vec());
        }
        Ok(state.bytes[start..end].to_vec())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
