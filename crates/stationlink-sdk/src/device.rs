//! Device capability: byte-addressed reads from numbered tables.

use std::future::Future;

use crate::error::DeviceError;

mod modbus;
mod simulated;

pub use modbus::ModbusDevice;
pub use simulated::{SimulatedDevice, SimulatedTable};

/// A connection to an industrial controller exposing numbered tables of
/// bytes.
///
/// Implementations must report reads past the end of a table as
/// [`DeviceError::AddressOutOfRange`], reads on a closed link as
/// [`DeviceError::NotConnected`], and every other transport failure as
/// [`DeviceError::Io`].
pub trait DeviceCapability: Send {
    /// Open the link to the controller at `address`.
    fn connect(&mut self, address: &str) -> impl Future<Output = Result<(), DeviceError>> + Send;

    /// Close the link. Closing an already closed link is a no-op.
    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;

    /// Read `length` bytes starting at `offset` in table `table_id`.
    fn read(
        &mut self,
        table_id: u16,
        offset: u32,
        length: usize,
    ) -> impl Future<Output = Result<Vec<u8>, DeviceError>> + Send;

    /// Whether the transport currently holds an open connection.
    fn is_connected(&self) -> bool;
}
