//! Modbus TCP device adapter.
//!
//! Tables map onto Modbus unit ids and byte offsets onto holding registers:
//! byte offset `o` is register `o / 2`, each register holding two bytes in
//! big-endian order. Offsets and lengths must therefore be even.

use std::time::Duration;

use tokio_modbus::client::{tcp, Context};
use tokio_modbus::prelude::*;
use tracing::{debug, warn};

use super::DeviceCapability;
use crate::error::DeviceError;

/// A [`DeviceCapability`] speaking Modbus TCP.
pub struct ModbusDevice {
    ctx: Option<Context>,
    timeout: Duration,
}

impl ModbusDevice {
    /// Create a disconnected adapter. `timeout` bounds every connect and
    /// register read.
    pub fn new(timeout: Duration) -> Self {
        Self { ctx: None, timeout }
    }
}

/// Convert a byte span into a register span.
fn register_span(table_id: u16, offset: u32, length: usize) -> Result<(u16, u16), DeviceError> {
    let out_of_range = || DeviceError::AddressOutOfRange {
        table_id,
        offset,
        length,
    };
    if offset % 2 != 0 || length % 2 != 0 {
        return Err(DeviceError::Io(format!(
            "unaligned read (offset {offset}, length {length}): Modbus registers are two bytes wide"
        )));
    }
    let address = u16::try_from(offset / 2).map_err(|_| out_of_range())?;
    let count = u16::try_from(length / 2).map_err(|_| out_of_range())?;
    if u32::from(address) + u32::from(count) > 0x1_0000 {
        return Err(out_of_range());
    }
    Ok((address, count))
}

impl DeviceCapability for ModbusDevice {
    async fn connect(&mut self, address: &str) -> Result<(), DeviceError> {
        let connect_error = |reason: String| DeviceError::Connect {
            address: address.to_string(),
            reason,
        };

        let socket_addr = tokio::net::lookup_host(address)
            .await
            .map_err(|e| connect_error(e.to_string()))?
            .next()
            .ok_or_else(|| connect_error("address did not resolve".into()))?;

        let ctx = tokio::time::timeout(self.timeout, tcp::connect(socket_addr))
            .await
            .map_err(|_| connect_error(format!("timed out after {:?}", self.timeout)))?
            .map_err(|e| connect_error(e.to_string()))?;

        debug!(%socket_addr, "modbus connection established");
        self.ctx = Some(ctx);
        Ok(())
    }

    async fn disconnect(&mut self) {
        if self.ctx.take().is_some() {
            debug!("modbus connection closed");
        }
    }

    async fn read(&mut self, table_id: u16, offset: u32, length: usize) -> Result<Vec<u8>, DeviceError> {
        let ctx = self.ctx.as_mut().ok_or(DeviceError::NotConnected)?;

        let unit = u8::try_from(table_id)
            .map_err(|_| DeviceError::Io(format!("table {table_id} is not a valid Modbus unit id")))?;
        let (address, count) = register_span(table_id, offset, length)?;
        ctx.set_slave(Slave(unit));

        let response = match tokio::time::timeout(self.timeout, ctx.read_holding_registers(address, count)).await {
            Ok(response) => response,
            Err(_) => {
                warn!(table_id, offset, "modbus read timed out, dropping connection");
                self.ctx = None;
                return Err(DeviceError::Io(format!("read timed out after {:?}", self.timeout)));
            }
        };

        let words = match response {
            Ok(Ok(words)) => words,
            Ok(Err(ExceptionCode::IllegalDataAddress)) => {
                return Err(DeviceError::AddressOutOfRange {
                    table_id,
                    offset,
                    length,
                })
            }
            Ok(Err(code)) => return Err(DeviceError::Io(format!("modbus exception {code:?}"))),
            Err(e) => {
                self.ctx = None;
                return Err(e.into());
            }
        };

        Ok(words.iter().flat_map(|word| word.to_be_bytes()).collect())
    }

    fn is_connected(&self) -> bool {
        self.ctx.is_some()
    }
}
