//! # StationLink SDK
//!
//! Narrow capability interfaces for the two links the gateway depends on,
//! plus the adapters that implement them.
//!
//! * [`DeviceCapability`]: read `length` bytes at a byte offset within a
//!   numbered table of an industrial controller.
//! * [`BrokerCapability`]: connect / publish / subscribe on a
//!   publish-subscribe broker, reporting connection results and inbound
//!   messages asynchronously as [`BrokerEvent`]s.
//! * [`Topics`]: canonical publish / command topic names.
//!
//! # Adapters
//!
//! | Capability | Adapter | Transport |
//! |------------|---------|-----------|
//! | device | [`device::ModbusDevice`] | Modbus TCP holding registers (`tokio-modbus`) |
//! | device | [`device::SimulatedDevice`] | in-memory table |
//! | broker | [`broker::MqttBroker`] | MQTT 3.1.1 (`rumqttc`) |
//! | broker | [`broker::NatsBroker`] | NATS (`async-nats`) |
//! | broker | [`broker::MemoryBroker`] | in-memory recorder |
//!
//! # Quick start
//!
//! ```rust,no_run
//! use stationlink_sdk::device::{DeviceCapability, ModbusDevice};
//!
//! # async fn run() -> Result<(), stationlink_sdk::DeviceError> {
//! let mut device = ModbusDevice::new(std::time::Duration::from_secs(5));
//! device.connect("192.168.0.10:502").await?;
//! let block = device.read(1, 0, 10).await?;
//! assert_eq!(block.len(), 10);
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod device;
pub mod error;
pub mod topics;

pub use broker::{
    BrokerCapability, BrokerEndpoint, BrokerEvent, BrokerEventSender, Credentials, QoS,
};
pub use device::DeviceCapability;
pub use error::{BrokerError, DeviceError};
pub use topics::Topics;
