//! SDK error types.
//!
//! [`DeviceError`] is returned by every [`DeviceCapability`](crate::DeviceCapability)
//! operation and [`BrokerError`] by every
//! [`BrokerCapability`](crate::BrokerCapability) operation. Transport-specific
//! errors are flattened into strings so both enums stay `Clone`.

/// Error type for device operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// The requested bytes lie past the end of the device's table.
    ///
    /// Reading the whole table relies on this to find its real length.
    #[error("address out of range: table {table_id}, offset {offset}, length {length}")]
    AddressOutOfRange {
        /// Table that was read.
        table_id: u16,
        /// Byte offset of the read.
        offset: u32,
        /// Number of bytes requested.
        length: usize,
    },

    /// The device link is not connected.
    #[error("device not connected")]
    NotConnected,

    /// Establishing the connection failed.
    #[error("connect to {address} failed: {reason}")]
    Connect {
        /// Address that was dialled.
        address: String,
        /// Transport-level reason.
        reason: String,
    },

    /// Any other transport failure.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for DeviceError {
    fn from(e: std::io::Error) -> Self {
        DeviceError::Io(e.to_string())
    }
}

impl From<tokio_modbus::Error> for DeviceError {
    fn from(e: tokio_modbus::Error) -> Self {
        DeviceError::Io(e.to_string())
    }
}

/// Error type for broker operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// Invalid endpoint parameters (e.g. unresolvable host).
    #[error("configuration error: {0}")]
    Config(String),

    /// The broker link is not connected.
    #[error("broker not connected")]
    NotConnected,

    /// The broker refused the connection.
    #[error("connection refused: {0}")]
    Refused(String),

    /// No connection acknowledgement arrived in time.
    #[error("no connection acknowledgement within {0:?}")]
    AckTimeout(std::time::Duration),

    /// A publish was rejected or could not be queued.
    #[error("publish to {topic} failed: {reason}")]
    Publish {
        /// Destination topic.
        topic: String,
        /// Transport-level reason.
        reason: String,
    },

    /// MQTT transport error.
    #[error("MQTT error: {0}")]
    Mqtt(String),

    /// NATS transport error.
    #[error("NATS error: {0}")]
    Nats(String),
}

impl From<rumqttc::ClientError> for BrokerError {
    fn from(e: rumqttc::ClientError) -> Self {
        BrokerError::Mqtt(e.to_string())
    }
}

impl From<async_nats::ConnectError> for BrokerError {
    fn from(e: async_nats::ConnectError) -> Self {
        BrokerError::Nats(e.to_string())
    }
}

impl From<async_nats::SubscribeError> for BrokerError {
    fn from(e: async_nats::SubscribeError) -> Self {
        BrokerError::Nats(e.to_string())
    }
}
