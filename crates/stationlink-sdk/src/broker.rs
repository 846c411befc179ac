//! Broker capability: publish / subscribe with asynchronous connection
//! results.
//!
//! Connecting is a two-step affair. [`BrokerCapability::connect`] only
//! starts the attempt; whether the broker accepted it arrives later as a
//! [`BrokerEvent`] on the sender passed to `connect`, emitted from the
//! adapter's own background task. The same channel carries disconnect
//! notifications and inbound messages.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::BrokerError;

mod memory;
mod mqtt;
mod nats;

pub use memory::{MemoryBroker, PublishedMessage};
pub use mqtt::MqttBroker;
pub use nats::NatsBroker;

/// Notification emitted by a broker adapter outside the caller's control
/// flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// The broker accepted the connection.
    Connected,
    /// The broker rejected the connection.
    ConnectionRefused {
        /// Human-readable refusal reason.
        reason: String,
    },
    /// An established connection was lost or closed.
    Disconnected {
        /// Transport-level reason, if any.
        reason: Option<String>,
    },
    /// A message arrived on a subscribed topic.
    Message {
        /// Topic the message was published on.
        topic: String,
        /// Raw payload.
        payload: Vec<u8>,
    },
}

/// Channel on which adapters deliver [`BrokerEvent`]s.
pub type BrokerEventSender = mpsc::UnboundedSender<BrokerEvent>;

/// Username / password pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// User name.
    pub username: String,
    /// Password.
    pub password: String,
}

/// Where and how to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Keep-alive (MQTT) / ping (NATS) interval.
    pub keepalive: Duration,
    /// Client identifier presented to the broker.
    pub client_id: String,
    /// Optional authentication; `None` connects anonymously.
    pub credentials: Option<Credentials>,
}

/// Delivery guarantee requested for a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
pub enum QoS {
    /// Fire and forget.
    AtMostOnce,
    /// Acknowledged delivery, possibly duplicated.
    #[default]
    AtLeastOnce,
    /// Acknowledged, exactly-once delivery.
    ExactlyOnce,
}

impl TryFrom<u8> for QoS {
    type Error = BrokerError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            other => Err(BrokerError::Config(format!("invalid QoS level {other}"))),
        }
    }
}

/// A publish-subscribe broker client.
pub trait BrokerCapability: Send {
    /// Start connecting to `endpoint`.
    ///
    /// Returns once the attempt has been started; the outcome is reported
    /// as [`BrokerEvent::Connected`] or [`BrokerEvent::ConnectionRefused`] on
    /// `events`. An `Err` means the attempt could not even be started.
    fn connect(
        &mut self,
        endpoint: &BrokerEndpoint,
        events: BrokerEventSender,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Close the connection and stop the background task.
    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;

    /// Publish `payload` on `topic`.
    fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Subscribe to `topic`; messages arrive as [`BrokerEvent::Message`].
    fn subscribe(&mut self, topic: &str, qos: QoS) -> impl Future<Output = Result<(), BrokerError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_from_level() {
        assert_eq!(QoS::try_from(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(QoS::try_from(1).unwrap(), QoS::AtLeastOnce);
        assert_eq!(QoS::try_from(2).unwrap(), QoS::ExactlyOnce);
        assert!(matches!(QoS::try_from(3), Err(BrokerError::Config(_))));
    }

    #[test]
    fn default_qos_is_at_least_once() {
        assert_eq!(QoS::default(), QoS::AtLeastOnce);
    }
}
