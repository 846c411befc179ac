//! Runtime selection of the device and broker adapters.
//!
//! The poll loop is generic over both capabilities; these enums let `main`
//! pick a concrete adapter from configuration without boxing.

use stationlink_sdk::broker::{MemoryBroker, MqttBroker, NatsBroker};
use stationlink_sdk::device::{ModbusDevice, SimulatedDevice, SimulatedTable};
use stationlink_sdk::{
    BrokerCapability, BrokerEndpoint, BrokerError, BrokerEventSender, DeviceCapability, DeviceError, QoS,
};

use crate::config::{BrokerKind, DeviceConfig, DeviceKind};

pub enum AnyDevice {
    Modbus(ModbusDevice),
    Sim(SimulatedDevice),
}

impl AnyDevice {
    /// The adapter named by `config`. The simulated device starts with a
    /// zeroed table of the configured size.
    pub fn from_config(config: &DeviceConfig) -> Self {
        match config.kind {
            DeviceKind::Modbus => Self::Modbus(ModbusDevice::new(config.timeout)),
            DeviceKind::Sim => Self::Sim(SimulatedDevice::new(SimulatedTable::zeroed(
                config.station_count as usize,
            ))),
        }
    }
}

impl DeviceCapability for AnyDevice {
    async fn connect(&mut self, address: &str) -> Result<(), DeviceError> {
        match self {
            Self::Modbus(device) => device.connect(address).await,
            Self::Sim(device) => device.connect(address).await,
        }
    }

    async fn disconnect(&mut self) {
        match self {
            Self::Modbus(device) => device.disconnect().await,
            Self::Sim(device) => device.disconnect().await,
        }
    }

    async fn read(&mut self, table_id: u16, offset: u32, length: usize) -> Result<Vec<u8>, DeviceError> {
        match self {
            Self::Modbus(device) => device.read(table_id, offset, length).await,
            Self::Sim(device) => device.read(table_id, offset, length).await,
        }
    }

    fn is_connected(&self) -> bool {
        match self {
            Self::Modbus(device) => device.is_connected(),
            Self::Sim(device) => device.is_connected(),
        }
    }
}

pub enum AnyBroker {
    Mqtt(MqttBroker),
    Nats(NatsBroker),
    Memory(MemoryBroker),
}

impl AnyBroker {
    pub fn from_kind(kind: BrokerKind) -> Self {
        match kind {
            BrokerKind::Mqtt => Self::Mqtt(MqttBroker::new()),
            BrokerKind::Nats => Self::Nats(NatsBroker::new()),
            BrokerKind::Memory => Self::Memory(MemoryBroker::new()),
        }
    }
}

impl BrokerCapability for AnyBroker {
    async fn connect(&mut self, endpoint: &BrokerEndpoint, events: BrokerEventSender) -> Result<(), BrokerError> {
        match self {
            Self::Mqtt(broker) => broker.connect(endpoint, events).await,
            Self::Nats(broker) => broker.connect(endpoint, events).await,
            Self::Memory(broker) => broker.connect(endpoint, events).await,
        }
    }

    async fn disconnect(&mut self) {
        match self {
            Self::Mqtt(broker) => broker.disconnect().await,
            Self::Nats(broker) => broker.disconnect().await,
            Self::Memory(broker) => broker.disconnect().await,
        }
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), BrokerError> {
        match self {
            Self::Mqtt(broker) => broker.publish(topic, payload, qos).await,
            Self::Nats(broker) => broker.publish(topic, payload, qos).await,
            Self::Memory(broker) => broker.publish(topic, payload, qos).await,
        }
    }

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), BrokerError> {
        match self {
            Self::Mqtt(broker) => broker.subscribe(topic, qos).await,
            Self::Nats(broker) => broker.subscribe(topic, qos).await,
            Self::Memory(broker) => broker.subscribe(topic, qos).await,
        }
    }
}
