//! Gateway configuration.
//!
//! Built from environment variables at startup, then optionally overridden
//! by command-line flags (see `main.rs`). Unparsable values fail while
//! loading; cross-field rules are checked by [`GatewayConfig::validate`]
//! once the overrides are applied. Either failure is fatal.
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `DEVICE_KIND` | `modbus` | `modbus` or `sim` |
//! | `DEVICE_ADDRESS` / `PLC_IP` | `172.16.10.201:502` | controller address (`:502` added when no port) |
//! | `TABLE_ID` / `DB_NUMBER` | `1` | table to read (Modbus unit id) |
//! | `STATION_COUNT` | `40` | configured table length |
//! | `SINGLE_STATION_INDEX` | `0` | station read in single mode |
//! | `DEVICE_TIMEOUT` | `5` | seconds per connect / read |
//! | `PLC_RETRY_COUNT` / `PLC_RETRY_DELAY` | `3` / `2` | start-up connect attempts / seconds between |
//! | `OPERATING_MODE` | `batch` | `batch` or `single` |
//! | `POLL_INTERVAL` | `2` | seconds between cycles |
//! | `MQTT_CHUNK` | `10` | records per batch message |
//! | `HEARTBEAT_INTERVAL` | `5` | unchanged cycles before a forced full publish |
//! | `PUBLISH_INITIAL` | `false` | publish the first table read instead of only storing it |
//! | `BROKER_KIND` | `mqtt` | `mqtt`, `nats` or `memory` |
//! | `MQTT_BROKER` / `MQTT_PORT` | `Mqtt.dxiot.liju.cc` / `1883` | broker endpoint |
//! | `MQTT_BROKER_IP` | none | fallback host when `MQTT_BROKER` does not resolve |
//! | `MQTT_USERNAME` / `MQTT_PASSWORD` | none | credentials (both required) |
//! | `MQTT_CLIENT_ID` | `stationlink-{table}` | client identifier |
//! | `MQTT_KEEPALIVE` / `MQTT_CONNECT_TIMEOUT` | `120` / `30` | seconds |
//! | `MQTT_RETRY_COUNT` / `MQTT_RETRY_DELAY` | `3` / `5` | per-cycle connect attempts / seconds between |
//! | `MQTT_QOS` | `1` | 0, 1 or 2 |
//! | `TOPIC_PREFIX` / `TOPIC_SITE` / `TOPIC_LINE` | `/dxiot/4q` / `huaheng` / `wuliu` | topic parts |
//! | `MQTT_TOPIC_PUB` / `MQTT_TOPIC_SUB` | derived | explicit topic overrides |

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use stationlink_models::{OperatingMode, MAX_STATIONS};
use stationlink_sdk::{BrokerEndpoint, Credentials, QoS, Topics};

/// Configuration errors. Always fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A variable could not be parsed.
    #[error("{key}: invalid value \"{value}\": {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    /// A numeric setting is below its minimum.
    #[error("{key} must be at least {min}, got {value}")]
    TooSmall {
        key: &'static str,
        min: u64,
        value: u64,
    },

    /// A numeric setting is above its maximum.
    #[error("{key} must be at most {max}, got {value}")]
    TooLarge {
        key: &'static str,
        max: u64,
        value: u64,
    },

    /// Two settings contradict each other.
    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}

/// Which device adapter to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DeviceKind {
    Modbus,
    Sim,
}

/// Which broker adapter to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum BrokerKind {
    Mqtt,
    Nats,
    Memory,
}

/// Bounded connect retries with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub kind: DeviceKind,
    pub address: String,
    pub table_id: u16,
    pub station_count: u32,
    pub single_station: u32,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub kind: BrokerKind,
    pub endpoint: BrokerEndpoint,
    pub fallback_host: Option<String>,
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
    pub qos: QoS,
    pub publish_topic: String,
    pub command_topic: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    pub mode: OperatingMode,
    pub interval: Duration,
    pub chunk_size: usize,
    pub heartbeat_threshold: u32,
    pub publish_initial: bool,
}

/// Complete gateway configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub device: DeviceConfig,
    pub broker: BrokerConfig,
    pub poll: PollConfig,
}

/// Variable lookup with typed parsing.
struct Vars<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    /// First non-empty value among `keys`, trimmed.
    fn first(&self, keys: &[&'static str]) -> Option<(&'static str, String)> {
        keys.iter().find_map(|key| {
            (self.lookup)(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(|v| (*key, v))
        })
    }

    fn string(&self, keys: &[&'static str], default: &str) -> String {
        self.first(keys).map_or_else(|| default.to_string(), |(_, v)| v)
    }

    fn optional(&self, key: &'static str) -> Option<String> {
        self.first(&[key]).map(|(_, v)| v)
    }

    fn parse<T>(&self, keys: &[&'static str], default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.first(keys) {
            None => Ok(default),
            Some((key, value)) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn seconds(&self, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
        self.parse(&[key], default).map(Duration::from_secs)
    }

    fn flag(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.first(&[key]) {
            None => Ok(default),
            Some((key, value)) => match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    key,
                    value,
                    reason: "expected true or false".into(),
                }),
            },
        }
    }
}

fn at_least(key: &'static str, value: u64, min: u64) -> Result<(), ConfigError> {
    if value < min {
        return Err(ConfigError::TooSmall { key, min, value });
    }
    Ok(())
}

fn at_most(key: &'static str, value: u64, max: u64) -> Result<(), ConfigError> {
    if value > max {
        return Err(ConfigError::TooLarge { key, max, value });
    }
    Ok(())
}

/// Append the default Modbus port when `address` carries none.
fn with_default_port(address: &str, port: u16) -> String {
    if address.contains(':') {
        address.to_string()
    } else {
        format!("{address}:{port}")
    }
}

impl GatewayConfig {
    /// Load the configuration from the process environment. Call
    /// [`validate`](Self::validate) before use.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars { lookup };

        let table_id: u16 = vars.parse(&["TABLE_ID", "DB_NUMBER"], 1)?;
        let device = DeviceConfig {
            kind: vars.parse(&["DEVICE_KIND"], DeviceKind::Modbus)?,
            address: with_default_port(
                &vars.string(&["DEVICE_ADDRESS", "PLC_IP"], "172.16.10.201"),
                502,
            ),
            table_id,
            station_count: vars.parse(&["STATION_COUNT"], 40)?,
            single_station: vars.parse(&["SINGLE_STATION_INDEX"], 0)?,
            timeout: vars.seconds("DEVICE_TIMEOUT", 5)?,
            retry: RetryPolicy {
                attempts: vars.parse(&["PLC_RETRY_COUNT"], 3)?,
                delay: vars.seconds("PLC_RETRY_DELAY", 2)?,
            },
        };

        let qos_level: u8 = vars.parse(&["MQTT_QOS"], 1)?;
        let qos = QoS::try_from(qos_level).map_err(|e| ConfigError::Invalid {
            key: "MQTT_QOS",
            value: qos_level.to_string(),
            reason: e.to_string(),
        })?;

        let credentials = match (vars.optional("MQTT_USERNAME"), vars.optional("MQTT_PASSWORD")) {
            (Some(username), Some(password)) => Some(Credentials { username, password }),
            _ => None,
        };

        let prefix = vars.string(&["TOPIC_PREFIX"], "/dxiot/4q");
        let site = vars.string(&["TOPIC_SITE"], "huaheng");
        let line = vars.string(&["TOPIC_LINE"], "wuliu");

        let broker = BrokerConfig {
            kind: vars.parse(&["BROKER_KIND"], BrokerKind::Mqtt)?,
            endpoint: BrokerEndpoint {
                host: vars.string(&["MQTT_BROKER"], "Mqtt.dxiot.liju.cc"),
                port: vars.parse(&["MQTT_PORT"], 1883)?,
                keepalive: vars.seconds("MQTT_KEEPALIVE", 120)?,
                client_id: vars.string(&["MQTT_CLIENT_ID"], &format!("stationlink-{table_id}")),
                credentials,
            },
            fallback_host: vars.optional("MQTT_BROKER_IP"),
            connect_timeout: vars.seconds("MQTT_CONNECT_TIMEOUT", 30)?,
            retry: RetryPolicy {
                attempts: vars.parse(&["MQTT_RETRY_COUNT"], 3)?,
                delay: vars.seconds("MQTT_RETRY_DELAY", 5)?,
            },
            qos,
            publish_topic: vars.string(&["MQTT_TOPIC_PUB"], &Topics::publish(&prefix, &site, &line)),
            command_topic: vars.string(&["MQTT_TOPIC_SUB"], &Topics::command(&prefix, &site, &line)),
        };

        let poll = PollConfig {
            mode: vars.parse(&["OPERATING_MODE"], OperatingMode::Batch)?,
            interval: vars.seconds("POLL_INTERVAL", 2)?,
            chunk_size: vars.parse(&["MQTT_CHUNK"], 10)?,
            heartbeat_threshold: vars.parse(&["HEARTBEAT_INTERVAL"], 5)?,
            publish_initial: vars.flag("PUBLISH_INITIAL", false)?,
        };

        Ok(Self { device, broker, poll })
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        at_least("STATION_COUNT", u64::from(self.device.station_count), 1)?;
        at_most("STATION_COUNT", u64::from(self.device.station_count), u64::from(MAX_STATIONS))?;
        at_least("PLC_RETRY_COUNT", u64::from(self.device.retry.attempts), 1)?;
        at_least("MQTT_RETRY_COUNT", u64::from(self.broker.retry.attempts), 1)?;
        at_least("MQTT_CHUNK", self.poll.chunk_size as u64, 1)?;
        at_least("HEARTBEAT_INTERVAL", u64::from(self.poll.heartbeat_threshold), 1)?;

        if self.device.single_station >= self.device.station_count {
            return Err(ConfigError::Inconsistent(format!(
                "single station index {} is outside a table of {} stations",
                self.device.single_station, self.device.station_count
            )));
        }
        if self.device.kind == DeviceKind::Modbus && u8::try_from(self.device.table_id).is_err() {
            return Err(ConfigError::Inconsistent(format!(
                "table id {} cannot be used as a Modbus unit id (0-255)",
                self.device.table_id
            )));
        }
        if self.broker.publish_topic.is_empty() {
            return Err(ConfigError::Inconsistent("publish topic is empty".into()));
        }
        Ok(())
    }
}
