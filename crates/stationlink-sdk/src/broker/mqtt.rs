//! MQTT 3.1.1 broker adapter built on `rumqttc`.
//!
//! `rumqttc` splits a connection into an [`AsyncClient`] handle and an
//! [`EventLoop`] that must be polled for anything to happen. The event loop
//! runs on a spawned task that translates packets into [`BrokerEvent`]s and
//! stops at the first connection error; reconnecting is left to the caller.

use rumqttc::{AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{BrokerCapability, BrokerEndpoint, BrokerEvent, BrokerEventSender, QoS};
use crate::error::BrokerError;

/// Capacity of the request channel between [`AsyncClient`] and the event loop.
const REQUEST_CAPACITY: usize = 64;

/// A [`BrokerCapability`] speaking MQTT.
#[derive(Default)]
pub struct MqttBroker {
    client: Option<AsyncClient>,
    driver: Option<JoinHandle<()>>,
}

impl MqttBroker {
    /// Create a disconnected adapter.
    pub fn new() -> Self {
        Self::default()
    }

    fn stop_driver(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

impl Drop for MqttBroker {
    fn drop(&mut self) {
        self.stop_driver();
    }
}

/// Human-readable meaning of a CONNACK return code.
pub fn describe_return_code(code: ConnectReturnCode) -> &'static str {
    match code {
        ConnectReturnCode::Success => "connection accepted",
        ConnectReturnCode::RefusedProtocolVersion => "unacceptable protocol version",
        ConnectReturnCode::BadClientId => "client identifier rejected",
        ConnectReturnCode::ServiceUnavailable => "server unavailable",
        ConnectReturnCode::BadUserNamePassword => "bad user name or password",
        ConnectReturnCode::NotAuthorized => "not authorized",
    }
}

fn to_mqtt_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

/// Poll `eventloop` until the connection ends, forwarding events.
async fn drive(mut eventloop: EventLoop, events: BrokerEventSender) {
    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    BrokerEvent::Connected
                } else {
                    let _ = events.send(BrokerEvent::ConnectionRefused {
                        reason: describe_return_code(ack.code).to_string(),
                    });
                    return;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => BrokerEvent::Message {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            },
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                debug!(pkid = ack.pkid, "mqtt publish acknowledged");
                continue;
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                let _ = events.send(BrokerEvent::Disconnected {
                    reason: Some("broker closed the session".into()),
                });
                return;
            }
            Ok(other) => {
                trace!(?other, "mqtt event");
                continue;
            }
            Err(ConnectionError::ConnectionRefused(code)) => {
                let _ = events.send(BrokerEvent::ConnectionRefused {
                    reason: describe_return_code(code).to_string(),
                });
                return;
            }
            Err(e) => {
                let _ = events.send(BrokerEvent::Disconnected {
                    reason: Some(e.to_string()),
                });
                return;
            }
        };
        if events.send(event).is_err() {
            debug!("event receiver dropped, stopping mqtt driver");
            return;
        }
    }
}

impl BrokerCapability for MqttBroker {
    async fn connect(&mut self, endpoint: &BrokerEndpoint, events: BrokerEventSender) -> Result<(), BrokerError> {
        self.stop_driver();

        let mut options = MqttOptions::new(endpoint.client_id.clone(), endpoint.host.clone(), endpoint.port);
        options.set_keep_alive(endpoint.keepalive);
        if let Some(credentials) = &endpoint.credentials {
            options.set_credentials(credentials.username.clone(), credentials.password.clone());
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        self.driver = Some(tokio::spawn(drive(eventloop, events)));
        self.client = Some(client);
        debug!(host = %endpoint.host, port = endpoint.port, "mqtt connect started");
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.disconnect().await {
                debug!(error = %e, "mqtt disconnect request not delivered");
            }
        }
        self.stop_driver();
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), BrokerError> {
        let client = self.client.as_ref().ok_or(BrokerError::NotConnected)?;
        client
            .publish(topic, to_mqtt_qos(qos), false, payload)
            .await
            .map_err(|e| BrokerError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), BrokerError> {
        let client = self.client.as_ref().ok_or(BrokerError::NotConnected)?;
        client.subscribe(topic, to_mqtt_qos(qos)).await?;
        Ok(())
    }
}
