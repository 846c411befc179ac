//! NATS broker adapter built on `async-nats`.
//!
//! NATS has no per-message QoS; the requested level is ignored and every
//! publish is flushed before returning. Connection state changes reported
//! by the client's event callback are forwarded as [`BrokerEvent`]s.

use async_nats::ConnectOptions;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{BrokerCapability, BrokerEndpoint, BrokerEvent, BrokerEventSender, QoS};
use crate::error::BrokerError;

/// A [`BrokerCapability`] speaking NATS.
#[derive(Default)]
pub struct NatsBroker {
    client: Option<async_nats::Client>,
    events: Option<BrokerEventSender>,
    subscriptions: Vec<JoinHandle<()>>,
}

impl NatsBroker {
    /// Create a disconnected adapter.
    pub fn new() -> Self {
        Self::default()
    }

    fn stop_subscriptions(&mut self) {
        for handle in self.subscriptions.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for NatsBroker {
    fn drop(&mut self) {
        self.stop_subscriptions();
    }
}

/// `nats://host:port` for an endpoint.
fn server_url(endpoint: &BrokerEndpoint) -> String {
    format!("nats://{}:{}", endpoint.host, endpoint.port)
}

impl BrokerCapability for NatsBroker {
    async fn connect(&mut self, endpoint: &BrokerEndpoint, events: BrokerEventSender) -> Result<(), BrokerError> {
        self.stop_subscriptions();

        let sink = events.clone();
        let mut options = ConnectOptions::new()
            .name(endpoint.client_id.clone())
            .ping_interval(endpoint.keepalive)
            .event_callback(move |event| {
                let sink = sink.clone();
                async move {
                    let forwarded = match event {
                        async_nats::Event::Connected => BrokerEvent::Connected,
                        async_nats::Event::Disconnected => BrokerEvent::Disconnected { reason: None },
                        async_nats::Event::Closed => BrokerEvent::Disconnected {
                            reason: Some("connection closed".into()),
                        },
                        other => {
                            trace!(?other, "nats event");
                            return;
                        }
                    };
                    let _ = sink.send(forwarded);
                }
            });
        if let Some(credentials) = &endpoint.credentials {
            options = options.user_and_password(credentials.username.clone(), credentials.password.clone());
        }

        let url = server_url(endpoint);
        let client = options.connect(url.as_str()).await?;
        debug!(%url, "nats connection established");

        // The callback only fires on later transitions; report the initial one.
        let _ = events.send(BrokerEvent::Connected);
        self.client = Some(client);
        self.events = Some(events);
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.stop_subscriptions();
        if let Some(client) = self.client.take() {
            if let Err(e) = client.flush().await {
                debug!(error = %e, "nats flush on disconnect failed");
            }
        }
        self.events = None;
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>, _qos: QoS) -> Result<(), BrokerError> {
        let client = self.client.as_ref().ok_or(BrokerError::NotConnected)?;
        let publish_error = |reason: String| BrokerError::Publish {
            topic: topic.to_string(),
            reason,
        };
        client
            .publish(topic.to_string(), payload.into())
            .await
            .map_err(|e| publish_error(e.to_string()))?;
        client.flush().await.map_err(|e| publish_error(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str, _qos: QoS) -> Result<(), BrokerError> {
        let client = self.client.as_ref().ok_or(BrokerError::NotConnected)?;
        let events = self.events.clone().ok_or(BrokerError::NotConnected)?;
        let mut subscriber = client.subscribe(topic.to_string()).await?;

        self.subscriptions.push(tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                let event = BrokerEvent::Message {
                    topic: message.subject.to_string(),
                    payload: message.payload.to_vec(),
                };
                if events.send(event).is_err() {
                    break;
                }
            }
        }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn url_from_endpoint() {
        let endpoint = BrokerEndpoint {
            host: "localhost".into(),
            port: 4222,
            keepalive: Duration::from_secs(60),
            client_id: "stationlink".into(),
            credentials: None,
        };
        assert_eq!(server_url(&endpoint), "nats://localhost:4222");
    }

    #[tokio::test]
    async fn subscribe_before_connect_fails() {
        let mut broker = NatsBroker::new();
        assert_eq!(
            broker.subscribe("cmd", QoS::AtMostOnce).await,
            Err(BrokerError::NotConnected)
        );
    }
}
