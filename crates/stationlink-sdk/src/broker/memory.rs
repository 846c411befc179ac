//! In-memory broker that records what is published.
//!
//! Cloning a [`MemoryBroker`] yields another handle to the same state, so a
//! test can keep one handle while the gateway owns the other. Connection
//! outcomes are delivered through the event channel exactly like the real
//! adapters do.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use super::{BrokerCapability, BrokerEndpoint, BrokerEvent, BrokerEventSender, QoS};
use crate::error::BrokerError;

/// Number of messages kept before the oldest are discarded.
const RETAINED_MESSAGES: usize = 4096;

/// One recorded publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Destination topic.
    pub topic: String,
    /// Raw payload.
    pub payload: Vec<u8>,
    /// Requested QoS.
    pub qos: QoS,
}

#[derive(Debug, Default)]
struct MemoryState {
    published: VecDeque<PublishedMessage>,
    subscriptions: Vec<String>,
    events: Option<BrokerEventSender>,
    connected: bool,
    connect_attempts: u32,
    connect_hosts: Vec<String>,
    refuse_connects: u32,
    unanswered_connects: u32,
    publish_budget: Option<usize>,
}

/// A [`BrokerCapability`] that keeps published messages in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryBroker {
    /// Create an empty, disconnected broker.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Messages published so far, oldest first.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.iter().cloned().collect()
    }

    /// Topics subscribed so far.
    pub fn subscriptions(&self) -> Vec<String> {
        self.state().subscriptions.clone()
    }

    /// Connect attempts seen so far.
    pub fn connect_attempts(&self) -> u32 {
        self.state().connect_attempts
    }

    /// Host named by each connect attempt, oldest first.
    pub fn connect_hosts(&self) -> Vec<String> {
        self.state().connect_hosts.clone()
    }

    /// Refuse the next `count` connect attempts with a refusal event.
    pub fn refuse_connects(&self, count: u32) {
        self.state().refuse_connects = count;
    }

    /// Leave the next `count` connect attempts without any answer.
    pub fn ignore_connects(&self, count: u32) {
        self.state().unanswered_connects = count;
    }

    /// Let `count` more publishes succeed, then fail every publish until
    /// [`allow_publishes`](Self::allow_publishes) is called.
    pub fn fail_publishes_after(&self, count: usize) {
        self.state().publish_budget = Some(count);
    }

    /// Stop failing publishes.
    pub fn allow_publishes(&self) {
        self.state().publish_budget = None;
    }

    /// Simulate the broker dropping the connection.
    pub fn drop_connection(&self) {
        let mut state = self.state();
        state.connected = false;
        if let Some(events) = &state.events {
            let _ = events.send(BrokerEvent::Disconnected {
                reason: Some("dropped by broker".into()),
            });
        }
    }

    /// Deliver an inbound message to the subscriber.
    pub fn inject_message(&self, topic: &str, payload: &[u8]) {
        if let Some(events) = &self.state().events {
            let _ = events.send(BrokerEvent::Message {
                topic: topic.to_string(),
                payload: payload.to_vec(),
            });
        }
    }
}

impl BrokerCapability for MemoryBroker {
    async fn connect(&mut self, endpoint: &BrokerEndpoint, events: BrokerEventSender) -> Result<(), BrokerError> {
        let mut state = self.state();
        state.connect_attempts += 1;
        state.connect_hosts.push(endpoint.host.clone());
        debug!(host = %endpoint.host, attempt = state.connect_attempts, "memory broker connect");

        if state.unanswered_connects > 0 {
            state.unanswered_connects -= 1;
        } else if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            let _ = events.send(BrokerEvent::ConnectionRefused {
                reason: "refused by memory broker".into(),
            });
        } else {
            state.connected = true;
            let _ = events.send(BrokerEvent::Connected);
        }
        state.events = Some(events);
        Ok(())
    }

    async fn disconnect(&mut self) {
        let mut state = self.state();
        state.connected = false;
        state.events = None;
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), BrokerError> {
        let mut state = self.state();
        if !state.connected {
            return Err(BrokerError::NotConnected);
        }
        if let Some(remaining) = state.publish_budget.as_mut() {
            if *remaining == 0 {
                return Err(BrokerError::Publish {
                    topic: topic.to_string(),
                    reason: "rejected by memory broker".into(),
                });
            }
            *remaining -= 1;
        }
        if state.published.len() == RETAINED_MESSAGES {
            state.published.pop_front();
        }
        debug!(topic, bytes = payload.len(), "memory broker publish");
        state.published.push_back(PublishedMessage {
            topic: topic.to_string(),
            payload,
            qos,
        });
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str, _qos: QoS) -> Result<(), BrokerError> {
        let mut state = self.state();
        if !state.connected {
            return Err(BrokerError::NotConnected);
        }
        state.subscriptions.push(topic.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn endpoint() -> BrokerEndpoint {
        BrokerEndpoint {
            host: "memory".into(),
            port: 0,
            keepalive: Duration::from_secs(60),
            client_id: "test".into(),
            credentials: None,
        }
    }

    #[tokio::test]
    async fn connect_reports_through_events() {
        let mut broker = MemoryBroker::new();
        broker.refuse_connects(1);
        let (tx, mut rx) = mpsc::unbounded_channel();

        broker.connect(&endpoint(), tx.clone()).await.unwrap();
        assert!(matches!(rx.recv().await, Some(BrokerEvent::ConnectionRefused { .. })));

        broker.connect(&endpoint(), tx).await.unwrap();
        assert_eq!(rx.recv().await, Some(BrokerEvent::Connected));
        assert_eq!(broker.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn records_publishes_in_order() {
        let mut broker = MemoryBroker::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        broker.connect(&endpoint(), tx).await.unwrap();

        broker.publish("a", b"1".to_vec(), QoS::AtLeastOnce).await.unwrap();
        broker.publish("a", b"2".to_vec(), QoS::AtMostOnce).await.unwrap();

        let published = broker.published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].payload, b"1");
        assert_eq!(published[1].qos, QoS::AtMostOnce);
    }

    #[tokio::test]
    async fn publish_budget_exhausts() {
        let mut broker = MemoryBroker::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        broker.connect(&endpoint(), tx).await.unwrap();
        broker.fail_publishes_after(1);

        assert!(broker.publish("a", vec![], QoS::AtLeastOnce).await.is_ok());
        assert!(matches!(
            broker.publish("a", vec![], QoS::AtLeastOnce).await,
            Err(BrokerError::Publish { .. })
        ));
        broker.allow_publishes();
        assert!(broker.publish("a", vec![], QoS::AtLeastOnce).await.is_ok());
    }

    #[tokio::test]
    async fn drop_connection_notifies() {
        let mut broker = MemoryBroker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker.connect(&endpoint(), tx).await.unwrap();
        assert_eq!(rx.recv().await, Some(BrokerEvent::Connected));

        broker.drop_connection();
        assert!(matches!(rx.recv().await, Some(BrokerEvent::Disconnected { .. })));
        assert_eq!(
            broker.publish("a", vec![], QoS::AtLeastOnce).await,
            Err(BrokerError::NotConnected)
        );
    }

    #[tokio::test]
    async fn injected_message_reaches_subscriber() {
        let mut broker = MemoryBroker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker.connect(&endpoint(), tx).await.unwrap();
        assert_eq!(rx.recv().await, Some(BrokerEvent::Connected));
        assert_eq!(broker.connect_hosts(), vec!["memory".to_string()]);

        broker.inject_message("cmd", b"ping");
        assert_eq!(
            rx.recv().await,
            Some(BrokerEvent::Message {
                topic: "cmd".into(),
                payload: b"ping".to_vec(),
            })
        );
    }
}
