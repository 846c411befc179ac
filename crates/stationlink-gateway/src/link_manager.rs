//! Device and broker link supervision.
//!
//! Each link is a small state machine over [`LinkState`]:
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──ack──▶ Connected
//!       ▲                       │                   │
//!       └──────refused/timeout──┘◀──error/notify────┘
//! ```
//!
//! The device link is driven entirely by the poll loop. The broker link's
//! state lives in a `watch` channel: a listener task turns the adapter's
//! [`BrokerEvent`]s into state transitions and the poll loop only reads it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stationlink_models::LinkState;
use stationlink_sdk::{
    BrokerCapability, BrokerEndpoint, BrokerError, BrokerEvent, DeviceCapability, DeviceError, QoS,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{BrokerConfig, RetryPolicy};

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// Every device connect attempt failed.
    #[error("device at {address} unavailable after {attempts} attempt(s): {source}")]
    DeviceUnavailable {
        address: String,
        attempts: u32,
        source: DeviceError,
    },

    /// Every broker connect attempt failed.
    #[error("broker {host}:{port} unavailable after {attempts} attempt(s): {source}")]
    BrokerUnavailable {
        host: String,
        port: u16,
        attempts: u32,
        source: BrokerError,
    },
}

// ---------------------------------------------------------------------------
// Device link
// ---------------------------------------------------------------------------

/// A device connection plus its [`LinkState`].
pub struct DeviceLink<D> {
    device: D,
    address: String,
    retry: RetryPolicy,
    state: LinkState,
}

impl<D: DeviceCapability> DeviceLink<D> {
    pub fn new(device: D, address: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            device,
            address: address.into(),
            retry,
            state: LinkState::Disconnected,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Connect, retrying up to the policy's attempt count with its fixed
    /// delay between attempts.
    pub async fn connect_with_retry(&mut self) -> Result<(), LinkError> {
        let mut attempt = 1;
        loop {
            match self.try_connect().await {
                Ok(()) => return Ok(()),
                Err(source) if attempt >= self.retry.attempts => {
                    return Err(LinkError::DeviceUnavailable {
                        address: self.address.clone(),
                        attempts: attempt,
                        source,
                    });
                }
                Err(e) => {
                    warn!(
                        address = %self.address,
                        attempt,
                        max = self.retry.attempts,
                        error = %e,
                        "device connect failed, retrying in {:?}",
                        self.retry.delay
                    );
                    attempt += 1;
                    tokio::time::sleep(self.retry.delay).await;
                }
            }
        }
    }

    /// A single reconnect attempt, used mid-run.
    pub async fn reconnect_once(&mut self) -> Result<(), DeviceError> {
        self.device.disconnect().await;
        self.state = LinkState::Disconnected;
        self.try_connect().await
    }

    async fn try_connect(&mut self) -> Result<(), DeviceError> {
        self.state = LinkState::Connecting;
        match self.device.connect(&self.address).await {
            Ok(()) => {
                self.state = LinkState::Connected;
                info!(address = %self.address, "device connected");
                Ok(())
            }
            Err(e) => {
                self.state = LinkState::Disconnected;
                Err(e)
            }
        }
    }

    /// Read through the link. Fails with [`DeviceError::NotConnected`]
    /// without touching the device unless the link is connected; a closed
    /// or broken transport marks the link disconnected.
    pub async fn read(&mut self, table_id: u16, offset: u32, length: usize) -> Result<Vec<u8>, DeviceError> {
        if !self.state.is_connected() {
            return Err(DeviceError::NotConnected);
        }
        let result = self.device.read(table_id, offset, length).await;
        if let Err(e @ (DeviceError::NotConnected | DeviceError::Io(_))) = &result {
            debug!(error = %e, "device link lost");
            self.state = LinkState::Disconnected;
        }
        result
    }

    pub async fn disconnect(&mut self) {
        self.device.disconnect().await;
        self.state = LinkState::Disconnected;
    }
}

// ---------------------------------------------------------------------------
// Broker link
// ---------------------------------------------------------------------------

/// A broker connection whose [`LinkState`] is maintained by a listener task.
pub struct BrokerLink<B> {
    broker: B,
    endpoint: BrokerEndpoint,
    fallback_host: Option<String>,
    connect_timeout: Duration,
    retry: RetryPolicy,
    qos: QoS,
    command_topic: String,
    state_tx: Arc<watch::Sender<LinkState>>,
    state_rx: watch::Receiver<LinkState>,
    inbound: Arc<AtomicU64>,
    listener: Option<JoinHandle<()>>,
}

impl<B: BrokerCapability> BrokerLink<B> {
    pub fn new(broker: B, config: &BrokerConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);
        Self {
            broker,
            endpoint: config.endpoint.clone(),
            fallback_host: config.fallback_host.clone(),
            connect_timeout: config.connect_timeout,
            retry: config.retry,
            qos: config.qos,
            command_topic: config.command_topic.clone(),
            state_tx: Arc::new(state_tx),
            state_rx,
            inbound: Arc::new(AtomicU64::new(0)),
            listener: None,
        }
    }

    /// Current state as last written by the listener task.
    pub fn state(&self) -> LinkState {
        *self.state_rx.borrow()
    }

    /// A receiver observing every state change.
    #[allow(dead_code)] // used in tests
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state_rx.clone()
    }

    /// Messages received on the command topic since start-up.
    pub fn inbound_messages(&self) -> u64 {
        self.inbound.load(Ordering::Relaxed)
    }

    /// Connect unless already connected, retrying up to the policy's
    /// attempt count.
    pub async fn ensure_connected(&mut self) -> Result<(), LinkError> {
        if self.state().is_connected() {
            return Ok(());
        }
        let mut attempt = 1;
        loop {
            match self.connect_once().await {
                Ok(()) => return Ok(()),
                Err(source) if attempt >= self.retry.attempts => {
                    return Err(LinkError::BrokerUnavailable {
                        host: self.endpoint.host.clone(),
                        port: self.endpoint.port,
                        attempts: attempt,
                        source,
                    });
                }
                Err(e) => {
                    warn!(
                        host = %self.endpoint.host,
                        attempt,
                        max = self.retry.attempts,
                        error = %e,
                        "broker connect failed, retrying in {:?}",
                        self.retry.delay
                    );
                    attempt += 1;
                    tokio::time::sleep(self.retry.delay).await;
                }
            }
        }
    }

    async fn connect_once(&mut self) -> Result<(), BrokerError> {
        let endpoint = self.resolve_endpoint().await;
        self.stop_listener();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = oneshot::channel();
        self.state_tx.send_replace(LinkState::Connecting);
        self.listener = Some(tokio::spawn(listen(
            events_rx,
            Arc::clone(&self.state_tx),
            Arc::clone(&self.inbound),
            ack_tx,
        )));

        info!(host = %endpoint.host, port = endpoint.port, client_id = %endpoint.client_id, "connecting to broker");
        if let Err(e) = self.broker.connect(&endpoint, events_tx).await {
            self.state_tx.send_replace(LinkState::Disconnected);
            return Err(e);
        }

        let outcome = match tokio::time::timeout(self.connect_timeout, ack_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(BrokerError::Refused("event channel closed".into())),
            Err(_) => Err(BrokerError::AckTimeout(self.connect_timeout)),
        };
        if let Err(e) = outcome {
            self.broker.disconnect().await;
            self.stop_listener();
            self.state_tx.send_replace(LinkState::Disconnected);
            return Err(e);
        }

        if let Err(e) = self.broker.subscribe(&self.command_topic, self.qos).await {
            warn!(topic = %self.command_topic, error = %e, "command topic subscription failed");
        } else {
            info!(topic = %self.command_topic, "subscribed to command topic");
        }
        Ok(())
    }

    /// The configured endpoint, or the fallback host when the primary name
    /// does not resolve.
    async fn resolve_endpoint(&self) -> BrokerEndpoint {
        let Some(fallback) = &self.fallback_host else {
            return self.endpoint.clone();
        };
        let resolved = tokio::net::lookup_host((self.endpoint.host.as_str(), self.endpoint.port))
            .await
            .map(|mut addrs| addrs.next().is_some())
            .unwrap_or(false);
        if resolved {
            return self.endpoint.clone();
        }
        warn!(host = %self.endpoint.host, fallback = %fallback, "broker host did not resolve, using fallback");
        BrokerEndpoint {
            host: fallback.clone(),
            ..self.endpoint.clone()
        }
    }

    pub async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        if !self.state().is_connected() {
            return Err(BrokerError::NotConnected);
        }
        self.broker.publish(topic, payload, self.qos).await
    }

    pub async fn disconnect(&mut self) {
        self.broker.disconnect().await;
        self.stop_listener();
        self.state_tx.send_replace(LinkState::Disconnected);
    }

    fn stop_listener(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

impl<B> Drop for BrokerLink<B> {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

/// Turn adapter events into state transitions. The first connection
/// outcome is also reported on `ack`. Inbound messages are logged and
/// counted; they never change the link state.
async fn listen(
    mut events: mpsc::UnboundedReceiver<BrokerEvent>,
    state: Arc<watch::Sender<LinkState>>,
    inbound: Arc<AtomicU64>,
    ack: oneshot::Sender<Result<(), BrokerError>>,
) {
    let mut ack = Some(ack);
    let mut acknowledge = |outcome: Result<(), BrokerError>| {
        if let Some(ack) = ack.take() {
            let _ = ack.send(outcome);
        }
    };

    while let Some(event) = events.recv().await {
        match event {
            BrokerEvent::Connected => {
                state.send_replace(LinkState::Connected);
                info!("broker connected");
                acknowledge(Ok(()));
            }
            BrokerEvent::ConnectionRefused { reason } => {
                state.send_replace(LinkState::Disconnected);
                warn!(%reason, "broker refused connection");
                acknowledge(Err(BrokerError::Refused(reason)));
            }
            BrokerEvent::Disconnected { reason } => {
                state.send_replace(LinkState::Disconnected);
                let reason = reason.unwrap_or_else(|| "connection closed".into());
                warn!(%reason, "broker disconnected");
                acknowledge(Err(BrokerError::Refused(reason)));
            }
            BrokerEvent::Message { topic, payload } => {
                inbound.fetch_add(1, Ordering::Relaxed);
                info!(%topic, payload = %String::from_utf8_lossy(&payload), "inbound message");
            }
        }
    }
    debug!("broker event channel closed");
}

// ---------------------------------------------------------------------------
// LinkManager
// ---------------------------------------------------------------------------

/// Owns both links for the lifetime of the poll loop.
pub struct LinkManager<D, B> {
    device: DeviceLink<D>,
    broker: BrokerLink<B>,
}

impl<D: DeviceCapability, B: BrokerCapability> LinkManager<D, B> {
    pub fn new(device: DeviceLink<D>, broker: BrokerLink<B>) -> Self {
        Self { device, broker }
    }

    pub fn device(&self) -> &DeviceLink<D> {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut DeviceLink<D> {
        &mut self.device
    }

    pub fn broker(&self) -> &BrokerLink<B> {
        &self.broker
    }

    pub fn broker_mut(&mut self) -> &mut BrokerLink<B> {
        &mut self.broker
    }

    /// Disconnect both links.
    pub async fn shutdown(&mut self) {
        self.broker.disconnect().await;
        self.device.disconnect().await;
        info!("links closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stationlink_sdk::broker::MemoryBroker;
    use stationlink_sdk::device::{SimulatedDevice, SimulatedTable};

    fn retry(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            delay: Duration::ZERO,
        }
    }

    fn broker_config() -> BrokerConfig {
        BrokerConfig {
            kind: crate::config::BrokerKind::Memory,
            endpoint: BrokerEndpoint {
                host: "memory".into(),
                port: 1883,
                keepalive: Duration::from_secs(60),
                client_id: "test".into(),
                credentials: None,
            },
            fallback_host: None,
            connect_timeout: Duration::from_millis(200),
            retry: retry(2),
            qos: QoS::AtLeastOnce,
            publish_topic: "out".into(),
            command_topic: "cmd".into(),
        }
    }

    #[tokio::test]
    async fn device_connect_gives_up_after_retries() {
        let table = SimulatedTable::zeroed(4);
        table.refuse_connects(10);
        let mut link = DeviceLink::new(SimulatedDevice::new(table.clone()), "sim", retry(3));

        let err = link.connect_with_retry().await.unwrap_err();
        assert!(matches!(err, LinkError::DeviceUnavailable { attempts: 3, .. }));
        assert_eq!(table.connect_attempts(), 3);
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn device_connect_succeeds_on_later_attempt() {
        let table = SimulatedTable::zeroed(4);
        table.refuse_connects(2);
        let mut link = DeviceLink::new(SimulatedDevice::new(table.clone()), "sim", retry(3));

        link.connect_with_retry().await.unwrap();
        assert_eq!(table.connect_attempts(), 3);
        assert_eq!(link.state(), LinkState::Connected);
    }

    #[tokio::test]
    async fn read_on_disconnected_link_skips_device() {
        let table = SimulatedTable::zeroed(4);
        let mut link = DeviceLink::new(SimulatedDevice::new(table.clone()), "sim", retry(1));

        assert_eq!(link.read(1, 0, 10).await, Err(DeviceError::NotConnected));
        assert_eq!(table.reads(), 0);
    }

    #[tokio::test]
    async fn io_failure_marks_link_disconnected() {
        let table = SimulatedTable::zeroed(4);
        let mut link = DeviceLink::new(SimulatedDevice::new(table.clone()), "sim", retry(1));
        link.connect_with_retry().await.unwrap();

        table.inject_read_fault(DeviceError::Io("reset".into()));
        assert!(link.read(1, 0, 10).await.is_err());
        assert_eq!(link.state(), LinkState::Disconnected);

        link.reconnect_once().await.unwrap();
        assert_eq!(link.read(1, 0, 10).await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn out_of_range_keeps_link_connected() {
        let table = SimulatedTable::zeroed(1);
        let mut link = DeviceLink::new(SimulatedDevice::new(table), "sim", retry(1));
        link.connect_with_retry().await.unwrap();

        assert!(matches!(
            link.read(1, 10, 10).await,
            Err(DeviceError::AddressOutOfRange { .. })
        ));
        assert_eq!(link.state(), LinkState::Connected);
    }

    #[tokio::test]
    async fn broker_connects_and_subscribes() {
        let broker = MemoryBroker::new();
        let mut link = BrokerLink::new(broker.clone(), &broker_config());

        link.ensure_connected().await.unwrap();
        assert_eq!(link.state(), LinkState::Connected);
        assert_eq!(broker.subscriptions(), vec!["cmd".to_string()]);

        link.ensure_connected().await.unwrap();
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn broker_refusal_is_retried() {
        let broker = MemoryBroker::new();
        broker.refuse_connects(1);
        let mut link = BrokerLink::new(broker.clone(), &broker_config());

        link.ensure_connected().await.unwrap();
        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(link.state(), LinkState::Connected);
    }

    #[tokio::test]
    async fn broker_unavailable_after_retries() {
        let broker = MemoryBroker::new();
        broker.refuse_connects(5);
        let mut link = BrokerLink::new(broker.clone(), &broker_config());

        let err = link.ensure_connected().await.unwrap_err();
        assert!(matches!(
            err,
            LinkError::BrokerUnavailable {
                attempts: 2,
                source: BrokerError::Refused(_),
                ..
            }
        ));
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn missing_ack_times_out() {
        let broker = MemoryBroker::new();
        broker.ignore_connects(1);
        let mut config = broker_config();
        config.retry = retry(1);
        let mut link = BrokerLink::new(broker, &config);

        let err = link.ensure_connected().await.unwrap_err();
        assert!(matches!(
            err,
            LinkError::BrokerUnavailable {
                source: BrokerError::AckTimeout(_),
                ..
            }
        ));
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_notification_updates_state() {
        let broker = MemoryBroker::new();
        let mut link = BrokerLink::new(broker.clone(), &broker_config());
        link.ensure_connected().await.unwrap();

        let mut state = link.watch_state();
        broker.drop_connection();
        state.wait_for(|s| *s == LinkState::Disconnected).await.unwrap();

        assert_eq!(link.publish("out", b"[]".to_vec()).await, Err(BrokerError::NotConnected));
    }

    #[tokio::test]
    async fn unresolvable_host_uses_fallback() {
        let broker = MemoryBroker::new();
        let mut config = broker_config();
        config.endpoint.host = "nonexistent.invalid".into();
        config.fallback_host = Some("10.0.0.7".into());
        let mut link = BrokerLink::new(broker.clone(), &config);

        link.ensure_connected().await.unwrap();
        assert_eq!(broker.connect_hosts(), vec!["10.0.0.7".to_string()]);
        assert_eq!(link.state(), LinkState::Connected);
    }

    #[tokio::test]
    async fn resolvable_host_ignores_fallback() {
        let broker = MemoryBroker::new();
        let mut config = broker_config();
        config.endpoint.host = "127.0.0.1".into();
        config.fallback_host = Some("10.0.0.7".into());
        let mut link = BrokerLink::new(broker.clone(), &config);

        link.ensure_connected().await.unwrap();
        assert_eq!(broker.connect_hosts(), vec!["127.0.0.1".to_string()]);
    }

    #[tokio::test]
    async fn inbound_message_keeps_link_connected() {
        let broker = MemoryBroker::new();
        let mut link = BrokerLink::new(broker.clone(), &broker_config());
        link.ensure_connected().await.unwrap();

        broker.inject_message("cmd", br#"{"cmd":"refresh"}"#);
        broker.inject_message("cmd", b"\xff not utf-8");
        while link.inbound_messages() < 2 {
            tokio::task::yield_now().await;
        }

        assert_eq!(link.state(), LinkState::Connected);
        link.publish("out", b"[]".to_vec()).await.unwrap();
        assert_eq!(broker.published().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_closes_both_links() {
        let table = SimulatedTable::zeroed(1);
        let mut manager = LinkManager::new(
            DeviceLink::new(SimulatedDevice::new(table), "sim", retry(1)),
            BrokerLink::new(MemoryBroker::new(), &broker_config()),
        );
        manager.device_mut().connect_with_retry().await.unwrap();
        manager.broker_mut().ensure_connected().await.unwrap();

        manager.shutdown().await;
        assert_eq!(manager.device().state(), LinkState::Disconnected);
        assert_eq!(manager.broker().state(), LinkState::Disconnected);
    }
}
