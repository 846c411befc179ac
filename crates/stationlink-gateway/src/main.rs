//! StationLink gateway: polls a controller's station table and publishes
//! changed records to a broker.

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use stationlink_models::OperatingMode;
use tokio::sync::watch;
use tracing::{error, info, warn};

mod adapters;
mod change_detector;
mod config;
mod device_reader;
mod link_manager;
mod poll_loop;
mod publisher;

use adapters::{AnyBroker, AnyDevice};
use config::{BrokerKind, DeviceKind, GatewayConfig};
use link_manager::{BrokerLink, DeviceLink, LinkManager};
use poll_loop::PollLoop;

/// Station table change publisher.
///
/// Settings come from environment variables; the flags below override them.
#[derive(Parser, Debug)]
#[command(name = "stationlink-gateway", about = "Station table change publisher")]
struct Args {
    /// Read the whole table (`batch`) or one station (`single`).
    #[arg(long)]
    mode: Option<OperatingMode>,

    /// Seconds between poll cycles.
    #[arg(long)]
    interval: Option<u64>,

    /// Station index read in single mode.
    #[arg(long)]
    station: Option<u32>,

    /// Device adapter: `modbus` or `sim`.
    #[arg(long)]
    device_kind: Option<DeviceKind>,

    /// Broker adapter: `mqtt`, `nats` or `memory`.
    #[arg(long)]
    broker_kind: Option<BrokerKind>,

    /// Publish the first table read instead of only storing it.
    #[arg(long)]
    publish_initial: bool,
}

impl Args {
    fn apply(&self, config: &mut GatewayConfig) {
        if let Some(mode) = self.mode {
            config.poll.mode = mode;
        }
        if let Some(secs) = self.interval {
            config.poll.interval = Duration::from_secs(secs);
        }
        if let Some(index) = self.station {
            config.device.single_station = index;
        }
        if let Some(kind) = self.device_kind {
            config.device.kind = kind;
        }
        if let Some(kind) = self.broker_kind {
            config.broker.kind = kind;
        }
        if self.publish_initial {
            config.poll.publish_initial = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (controlled via RUST_LOG env var).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = GatewayConfig::from_env().context("invalid configuration")?;
    args.apply(&mut config);
    config.validate().context("invalid configuration")?;

    info!(
        device = %config.device.kind,
        address = %config.device.address,
        table = config.device.table_id,
        stations = config.device.station_count,
        mode = %config.poll.mode,
        broker = %config.broker.kind,
        host = %config.broker.endpoint.host,
        port = config.broker.endpoint.port,
        topic = %config.broker.publish_topic,
        "starting stationlink gateway"
    );

    let mut device = DeviceLink::new(
        AnyDevice::from_config(&config.device),
        config.device.address.clone(),
        config.device.retry,
    );
    device
        .connect_with_retry()
        .await
        .context("device unavailable at start-up")?;

    let mut broker = BrokerLink::new(AnyBroker::from_kind(config.broker.kind), &config.broker);
    if let Err(e) = broker.ensure_connected().await {
        warn!(error = %e, "broker unavailable at start-up, retrying every cycle");
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received");
                let _ = stop_tx.send(true);
            }
            Err(e) => {
                error!(error = %e, "cannot listen for interrupt, running until killed");
                std::future::pending::<()>().await;
            }
        }
    });

    PollLoop::new(LinkManager::new(device, broker), &config)
        .run(stop_rx)
        .await;
    Ok(())
}
