//! The read → detect → publish cycle and its run loop.

use std::time::Duration;

use chrono::Local;
use stationlink_models::{OperatingMode, StationRecord};
use stationlink_sdk::{BrokerCapability, DeviceCapability};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::change_detector::{ChangeDetector, Detection};
use crate::config::GatewayConfig;
use crate::device_reader::{DeviceReader, ReadError, TableRead};
use crate::link_manager::LinkManager;
use crate::publisher::Publisher;

/// Cycles between `info` status lines while nothing changes.
const STATUS_EVERY: u64 = 10;

/// What one cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Records went out. `detection` says why.
    Published {
        detection: Detection,
        chunks: usize,
        records: usize,
    },
    /// First read stored as the baseline, nothing published.
    Baseline { stations: usize },
    /// Nothing changed.
    Unchanged { streak: u32 },
    /// A heartbeat fell due but the table read back empty.
    EmptyHeartbeat,
    /// Records were due but the broker was unreachable; they are deferred.
    BrokerSkipped { deferred: usize },
    /// The device read failed; nothing was detected.
    ReadFailed,
    /// Publishing stopped partway; the rest is deferred.
    PublishFailed {
        chunks_sent: usize,
        chunks_total: usize,
        deferred: usize,
    },
}

// ---------------------------------------------------------------------------
// Run statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub cycles: u64,
    pub reads: u64,
    pub read_failures: u64,
    pub changed_cycles: u64,
    pub heartbeats: u64,
    pub records_published: u64,
    pub chunks_published: u64,
    pub broker_skips: u64,
    pub publish_failures: u64,
}

impl RunStats {
    pub fn record(&mut self, outcome: &CycleOutcome) {
        self.cycles += 1;
        if *outcome == CycleOutcome::ReadFailed {
            self.read_failures += 1;
            return;
        }
        self.reads += 1;
        match outcome {
            CycleOutcome::Published {
                detection,
                chunks,
                records,
            } => {
                match detection {
                    Detection::Heartbeat => self.heartbeats += 1,
                    _ => self.changed_cycles += 1,
                }
                self.chunks_published += *chunks as u64;
                self.records_published += *records as u64;
            }
            CycleOutcome::EmptyHeartbeat => self.heartbeats += 1,
            CycleOutcome::BrokerSkipped { .. } => self.broker_skips += 1,
            CycleOutcome::PublishFailed { chunks_sent, .. } => {
                self.publish_failures += 1;
                self.chunks_published += *chunks_sent as u64;
            }
            _ => {}
        }
    }

    /// Share of successful reads that published a real change, in percent.
    #[allow(clippy::cast_precision_loss)]
    pub fn change_rate(&self) -> f64 {
        if self.reads == 0 {
            return 0.0;
        }
        self.changed_cycles as f64 * 100.0 / self.reads as f64
    }

    pub fn log_summary(&self) {
        info!(
            cycles = self.cycles,
            reads = self.reads,
            read_failures = self.read_failures,
            changed_cycles = self.changed_cycles,
            heartbeats = self.heartbeats,
            records_published = self.records_published,
            chunks_published = self.chunks_published,
            broker_skips = self.broker_skips,
            publish_failures = self.publish_failures,
            change_rate = format_args!("{:.1}%", self.change_rate()),
            "run statistics"
        );
    }
}

// ---------------------------------------------------------------------------
// PollLoop
// ---------------------------------------------------------------------------

pub struct PollLoop<D, B> {
    links: LinkManager<D, B>,
    reader: DeviceReader,
    detector: ChangeDetector,
    publisher: Publisher,
    mode: OperatingMode,
    single_station: u32,
    interval: Duration,
    stats: RunStats,
}

impl<D: DeviceCapability, B: BrokerCapability> PollLoop<D, B> {
    pub fn new(links: LinkManager<D, B>, config: &GatewayConfig) -> Self {
        Self {
            links,
            reader: DeviceReader::new(config.device.table_id, config.device.station_count),
            detector: ChangeDetector::new(config.poll.heartbeat_threshold, config.poll.publish_initial),
            publisher: Publisher::new(
                config.broker.publish_topic.clone(),
                config.poll.chunk_size,
                config.device.table_id,
            ),
            mode: config.poll.mode,
            single_station: config.device.single_station,
            interval: config.poll.interval,
            stats: RunStats::default(),
        }
    }

    #[allow(dead_code)] // used in tests
    pub fn links(&self) -> &LinkManager<D, B> {
        &self.links
    }

    /// Run cycles until `stop` turns true (or its sender is dropped), then
    /// close both links.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> RunStats {
        info!(
            mode = %self.mode,
            interval = ?self.interval,
            stations = self.reader.station_count(),
            table = self.reader.table_id(),
            topic = %self.publisher.topic(),
            "poll loop started"
        );
        loop {
            if *stop.borrow() {
                break;
            }
            let outcome = self.run_cycle().await;
            self.stats.record(&outcome);
            self.log_outcome(&outcome);

            tokio::select! {
                () = tokio::time::sleep(self.interval) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("stop requested, shutting down");
        self.links.shutdown().await;
        self.stats.log_summary();
        self.stats
    }

    /// One read → detect → publish cycle. Failures are absorbed into the
    /// returned outcome.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        let broker_ready = match self.links.broker_mut().ensure_connected().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "broker unavailable this cycle");
                false
            }
        };
        match self.mode {
            OperatingMode::Batch => self.batch_cycle(broker_ready).await,
            OperatingMode::Single => self.single_cycle(broker_ready).await,
        }
    }

    async fn batch_cycle(&mut self, broker_ready: bool) -> CycleOutcome {
        let table = match self.read_table().await {
            Ok(table) => table,
            Err(e) => {
                error!(error = %e, "table read failed");
                return CycleOutcome::ReadFailed;
            }
        };
        if let Some(end) = table.end_of_table {
            debug!(end, configured = self.reader.station_count(), "device table shorter than configured");
        }

        let changes = self.detector.compute_batch_changes(&table.records);
        if changes.records.is_empty() {
            return self.quiet_outcome(changes.detection, table.records.len());
        }
        if !broker_ready {
            self.detector.defer(changes.detection, &changes.records);
            return CycleOutcome::BrokerSkipped {
                deferred: changes.records.len(),
            };
        }

        let report = self.publisher.publish(self.links.broker_mut(), &changes.records).await;
        if !report.is_complete() {
            self.detector.defer(changes.detection, report.unsent);
            return CycleOutcome::PublishFailed {
                chunks_sent: report.chunks_sent,
                chunks_total: report.chunks_total,
                deferred: report.unsent.len(),
            };
        }
        CycleOutcome::Published {
            detection: changes.detection,
            chunks: report.chunks_sent,
            records: report.records_sent,
        }
    }

    async fn single_cycle(&mut self, broker_ready: bool) -> CycleOutcome {
        let record = match self.read_single().await {
            Ok(record) => record,
            Err(e) => {
                error!(index = self.single_station, error = %e, "station read failed");
                return CycleOutcome::ReadFailed;
            }
        };

        let change = self.detector.compute_single_change(record);
        let Some(record) = change.record else {
            return self.quiet_outcome(change.detection, 1);
        };
        if !broker_ready {
            self.detector.defer_single(change.detection);
            return CycleOutcome::BrokerSkipped { deferred: 1 };
        }

        match self
            .publisher
            .publish_single(self.links.broker_mut(), &record, &Local::now())
            .await
        {
            Ok(()) => CycleOutcome::Published {
                detection: change.detection,
                chunks: 1,
                records: 1,
            },
            Err(e) => {
                warn!(index = record.index, error = %e, "station publish failed");
                self.detector.defer_single(change.detection);
                CycleOutcome::PublishFailed {
                    chunks_sent: 0,
                    chunks_total: 1,
                    deferred: 1,
                }
            }
        }
    }

    fn quiet_outcome(&self, detection: Detection, stations: usize) -> CycleOutcome {
        match detection {
            Detection::Baseline => CycleOutcome::Baseline { stations },
            Detection::Unchanged { streak } => CycleOutcome::Unchanged { streak },
            Detection::Heartbeat => CycleOutcome::EmptyHeartbeat,
            Detection::Changed => CycleOutcome::Unchanged {
                streak: self.detector.unchanged_cycles(),
            },
        }
    }

    /// Read the whole table, reconnecting once if the link is down.
    async fn read_table(&mut self) -> Result<TableRead, ReadError> {
        let count = self.reader.station_count();
        let result = self.reader.read_all_stations(self.links.device_mut(), count).await;
        if matches!(&result, Err(e) if e.is_not_connected()) && self.reconnect_device().await {
            return self.reader.read_all_stations(self.links.device_mut(), count).await;
        }
        result
    }

    /// Read the configured station, reconnecting once if the link is down.
    async fn read_single(&mut self) -> Result<StationRecord, ReadError> {
        let index = self.single_station;
        let result = self.reader.read_record(self.links.device_mut(), index).await;
        if matches!(&result, Err(e) if e.is_not_connected()) && self.reconnect_device().await {
            return self.reader.read_record(self.links.device_mut(), index).await;
        }
        result
    }

    async fn reconnect_device(&mut self) -> bool {
        let device = self.links.device_mut();
        warn!(address = %device.address(), "device link down, reconnecting");
        match device.reconnect_once().await {
            Ok(()) => true,
            Err(e) => {
                warn!(address = %device.address(), error = %e, "device reconnect failed");
                false
            }
        }
    }

    fn log_outcome(&self, outcome: &CycleOutcome) {
        match outcome {
            CycleOutcome::Published {
                detection: Detection::Heartbeat,
                chunks,
                records,
            } => info!(chunks, records, "heartbeat published"),
            CycleOutcome::Published {
                detection,
                chunks,
                records,
            } => info!(%detection, chunks, records, "changes published"),
            CycleOutcome::Baseline { stations } => info!(stations, "baseline stored"),
            CycleOutcome::EmptyHeartbeat => info!("heartbeat due, table is empty"),
            CycleOutcome::Unchanged { streak } => {
                debug!(streak, "no changes");
                if self.stats.reads % STATUS_EVERY == 0 {
                    info!(
                        reads = self.stats.reads,
                        changed_cycles = self.stats.changed_cycles,
                        heartbeats = self.stats.heartbeats,
                        device = %self.links.device().state(),
                        broker = %self.links.broker().state(),
                        inbound = self.links.broker().inbound_messages(),
                        "status"
                    );
                }
            }
            CycleOutcome::BrokerSkipped { deferred } => {
                warn!(deferred, "publishing skipped, broker unavailable");
            }
            CycleOutcome::ReadFailed => warn!("cycle failed, device read unsuccessful"),
            CycleOutcome::PublishFailed {
                chunks_sent,
                chunks_total,
                deferred,
            } => warn!(chunks_sent, chunks_total, deferred, "publish incomplete, remainder deferred"),
        }
    }
}
