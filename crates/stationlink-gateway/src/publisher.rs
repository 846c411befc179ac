//! Changeset serialisation and chunked publishing.

use chrono::{DateTime, TimeZone};
use stationlink_models::{default_device_id, SingleStationMessage, StationRecord};
use stationlink_sdk::{BrokerCapability, BrokerError};
use tracing::{debug, warn};

use crate::link_manager::BrokerLink;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("chunk {chunk} could not be serialised: {source}")]
    Serialize {
        chunk: usize,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Outcome of publishing one changeset.
#[derive(Debug)]
pub struct PublishReport<'a> {
    pub chunks_sent: usize,
    pub chunks_total: usize,
    pub records_sent: usize,
    /// Records of the failed chunk and every chunk after it.
    pub unsent: &'a [StationRecord],
    pub failure: Option<PublishError>,
}

impl PublishReport<'_> {
    pub fn is_complete(&self) -> bool {
        self.failure.is_none()
    }
}

/// Splits changesets into chunks and publishes them in order.
#[derive(Debug, Clone)]
pub struct Publisher {
    topic: String,
    chunk_size: usize,
    table_id: u16,
}

impl Publisher {
    /// `chunk_size` is clamped to at least 1.
    pub fn new(topic: impl Into<String>, chunk_size: usize, table_id: u16) -> Self {
        Self {
            topic: topic.into(),
            chunk_size: chunk_size.max(1),
            table_id,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Number of chunks `len` records split into.
    pub fn chunk_count(&self, len: usize) -> usize {
        len.div_ceil(self.chunk_size)
    }

    /// Publish `records` as JSON arrays of at most `chunk_size` entries,
    /// stopping at the first chunk that fails.
    pub async fn publish<'a, B: BrokerCapability>(
        &self,
        link: &mut BrokerLink<B>,
        records: &'a [StationRecord],
    ) -> PublishReport<'a> {
        let chunks_total = self.chunk_count(records.len());
        let mut report = PublishReport {
            chunks_sent: 0,
            chunks_total,
            records_sent: 0,
            unsent: &[],
            failure: None,
        };

        for (chunk_index, chunk) in records.chunks(self.chunk_size).enumerate() {
            match self.send_chunk(link, chunk_index, chunk).await {
                Ok(()) => {
                    debug!(
                        chunk = chunk_index + 1,
                        of = chunks_total,
                        records = chunk.len(),
                        first = chunk.first().map(|r| r.index),
                        "chunk published"
                    );
                    report.chunks_sent += 1;
                    report.records_sent += chunk.len();
                }
                Err(e) => {
                    warn!(chunk = chunk_index + 1, of = chunks_total, error = %e, "chunk publish failed, aborting remaining chunks");
                    report.unsent = &records[report.records_sent..];
                    report.failure = Some(e);
                    break;
                }
            }
        }
        report
    }

    async fn send_chunk<B: BrokerCapability>(
        &self,
        link: &mut BrokerLink<B>,
        chunk_index: usize,
        chunk: &[StationRecord],
    ) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(chunk).map_err(|source| PublishError::Serialize {
            chunk: chunk_index,
            source,
        })?;
        link.publish(&self.topic, payload).await?;
        Ok(())
    }

    /// Publish one station wrapped in a timestamped envelope.
    pub async fn publish_single<B, Tz>(
        &self,
        link: &mut BrokerLink<B>,
        record: &StationRecord,
        at: &DateTime<Tz>,
    ) -> Result<(), PublishError>
    where
        B: BrokerCapability,
        Tz: TimeZone,
        Tz::Offset: std::fmt::Display,
    {
        let message = SingleStationMessage::new(record, default_device_id(self.table_id, record.index), at);
        let payload = serde_json::to_vec(&message).map_err(|source| PublishError::Serialize { chunk: 0, source })?;
        link.publish(&self.topic, payload).await?;
        debug!(index = record.index, "station message published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use serde_json::Value;
    use stationlink_sdk::broker::MemoryBroker;
    use stationlink_sdk::{BrokerEndpoint, QoS};

    use crate::config::{BrokerConfig, BrokerKind, RetryPolicy};

    fn station(index: u32) -> StationRecord {
        StationRecord {
            index,
            occupied: index % 2 == 1,
            call_station: false,
            field3: 0,
            kind: 3,
            old_station: 0,
            reserve2: 0,
        }
    }

    fn records(count: u32) -> Vec<StationRecord> {
        (0..count).map(station).collect()
    }

    async fn connected_link(broker: &MemoryBroker) -> BrokerLink<MemoryBroker> {
        let config = BrokerConfig {
            kind: BrokerKind::Memory,
            endpoint: BrokerEndpoint {
                host: "memory".into(),
                port: 0,
                keepalive: Duration::from_secs(60),
                client_id: "test".into(),
                credentials: None,
            },
            fallback_host: None,
            connect_timeout: Duration::from_secs(1),
            retry: RetryPolicy {
                attempts: 1,
                delay: Duration::ZERO,
            },
            qos: QoS::AtLeastOnce,
            publish_topic: "out".into(),
            command_topic: "cmd".into(),
        };
        let mut link = BrokerLink::new(broker.clone(), &config);
        link.ensure_connected().await.unwrap();
        link
    }

    fn chunk_lengths(broker: &MemoryBroker) -> Vec<usize> {
        broker
            .published()
            .iter()
            .map(|m| {
                let chunk: Vec<StationRecord> = serde_json::from_slice(&m.payload).unwrap();
                chunk.len()
            })
            .collect()
    }

    #[test]
    fn chunk_count_rounds_up() {
        let publisher = Publisher::new("out", 10, 1);
        assert_eq!(publisher.chunk_count(0), 0);
        assert_eq!(publisher.chunk_count(10), 1);
        assert_eq!(publisher.chunk_count(23), 3);
    }

    #[tokio::test]
    async fn splits_into_ordered_chunks() {
        let broker = MemoryBroker::new();
        let mut link = connected_link(&broker).await;
        let publisher = Publisher::new("out", 10, 1);
        let records = records(23);

        let report = publisher.publish(&mut link, &records).await;
        assert!(report.is_complete());
        assert_eq!(report.chunks_sent, 3);
        assert_eq!(report.records_sent, 23);
        assert_eq!(chunk_lengths(&broker), vec![10, 10, 3]);

        let mut seen = Vec::new();
        for message in broker.published() {
            assert_eq!(message.topic, "out");
            let chunk: Vec<StationRecord> = serde_json::from_slice(&message.payload).unwrap();
            seen.extend(chunk);
        }
        assert_eq!(seen, records);
    }

    #[tokio::test]
    async fn empty_changeset_publishes_nothing() {
        let broker = MemoryBroker::new();
        let mut link = connected_link(&broker).await;

        let report = Publisher::new("out", 10, 1).publish(&mut link, &[]).await;
        assert_eq!(report.chunks_sent, 0);
        assert_eq!(report.chunks_total, 0);
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn stops_at_first_failed_chunk() {
        let broker = MemoryBroker::new();
        let mut link = connected_link(&broker).await;
        broker.fail_publishes_after(1);
        let records = records(25);

        let report = Publisher::new("out", 10, 1).publish(&mut link, &records).await;
        assert_eq!(report.chunks_sent, 1);
        assert_eq!(report.chunks_total, 3);
        assert!(matches!(report.failure, Some(PublishError::Broker(BrokerError::Publish { .. }))));
        assert_eq!(report.unsent.len(), 15);
        assert_eq!(report.unsent[0].index, 10);
        assert_eq!(broker.published().len(), 1);
    }

    #[tokio::test]
    async fn batch_entry_field_names() {
        let broker = MemoryBroker::new();
        let mut link = connected_link(&broker).await;
        Publisher::new("out", 10, 1).publish(&mut link, &records(2)).await;

        let payload: Value = serde_json::from_slice(&broker.published()[0].payload).unwrap();
        let entry = &payload[1];
        assert_eq!(entry["index"], 1);
        assert_eq!(entry["Occupied"], true);
        assert_eq!(entry["CallStation"], false);
        assert_eq!(entry["Type"], 3);
        assert!(entry.get("OldStation").is_some());
        assert!(entry.get("Reserve2").is_some());
        assert!(entry.get("Field3").is_some());
    }

    #[tokio::test]
    async fn single_message_envelope() {
        let broker = MemoryBroker::new();
        let mut link = connected_link(&broker).await;
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();

        Publisher::new("out", 10, 3003)
            .publish_single(&mut link, &station(4), &at)
            .await
            .unwrap();

        let message: Value = serde_json::from_slice(&broker.published()[0].payload).unwrap();
        assert_eq!(message["timestamp"], "2024-03-09 07:05:01");
        assert_eq!(message["device_id"], "PLC_DB3003_Station4");
        assert_eq!(message["station_index"], 4);
        assert_eq!(message["base_offset"], 40);
        assert_eq!(message["data"]["Type"], 3);
        assert!(message["data"].get("index").is_none());
    }
}
