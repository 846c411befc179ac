//! Change detection against the last published snapshot, with a periodic
//! heartbeat.
//!
//! The snapshot is replaced wholesale whenever a changeset is produced and
//! left untouched otherwise. Records that were detected but could not be
//! published are handed back with [`ChangeDetector::defer`] and reappear in
//! the next changeset with whatever value they have by then. A deferred
//! heartbeat that is replayed without any real change is still reported as
//! a heartbeat.

use std::collections::{BTreeMap, BTreeSet};

use stationlink_models::StationRecord;

/// The last published state, per operating mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotStore {
    batch: Option<BTreeMap<u32, StationRecord>>,
    single: Option<StationRecord>,
}

impl SnapshotStore {
    #[allow(dead_code)] // used in tests
    pub fn batch(&self) -> Option<&BTreeMap<u32, StationRecord>> {
        self.batch.as_ref()
    }

    #[allow(dead_code)] // used in tests
    pub fn single(&self) -> Option<&StationRecord> {
        self.single.as_ref()
    }
}

/// Why a detection produced (or did not produce) records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Detection {
    /// First read; stored as the baseline.
    Baseline,
    /// At least one record differs from the snapshot.
    Changed,
    /// Nothing changed for the heartbeat threshold; the full table is due.
    Heartbeat,
    /// Nothing changed; `streak` consecutive unchanged cycles so far.
    Unchanged { streak: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchChanges {
    pub detection: Detection,
    /// Records to publish, ascending by index.
    pub records: Vec<StationRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingleChange {
    pub detection: Detection,
    pub record: Option<StationRecord>,
}

#[derive(Debug)]
pub struct ChangeDetector {
    store: SnapshotStore,
    unchanged_cycles: u32,
    heartbeat_threshold: u32,
    publish_initial: bool,
    deferred: BTreeSet<u32>,
    single_deferred: bool,
    deferred_heartbeat: bool,
}

impl ChangeDetector {
    /// `heartbeat_threshold` is clamped to at least 1.
    pub fn new(heartbeat_threshold: u32, publish_initial: bool) -> Self {
        Self {
            store: SnapshotStore::default(),
            unchanged_cycles: 0,
            heartbeat_threshold: heartbeat_threshold.max(1),
            publish_initial,
            deferred: BTreeSet::new(),
            single_deferred: false,
            deferred_heartbeat: false,
        }
    }

    #[allow(dead_code)] // used in tests
    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn unchanged_cycles(&self) -> u32 {
        self.unchanged_cycles
    }

    /// Indices waiting to be republished.
    #[allow(dead_code)] // used in tests
    pub fn deferred(&self) -> impl Iterator<Item = u32> + '_ {
        self.deferred.iter().copied()
    }

    /// Compare a full table read against the batch snapshot.
    pub fn compute_batch_changes(&mut self, current: &[StationRecord]) -> BatchChanges {
        let current: BTreeMap<u32, StationRecord> = current.iter().map(|r| (r.index, *r)).collect();
        let replaying_heartbeat = std::mem::take(&mut self.deferred_heartbeat);

        let Some(snapshot) = &self.store.batch else {
            let records = if self.publish_initial {
                current.values().copied().collect()
            } else {
                Vec::new()
            };
            self.store.batch = Some(current);
            self.unchanged_cycles = 0;
            self.deferred.clear();
            return BatchChanges {
                detection: Detection::Baseline,
                records,
            };
        };

        let mut real_change = false;
        let changed: Vec<StationRecord> = current
            .values()
            .filter(|r| {
                let differs = snapshot.get(&r.index) != Some(*r);
                real_change |= differs;
                differs || self.deferred.contains(&r.index)
            })
            .copied()
            .collect();
        self.deferred.clear();

        if !changed.is_empty() {
            self.store.batch = Some(current);
            self.unchanged_cycles = 0;
            let detection = if replaying_heartbeat && !real_change {
                Detection::Heartbeat
            } else {
                Detection::Changed
            };
            return BatchChanges {
                detection,
                records: changed,
            };
        }

        match self.tick() {
            Detection::Heartbeat => {
                let records = current.values().copied().collect();
                self.store.batch = Some(current);
                BatchChanges {
                    detection: Detection::Heartbeat,
                    records,
                }
            }
            detection => BatchChanges {
                detection,
                records: Vec::new(),
            },
        }
    }

    /// Compare the configured station against the single snapshot.
    pub fn compute_single_change(&mut self, current: StationRecord) -> SingleChange {
        let replaying_heartbeat = std::mem::take(&mut self.deferred_heartbeat);
        let Some(previous) = self.store.single else {
            self.store.single = Some(current);
            self.unchanged_cycles = 0;
            self.single_deferred = false;
            return SingleChange {
                detection: Detection::Baseline,
                record: self.publish_initial.then_some(current),
            };
        };

        let deferred = std::mem::take(&mut self.single_deferred);
        if previous != current || deferred {
            self.store.single = Some(current);
            self.unchanged_cycles = 0;
            let detection = if replaying_heartbeat && previous == current {
                Detection::Heartbeat
            } else {
                Detection::Changed
            };
            return SingleChange {
                detection,
                record: Some(current),
            };
        }

        let detection = self.tick();
        SingleChange {
            detection,
            record: (detection == Detection::Heartbeat).then_some(current),
        }
    }

    /// Count one unchanged cycle; a heartbeat resets the count.
    fn tick(&mut self) -> Detection {
        self.unchanged_cycles += 1;
        if self.unchanged_cycles >= self.heartbeat_threshold {
            self.unchanged_cycles = 0;
            Detection::Heartbeat
        } else {
            Detection::Unchanged {
                streak: self.unchanged_cycles,
            }
        }
    }

    /// Include these records' indices in the next batch changeset.
    /// `detection` is the reason they were due.
    pub fn defer(&mut self, detection: Detection, records: &[StationRecord]) {
        self.deferred.extend(records.iter().map(|r| r.index));
        self.deferred_heartbeat = detection == Detection::Heartbeat && !records.is_empty();
    }

    /// Publish the single station on the next cycle regardless of change.
    pub fn defer_single(&mut self, detection: Detection) {
        self.single_deferred = true;
        self.deferred_heartbeat = detection == Detection::Heartbeat;
    }
}
