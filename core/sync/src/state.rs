//! In-memory view of the sync log.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use buddy_common::{OperationType, Priority, RecordKey, SyncRecord, SyncStatus};

/// Latest sync record per key plus engine bookkeeping.
#[derive(Debug, Default)]
pub struct SyncState {
    records: HashMap<RecordKey, SyncRecord>,
    /// Payloads written while the record was being pushed.
    staged: HashMap<RecordKey, (OperationType, Value)>,
    /// Last completed pull.
    pub last_sync: Option<DateTime<Utc>>,
    /// Whether a full `sync_changes` pass is running.
    pub sync_in_progress: bool,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &RecordKey) -> Option<&SyncRecord> {
        self.records.get(key)
    }

    pub fn get_mut(&mut self, key: &RecordKey) -> Option<&mut SyncRecord> {
        self.records.get_mut(key)
    }

    /// Insert or replace the record for its key.
    pub fn upsert(&mut self, record: SyncRecord) {
        self.records.insert(record.key(), record);
    }

    pub fn stage(&mut self, key: RecordKey, operation: OperationType, data: Value) {
        self.staged.insert(key, (operation, data));
    }

    pub fn take_staged(&mut self, key: &RecordKey) -> Option<(OperationType, Value)> {
        self.staged.remove(key)
    }

    /// Keys whose record is in `status`, oldest change first.
    pub fn keys_with_status(&self, status: SyncStatus) -> Vec<RecordKey> {
        let mut found: Vec<&SyncRecord> = self
            .records
            .values()
            .filter(|r| r.status == status)
            .collect();
        found.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        found.into_iter().map(SyncRecord::key).collect()
    }

    pub fn records_with_status(&self, status: SyncStatus) -> Vec<SyncRecord> {
        self.keys_with_status(status)
            .iter()
            .filter_map(|k| self.records.get(k).cloned())
            .collect()
    }

    /// Count records by status.
    pub fn count_by_status(&self) -> HashMap<SyncStatus, usize> {
        let mut counts = HashMap::new();
        for record in self.records.values() {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Snapshot served to the transport layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusReport {
    pub pending: usize,
    pub syncing: usize,
    pub completed: usize,
    pub failed: usize,
    pub conflicts: usize,
    pub online: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub device_count: usize,
    /// Queued operations per tier; empty when no scheduler is attached.
    pub queued: BTreeMap<Priority, usize>,
}

impl SyncStatusReport {
    pub fn from_counts(counts: &HashMap<SyncStatus, usize>) -> Self {
        let count = |s: SyncStatus| counts.get(&s).copied().unwrap_or(0);
        Self {
            pending: count(SyncStatus::Pending),
            syncing: count(SyncStatus::Syncing),
            completed: count(SyncStatus::Completed),
            failed: count(SyncStatus::Failed),
            conflicts: count(SyncStatus::Conflict),
            ..Self::default()
        }
    }

    pub fn with_queue_depths(mut self, queued: BTreeMap<Priority, usize>) -> Self {
        self.queued = queued;
        self
    }
}
