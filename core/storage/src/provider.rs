//! Store trait definitions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use buddy_common::{
    checksum, ConflictAudit, DeviceInfo, RecordKey, Result, SyncOperation, SyncRecord, SyncStatus,
};

/// A row of application data as the local store holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord {
    pub data: Value,
    pub sync_version: u64,
    pub updated_at: DateTime<Utc>,
}

/// A record as the remote store holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    pub table_name: String,
    pub record_id: String,
    pub data: Value,
    pub sync_version: u64,
    /// Device that wrote this version.
    pub device_id: String,
    pub checksum: String,
    /// Tombstone left by a delete.
    pub deleted: bool,
    pub changed_at: DateTime<Utc>,
}

impl RemoteRecord {
    /// A live version of a record.
    pub fn upsert(key: &RecordKey, data: Value, sync_version: u64, device_id: &str) -> Self {
        Self {
            table_name: key.table_name.clone(),
            record_id: key.record_id.clone(),
            checksum: checksum(&data),
            data,
            sync_version,
            device_id: device_id.to_string(),
            deleted: false,
            changed_at: Utc::now(),
        }
    }

    /// A tombstone version of a record.
    pub fn tombstone(key: &RecordKey, sync_version: u64, device_id: &str) -> Self {
        Self {
            deleted: true,
            ..Self::upsert(key, Value::Null, sync_version, device_id)
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            table_name: self.table_name.clone(),
            record_id: self.record_id.clone(),
        }
    }
}

/// Acknowledgement of a remote write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushAck {
    pub sync_version: u64,
    /// Checksum of what the remote stored.
    pub checksum: String,
    /// `false` when the write repeated an already stored version.
    pub applied: bool,
}

/// Device-local durable storage.
///
/// Holds application rows, the sync log, the device registry mirror, the
/// conflict audit trail and the persisted scheduler queue. Implementations are
/// expected to be internally synchronized.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Get the store name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Get an application row.
    async fn get_record(&self, key: &RecordKey) -> Result<Option<StoredRecord>>;

    /// Insert or replace an application row at the given version.
    async fn upsert_record(&self, key: &RecordKey, data: &Value, sync_version: u64) -> Result<()>;

    /// Delete an application row. Deleting a missing row is not an error.
    async fn delete_record(&self, key: &RecordKey) -> Result<()>;

    /// Append a sync record to the log.
    ///
    /// # Postconditions
    /// - The record replaces any previous row with the same id
    async fn append_sync_log(&self, record: &SyncRecord) -> Result<()>;

    /// Update a sync record already in the log.
    ///
    /// # Errors
    /// - Not found if no row has the record's id
    async fn update_sync_log(&self, record: &SyncRecord) -> Result<()>;

    /// Latest sync record for a key.
    async fn get_sync_record(&self, key: &RecordKey) -> Result<Option<SyncRecord>>;

    /// Records that still need a push (PENDING or SYNCING), optionally by table.
    async fn list_pending(&self, table: Option<&str>) -> Result<Vec<SyncRecord>>;

    /// Sync records with the given status, or all of them.
    async fn list_sync_log(&self, status: Option<SyncStatus>) -> Result<Vec<SyncRecord>>;

    /// Insert or replace a device row.
    async fn persist_device_info(&self, info: &DeviceInfo) -> Result<()>;

    /// All known device rows.
    async fn load_devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Append a conflict audit row.
    async fn append_conflict_audit(&self, audit: &ConflictAudit) -> Result<()>;

    /// Conflict audit rows, optionally for one record, oldest first.
    async fn list_conflict_audits(&self, key: Option<&RecordKey>) -> Result<Vec<ConflictAudit>>;

    /// Persist a queued operation. Replaces any row with the same id.
    async fn save_queued_operation(&self, op: &SyncOperation) -> Result<()>;

    /// Remove a queued operation. Removing a missing row is not an error.
    async fn remove_queued_operation(&self, op_id: &str) -> Result<()>;

    /// All queued operations ordered by priority, then creation time.
    async fn load_queued_operations(&self) -> Result<Vec<SyncOperation>>;
}

/// The shared cloud store every device of a user syncs with.
///
/// Writes are keyed by record and sync version: repeating a write that is
/// already stored at the same version with the same checksum is a no-op.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Get the store name.
    fn name(&self) -> &str;

    /// Cheap reachability check.
    async fn ping(&self) -> bool;

    /// Fetch the current version of a record, tombstones included.
    ///
    /// # Errors
    /// - Network errors
    async fn get_record(&self, key: &RecordKey) -> Result<Option<RemoteRecord>>;

    /// Store a new version of a record.
    ///
    /// # Preconditions
    /// - `record.sync_version` is greater than the stored version, or equal to it
    ///   with the same checksum
    ///
    /// # Errors
    /// - Conflict if the stored version is newer or equal with different content
    /// - Network errors
    async fn upsert_record(&self, record: RemoteRecord) -> Result<PushAck>;

    /// Replace a record with a tombstone at `sync_version`.
    async fn delete_record(&self, key: &RecordKey, sync_version: u64, device_id: &str) -> Result<PushAck>;

    /// Records changed after `since` by devices other than `device_id`.
    async fn get_changes_since(
        &self,
        device_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteRecord>>;

    /// Mirror a device row.
    async fn register_device(&self, info: &DeviceInfo) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_remote_record_construction() {
        let key = RecordKey::new("preferences", "theme").unwrap();
        let record = RemoteRecord::upsert(&key, json!({"value": "dark"}), 2, "d1");
        assert_eq!(record.key(), key);
        assert_eq!(record.checksum, checksum(&json!({"value": "dark"})));
        assert!(!record.deleted);

        let tomb = RemoteRecord::tombstone(&key, 3, "d2");
        assert!(tomb.deleted);
        assert_eq!(tomb.sync_version, 3);
        assert_eq!(tomb.data, Value::Null);
    }

    #[test]
    fn test_remote_record_serialization() {
        let key = RecordKey::new("reminders", "r1").unwrap();
        let record = RemoteRecord::upsert(&key, json!({"text": "call mom"}), 1, "d1");

        let json = serde_json::to_string(&record).unwrap();
        let restored: RemoteRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, record);
    }
}
