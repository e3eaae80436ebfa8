//! Persisted sync data model.
//!
//! Every struct here maps one-to-one onto a row of the local durable log and
//! serializes with camelCase field names so the transport layer can hand them
//! out unchanged.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::{ConflictStrategy, ConnectionState, DeviceType, OperationType, Priority, RecordKey};
use crate::{Error, Result};

/// Key of the metadata envelope the change tracker adds to every payload.
pub const SYNC_ENVELOPE_KEY: &str = "_sync";

/// Content hash of a payload, ignoring the metadata envelope.
///
/// BLAKE2b-256 over the JSON encoding. Object keys serialize in sorted order, so
/// equal values always hash equally.
pub fn checksum(data: &Value) -> String {
    let bytes = match data {
        Value::Object(map) if map.contains_key(SYNC_ENVELOPE_KEY) => {
            let mut stripped = map.clone();
            stripped.remove(SYNC_ENVELOPE_KEY);
            serde_json::to_vec(&Value::Object(stripped))
        }
        other => serde_json::to_vec(other),
    }
    .unwrap_or_default();

    let mut hasher = Blake2b::<U32>::new();
    hasher.update(&bytes);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Lifecycle state of a [`SyncRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    /// Waiting to be pushed.
    Pending,
    /// Picked up by a push.
    Syncing,
    /// Remote has accepted this version.
    Completed,
    /// Retries exhausted or payload rejected.
    Failed,
    /// Remote moved ahead and the resolution is outstanding.
    Conflict,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "PENDING",
            SyncStatus::Syncing => "SYNCING",
            SyncStatus::Completed => "COMPLETED",
            SyncStatus::Failed => "FAILED",
            SyncStatus::Conflict => "CONFLICT",
        }
    }

    /// PENDING and SYNCING records are still owned by the push path.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, SyncStatus::Pending | SyncStatus::Syncing)
    }

    /// Whether the state machine allows `self -> next`.
    pub fn can_transition_to(&self, next: SyncStatus) -> bool {
        use SyncStatus::*;
        matches!(
            (self, next),
            (Pending, Syncing)
                | (Pending, Failed)
                | (Syncing, Completed)
                | (Syncing, Pending)
                | (Syncing, Failed)
                | (Syncing, Conflict)
                | (Conflict, Completed)
                | (Conflict, Pending)
                | (Completed, Pending)
                | (Failed, Pending)
                | (Conflict, Conflict)
        )
    }
}

impl std::str::FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(SyncStatus::Pending),
            "SYNCING" => Ok(SyncStatus::Syncing),
            "COMPLETED" => Ok(SyncStatus::Completed),
            "FAILED" => Ok(SyncStatus::Failed),
            "CONFLICT" => Ok(SyncStatus::Conflict),
            other => Err(Error::Serialization(format!("Unknown sync status: {}", other))),
        }
    }
}

/// Durable record of one local mutation and its sync progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecord {
    pub id: String,
    pub user_id: String,
    pub device_id: String,
    pub table_name: String,
    pub record_id: String,
    pub operation: OperationType,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub sync_version: u64,
    pub status: SyncStatus,
    pub checksum: String,
    pub error_message: Option<String>,
    pub retry_count: u32,
}

impl SyncRecord {
    /// Create a new PENDING record.
    pub fn new(
        key: &RecordKey,
        operation: OperationType,
        data: Value,
        user_id: impl Into<String>,
        device_id: impl Into<String>,
        sync_version: u64,
    ) -> Self {
        let checksum = checksum(&data);
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            device_id: device_id.into(),
            table_name: key.table_name.clone(),
            record_id: key.record_id.clone(),
            operation,
            data,
            timestamp: Utc::now(),
            sync_version,
            status: SyncStatus::Pending,
            checksum,
            error_message: None,
            retry_count: 0,
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            table_name: self.table_name.clone(),
            record_id: self.record_id.clone(),
        }
    }

    fn transition(&mut self, next: SyncStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidInput(format!(
                "Illegal sync transition for {}: {} -> {}",
                self.key(),
                self.status.as_str(),
                next.as_str()
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Replace the payload with a newer local write and return to PENDING.
    ///
    /// Retry bookkeeping starts over because this is a different payload.
    pub fn replace_payload(&mut self, operation: OperationType, data: Value) -> Result<()> {
        if self.status == SyncStatus::Syncing {
            return Err(Error::Conflict(format!("{} is being pushed", self.key())));
        }
        if self.status != SyncStatus::Pending {
            self.transition(SyncStatus::Pending)?;
        }
        self.checksum = checksum(&data);
        self.operation = operation;
        self.data = data;
        self.timestamp = Utc::now();
        self.retry_count = 0;
        self.error_message = None;
        Ok(())
    }

    /// Mark as picked up by a push.
    pub fn mark_syncing(&mut self) -> Result<()> {
        self.transition(SyncStatus::Syncing)
    }

    /// Mark as accepted by the remote at `sync_version`.
    pub fn mark_completed(&mut self, sync_version: u64) -> Result<()> {
        self.transition(SyncStatus::Completed)?;
        self.sync_version = sync_version;
        self.error_message = None;
        Ok(())
    }

    /// Record a transient failure.
    ///
    /// Returns to PENDING while `retry_count < max_retries`, FAILED otherwise.
    pub fn mark_retry(&mut self, error: impl Into<String>, max_retries: u32) -> Result<SyncStatus> {
        self.retry_count += 1;
        self.error_message = Some(error.into());
        let next = if self.retry_count < max_retries {
            SyncStatus::Pending
        } else {
            SyncStatus::Failed
        };
        self.transition(next)?;
        Ok(next)
    }

    /// Mark as permanently failed.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<()> {
        self.error_message = Some(error.into());
        self.transition(SyncStatus::Failed)
    }

    /// Mark as conflicted with an explanation.
    pub fn mark_conflict(&mut self, reason: impl Into<String>) -> Result<()> {
        self.error_message = Some(reason.into());
        self.transition(SyncStatus::Conflict)
    }

    /// Close a conflict with the resolved payload now stored remotely at `sync_version`.
    pub fn mark_resolved(&mut self, operation: OperationType, data: Value, sync_version: u64) -> Result<()> {
        if self.status != SyncStatus::Conflict {
            return Err(Error::InvalidInput(format!("{} is not in conflict", self.key())));
        }
        self.transition(SyncStatus::Completed)?;
        self.checksum = checksum(&data);
        self.operation = operation;
        self.data = data;
        self.sync_version = sync_version;
        self.error_message = None;
        Ok(())
    }

    /// Take over a newer remote version pulled from another device.
    ///
    /// Only settled records (COMPLETED or FAILED) may adopt; the status is kept.
    pub fn adopt(&mut self, operation: OperationType, data: Value, sync_version: u64) -> Result<()> {
        if !matches!(self.status, SyncStatus::Completed | SyncStatus::Failed) {
            return Err(Error::Conflict(format!(
                "{} has unsynced local changes",
                self.key()
            )));
        }
        self.checksum = checksum(&data);
        self.operation = operation;
        self.data = data;
        self.sync_version = sync_version;
        Ok(())
    }

    /// Return an interrupted push to PENDING.
    pub fn revert_interrupted(&mut self) -> Result<()> {
        if self.status != SyncStatus::Syncing {
            return Ok(());
        }
        self.transition(SyncStatus::Pending)
    }
}

/// One queued unit of outbound sync work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    pub id: String,
    pub table_name: String,
    pub record_id: String,
    pub operation_type: OperationType,
    pub payload: Value,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub device_id: String,
    pub user_id: String,
    pub size_bytes: u64,
}

impl SyncOperation {
    /// Create an operation that is ready immediately.
    pub fn new(
        key: &RecordKey,
        operation_type: OperationType,
        payload: Value,
        priority: Priority,
        user_id: impl Into<String>,
        device_id: impl Into<String>,
        max_retries: u32,
    ) -> Self {
        let now = Utc::now();
        let size_bytes = serde_json::to_vec(&payload).map(|b| b.len() as u64).unwrap_or(0);
        Self {
            id: Uuid::new_v4().to_string(),
            table_name: key.table_name.clone(),
            record_id: key.record_id.clone(),
            operation_type,
            payload,
            priority,
            created_at: now,
            scheduled_at: now,
            retry_count: 0,
            max_retries,
            device_id: device_id.into(),
            user_id: user_id.into(),
            size_bytes,
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            table_name: self.table_name.clone(),
            record_id: self.record_id.clone(),
        }
    }

    /// Whether the backoff gate has opened.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at <= now
    }
}

/// A registered device of a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: String,
    pub user_id: String,
    pub device_type: DeviceType,
    pub device_name: String,
    pub capabilities: Vec<String>,
    pub last_sync: Option<DateTime<Utc>>,
    pub sync_version: u64,
    pub is_active: bool,
    pub connection_state: ConnectionState,
}

impl DeviceInfo {
    /// Create an active, online device that has never synced.
    pub fn new(
        device_id: impl Into<String>,
        user_id: impl Into<String>,
        device_type: DeviceType,
        device_name: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            user_id: user_id.into(),
            device_type,
            device_name: device_name.into(),
            capabilities: Vec::new(),
            last_sync: None,
            sync_version: 0,
            is_active: true,
            connection_state: ConnectionState::Online,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// Append-only trail of detected conflicts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictAudit {
    pub id: String,
    pub table_name: String,
    pub record_id: String,
    pub local_version: u64,
    pub remote_version: u64,
    pub strategy: ConflictStrategy,
    /// `None` while the conflict is unresolved.
    pub resolved_data: Option<Value>,
    pub resolver_device_id: String,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ConflictAudit {
    pub fn new(
        key: &RecordKey,
        local_version: u64,
        remote_version: u64,
        strategy: ConflictStrategy,
        resolver_device_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            table_name: key.table_name.clone(),
            record_id: key.record_id.clone(),
            local_version,
            remote_version,
            strategy,
            resolved_data: None,
            resolver_device_id: resolver_device_id.into(),
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    /// Attach the resolution outcome.
    pub fn resolved(mut self, data: Value) -> Self {
        self.resolved_data = Some(data);
        self.resolved_at = Some(Utc::now());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn key() -> RecordKey {
        RecordKey::new("preferences", "theme").unwrap()
    }

    #[test]
    fn test_checksum_ignores_envelope_and_key_order() {
        let a = json!({"value": "dark", "scope": "global", "_sync": {"timestamp": "2024-01-01T00:00:00Z"}});
        let b = json!({"scope": "global", "value": "dark", "_sync": {"timestamp": "2025-06-01T00:00:00Z"}});
        assert_eq!(checksum(&a), checksum(&b));
        assert_ne!(checksum(&a), checksum(&json!({"value": "light", "scope": "global"})));
        assert_eq!(checksum(&a).len(), 64);
    }

    #[test]
    fn test_record_happy_path() {
        let mut record = SyncRecord::new(&key(), OperationType::Update, json!({"value": "dark"}), "u1", "d1", 1);
        assert_eq!(record.status, SyncStatus::Pending);

        record.mark_syncing().unwrap();
        record.mark_completed(2).unwrap();
        assert_eq!(record.status, SyncStatus::Completed);
        assert_eq!(record.sync_version, 2);
    }

    #[test]
    fn test_record_retry_until_failed() {
        let mut record = SyncRecord::new(&key(), OperationType::Update, json!({}), "u1", "d1", 1);

        for attempt in 1..=3 {
            record.mark_syncing().unwrap();
            let next = record.mark_retry("timeout", 3).unwrap();
            assert_eq!(record.retry_count, attempt);
            if attempt < 3 {
                assert_eq!(next, SyncStatus::Pending);
            } else {
                assert_eq!(next, SyncStatus::Failed);
            }
        }
        assert_eq!(record.error_message.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut record = SyncRecord::new(&key(), OperationType::Update, json!({}), "u1", "d1", 1);
        assert!(record.mark_completed(2).is_err());
        assert_eq!(record.status, SyncStatus::Pending);
    }

    #[test]
    fn test_replace_payload_resets_retries() {
        let mut record = SyncRecord::new(&key(), OperationType::Update, json!({"value": "dark"}), "u1", "d1", 1);
        record.mark_syncing().unwrap();
        record.mark_retry("timeout", 3).unwrap();

        record.replace_payload(OperationType::Update, json!({"value": "light"})).unwrap();
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.status, SyncStatus::Pending);
        assert_eq!(record.checksum, checksum(&json!({"value": "light"})));

        record.mark_syncing().unwrap();
        assert!(record.replace_payload(OperationType::Update, json!({})).is_err());
    }

    #[test]
    fn test_conflict_resolution_path() {
        let mut record = SyncRecord::new(&key(), OperationType::Update, json!({"value": "light"}), "u1", "d2", 1);
        record.mark_syncing().unwrap();
        assert!(record.mark_resolved(OperationType::Upsert, json!({}), 3).is_err());

        record.mark_conflict("remote v2 ahead of v1").unwrap();
        record
            .mark_resolved(OperationType::Upsert, json!({"value": "dark"}), 3)
            .unwrap();
        assert_eq!(record.status, SyncStatus::Completed);
        assert_eq!(record.sync_version, 3);
        assert_eq!(record.checksum, checksum(&json!({"value": "dark"})));
        assert!(record.error_message.is_none());
    }

    #[test]
    fn test_adopt_only_when_settled() {
        let mut record = SyncRecord::new(&key(), OperationType::Update, json!({"value": "light"}), "u1", "d1", 1);
        assert!(record.adopt(OperationType::Upsert, json!({"value": "dark"}), 4).is_err());

        record.mark_syncing().unwrap();
        record.revert_interrupted().unwrap();
        assert_eq!(record.status, SyncStatus::Pending);

        record.mark_syncing().unwrap();
        record.mark_completed(2).unwrap();
        record.adopt(OperationType::Upsert, json!({"value": "dark"}), 4).unwrap();
        assert_eq!(record.sync_version, 4);
        assert_eq!(record.status, SyncStatus::Completed);
    }

    #[test]
    fn test_operation_readiness() {
        let mut op = SyncOperation::new(&key(), OperationType::Update, json!({"value": "dark"}), Priority::High, "u1", "d1", 3);
        assert!(op.is_ready(Utc::now()));
        op.scheduled_at = Utc::now() + chrono::Duration::seconds(30);
        assert!(!op.is_ready(Utc::now()));
        assert!(op.size_bytes > 0);
    }

    #[test]
    fn test_record_serialization_uses_camel_case() {
        let record = SyncRecord::new(&key(), OperationType::Create, json!({"value": 1}), "u1", "d1", 1);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["tableName"], "preferences");
        assert_eq!(json["status"], "PENDING");
        assert_eq!(json["syncVersion"], 1);
    }

    proptest! {
        #[test]
        fn prop_checksum_ignores_envelope(
            fields in proptest::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..8),
            stamp in "[0-9:TZ-]{0,24}",
        ) {
            let plain: serde_json::Map<String, Value> =
                fields.into_iter().map(|(k, v)| (k, json!(v))).collect();
            let mut wrapped = plain.clone();
            wrapped.insert(SYNC_ENVELOPE_KEY.to_string(), json!({"timestamp": stamp}));

            prop_assert_eq!(
                checksum(&Value::Object(plain)),
                checksum(&Value::Object(wrapped))
            );
        }
    }
}
