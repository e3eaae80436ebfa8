//! In-memory stores for testing and demos.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use buddy_common::{
    ConflictAudit, DeviceInfo, Error, RecordKey, Result, SyncOperation, SyncRecord, SyncStatus,
};

use crate::provider::{LocalStore, PushAck, RemoteRecord, RemoteStore, StoredRecord};

/// In-memory local store.
///
/// All data is lost on drop.
#[derive(Default)]
pub struct MemoryLocalStore {
    records: RwLock<HashMap<RecordKey, StoredRecord>>,
    sync_log: RwLock<HashMap<String, SyncRecord>>,
    devices: RwLock<HashMap<String, DeviceInfo>>,
    audits: RwLock<Vec<ConflictAudit>>,
    queue: RwLock<HashMap<String, SyncOperation>>,
}

impl MemoryLocalStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get_record(&self, key: &RecordKey) -> Result<Option<StoredRecord>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn upsert_record(&self, key: &RecordKey, data: &Value, sync_version: u64) -> Result<()> {
        let record = StoredRecord {
            data: data.clone(),
            sync_version,
            updated_at: Utc::now(),
        };
        self.records.write().await.insert(key.clone(), record);
        Ok(())
    }

    async fn delete_record(&self, key: &RecordKey) -> Result<()> {
        self.records.write().await.remove(key);
        Ok(())
    }

    async fn append_sync_log(&self, record: &SyncRecord) -> Result<()> {
        self.sync_log
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn update_sync_log(&self, record: &SyncRecord) -> Result<()> {
        let mut log = self.sync_log.write().await;
        match log.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("Sync record not found: {}", record.id))),
        }
    }

    async fn get_sync_record(&self, key: &RecordKey) -> Result<Option<SyncRecord>> {
        let log = self.sync_log.read().await;
        Ok(log
            .values()
            .filter(|r| r.table_name == key.table_name && r.record_id == key.record_id)
            .max_by_key(|r| r.timestamp)
            .cloned())
    }

    async fn list_pending(&self, table: Option<&str>) -> Result<Vec<SyncRecord>> {
        let log = self.sync_log.read().await;
        let mut pending: Vec<SyncRecord> = log
            .values()
            .filter(|r| r.status.is_in_flight())
            .filter(|r| table.is_none_or(|t| r.table_name == t))
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.timestamp);
        Ok(pending)
    }

    async fn list_sync_log(&self, status: Option<SyncStatus>) -> Result<Vec<SyncRecord>> {
        let log = self.sync_log.read().await;
        let mut records: Vec<SyncRecord> = log
            .values()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }

    async fn persist_device_info(&self, info: &DeviceInfo) -> Result<()> {
        self.devices
            .write()
            .await
            .insert(info.device_id.clone(), info.clone());
        Ok(())
    }

    async fn load_devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self.devices.read().await.values().cloned().collect())
    }

    async fn append_conflict_audit(&self, audit: &ConflictAudit) -> Result<()> {
        self.audits.write().await.push(audit.clone());
        Ok(())
    }

    async fn list_conflict_audits(&self, key: Option<&RecordKey>) -> Result<Vec<ConflictAudit>> {
        let audits = self.audits.read().await;
        Ok(audits
            .iter()
            .filter(|a| key.is_none_or(|k| a.table_name == k.table_name && a.record_id == k.record_id))
            .cloned()
            .collect())
    }

    async fn save_queued_operation(&self, op: &SyncOperation) -> Result<()> {
        self.queue.write().await.insert(op.id.clone(), op.clone());
        Ok(())
    }

    async fn remove_queued_operation(&self, op_id: &str) -> Result<()> {
        self.queue.write().await.remove(op_id);
        Ok(())
    }

    async fn load_queued_operations(&self) -> Result<Vec<SyncOperation>> {
        let queue = self.queue.read().await;
        let mut ops: Vec<SyncOperation> = queue.values().cloned().collect();
        ops.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(ops)
    }
}

/// In-memory remote store shared by several simulated devices.
///
/// Supports switching reachability, injecting a number of network failures,
/// simulated latency and corrupted acknowledgements.
pub struct MemoryRemoteStore {
    records: RwLock<HashMap<RecordKey, RemoteRecord>>,
    devices: RwLock<HashMap<String, DeviceInfo>>,
    reachable: AtomicBool,
    failures_remaining: AtomicU32,
    corrupt_next_ack: AtomicBool,
    latency_ms: AtomicU64,
    writes_applied: AtomicU64,
}

impl MemoryRemoteStore {
    /// Create a new empty, reachable store.
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            devices: RwLock::new(HashMap::new()),
            reachable: AtomicBool::new(true),
            failures_remaining: AtomicU32::new(0),
            corrupt_next_ack: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
            writes_applied: AtomicU64::new(0),
        }
    }

    /// Toggle reachability. Unreachable stores fail every call.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Fail the next `count` calls with a network error.
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Report a wrong checksum in the next write acknowledgement.
    pub fn corrupt_next_ack(&self) {
        self.corrupt_next_ack.store(true, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of writes that changed stored state.
    pub fn writes_applied(&self) -> u64 {
        self.writes_applied.load(Ordering::SeqCst)
    }

    /// Current stored version of a record, bypassing failure injection.
    pub async fn snapshot(&self, key: &RecordKey) -> Option<RemoteRecord> {
        self.records.read().await.get(key).cloned()
    }

    /// Registered devices, bypassing failure injection.
    pub async fn devices(&self) -> Vec<DeviceInfo> {
        self.devices.read().await.values().cloned().collect()
    }

    async fn gate(&self) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(Error::Network("Remote store unreachable".to_string()));
        }
        let injected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::Network("Injected network failure".to_string()));
        }
        Ok(())
    }

    async fn store(&self, record: RemoteRecord) -> Result<PushAck> {
        let key = record.key();
        let mut records = self.records.write().await;

        if let Some(existing) = records.get(&key) {
            if existing.sync_version == record.sync_version && existing.checksum == record.checksum {
                debug!("Duplicate push of {} at v{}", key, record.sync_version);
                return Ok(PushAck {
                    sync_version: existing.sync_version,
                    checksum: existing.checksum.clone(),
                    applied: false,
                });
            }
            if existing.sync_version >= record.sync_version {
                return Err(Error::Conflict(format!(
                    "{} is at v{}, rejected v{}",
                    key, existing.sync_version, record.sync_version
                )));
            }
        }

        let mut checksum = record.checksum.clone();
        if self.corrupt_next_ack.swap(false, Ordering::SeqCst) {
            checksum = format!("corrupt-{}", checksum);
        }
        let ack = PushAck {
            sync_version: record.sync_version,
            checksum,
            applied: true,
        };
        records.insert(key, record);
        self.writes_applied.fetch_add(1, Ordering::SeqCst);
        Ok(ack)
    }
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn ping(&self) -> bool {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        self.reachable.load(Ordering::SeqCst)
    }

    async fn get_record(&self, key: &RecordKey) -> Result<Option<RemoteRecord>> {
        self.gate().await?;
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn upsert_record(&self, record: RemoteRecord) -> Result<PushAck> {
        self.gate().await?;
        self.store(record).await
    }

    async fn delete_record(&self, key: &RecordKey, sync_version: u64, device_id: &str) -> Result<PushAck> {
        self.gate().await?;
        self.store(RemoteRecord::tombstone(key, sync_version, device_id))
            .await
    }

    async fn get_changes_since(
        &self,
        device_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteRecord>> {
        self.gate().await?;
        let records = self.records.read().await;
        let mut changes: Vec<RemoteRecord> = records
            .values()
            .filter(|r| r.device_id != device_id)
            .filter(|r| since.is_none_or(|s| r.changed_at > s))
            .cloned()
            .collect();
        changes.sort_by_key(|r| r.changed_at);
        Ok(changes)
    }

    async fn register_device(&self, info: &DeviceInfo) -> Result<()> {
        self.gate().await?;
        self.devices
            .write()
            .await
            .insert(info.device_id.clone(), info.clone());
        Ok(())
    }
}
