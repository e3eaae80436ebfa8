//! Core sync engine.
//!
//! Owns the sync log and the [`SyncRecord`] state machine: records tracked
//! changes, pushes them to the remote store, resolves version conflicts and pulls
//! what other devices wrote.
//!
//! Locking: the state lock may be held across local store calls but never across
//! remote calls. A record is claimed for a push by moving it to SYNCING, so a
//! full sync and a scheduler batch never push the same record at once.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use buddy_common::{
    ConflictAudit, ConflictStrategy, DeviceInfo, Error, OperationType, RecordKey, Result,
    SyncOperation, SyncRecord, SyncStatus,
};
use buddy_storage::{LocalStore, RemoteRecord, RemoteStore};

use crate::config::{EngineConfig, SyncConfig};
use crate::conflict::{ConflictResolver, ResolutionResult, Winner};
use crate::events::{EventBus, SyncEvent};
use crate::registry::DeviceRegistry;
use crate::retry::{RetryConfig, RetryExecutor};
use crate::state::{SyncState, SyncStatusReport};

/// What `track_change` did with a change.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeDisposition {
    /// The record is PENDING with this payload.
    Recorded(SyncRecord),
    /// The record is being pushed; the payload is applied once the push settles.
    Staged,
    /// Same payload as the current record.
    Unchanged,
    /// Permanently invalid; the record is FAILED.
    Rejected { reason: String },
}

/// Result of one push attempt for one record.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    Completed { sync_version: u64 },
    /// Remote was ahead. `resolved` is false when the record stays in CONFLICT.
    Conflict { resolved: bool },
    /// Transient failure; the record is PENDING again.
    Retry { error: String },
    /// The record is FAILED.
    Failed { error: String },
    /// Another path is pushing this record.
    InFlight,
    /// No record for this key.
    Missing,
}

/// User choice for a conflict left open.
#[derive(Debug, Clone, PartialEq)]
pub enum ManualResolution {
    KeepLocal,
    KeepRemote,
    Custom(Value),
}

/// Summary of a sync pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncResult {
    pub records_pushed: usize,
    pub records_retried: usize,
    pub records_failed: usize,
    pub conflicts_found: usize,
    pub records_pulled: usize,
    pub duration: Duration,
}

impl SyncResult {
    pub fn record(&mut self, outcome: &PushOutcome) {
        match outcome {
            PushOutcome::Completed { .. } => self.records_pushed += 1,
            PushOutcome::Conflict { .. } => self.conflicts_found += 1,
            PushOutcome::Retry { .. } => self.records_retried += 1,
            PushOutcome::Failed { .. } => self.records_failed += 1,
            PushOutcome::InFlight | PushOutcome::Missing => {}
        }
    }
}

enum PushStep {
    Accepted { sync_version: u64 },
    Diverged(RemoteRecord),
}

/// Main sync engine for one device.
pub struct SyncEngine {
    device_id: String,
    user_id: String,
    config: EngineConfig,
    max_retries: u32,
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    registry: DeviceRegistry,
    resolver: ConflictResolver,
    transport: RetryExecutor,
    state: RwLock<SyncState>,
    /// Held for the duration of `sync_changes`.
    sync_lock: Mutex<()>,
    online: AtomicBool,
    events: EventBus,
    tasks: TaskTracker,
}

impl SyncEngine {
    /// Create an engine, reload persisted state and probe connectivity.
    pub async fn new(
        config: &SyncConfig,
        device_id: impl Into<String>,
        user_id: impl Into<String>,
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        events: EventBus,
    ) -> Result<Arc<Self>> {
        let transport = RetryExecutor::new(
            RetryConfig::new(config.engine.transport_retries)
                .with_initial_delay(config.engine.transport_retry_delay)
                .with_max_delay(config.retry.max_delay),
        );

        let engine = Self {
            device_id: device_id.into(),
            user_id: user_id.into(),
            config: config.engine.clone(),
            max_retries: config.retry.max_retries,
            registry: DeviceRegistry::new(local.clone()),
            local,
            remote,
            resolver: ConflictResolver::from_config(&config.engine),
            transport,
            state: RwLock::new(SyncState::new()),
            sync_lock: Mutex::new(()),
            online: AtomicBool::new(false),
            events,
            tasks: TaskTracker::new(),
        };

        let restored = engine.restore().await?;
        let online = engine.remote.ping().await;
        engine.online.store(online, Ordering::SeqCst);
        info!(
            "Sync engine ready for device {} ({} records restored, {})",
            engine.device_id,
            restored,
            if online { "online" } else { "offline" }
        );

        Ok(Arc::new(engine))
    }

    /// Reload devices and the sync log. Interrupted pushes return to PENDING.
    async fn restore(&self) -> Result<usize> {
        self.registry.restore().await?;
        let last_sync = self
            .registry
            .device(&self.device_id)
            .await
            .and_then(|d| d.last_sync);

        let mut records = self.local.list_sync_log(None).await?;
        records.sort_by_key(|r| r.timestamp);
        let count = records.len();

        let mut state = self.state.write().await;
        for mut record in records {
            if record.status == SyncStatus::Syncing {
                record.revert_interrupted()?;
                self.local.update_sync_log(&record).await?;
                debug!("Reverted interrupted push of {}", record.key());
            }
            state.upsert(record);
        }
        state.last_sync = last_sync;
        Ok(count)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn local(&self) -> &Arc<dyn LocalStore> {
        &self.local
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Update connectivity. Presence changes are mirrored and published.
    pub async fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::SeqCst);
        if was == online {
            return;
        }
        info!(
            "Device {} is now {}",
            self.device_id,
            if online { "online" } else { "offline" }
        );
        if let Err(e) = self.registry.set_online(&self.device_id, online).await {
            debug!("Presence not recorded: {}", e);
        }
        self.events.publish(SyncEvent::DeviceStatusChanged {
            device_id: self.device_id.clone(),
            online,
        });
    }

    /// Ping the remote and update connectivity.
    pub async fn check_connectivity(&self) -> bool {
        let reachable = self.remote.ping().await;
        self.set_online(reachable).await;
        reachable
    }

    /// Register a device locally and, when online, remotely.
    pub async fn register_device(&self, info: DeviceInfo) -> Result<()> {
        self.registry.register(info.clone()).await?;

        if self.is_online() {
            if let Err(e) = self
                .transport
                .execute(|| self.remote.register_device(&info))
                .await
            {
                warn!("Could not mirror device {} remotely: {}", info.device_id, e);
            }
        }

        info!(
            "Device {} ({}) registered for user {}",
            info.device_id, info.device_type, info.user_id
        );
        self.events.publish(SyncEvent::DeviceConnected {
            device_id: info.device_id,
            user_id: info.user_id,
            device_type: info.device_type,
        });
        Ok(())
    }

    /// Record a local mutation.
    ///
    /// Repeated changes to the same record coalesce into one PENDING record
    /// carrying the latest payload.
    pub async fn track_change(
        self: &Arc<Self>,
        key: &RecordKey,
        operation: OperationType,
        data: Value,
        user_id: &str,
        device_id: &str,
    ) -> Result<ChangeDisposition> {
        let malformed = operation.carries_payload() && !data.is_object();
        let incoming = buddy_common::checksum(&data);
        let stored_version = self.local.get_record(key).await?.map(|r| r.sync_version);

        let mut state = self.state.write().await;

        let current = state.get(key).map(|r| (r.status, r.checksum.clone(), r.operation, r.sync_version));
        let (disposition, local_version) = match current {
            Some((SyncStatus::Syncing, _, _, version)) => {
                if malformed {
                    return Ok(ChangeDisposition::Rejected {
                        reason: format!("{} payload must be a JSON object", operation),
                    });
                }
                state.stage(key.clone(), operation, data.clone());
                debug!("Staged change to {} behind an in-flight push", key);
                (ChangeDisposition::Staged, version)
            }
            Some((status, checksum, op, _))
                if checksum == incoming
                    && op == operation
                    && matches!(status, SyncStatus::Pending | SyncStatus::Completed) =>
            {
                debug!("Change to {} is identical to the current record", key);
                return Ok(ChangeDisposition::Unchanged);
            }
            Some(_) => {
                let Some(record) = state.get_mut(key) else {
                    return Err(Error::NotFound(key.to_string()));
                };
                record.replace_payload(operation, data.clone())?;
                record.user_id = user_id.to_string();
                record.device_id = device_id.to_string();
                let disposition = Self::validate(record, malformed)?;
                self.local.update_sync_log(record).await?;
                (disposition, record.sync_version)
            }
            None => {
                let version = stored_version.unwrap_or(1);
                let mut record =
                    SyncRecord::new(key, operation, data.clone(), user_id, device_id, version);
                let disposition = Self::validate(&mut record, malformed)?;
                self.local.append_sync_log(&record).await?;
                state.upsert(record);
                (disposition, version)
            }
        };
        drop(state);

        if matches!(disposition, ChangeDisposition::Rejected { .. }) {
            return Ok(disposition);
        }

        self.write_local(key, operation, &data, local_version).await?;
        debug!("Tracked {} {} at v{}", operation, key, local_version);

        if matches!(disposition, ChangeDisposition::Recorded(_))
            && self.config.immediate_sync
            && self.config.is_priority_table(key.table())
            && self.is_online()
        {
            self.spawn_sync(key.clone());
        }

        Ok(disposition)
    }

    fn validate(record: &mut SyncRecord, malformed: bool) -> Result<ChangeDisposition> {
        if malformed {
            let reason = format!("{} payload must be a JSON object", record.operation);
            record.mark_failed(reason.clone())?;
            warn!("Rejected change to {}: {}", record.key(), reason);
            return Ok(ChangeDisposition::Rejected { reason });
        }
        Ok(ChangeDisposition::Recorded(record.clone()))
    }

    /// Run a sync pass for one record in the background.
    ///
    /// Other PENDING records are left to the scheduler, which applies its
    /// strategy and backoff to them.
    pub fn spawn_sync(self: &Arc<Self>, key: RecordKey) {
        let engine = self.clone();
        self.tasks.spawn(async move {
            if let Err(e) = engine.sync_pass(false, Some(&key)).await {
                warn!("Immediate sync of {} failed: {}", key, e);
            }
        });
    }

    /// Push every PENDING record, then pull remote changes.
    ///
    /// Skipped when offline, or when another pass is running unless `force` is set,
    /// in which case it waits for that pass.
    pub async fn sync_changes(&self, force: bool) -> Result<SyncResult> {
        self.sync_pass(force, None).await
    }

    async fn sync_pass(&self, force: bool, only: Option<&RecordKey>) -> Result<SyncResult> {
        if !self.is_online() {
            debug!("Offline, sync skipped");
            return Ok(SyncResult::default());
        }

        let _guard = if force {
            self.sync_lock.lock().await
        } else {
            match self.sync_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    debug!("Sync already running");
                    return Ok(SyncResult::default());
                }
            }
        };

        let start = Instant::now();
        info!("Starting sync for device {}", self.device_id);
        let pending = {
            let mut state = self.state.write().await;
            state.sync_in_progress = true;
            let mut keys = state.keys_with_status(SyncStatus::Pending);
            if let Some(only) = only {
                keys.retain(|k| k == only);
            }
            keys
        };

        let mut result = SyncResult::default();
        for key in pending {
            let outcome = self.push_record(&key, self.max_retries).await;
            result.record(&outcome);
        }

        match self.pull_remote_changes().await {
            Ok(pulled) => result.records_pulled = pulled,
            Err(e) => warn!("Pull failed: {}", e),
        }

        self.state.write().await.sync_in_progress = false;
        result.duration = start.elapsed();
        info!(
            "Sync completed: {} pushed, {} retried, {} failed, {} conflicts, {} pulled",
            result.records_pushed,
            result.records_retried,
            result.records_failed,
            result.conflicts_found,
            result.records_pulled
        );
        Ok(result)
    }

    /// Push the records behind a batch of queued operations.
    ///
    /// The push always uses the record's latest payload. Per-operation failures are
    /// reported in the outcomes; the call itself only fails when offline.
    pub async fn apply_batch(&self, ops: &[SyncOperation]) -> Result<Vec<(String, PushOutcome)>> {
        if !self.is_online() {
            return Err(Error::Network("Device is offline".to_string()));
        }

        let mut outcomes = Vec::with_capacity(ops.len());
        for op in ops {
            let outcome = self.push_record(&op.key(), op.max_retries).await;
            debug!("Operation {} on {}: {:?}", op.id, op.key(), outcome);
            outcomes.push((op.id.clone(), outcome));
        }
        Ok(outcomes)
    }

    /// Push one record if it is PENDING.
    pub async fn push_record(&self, key: &RecordKey, max_retries: u32) -> PushOutcome {
        let record = {
            let mut state = self.state.write().await;
            let Some(record) = state.get_mut(key) else {
                return PushOutcome::Missing;
            };
            match record.status {
                SyncStatus::Pending => {}
                SyncStatus::Syncing => return PushOutcome::InFlight,
                SyncStatus::Completed => {
                    return PushOutcome::Completed {
                        sync_version: record.sync_version,
                    }
                }
                SyncStatus::Failed => {
                    return PushOutcome::Failed {
                        error: record.error_message.clone().unwrap_or_default(),
                    }
                }
                SyncStatus::Conflict => return PushOutcome::Conflict { resolved: false },
            }
            if let Err(e) = record.mark_syncing() {
                return PushOutcome::Failed {
                    error: e.to_string(),
                };
            }
            let snapshot = record.clone();
            if let Err(e) = self.local.update_sync_log(&snapshot).await {
                warn!("Could not persist push of {}: {}", key, e);
            }
            snapshot
        };

        match self.attempt_push(&record).await {
            Ok(PushStep::Accepted { sync_version }) => self.complete(key, sync_version).await,
            Ok(PushStep::Diverged(remote)) => self.handle_conflict(&record, remote, max_retries).await,
            Err(e) => self.fail_attempt(key, e, max_retries).await,
        }
    }

    async fn attempt_push(&self, record: &SyncRecord) -> Result<PushStep> {
        let key = record.key();
        let remote = self
            .transport
            .execute(|| self.remote.get_record(&key))
            .await?;

        if let Some(remote) = remote {
            if remote.sync_version > record.sync_version {
                // Our own earlier write whose acknowledgement was lost.
                if remote.device_id == self.device_id
                    && remote.checksum == record.checksum
                    && remote.deleted != record.operation.carries_payload()
                {
                    return Ok(PushStep::Accepted {
                        sync_version: remote.sync_version,
                    });
                }
                return Ok(PushStep::Diverged(remote));
            }
        }

        let version = record.sync_version + 1;
        match self
            .write_remote(&key, record.operation, &record.data, version)
            .await
        {
            Ok(sync_version) => Ok(PushStep::Accepted { sync_version }),
            Err(Error::Conflict(reason)) => {
                debug!("Remote moved during push of {}: {}", key, reason);
                match self.transport.execute(|| self.remote.get_record(&key)).await? {
                    Some(remote) if remote.sync_version > record.sync_version => {
                        Ok(PushStep::Diverged(remote))
                    }
                    _ => Err(Error::Network(reason)),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Write a version to the remote store and verify the acknowledgement.
    async fn write_remote(
        &self,
        key: &RecordKey,
        operation: OperationType,
        data: &Value,
        sync_version: u64,
    ) -> Result<u64> {
        if !operation.carries_payload() {
            let ack = self
                .transport
                .execute(|| self.remote.delete_record(key, sync_version, &self.device_id))
                .await?;
            return Ok(ack.sync_version);
        }

        let record = RemoteRecord::upsert(key, data.clone(), sync_version, &self.device_id);
        let expected = record.checksum.clone();
        let ack = self
            .transport
            .execute(|| self.remote.upsert_record(record.clone()))
            .await?;

        if ack.checksum != expected {
            return Err(Error::Network(format!(
                "Checksum mismatch in acknowledgement for {} v{}",
                key, sync_version
            )));
        }
        if !ack.applied {
            debug!("{} v{} was already stored remotely", key, sync_version);
        }
        Ok(ack.sync_version)
    }

    async fn write_local(
        &self,
        key: &RecordKey,
        operation: OperationType,
        data: &Value,
        sync_version: u64,
    ) -> Result<()> {
        if operation.carries_payload() && !data.is_null() {
            self.local.upsert_record(key, data, sync_version).await
        } else {
            self.local.delete_record(key).await
        }
    }

    async fn complete(&self, key: &RecordKey, sync_version: u64) -> PushOutcome {
        let mut state = self.state.write().await;
        let Some(record) = state.get_mut(key) else {
            return PushOutcome::Missing;
        };
        if let Err(e) = record.mark_completed(sync_version) {
            error!("Could not complete {}: {}", key, e);
            return PushOutcome::Failed {
                error: e.to_string(),
            };
        }
        info!("Pushed {} at v{}", key, sync_version);

        let settled = self.settle(&mut state, key).await;
        if let Some(record) = settled {
            if let Err(e) = self
                .write_local(key, record.operation, &record.data, sync_version)
                .await
            {
                warn!("Could not update local row {}: {}", key, e);
            }
        }
        PushOutcome::Completed { sync_version }
    }

    async fn fail_attempt(&self, key: &RecordKey, err: Error, max_retries: u32) -> PushOutcome {
        let mut state = self.state.write().await;
        let Some(record) = state.get_mut(key) else {
            return PushOutcome::Missing;
        };
        let error = err.to_string();

        let outcome = if err.is_transient() {
            match record.mark_retry(error.clone(), max_retries) {
                Ok(SyncStatus::Pending) => {
                    warn!(
                        "Push of {} failed (attempt {}/{}): {}",
                        key, record.retry_count, max_retries, error
                    );
                    PushOutcome::Retry { error }
                }
                Ok(_) => {
                    error!(
                        "Push of {} failed permanently after {} attempts: {}",
                        key, record.retry_count, error
                    );
                    PushOutcome::Failed { error }
                }
                Err(e) => PushOutcome::Failed {
                    error: e.to_string(),
                },
            }
        } else {
            if let Err(e) = record.mark_failed(error.clone()) {
                warn!("Could not mark {} failed: {}", key, e);
            }
            error!("Push of {} rejected: {}", key, error);
            PushOutcome::Failed { error }
        };

        self.settle(&mut state, key).await;
        outcome
    }

    /// Apply a payload staged during the push and persist the record.
    async fn settle(&self, state: &mut SyncState, key: &RecordKey) -> Option<SyncRecord> {
        let staged = state.take_staged(key);
        let record = state.get_mut(key)?;
        if let Some((operation, data)) = staged {
            match record.replace_payload(operation, data) {
                Ok(()) => debug!("Applied staged change to {}", key),
                Err(e) => warn!("Dropped staged change to {}: {}", key, e),
            }
        }
        if let Err(e) = self.local.update_sync_log(record).await {
            warn!("Could not persist {}: {}", key, e);
        }
        Some(record.clone())
    }

    /// Resolve a version conflict with the table's strategy.
    ///
    /// A resolved payload is pushed at `remote + 1` and applied locally. MANUAL
    /// strategies and resolver errors leave the record in CONFLICT.
    async fn handle_conflict(
        &self,
        local: &SyncRecord,
        remote: RemoteRecord,
        max_retries: u32,
    ) -> PushOutcome {
        let key = local.key();
        let strategy = self.resolver.strategy_for(key.table());
        let reason = format!(
            "Remote v{} ahead of local v{}",
            remote.sync_version, local.sync_version
        );
        warn!("Conflict on {}: {} ({})", key, reason, strategy);

        let audit = ConflictAudit::new(
            &key,
            local.sync_version,
            remote.sync_version,
            strategy,
            &self.device_id,
        );
        let remote_data = if remote.deleted {
            Value::Null
        } else {
            remote.data.clone()
        };

        let resolution = match self.resolver.resolve(key.table(), &local.data, &remote_data) {
            Ok(ResolutionResult::Resolved(resolution)) => Some(resolution),
            Ok(ResolutionResult::Pending) => None,
            Err(e) => {
                warn!("Resolver failed for {}: {}", key, e);
                None
            }
        };

        let Some(resolution) = resolution else {
            self.append_audit(&audit).await;
            self.leave_in_conflict(&key, reason).await;
            self.events.publish(SyncEvent::ConflictResolved {
                key,
                strategy,
                winner: None,
            });
            return PushOutcome::Conflict { resolved: false };
        };

        let operation = resolved_operation(&resolution.data);
        let version = remote.sync_version + 1;
        let pushed = self
            .write_remote(&key, operation, &resolution.data, version)
            .await;

        let sync_version = match pushed {
            Ok(v) => v,
            Err(e) => {
                self.append_audit(&audit).await;
                return self.fail_attempt(&key, e, max_retries).await;
            }
        };

        {
            let mut state = self.state.write().await;
            if let Some(record) = state.get_mut(&key) {
                let closed = record
                    .mark_conflict(reason)
                    .and_then(|_| record.mark_resolved(operation, resolution.data.clone(), sync_version));
                if let Err(e) = closed {
                    error!("Could not close conflict on {}: {}", key, e);
                }
            }
            if let Some(record) = self.settle(&mut state, &key).await {
                if let Err(e) = self
                    .write_local(&key, record.operation, &record.data, sync_version)
                    .await
                {
                    warn!("Could not apply resolution of {} locally: {}", key, e);
                }
            }
        }

        self.append_audit(&audit.resolved(resolution.data)).await;
        info!(
            "Resolved conflict on {} with {} ({:?} wins) at v{}",
            key, strategy, resolution.winner, sync_version
        );
        self.events.publish(SyncEvent::ConflictResolved {
            key,
            strategy,
            winner: Some(resolution.winner),
        });
        PushOutcome::Conflict { resolved: true }
    }

    async fn leave_in_conflict(&self, key: &RecordKey, reason: String) {
        let mut state = self.state.write().await;
        if let Some(record) = state.get_mut(key) {
            if let Err(e) = record.mark_conflict(reason) {
                error!("Could not mark {} conflicted: {}", key, e);
            }
        }
        self.settle(&mut state, key).await;
    }

    async fn append_audit(&self, audit: &ConflictAudit) {
        if let Err(e) = self.local.append_conflict_audit(audit).await {
            error!(
                "Could not write conflict audit for {}/{}: {}",
                audit.table_name, audit.record_id, e
            );
        }
    }

    /// Records waiting for a manual decision.
    pub async fn conflicts(&self) -> Vec<SyncRecord> {
        self.state
            .read()
            .await
            .records_with_status(SyncStatus::Conflict)
    }

    /// Settle a conflict left open.
    ///
    /// # Errors
    /// - Not found if there is no record for `key`
    /// - Invalid input if the record is not in CONFLICT
    /// - Validation error for a custom payload that is not an object or null
    /// - Network errors from the remote store
    pub async fn resolve_conflict(&self, key: &RecordKey, choice: ManualResolution) -> Result<SyncRecord> {
        let record = self
            .record(key)
            .await
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        if record.status != SyncStatus::Conflict {
            return Err(Error::InvalidInput(format!("{} is not in conflict", key)));
        }

        let remote = self
            .transport
            .execute(|| self.remote.get_record(key))
            .await?;
        let remote_version = remote.as_ref().map(|r| r.sync_version).unwrap_or(0);
        let remote_data = match &remote {
            Some(r) if !r.deleted => r.data.clone(),
            _ => Value::Null,
        };

        let (data, winner) = match choice {
            ManualResolution::KeepLocal => (record.data.clone(), Winner::Local),
            ManualResolution::KeepRemote => (remote_data, Winner::Remote),
            ManualResolution::Custom(data) => {
                if !(data.is_object() || data.is_null()) {
                    return Err(Error::Validation(
                        "Custom resolution must be a JSON object or null".to_string(),
                    ));
                }
                (data, Winner::Merged)
            }
        };
        let operation = resolved_operation(&data);

        let sync_version = if winner == Winner::Remote {
            remote_version
        } else {
            let version = remote_version.max(record.sync_version) + 1;
            self.write_remote(key, operation, &data, version).await?
        };

        let resolved = {
            let mut state = self.state.write().await;
            let current = state
                .get_mut(key)
                .ok_or_else(|| Error::NotFound(key.to_string()))?;
            current.mark_resolved(operation, data.clone(), sync_version)?;
            self.settle(&mut state, key)
                .await
                .ok_or_else(|| Error::NotFound(key.to_string()))?
        };
        self.write_local(key, resolved.operation, &resolved.data, sync_version)
            .await?;

        let audit = ConflictAudit::new(
            key,
            record.sync_version,
            remote_version,
            ConflictStrategy::Manual,
            &self.device_id,
        )
        .resolved(data);
        self.append_audit(&audit).await;

        info!("Manually resolved {} ({:?}) at v{}", key, winner, sync_version);
        self.events.publish(SyncEvent::ConflictResolved {
            key: key.clone(),
            strategy: ConflictStrategy::Manual,
            winner: Some(winner),
        });
        Ok(resolved)
    }

    /// Apply what other devices wrote since the last pull.
    ///
    /// Records with unsynced or conflicted local changes are left alone; their next
    /// push sees the newer remote version and goes through conflict resolution.
    pub async fn pull_remote_changes(&self) -> Result<usize> {
        if !self.is_online() {
            return Ok(0);
        }

        let since = self.state.read().await.last_sync;
        let started = Utc::now();
        let changes = self
            .transport
            .execute(|| self.remote.get_changes_since(&self.device_id, since))
            .await?;

        let mut applied = 0;
        for change in changes {
            let key = change.key();
            let mut state = self.state.write().await;

            let record_version = match state.get(&key) {
                Some(record)
                    if matches!(
                        record.status,
                        SyncStatus::Pending | SyncStatus::Syncing | SyncStatus::Conflict
                    ) =>
                {
                    debug!("Skipping remote change to {}: local change outstanding", key);
                    continue;
                }
                Some(record) => Some(record.sync_version),
                None => None,
            };
            let stored_version = self.local.get_record(&key).await?.map(|r| r.sync_version);
            if stored_version
                .max(record_version)
                .is_some_and(|v| v >= change.sync_version)
            {
                continue;
            }

            let (operation, data) = if change.deleted {
                (OperationType::Delete, Value::Null)
            } else {
                (OperationType::Upsert, change.data)
            };
            self.write_local(&key, operation, &data, change.sync_version)
                .await?;

            if let Some(record) = state.get_mut(&key) {
                record.adopt(operation, data, change.sync_version)?;
                self.local.update_sync_log(record).await?;
            }
            debug!("Pulled {} v{} from {}", key, change.sync_version, change.device_id);
            applied += 1;
        }

        self.state.write().await.last_sync = Some(started);
        if let Err(e) = self.registry.touch_last_sync(&self.device_id, started).await {
            debug!("Last sync not recorded: {}", e);
        }
        if applied > 0 {
            info!("Pulled {} remote changes", applied);
        }
        Ok(applied)
    }

    /// Latest record for a key.
    pub async fn record(&self, key: &RecordKey) -> Option<SyncRecord> {
        self.state.read().await.get(key).cloned()
    }

    pub async fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.last_sync
    }

    /// Counts by status plus connectivity. Never waits for a running sync.
    pub async fn get_sync_status(&self) -> SyncStatusReport {
        let (counts, last_sync) = {
            let state = self.state.read().await;
            (state.count_by_status(), state.last_sync)
        };
        let mut report = SyncStatusReport::from_counts(&counts);
        report.last_sync = last_sync;
        report.online = self.is_online();
        report.device_count = self.registry.count().await;
        report
    }

    /// Wait for background syncs to finish.
    pub async fn shutdown(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        debug!("Sync engine for {} stopped", self.device_id);
    }
}

fn resolved_operation(data: &Value) -> OperationType {
    if data.is_null() {
        OperationType::Delete
    } else {
        OperationType::Upsert
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buddy_common::DeviceType;
    use buddy_storage::{MemoryLocalStore, MemoryRemoteStore};
    use serde_json::json;

    struct Fixture {
        engine: Arc<SyncEngine>,
        local: Arc<MemoryLocalStore>,
        remote: Arc<MemoryRemoteStore>,
    }

    async fn fixture_with(config: SyncConfig, remote: Arc<MemoryRemoteStore>, device: &str) -> Fixture {
        let local = Arc::new(MemoryLocalStore::new());
        let (events, _) = EventBus::channel(64);
        let engine = SyncEngine::new(&config, device, "u1", local.clone(), remote.clone(), events)
            .await
            .unwrap();
        Fixture {
            engine,
            local,
            remote,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(SyncConfig::for_tests(), Arc::new(MemoryRemoteStore::new()), "d1").await
    }

    fn key(table: &str, id: &str) -> RecordKey {
        RecordKey::new(table, id).unwrap()
    }

    #[tokio::test]
    async fn test_track_change_records_pending() {
        let fx = fixture().await;
        let k = key("reminders", "r1");

        let disposition = fx
            .engine
            .track_change(&k, OperationType::Create, json!({"text": "water plants"}), "u1", "d1")
            .await
            .unwrap();
        assert!(matches!(disposition, ChangeDisposition::Recorded(_)));

        let record = fx.engine.record(&k).await.unwrap();
        assert_eq!(record.status, SyncStatus::Pending);
        assert_eq!(record.sync_version, 1);
        assert_eq!(fx.local.list_pending(None).await.unwrap().len(), 1);
        assert_eq!(
            fx.local.get_record(&k).await.unwrap().unwrap().data["text"],
            "water plants"
        );
    }

    #[tokio::test]
    async fn test_changes_coalesce_per_record() {
        let fx = fixture().await;
        let k = key("preferences", "theme");
        for value in ["dark", "light", "solarized"] {
            fx.engine
                .track_change(&k, OperationType::Update, json!({"value": value}), "u1", "d1")
                .await
                .unwrap();
        }

        let pending = fx.local.list_pending(None).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].data["value"], "solarized");

        let again = fx
            .engine
            .track_change(&k, OperationType::Update, json!({"value": "solarized"}), "u1", "d1")
            .await
            .unwrap();
        assert_eq!(again, ChangeDisposition::Unchanged);
    }

    #[tokio::test]
    async fn test_malformed_payload_fails_without_retry() {
        let fx = fixture().await;
        let k = key("reminders", "r1");
        let disposition = fx
            .engine
            .track_change(&k, OperationType::Create, json!("not an object"), "u1", "d1")
            .await
            .unwrap();
        assert!(matches!(disposition, ChangeDisposition::Rejected { .. }));

        let record = fx.engine.record(&k).await.unwrap();
        assert_eq!(record.status, SyncStatus::Failed);
        assert_eq!(record.retry_count, 0);
        assert_eq!(fx.engine.sync_changes(false).await.unwrap().records_pushed, 0);
    }

    #[tokio::test]
    async fn test_sync_pushes_next_version() {
        let fx = fixture().await;
        let k = key("reminders", "r1");
        fx.engine
            .track_change(&k, OperationType::Create, json!({"text": "call mom"}), "u1", "d1")
            .await
            .unwrap();

        let result = fx.engine.sync_changes(false).await.unwrap();
        assert_eq!(result.records_pushed, 1);

        let record = fx.engine.record(&k).await.unwrap();
        assert_eq!(record.status, SyncStatus::Completed);
        assert_eq!(record.sync_version, 2);
        assert_eq!(fx.remote.snapshot(&k).await.unwrap().sync_version, 2);
        assert_eq!(fx.local.get_record(&k).await.unwrap().unwrap().sync_version, 2);
        assert!(fx.engine.last_sync().await.is_some());
    }

    #[tokio::test]
    async fn test_lost_ack_is_idempotent() {
        let fx = fixture().await;
        let k = key("reminders", "r1");
        fx.engine
            .track_change(&k, OperationType::Create, json!({"text": "call mom"}), "u1", "d1")
            .await
            .unwrap();

        fx.remote.corrupt_next_ack();
        let first = fx.engine.push_record(&k, 3).await;
        assert!(matches!(first, PushOutcome::Retry { .. }));
        assert_eq!(fx.engine.record(&k).await.unwrap().status, SyncStatus::Pending);

        let second = fx.engine.push_record(&k, 3).await;
        assert_eq!(second, PushOutcome::Completed { sync_version: 2 });
        assert_eq!(fx.remote.writes_applied(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_returns_to_pending() {
        let fx = fixture().await;
        let k = key("reminders", "r1");
        fx.engine
            .track_change(&k, OperationType::Create, json!({"text": "x"}), "u1", "d1")
            .await
            .unwrap();

        fx.remote.fail_next(1);
        let outcome = fx.engine.push_record(&k, 3).await;
        assert!(matches!(outcome, PushOutcome::Retry { .. }));

        let record = fx.engine.record(&k).await.unwrap();
        assert_eq!(record.status, SyncStatus::Pending);
        assert_eq!(record.retry_count, 1);
        assert!(record.error_message.is_some());
    }

    #[tokio::test]
    async fn test_offline_sync_is_noop() {
        let fx = fixture().await;
        let k = key("reminders", "r1");
        fx.engine
            .track_change(&k, OperationType::Create, json!({"text": "x"}), "u1", "d1")
            .await
            .unwrap();

        fx.remote.set_reachable(false);
        assert!(!fx.engine.check_connectivity().await);
        assert_eq!(fx.engine.sync_changes(true).await.unwrap(), SyncResult::default());
        assert!(fx.engine.apply_batch(&[]).await.is_err());
        assert_eq!(fx.engine.get_sync_status().await.pending, 1);
    }

    #[tokio::test]
    async fn test_manual_conflict_stays_until_resolved() {
        let mut config = SyncConfig::for_tests();
        config
            .engine
            .table_strategies
            .insert("reminders".to_string(), ConflictStrategy::Manual);
        let remote = Arc::new(MemoryRemoteStore::new());
        let fx = fixture_with(config, remote.clone(), "d1").await;
        let k = key("reminders", "r1");

        remote
            .upsert_record(RemoteRecord::upsert(&k, json!({"text": "theirs"}), 5, "d9"))
            .await
            .unwrap();
        fx.engine
            .track_change(&k, OperationType::Update, json!({"text": "mine"}), "u1", "d1")
            .await
            .unwrap();

        let outcome = fx.engine.push_record(&k, 3).await;
        assert_eq!(outcome, PushOutcome::Conflict { resolved: false });
        assert_eq!(fx.engine.conflicts().await.len(), 1);
        assert_eq!(fx.engine.get_sync_status().await.conflicts, 1);

        let audits = fx.local.list_conflict_audits(Some(&k)).await.unwrap();
        assert_eq!(audits.len(), 1);
        assert!(audits[0].resolved_data.is_none());

        let resolved = fx
            .engine
            .resolve_conflict(&k, ManualResolution::KeepLocal)
            .await
            .unwrap();
        assert_eq!(resolved.status, SyncStatus::Completed);
        assert_eq!(resolved.sync_version, 6);

        let stored = remote.snapshot(&k).await.unwrap();
        assert_eq!(stored.data["text"], "mine");
        assert_eq!(stored.sync_version, 6);
        assert_eq!(fx.local.list_conflict_audits(Some(&k)).await.unwrap().len(), 2);
        assert!(fx.engine.conflicts().await.is_empty());
    }

    #[tokio::test]
    async fn test_resolver_error_leaves_conflict() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let fx = fixture_with(SyncConfig::for_tests(), remote.clone(), "d1").await;
        let k = key("conversations", "c1");

        // A tombstone cannot be merged into a conversation.
        remote.delete_record(&k, 3, "d9").await.unwrap();
        fx.engine
            .track_change(&k, OperationType::Update, json!({"messages": []}), "u1", "d1")
            .await
            .unwrap();

        let outcome = fx.engine.push_record(&k, 3).await;
        assert_eq!(outcome, PushOutcome::Conflict { resolved: false });

        let resolved = fx
            .engine
            .resolve_conflict(&k, ManualResolution::KeepRemote)
            .await
            .unwrap();
        assert_eq!(resolved.operation, OperationType::Delete);
        assert_eq!(resolved.sync_version, 3);
        assert!(fx.local.get_record(&k).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resolve_conflict_requires_conflict() {
        let fx = fixture().await;
        let k = key("reminders", "r1");
        assert!(matches!(
            fx.engine.resolve_conflict(&k, ManualResolution::KeepLocal).await,
            Err(Error::NotFound(_))
        ));

        fx.engine
            .track_change(&k, OperationType::Create, json!({"text": "x"}), "u1", "d1")
            .await
            .unwrap();
        assert!(matches!(
            fx.engine.resolve_conflict(&k, ManualResolution::KeepLocal).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_pull_applies_other_devices_changes() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let fx = fixture_with(SyncConfig::for_tests(), remote.clone(), "d1").await;
        let fresh = key("reminders", "r2");
        let gone = key("reminders", "r3");

        remote
            .upsert_record(RemoteRecord::upsert(&fresh, json!({"text": "from phone"}), 2, "d2"))
            .await
            .unwrap();
        fx.local.upsert_record(&gone, &json!({"text": "old"}), 2).await.unwrap();
        remote.delete_record(&gone, 3, "d2").await.unwrap();

        assert_eq!(fx.engine.pull_remote_changes().await.unwrap(), 2);
        assert_eq!(
            fx.local.get_record(&fresh).await.unwrap().unwrap().data["text"],
            "from phone"
        );
        assert!(fx.local.get_record(&gone).await.unwrap().is_none());

        // Nothing new since the last pull.
        assert_eq!(fx.engine.pull_remote_changes().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pull_skips_records_with_local_changes() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let fx = fixture_with(SyncConfig::for_tests(), remote.clone(), "d1").await;
        let k = key("reminders", "r1");

        fx.engine
            .track_change(&k, OperationType::Update, json!({"text": "mine"}), "u1", "d1")
            .await
            .unwrap();
        remote
            .upsert_record(RemoteRecord::upsert(&k, json!({"text": "theirs"}), 4, "d2"))
            .await
            .unwrap();

        assert_eq!(fx.engine.pull_remote_changes().await.unwrap(), 0);
        assert_eq!(fx.local.get_record(&k).await.unwrap().unwrap().data["text"], "mine");
    }

    #[tokio::test]
    async fn test_change_during_push_is_staged() {
        let fx = fixture().await;
        let k = key("reminders", "r1");
        fx.engine
            .track_change(&k, OperationType::Create, json!({"text": "first"}), "u1", "d1")
            .await
            .unwrap();

        fx.remote.set_latency(Duration::from_millis(100));
        let engine = fx.engine.clone();
        let push_key = k.clone();
        let push = tokio::spawn(async move { engine.push_record(&push_key, 3).await });
        tokio::time::sleep(Duration::from_millis(30)).await;

        let disposition = fx
            .engine
            .track_change(&k, OperationType::Update, json!({"text": "second"}), "u1", "d1")
            .await
            .unwrap();
        assert_eq!(disposition, ChangeDisposition::Staged);

        assert_eq!(push.await.unwrap(), PushOutcome::Completed { sync_version: 2 });
        let record = fx.engine.record(&k).await.unwrap();
        assert_eq!(record.status, SyncStatus::Pending);
        assert_eq!(record.data["text"], "second");
        assert_eq!(record.sync_version, 2);
        assert_eq!(fx.local.get_record(&k).await.unwrap().unwrap().data["text"], "second");
    }

    #[tokio::test]
    async fn test_restore_reverts_interrupted_push() {
        let local = Arc::new(MemoryLocalStore::new());
        let k = key("reminders", "r1");
        let mut record = SyncRecord::new(&k, OperationType::Create, json!({"text": "x"}), "u1", "d1", 1);
        record.mark_syncing().unwrap();
        local.append_sync_log(&record).await.unwrap();

        let (events, _) = EventBus::channel(8);
        let engine = SyncEngine::new(
            &SyncConfig::for_tests(),
            "d1",
            "u1",
            local.clone(),
            Arc::new(MemoryRemoteStore::new()),
            events,
        )
        .await
        .unwrap();

        assert_eq!(engine.record(&k).await.unwrap().status, SyncStatus::Pending);
        assert_eq!(local.list_pending(None).await.unwrap()[0].status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn test_register_device_mirrors_remotely() {
        let fx = fixture().await;
        fx.engine
            .register_device(DeviceInfo::new("d1", "u1", DeviceType::Desktop, "Laptop"))
            .await
            .unwrap();

        assert_eq!(fx.remote.devices().await.len(), 1);
        assert_eq!(fx.engine.get_sync_status().await.device_count, 1);
        assert!(fx.engine.get_sync_status().await.online);
    }

    #[tokio::test]
    async fn test_immediate_sync_covers_only_tracked_record() {
        let mut config = SyncConfig::for_tests();
        config.engine.immediate_sync = true;
        let fx = fixture_with(config, Arc::new(MemoryRemoteStore::new()), "d1").await;

        let other = key("reminders", "r1");
        fx.engine
            .track_change(&other, OperationType::Create, json!({"text": "later"}), "u1", "d1")
            .await
            .unwrap();
        let theme = key("preferences", "theme");
        fx.engine
            .track_change(&theme, OperationType::Update, json!({"value": "dark"}), "u1", "d1")
            .await
            .unwrap();
        fx.engine.shutdown().await;

        assert_eq!(fx.engine.record(&theme).await.unwrap().status, SyncStatus::Completed);
        assert_eq!(fx.engine.record(&other).await.unwrap().status, SyncStatus::Pending);
        assert!(fx.remote.snapshot(&other).await.is_none());
    }
}
