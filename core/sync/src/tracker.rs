//! Change capture.
//!
//! [`ChangeTracker`] is the entry point application code calls after mutating
//! a synced table. It filters by table, wraps the payload in a `_sync` envelope,
//! records it with the engine, queues it with the scheduler and notifies
//! listeners. Sync-side failures are logged; only malformed requests error.

use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use buddy_common::{Error, OperationType, Priority, RecordKey, Result, SyncOperation, SYNC_ENVELOPE_KEY};

use crate::config::TrackerConfig;
use crate::engine::{ChangeDisposition, SyncEngine};
use crate::events::{EventBus, Listener, SyncEvent};
use crate::scheduler::SyncScheduler;

/// A mutation reported by application code.
#[derive(Debug, Clone)]
pub struct ChangeRequest {
    pub table: String,
    pub record_id: String,
    pub operation: OperationType,
    pub data: Value,
    pub user_id: String,
    pub device_id: String,
    /// Free-form caller context copied into the envelope.
    pub context: Option<Value>,
}

impl ChangeRequest {
    pub fn new(
        table: impl Into<String>,
        record_id: impl Into<String>,
        operation: OperationType,
        data: Value,
    ) -> Self {
        Self {
            table: table.into(),
            record_id: record_id.into(),
            operation,
            data,
            user_id: String::new(),
            device_id: String::new(),
            context: None,
        }
    }

    pub fn by(mut self, user_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self.device_id = device_id.into();
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }
}

/// What happened to a tracked change.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackOutcome {
    /// Table is not synced.
    Ignored,
    /// Same payload as the current record.
    Unchanged,
    Queued { priority: Priority },
    /// Recorded, but the scheduler refused the operation.
    Deferred,
    /// Permanently invalid payload.
    Rejected { reason: String },
}

pub struct ChangeTracker {
    engine: Arc<SyncEngine>,
    scheduler: Arc<SyncScheduler>,
    config: TrackerConfig,
    events: EventBus,
}

impl ChangeTracker {
    pub fn new(
        engine: Arc<SyncEngine>,
        scheduler: Arc<SyncScheduler>,
        config: TrackerConfig,
        events: EventBus,
    ) -> Self {
        Self {
            engine,
            scheduler,
            config,
            events,
        }
    }

    /// Capture one change.
    ///
    /// Empty user or device ids default to this engine's identity.
    ///
    /// # Errors
    /// - Invalid input if the table or record id is empty or malformed
    pub async fn track_change(&self, request: ChangeRequest) -> Result<TrackOutcome> {
        if request.record_id.is_empty() {
            return Err(Error::InvalidInput("Record id cannot be empty".to_string()));
        }
        let key = RecordKey::new(request.table.as_str(), request.record_id.as_str())?;

        if !self.config.is_allowed(key.table()) {
            debug!("Ignoring change to unsynced table {}", key.table());
            return Ok(TrackOutcome::Ignored);
        }

        let user_id = if request.user_id.is_empty() {
            self.engine.user_id().to_string()
        } else {
            request.user_id.clone()
        };
        let device_id = if request.device_id.is_empty() {
            self.engine.device_id().to_string()
        } else {
            request.device_id.clone()
        };

        let data = self.envelope(&request, &user_id, &device_id).await;
        let disposition = match self
            .engine
            .track_change(&key, request.operation, data.clone(), &user_id, &device_id)
            .await
        {
            Ok(disposition) => disposition,
            Err(e) => {
                warn!("Could not record change to {}: {}", key, e);
                self.publish(&key, request.operation, None, data);
                return Ok(TrackOutcome::Deferred);
            }
        };

        let outcome = match disposition {
            ChangeDisposition::Unchanged => {
                debug!("{} unchanged", key);
                return Ok(TrackOutcome::Unchanged);
            }
            ChangeDisposition::Rejected { reason } => TrackOutcome::Rejected { reason },
            ChangeDisposition::Recorded(_) | ChangeDisposition::Staged => {
                let op = SyncOperation::new(
                    &key,
                    request.operation,
                    data.clone(),
                    self.config.priority_for(key.table()),
                    &user_id,
                    &device_id,
                    self.engine.max_retries(),
                );
                match self.scheduler.enqueue(op).await {
                    Ok(priority) => TrackOutcome::Queued { priority },
                    Err(e) => {
                        warn!("{} recorded but not queued: {}", key, e);
                        TrackOutcome::Deferred
                    }
                }
            }
        };

        let priority = match &outcome {
            TrackOutcome::Queued { priority } => Some(*priority),
            _ => None,
        };
        self.publish(&key, request.operation, priority, data);
        Ok(outcome)
    }

    /// Register a listener for one table, or for every event with `None`.
    pub async fn add_listener(&self, table: Option<&str>, listener: Listener) {
        self.events.subscribe(table, listener).await;
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Payload with the `_sync` envelope attached. Non-object payloads pass through.
    async fn envelope(&self, request: &ChangeRequest, user_id: &str, device_id: &str) -> Value {
        let Value::Object(fields) = &request.data else {
            return request.data.clone();
        };

        let mut meta = Map::new();
        meta.insert("table".to_string(), json!(request.table));
        meta.insert("operation".to_string(), json!(request.operation));
        meta.insert("userId".to_string(), json!(user_id));
        meta.insert("deviceId".to_string(), json!(device_id));
        if let Some(device) = self.engine.registry().device(device_id).await {
            meta.insert("deviceType".to_string(), json!(device.device_type));
        }
        meta.insert(
            "timestamp".to_string(),
            json!(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        if let Some(context) = &request.context {
            meta.insert("context".to_string(), context.clone());
        }

        let mut enriched = fields.clone();
        enriched.insert(SYNC_ENVELOPE_KEY.to_string(), Value::Object(meta));
        Value::Object(enriched)
    }

    fn publish(&self, key: &RecordKey, operation: OperationType, priority: Option<Priority>, data: Value) {
        self.events.publish(SyncEvent::ChangeTracked {
            key: key.clone(),
            operation,
            priority,
            data,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::context::SyncContext;
    use crate::events::EventDispatcher;
    use buddy_common::{DeviceInfo, DeviceType, SyncStatus};
    use buddy_storage::{MemoryLocalStore, MemoryRemoteStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        tracker: ChangeTracker,
        scheduler: Arc<SyncScheduler>,
        engine: Arc<SyncEngine>,
        dispatcher: Option<EventDispatcher>,
    }

    async fn fixture(config: SyncConfig) -> Fixture {
        let local = Arc::new(MemoryLocalStore::new());
        let remote = Arc::new(MemoryRemoteStore::new());
        let (events, dispatcher) = EventBus::channel(64);
        let engine = SyncEngine::new(&config, "d1", "u1", local, remote, events.clone())
            .await
            .unwrap();
        engine
            .register_device(DeviceInfo::new("d1", "u1", DeviceType::Desktop, "Desk"))
            .await
            .unwrap();
        let scheduler = SyncScheduler::new(
            engine.clone(),
            config.scheduler.clone(),
            config.retry.clone(),
            SyncContext::for_device(DeviceType::Desktop),
            events.clone(),
        );
        let tracker = ChangeTracker::new(engine.clone(), scheduler.clone(), config.tracker, events);
        Fixture {
            tracker,
            scheduler,
            engine,
            dispatcher: Some(dispatcher),
        }
    }

    #[tokio::test]
    async fn test_unsynced_table_is_ignored() {
        let fx = fixture(SyncConfig::for_tests()).await;
        let outcome = fx
            .tracker
            .track_change(ChangeRequest::new("scratch", "x", OperationType::Create, json!({})))
            .await
            .unwrap();
        assert_eq!(outcome, TrackOutcome::Ignored);
        assert!(fx.scheduler.queue_depths().await.values().all(|n| *n == 0));
    }

    #[tokio::test]
    async fn test_empty_ids_are_invalid() {
        let fx = fixture(SyncConfig::for_tests()).await;
        let err = fx
            .tracker
            .track_change(ChangeRequest::new("preferences", "", OperationType::Update, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let err = fx
            .tracker
            .track_change(ChangeRequest::new("", "theme", OperationType::Update, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_envelope_and_priority() {
        let fx = fixture(SyncConfig::for_tests()).await;
        let outcome = fx
            .tracker
            .track_change(
                ChangeRequest::new("preferences", "theme", OperationType::Update, json!({"value": "dark"}))
                    .with_context(json!({"screen": "settings"})),
            )
            .await
            .unwrap();
        assert_eq!(outcome, TrackOutcome::Queued { priority: Priority::High });

        let key = RecordKey::new("preferences", "theme").unwrap();
        let record = fx.engine.record(&key).await.unwrap();
        assert_eq!(record.status, SyncStatus::Pending);
        let meta = &record.data[SYNC_ENVELOPE_KEY];
        assert_eq!(meta["table"], "preferences");
        assert_eq!(meta["operation"], "UPDATE");
        assert_eq!(meta["userId"], "u1");
        assert_eq!(meta["deviceId"], "d1");
        assert_eq!(meta["deviceType"], "desktop");
        assert_eq!(meta["context"]["screen"], "settings");
        assert!(meta["timestamp"].as_str().unwrap().ends_with('Z'));
        assert_eq!(record.data["value"], "dark");

        let outcome = fx
            .tracker
            .track_change(ChangeRequest::new("reminders", "r1", OperationType::Create, json!({"at": 1})))
            .await
            .unwrap();
        assert_eq!(outcome, TrackOutcome::Queued { priority: Priority::Medium });
    }

    #[tokio::test]
    async fn test_repeated_payload_is_unchanged() {
        let fx = fixture(SyncConfig::for_tests()).await;
        let request = ChangeRequest::new("preferences", "theme", OperationType::Update, json!({"value": "dark"}));
        fx.tracker.track_change(request.clone()).await.unwrap();
        // Envelope timestamps differ; the checksum ignores them.
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(
            fx.tracker.track_change(request).await.unwrap(),
            TrackOutcome::Unchanged
        );
        assert_eq!(fx.scheduler.queue_depths().await[&Priority::High], 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_rejected() {
        let fx = fixture(SyncConfig::for_tests()).await;
        let outcome = fx
            .tracker
            .track_change(ChangeRequest::new("preferences", "theme", OperationType::Update, json!([1, 2])))
            .await
            .unwrap();
        assert!(matches!(outcome, TrackOutcome::Rejected { .. }));
        assert!(fx.scheduler.queue_depths().await.values().all(|n| *n == 0));
    }

    #[tokio::test]
    async fn test_full_queue_defers() {
        let mut config = SyncConfig::for_tests();
        config.scheduler.queue_capacity = 1;
        let fx = fixture(config).await;

        fx.tracker
            .track_change(ChangeRequest::new("reminders", "r1", OperationType::Create, json!({})))
            .await
            .unwrap();
        let outcome = fx
            .tracker
            .track_change(ChangeRequest::new("reminders", "r2", OperationType::Create, json!({})))
            .await
            .unwrap();
        assert_eq!(outcome, TrackOutcome::Deferred);

        let key = RecordKey::new("reminders", "r2").unwrap();
        assert_eq!(fx.engine.record(&key).await.unwrap().status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn test_listeners_are_notified_per_table() {
        let mut fx = fixture(SyncConfig::for_tests()).await;
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        fx.tracker
            .add_listener(
                Some("preferences"),
                Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .await;
        fx.tracker
            .add_listener(Some("preferences"), Arc::new(|_| panic!("listener bug")))
            .await;

        let cancel = CancellationToken::new();
        let dispatcher = fx.dispatcher.take().unwrap();
        let handle = tokio::spawn(dispatcher.run(cancel.clone()));

        fx.tracker
            .track_change(ChangeRequest::new("preferences", "theme", OperationType::Update, json!({"v": 1})))
            .await
            .unwrap();
        fx.tracker
            .track_change(ChangeRequest::new("reminders", "r1", OperationType::Create, json!({})))
            .await
            .unwrap();

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
