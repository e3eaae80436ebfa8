//! Wiring for a running sync stack.
//!
//! [`SyncService`] builds the engine, scheduler and tracker for one device and
//! supervises the scheduler loop, the context monitor and the event
//! dispatcher. [`SyncService::shutdown`] stops the loops first and the
//! dispatcher last, so events from work that was still running get delivered.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use buddy_common::{DeviceInfo, Result};
use buddy_storage::{LocalStore, RemoteStore};

use crate::config::SyncConfig;
use crate::context::{ContextMonitor, ResourceProbe, SyncContext};
use crate::engine::SyncEngine;
use crate::events::EventBus;
use crate::scheduler::SyncScheduler;
use crate::state::SyncStatusReport;
use crate::tracker::ChangeTracker;

pub struct SyncService {
    engine: Arc<SyncEngine>,
    scheduler: Arc<SyncScheduler>,
    tracker: Arc<ChangeTracker>,
    events: EventBus,
    cancel: CancellationToken,
    tasks: TaskTracker,
    dispatch_cancel: CancellationToken,
    dispatcher: JoinHandle<()>,
}

impl SyncService {
    /// Build the stack for `device` and start its background tasks.
    ///
    /// Queued operations persisted by an earlier run are restored first.
    pub async fn start(
        config: SyncConfig,
        device: DeviceInfo,
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        probe: Arc<dyn ResourceProbe>,
    ) -> Result<Self> {
        let (events, dispatcher) = EventBus::channel(config.event_capacity);
        let engine = SyncEngine::new(
            &config,
            device.device_id.clone(),
            device.user_id.clone(),
            local,
            remote.clone(),
            events.clone(),
        )
        .await?;
        engine.register_device(device.clone()).await?;

        let monitor = ContextMonitor::new(device.device_type, remote, probe);
        let context = monitor.sample(engine.last_sync().await).await;
        let scheduler = SyncScheduler::new(
            engine.clone(),
            config.scheduler.clone(),
            config.retry.clone(),
            context,
            events.clone(),
        );
        scheduler.restore().await?;

        let tracker = Arc::new(ChangeTracker::new(
            engine.clone(),
            scheduler.clone(),
            config.tracker.clone(),
            events.clone(),
        ));

        let dispatch_cancel = CancellationToken::new();
        let dispatcher = tokio::spawn(dispatcher.run(dispatch_cancel.clone()));

        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        tasks.spawn(scheduler.clone().run_loop(cancel.child_token()));
        tasks.spawn(scheduler.clone().run_context_monitor(monitor, cancel.child_token()));
        tasks.close();

        info!(
            "Sync service started for device {} ({})",
            device.device_id,
            device.device_type.as_str()
        );
        Ok(Self {
            engine,
            scheduler,
            tracker,
            events,
            cancel,
            tasks,
            dispatch_cancel,
            dispatcher,
        })
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn scheduler(&self) -> &Arc<SyncScheduler> {
        &self.scheduler
    }

    pub fn tracker(&self) -> &Arc<ChangeTracker> {
        &self.tracker
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub async fn context(&self) -> SyncContext {
        self.scheduler.snapshot().await.context.clone()
    }

    pub async fn status(&self) -> SyncStatusReport {
        self.scheduler.status().await
    }

    /// Stop the background tasks and wait for in-flight work.
    ///
    /// Queued operations stay persisted for the next start.
    pub async fn shutdown(self) {
        info!("Shutting down sync service");
        self.cancel.cancel();
        self.tasks.wait().await;
        self.scheduler.shutdown().await;
        self.engine.shutdown().await;

        self.dispatch_cancel.cancel();
        if let Err(e) = self.dispatcher.await {
            warn!("Event dispatcher ended abnormally: {}", e);
        }

        let depth: usize = self.scheduler.queue_depths().await.values().sum();
        if depth > 0 {
            warn!("{} operations left queued", depth);
        }
        info!("Sync service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ResourceSample, StaticResources};
    use crate::tracker::{ChangeRequest, TrackOutcome};
    use buddy_common::{DeviceType, OperationType, Priority, RecordKey, SyncStatus};
    use buddy_storage::{MemoryLocalStore, MemoryRemoteStore};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn plugged_in() -> Arc<StaticResources> {
        Arc::new(StaticResources::new(ResourceSample {
            battery_level: Some(90),
            is_charging: true,
            storage_free_mb: Some(10_000),
            memory_available_mb: Some(4_096),
            is_user_active: false,
        }))
    }

    #[tokio::test]
    async fn test_start_track_and_shutdown() {
        let local = Arc::new(MemoryLocalStore::new());
        let remote = Arc::new(MemoryRemoteStore::new());
        let mut config = SyncConfig::for_tests();
        config.scheduler.immediate_sync = true;

        let service = SyncService::start(
            config,
            DeviceInfo::new("d1", "u1", DeviceType::Desktop, "Desk"),
            local.clone(),
            remote.clone(),
            plugged_in(),
        )
        .await
        .unwrap();
        assert_eq!(remote.devices().await.len(), 1);

        let outcome = service
            .tracker()
            .track_change(ChangeRequest::new(
                "preferences",
                "theme",
                OperationType::Update,
                json!({"value": "dark"}),
            ))
            .await
            .unwrap();
        assert_eq!(outcome, TrackOutcome::Queued { priority: Priority::High });

        let key = RecordKey::new("preferences", "theme").unwrap();
        let mut synced = false;
        for _ in 0..50 {
            if service.engine().record(&key).await.map(|r| r.status) == Some(SyncStatus::Completed) {
                synced = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(synced);
        assert!(remote.snapshot(&key).await.is_some());

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_restores_queue() {
        let local = Arc::new(MemoryLocalStore::new());
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.set_reachable(false);
        let device = DeviceInfo::new("d1", "u1", DeviceType::Mobile, "Phone");

        let service = SyncService::start(
            SyncConfig::for_tests(),
            device.clone(),
            local.clone(),
            remote.clone(),
            plugged_in(),
        )
        .await
        .unwrap();
        assert!(service.context().await.is_offline());
        service
            .tracker()
            .track_change(ChangeRequest::new("reminders", "r1", OperationType::Create, json!({})))
            .await
            .unwrap();
        service.shutdown().await;

        let service = SyncService::start(SyncConfig::for_tests(), device, local, remote, plugged_in())
            .await
            .unwrap();
        let depth: usize = service.scheduler().queue_depths().await.values().sum();
        assert_eq!(depth, 1);
        assert_eq!(service.status().await.pending, 1);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_delivers_events_from_running_cycle() {
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.set_latency(Duration::from_millis(50));

        let service = SyncService::start(
            SyncConfig::for_tests(),
            DeviceInfo::new("d1", "u1", DeviceType::Desktop, "Desk"),
            Arc::new(MemoryLocalStore::new()),
            remote,
            plugged_in(),
        )
        .await
        .unwrap();

        let cycles = Arc::new(AtomicUsize::new(0));
        let counter = cycles.clone();
        service
            .tracker()
            .add_listener(
                None,
                Arc::new(move |event| {
                    if matches!(event, crate::events::SyncEvent::CycleCompleted { .. }) {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(())
                }),
            )
            .await;

        // Shut down while the first loop cycle is still pulling.
        tokio::time::sleep(Duration::from_millis(20)).await;
        service.shutdown().await;
        assert!(cycles.load(Ordering::SeqCst) >= 1);
    }
}
