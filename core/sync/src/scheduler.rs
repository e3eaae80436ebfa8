//! Priority-adaptive sync scheduling.
//!
//! Operations wait in five FIFO tiers. Each cycle picks a [`SyncStrategy`] from
//! the current [`SyncContext`], drains the tiers that strategy allows and hands
//! the operations to [`SyncEngine::apply_batch`]. Failed operations are retried
//! with exponential backoff at a lower priority.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use buddy_common::{OperationType, Priority, Result, SyncOperation};
use buddy_storage::LocalStore;

use crate::config::SchedulerConfig;
use crate::context::{
    ContextMonitor, NetworkQuality, ResourceConstraint, ScheduleTables, SyncContext, SyncStrategy,
};
use crate::engine::{PushOutcome, SyncEngine};
use crate::events::{EventBus, SyncEvent};
use crate::queue::PriorityQueues;
use crate::retry::RetryConfig;
use crate::state::SyncStatusReport;

/// Context together with the tables derived from it. Replaced as a whole.
#[derive(Debug, Clone)]
pub struct ContextSnapshot {
    pub context: SyncContext,
    pub tables: ScheduleTables,
}

/// Summary of one scheduler cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub strategy: Option<SyncStrategy>,
    pub completed: usize,
    pub conflicts: usize,
    pub retried: usize,
    pub dropped: usize,
    pub requeued: usize,
    pub pulled: usize,
}

struct Queues {
    queues: PriorityQueues,
    is_syncing: bool,
}

/// Drives the engine from the priority queues.
pub struct SyncScheduler {
    engine: Arc<SyncEngine>,
    local: Arc<dyn LocalStore>,
    config: SchedulerConfig,
    retry: RetryConfig,
    /// Queue access and the syncing flag share this lock.
    inner: Mutex<Queues>,
    context: RwLock<Arc<ContextSnapshot>>,
    events: EventBus,
    tasks: TaskTracker,
}

impl SyncScheduler {
    pub fn new(
        engine: Arc<SyncEngine>,
        config: SchedulerConfig,
        retry: RetryConfig,
        context: SyncContext,
        events: EventBus,
    ) -> Arc<Self> {
        let tables = ScheduleTables::compute(&context, &config);
        Arc::new(Self {
            local: engine.local().clone(),
            engine,
            inner: Mutex::new(Queues {
                queues: PriorityQueues::new(config.queue_capacity),
                is_syncing: false,
            }),
            context: RwLock::new(Arc::new(ContextSnapshot { context, tables })),
            config,
            retry,
            events,
            tasks: TaskTracker::new(),
        })
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Re-enqueue operations persisted by a previous run, in priority then age order.
    pub async fn restore(&self) -> Result<usize> {
        let ops = self.local.load_queued_operations().await?;
        let mut inner = self.inner.lock().await;
        let mut restored = 0;
        for op in ops {
            let id = op.id.clone();
            match inner.queues.push(op) {
                Ok(Some(replaced)) => {
                    self.forget(&replaced.id).await;
                    restored += 1;
                }
                Ok(None) => restored += 1,
                Err(e) => {
                    warn!("Could not restore operation {}: {}", id, e);
                    self.forget(&id).await;
                }
            }
        }
        if restored > 0 {
            info!("Restored {} queued operations", restored);
        }
        Ok(restored)
    }

    /// Queue an operation.
    ///
    /// The priority is first adjusted for the current context. REALTIME and HIGH
    /// operations start a cycle right away unless one is already running.
    ///
    /// # Errors
    /// - Resource constraint when the queues are full
    pub async fn enqueue(self: &Arc<Self>, mut op: SyncOperation) -> Result<Priority> {
        let snapshot = self.snapshot().await;
        let priority = adjust_priority(&op, &snapshot.context);
        if priority != op.priority {
            debug!("{} priority {} -> {}", op.key(), op.priority, priority);
            op.priority = priority;
        }

        let is_syncing = {
            let mut inner = self.inner.lock().await;
            if let Some(replaced) = inner.queues.push(op.clone())? {
                debug!("Replaced queued operation for {}", replaced.key());
                self.forget(&replaced.id).await;
            }
            inner.is_syncing
        };
        self.remember(&op).await;
        debug!("Queued {} {} at {}", op.operation_type, op.key(), priority);

        if matches!(priority, Priority::Realtime | Priority::High)
            && self.config.immediate_sync
            && !is_syncing
        {
            let scheduler = self.clone();
            self.tasks.spawn(async move {
                if let Err(e) = scheduler.sync_cycle().await {
                    warn!("Immediate cycle failed: {}", e);
                }
            });
        }
        Ok(priority)
    }

    /// Run one cycle. Returns `None` when skipped (offline or already syncing).
    pub async fn sync_cycle(&self) -> Result<Option<CycleReport>> {
        let snapshot = self.snapshot().await;
        if snapshot.context.is_offline() || !self.engine.is_online() {
            debug!("Offline, cycle skipped");
            return Ok(None);
        }
        let Some(strategy) = SyncStrategy::select(&snapshot.context) else {
            return Ok(None);
        };
        let plan = strategy.drain_plan(&snapshot.tables, &self.config);

        let batch = {
            let mut inner = self.inner.lock().await;
            if inner.is_syncing {
                debug!("Cycle already running");
                return Ok(None);
            }
            inner.is_syncing = true;
            let now = Utc::now();
            let mut batch = Vec::new();
            for (priority, max) in plan {
                batch.extend(inner.queues.take_ready(priority, max, now));
            }
            batch
        };

        debug!(
            "Cycle ({}) draining {} operations",
            strategy.as_str(),
            batch.len()
        );
        let mut report = self.drain(batch).await;
        report.strategy = Some(strategy);

        if strategy.pulls() {
            // With nothing queued, a full sweep also pushes PENDING records that
            // never made it into a queue (refused at capacity, or restored without one).
            let idle = self.inner.lock().await.queues.is_empty();
            if idle {
                match self.engine.sync_changes(false).await {
                    Ok(swept) => {
                        report.completed += swept.records_pushed;
                        report.conflicts += swept.conflicts_found;
                        report.dropped += swept.records_failed;
                        report.pulled = swept.records_pulled;
                    }
                    Err(e) => warn!("Sweep failed: {}", e),
                }
            } else {
                match self.engine.pull_remote_changes().await {
                    Ok(pulled) => report.pulled = pulled,
                    Err(e) => warn!("Pull failed: {}", e),
                }
            }
        }

        self.inner.lock().await.is_syncing = false;

        if report.completed + report.conflicts + report.retried + report.dropped + report.pulled > 0 {
            info!(
                "Cycle ({}): {} completed, {} conflicts, {} retried, {} dropped, {} pulled",
                strategy.as_str(),
                report.completed,
                report.conflicts,
                report.retried,
                report.dropped,
                report.pulled
            );
        }
        self.events.publish(SyncEvent::CycleCompleted {
            pushed: report.completed,
            failed: report.dropped,
            conflicts: report.conflicts,
            pulled: report.pulled,
        });
        Ok(Some(report))
    }

    async fn drain(&self, batch: Vec<SyncOperation>) -> CycleReport {
        let mut report = CycleReport::default();
        let mut failed = Vec::new();
        let mut requeue = Vec::new();

        for ops in group_by_kind(batch) {
            let outcomes = match self.engine.apply_batch(&ops).await {
                Ok(outcomes) => outcomes,
                Err(e) => {
                    warn!("Batch of {} operations not applied: {}", ops.len(), e);
                    requeue.extend(ops);
                    continue;
                }
            };

            let mut by_id: BTreeMap<String, PushOutcome> = outcomes.into_iter().collect();
            for op in ops {
                match by_id.remove(&op.id) {
                    Some(PushOutcome::Completed { .. }) | Some(PushOutcome::Missing) => {
                        report.completed += 1;
                        self.forget(&op.id).await;
                    }
                    Some(PushOutcome::Conflict { .. }) => {
                        report.conflicts += 1;
                        self.forget(&op.id).await;
                    }
                    Some(PushOutcome::Retry { .. }) => failed.push(op),
                    Some(PushOutcome::Failed { error }) => {
                        error!("Dropping operation {} on {}: {}", op.id, op.key(), error);
                        report.dropped += 1;
                        self.forget(&op.id).await;
                    }
                    Some(PushOutcome::InFlight) | None => requeue.push(op),
                }
            }
        }

        if !requeue.is_empty() {
            let mut superseded = Vec::new();
            {
                let mut inner = self.inner.lock().await;
                // Reverse so the earliest operation ends up at the front.
                for op in requeue.into_iter().rev() {
                    match inner.queues.push_front(op) {
                        Ok(()) => report.requeued += 1,
                        Err(op) => superseded.push(op),
                    }
                }
            }
            for op in superseded {
                // The record stays PENDING: a newer operation or the next sweep covers it.
                debug!("Not requeueing {} for {}", op.id, op.key());
                self.forget(&op.id).await;
            }
        }

        let (retried, dropped) = self.handle_failure(failed).await;
        report.retried = retried;
        report.dropped += dropped;
        report
    }

    /// Back off and downgrade failed operations, or drop them once exhausted.
    ///
    /// Returns `(requeued, dropped)`.
    pub async fn handle_failure(&self, ops: Vec<SyncOperation>) -> (usize, usize) {
        let mut requeued = Vec::new();
        let mut stale = Vec::new();
        let mut dropped = 0;
        {
            let mut inner = self.inner.lock().await;
            for mut op in ops {
                op.retry_count += 1;
                if op.retry_count >= op.max_retries {
                    error!(
                        "Operation {} on {} failed permanently after {} attempts",
                        op.id,
                        op.key(),
                        op.retry_count
                    );
                    dropped += 1;
                    stale.push(op.id);
                    continue;
                }

                let delay = self.retry.delay_for_attempt(op.retry_count);
                op.scheduled_at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(300));
                op.priority = op.priority.downgrade();
                debug!(
                    "Retrying {} in {:?} at {} (attempt {}/{})",
                    op.key(),
                    delay,
                    op.priority,
                    op.retry_count,
                    op.max_retries
                );

                if inner.queues.contains_key(&op.key()) {
                    debug!("{} was queued again, dropping retry {}", op.key(), op.id);
                    stale.push(op.id);
                    continue;
                }
                match inner.queues.push(op.clone()) {
                    Ok(replaced) => {
                        stale.extend(replaced.map(|r| r.id));
                        requeued.push(op);
                    }
                    Err(e) => {
                        // The record stays PENDING and the next full sync picks it up.
                        warn!("Could not requeue {}: {}", op.key(), e);
                        dropped += 1;
                        stale.push(op.id);
                    }
                }
            }
        }

        for id in &stale {
            self.forget(id).await;
        }
        for op in &requeued {
            self.remember(op).await;
        }
        (requeued.len(), dropped)
    }

    /// Interval before the next cycle: that of the most urgent non-empty tier.
    pub async fn next_interval(&self) -> Duration {
        let highest = self.inner.lock().await.queues.highest_non_empty();
        let snapshot = self.snapshot().await;
        snapshot
            .tables
            .intervals
            .get(highest.unwrap_or(Priority::Background))
    }

    /// Cycle until cancelled.
    pub async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        info!("Sync scheduler started");
        while !cancel.is_cancelled() {
            if let Err(e) = self.sync_cycle().await {
                error!("Sync cycle failed: {}", e);
            }
            let wait = self.next_interval().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        info!("Sync scheduler stopped");
    }

    /// Resample the context periodically until cancelled.
    pub async fn run_context_monitor(self: Arc<Self>, monitor: ContextMonitor, cancel: CancellationToken) {
        info!("Context monitor started");
        loop {
            let last_sync = self.engine.last_sync().await;
            let ctx = monitor.sample(last_sync).await;
            self.set_context(ctx).await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.context_poll_interval) => {}
            }
        }
        info!("Context monitor stopped");
    }

    /// Replace the context and its derived tables in one step.
    pub async fn set_context(&self, context: SyncContext) {
        let online = !context.is_offline();
        let tables = ScheduleTables::compute(&context, &self.config);
        *self.context.write().await = Arc::new(ContextSnapshot { context, tables });
        self.engine.set_online(online).await;
    }

    /// Modify a copy of the current context and install it.
    pub async fn update_context(&self, f: impl FnOnce(&mut SyncContext)) {
        let mut context = self.snapshot().await.context.clone();
        f(&mut context);
        self.set_context(context).await;
    }

    pub async fn snapshot(&self) -> Arc<ContextSnapshot> {
        self.context.read().await.clone()
    }

    pub async fn queue_depths(&self) -> BTreeMap<Priority, usize> {
        self.inner.lock().await.queues.depths()
    }

    /// Operations queued in one tier, front first.
    pub async fn queued(&self, priority: Priority) -> Vec<SyncOperation> {
        self.inner
            .lock()
            .await
            .queues
            .tier(priority)
            .cloned()
            .collect()
    }

    pub async fn is_syncing(&self) -> bool {
        self.inner.lock().await.is_syncing
    }

    /// Engine status plus queue depths.
    pub async fn status(&self) -> SyncStatusReport {
        let depths = self.queue_depths().await;
        self.engine.get_sync_status().await.with_queue_depths(depths)
    }

    /// Wait for immediate cycles to finish.
    pub async fn shutdown(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }

    async fn remember(&self, op: &SyncOperation) {
        if let Err(e) = self.local.save_queued_operation(op).await {
            warn!("Could not persist queued operation {}: {}", op.id, e);
        }
    }

    async fn forget(&self, op_id: &str) {
        if let Err(e) = self.local.remove_queued_operation(op_id).await {
            warn!("Could not remove queued operation {}: {}", op_id, e);
        }
    }
}

/// Priority after context adjustments.
pub fn adjust_priority(op: &SyncOperation, ctx: &SyncContext) -> Priority {
    let mut priority = op.priority;

    if ctx.has(ResourceConstraint::Battery) && matches!(priority, Priority::Medium | Priority::Low) {
        priority = Priority::Background;
    }

    if op.table_name == "conversations"
        && matches!(op.operation_type, OperationType::Create | OperationType::Update)
        && ctx.is_user_active
        && priority == Priority::High
    {
        priority = Priority::Realtime;
    }

    if ctx.has(ResourceConstraint::Storage)
        && op.operation_type == OperationType::Delete
        && priority > Priority::High
    {
        priority = Priority::High;
    }

    if matches!(ctx.network_quality, NetworkQuality::Poor | NetworkQuality::Minimal) {
        priority = match priority {
            Priority::Medium => Priority::Low,
            Priority::Low => Priority::Background,
            other => other,
        };
    }

    priority
}

/// Split a drained batch by (table, operation type), keeping first-seen order.
fn group_by_kind(batch: Vec<SyncOperation>) -> Vec<Vec<SyncOperation>> {
    let mut groups: Vec<((String, OperationType), Vec<SyncOperation>)> = Vec::new();
    for op in batch {
        let kind = (op.table_name.clone(), op.operation_type);
        match groups.iter_mut().find(|(k, _)| *k == kind) {
            Some((_, ops)) => ops.push(op),
            None => groups.push((kind, vec![op])),
        }
    }
    groups.into_iter().map(|(_, ops)| ops).collect()
}
