//! Event fan-out to local listeners.
//!
//! Producers publish into a bounded channel without waiting; a single
//! [`EventDispatcher`] task hands each event to the registered listeners. A
//! failing or panicking listener is logged and skipped.

use serde::Serialize;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use buddy_common::{ConflictStrategy, DeviceType, OperationType, Priority, RecordKey, Result};

use crate::conflict::Winner;

/// Something listeners may care about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    DeviceConnected {
        device_id: String,
        user_id: String,
        device_type: DeviceType,
    },
    DeviceStatusChanged {
        device_id: String,
        online: bool,
    },
    ChangeTracked {
        key: RecordKey,
        operation: OperationType,
        /// `None` when the change was recorded but not queued.
        priority: Option<Priority>,
        data: Value,
    },
    ConflictResolved {
        key: RecordKey,
        strategy: ConflictStrategy,
        /// `None` while the conflict is still open.
        winner: Option<Winner>,
    },
    CycleCompleted {
        pushed: usize,
        failed: usize,
        conflicts: usize,
        pulled: usize,
    },
}

impl SyncEvent {
    /// Table the event concerns, if any.
    pub fn table(&self) -> Option<&str> {
        match self {
            SyncEvent::ChangeTracked { key, .. } | SyncEvent::ConflictResolved { key, .. } => {
                Some(key.table())
            }
            _ => None,
        }
    }
}

/// Listener callback.
pub type Listener = Arc<dyn Fn(&SyncEvent) -> Result<()> + Send + Sync>;

struct Subscription {
    table: Option<String>,
    callback: Listener,
}

/// Publishing half. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<SyncEvent>,
    listeners: Arc<RwLock<Vec<Subscription>>>,
}

impl EventBus {
    /// Create a bus and the dispatcher that must be run to deliver its events.
    pub fn channel(capacity: usize) -> (Self, EventDispatcher) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let listeners = Arc::new(RwLock::new(Vec::new()));
        let bus = Self {
            tx,
            listeners: listeners.clone(),
        };
        (bus, EventDispatcher { rx, listeners })
    }

    /// Queue an event. Never waits; a full channel drops the event.
    pub fn publish(&self, event: SyncEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!("Event channel full, dropping {:?}", event);
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Event dispatcher gone, event discarded");
            }
        }
    }

    /// Register a listener, optionally restricted to one table.
    pub async fn subscribe(&self, table: Option<&str>, callback: Listener) {
        self.listeners.write().await.push(Subscription {
            table: table.map(str::to_string),
            callback,
        });
    }

    pub async fn listener_count(&self) -> usize {
        self.listeners.read().await.len()
    }
}

/// Consuming half of the bus.
pub struct EventDispatcher {
    rx: mpsc::Receiver<SyncEvent>,
    listeners: Arc<RwLock<Vec<Subscription>>>,
}

impl EventDispatcher {
    /// Deliver events until cancelled or every bus handle is dropped.
    ///
    /// Events already queued at cancellation are still delivered.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Event dispatcher started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.rx.recv() => match event {
                    Some(event) => self.dispatch(&event).await,
                    None => break,
                },
            }
        }

        self.rx.close();
        while let Some(event) = self.rx.recv().await {
            self.dispatch(&event).await;
        }
        info!("Event dispatcher stopped");
    }

    async fn dispatch(&self, event: &SyncEvent) {
        let listeners = self.listeners.read().await;
        for sub in listeners.iter() {
            if let Some(table) = &sub.table {
                if event.table() != Some(table.as_str()) {
                    continue;
                }
            }
            match catch_unwind(AssertUnwindSafe(|| (sub.callback)(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Listener failed on {:?}: {}", event, e),
                Err(_) => error!("Listener panicked on {:?}", event),
            }
        }
    }
}
