//! Buddy Sync Engine
//!
//! Offline-first synchronization between a user's devices:
//! - Change capture with a per-table allow-list and metadata envelope
//! - Five-tier priority queues adapted to device, network and battery context
//! - Versioned push/pull with conflict detection and pluggable resolution
//! - Retry with exponential backoff and priority downgrade
//! - Supervised background tasks with cancellation

pub mod config;
pub mod conflict;
pub mod context;
pub mod engine;
pub mod events;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod state;
pub mod tracker;

// Re-export main types
pub use config::{EngineConfig, SchedulerConfig, SyncConfig, TrackerConfig};
pub use conflict::{ConflictResolver, Resolution, ResolutionResult, Winner};
pub use context::{
    ContextMonitor, NetworkQuality, ResourceConstraint, ResourceProbe, ResourceSample, ScheduleTables,
    StaticResources, SyncContext, SyncStrategy,
};
pub use engine::{ChangeDisposition, ManualResolution, PushOutcome, SyncEngine, SyncResult};
pub use events::{EventBus, EventDispatcher, Listener, SyncEvent};
pub use queue::PriorityQueues;
pub use registry::DeviceRegistry;
pub use retry::{RetryConfig, RetryExecutor};
pub use scheduler::{adjust_priority, ContextSnapshot, CycleReport, SyncScheduler};
pub use service::SyncService;
pub use state::{SyncState, SyncStatusReport};
pub use tracker::{ChangeRequest, ChangeTracker, TrackOutcome};
