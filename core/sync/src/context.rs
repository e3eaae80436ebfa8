//! Device and network context, and the scheduling decisions derived from it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

use buddy_common::{CapabilityClass, DeviceType, Priority};
use buddy_storage::RemoteStore;

use crate::config::{SchedulerConfig, TierTable};

const LOW_BATTERY_PERCENT: u8 = 20;
const LOW_STORAGE_MB: u64 = 500;
const LOW_MEMORY_MB: u64 = 256;

/// Observed link quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    Excellent,
    Good,
    Poor,
    Minimal,
    Offline,
}

impl NetworkQuality {
    /// Classify a successful ping round trip.
    pub fn from_latency(latency: Duration) -> Self {
        match latency.as_millis() {
            0..100 => NetworkQuality::Excellent,
            100..300 => NetworkQuality::Good,
            300..1000 => NetworkQuality::Poor,
            _ => NetworkQuality::Minimal,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, NetworkQuality::Poor | NetworkQuality::Minimal)
    }
}

/// Device resource under pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceConstraint {
    Battery,
    Storage,
    Memory,
    Processing,
}

/// Everything the scheduler adapts to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncContext {
    pub device_type: DeviceType,
    pub capability_class: CapabilityClass,
    pub network_quality: NetworkQuality,
    pub constraints: Vec<ResourceConstraint>,
    pub battery_level: Option<u8>,
    #[serde(rename = "storageFreeMB")]
    pub storage_free_mb: Option<u64>,
    #[serde(rename = "memoryAvailableMB")]
    pub memory_available_mb: Option<u64>,
    pub is_charging: bool,
    pub is_user_active: bool,
    pub last_sync: Option<DateTime<Utc>>,
}

impl SyncContext {
    /// Unconstrained context on a good link.
    pub fn for_device(device_type: DeviceType) -> Self {
        Self {
            device_type,
            capability_class: device_type.capability_class(),
            network_quality: NetworkQuality::Good,
            constraints: Vec::new(),
            battery_level: None,
            storage_free_mb: None,
            memory_available_mb: None,
            is_charging: false,
            is_user_active: false,
            last_sync: None,
        }
    }

    pub fn with_network(mut self, quality: NetworkQuality) -> Self {
        self.network_quality = quality;
        self
    }

    pub fn with_constraint(mut self, constraint: ResourceConstraint) -> Self {
        if !self.constraints.contains(&constraint) {
            self.constraints.push(constraint);
            self.constraints.sort();
        }
        self
    }

    pub fn with_user_active(mut self, active: bool) -> Self {
        self.is_user_active = active;
        self
    }

    pub fn has(&self, constraint: ResourceConstraint) -> bool {
        self.constraints.contains(&constraint)
    }

    pub fn is_offline(&self) -> bool {
        self.network_quality == NetworkQuality::Offline
    }
}

/// How a cycle drains the queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    /// Every tier at full batch size.
    Aggressive,
    /// REALTIME, HIGH and MEDIUM with capped batches.
    Conservative,
    /// Only REALTIME and HIGH, a handful at a time.
    Minimal,
    /// Only BACKGROUND.
    BackgroundOnly,
}

impl SyncStrategy {
    /// Pick the strategy for `ctx`. `None` when offline.
    pub fn select(ctx: &SyncContext) -> Option<Self> {
        if ctx.is_offline() {
            return None;
        }
        let strategy = if ctx.has(ResourceConstraint::Battery) {
            SyncStrategy::BackgroundOnly
        } else if ctx.network_quality == NetworkQuality::Minimal {
            SyncStrategy::Minimal
        } else if ctx.capability_class == CapabilityClass::High
            && matches!(ctx.network_quality, NetworkQuality::Good | NetworkQuality::Excellent)
        {
            SyncStrategy::Aggressive
        } else {
            SyncStrategy::Conservative
        };
        Some(strategy)
    }

    /// Tiers to drain, most urgent first, with how many operations to take from each.
    pub fn drain_plan(&self, tables: &ScheduleTables, config: &SchedulerConfig) -> Vec<(Priority, usize)> {
        match self {
            SyncStrategy::Aggressive => Priority::ALL
                .into_iter()
                .map(|p| (p, tables.batch_sizes.get(p)))
                .collect(),
            SyncStrategy::Conservative => [Priority::Realtime, Priority::High, Priority::Medium]
                .into_iter()
                .map(|p| (p, tables.batch_sizes.get(p).min(config.conservative_batch_cap)))
                .collect(),
            SyncStrategy::Minimal => vec![
                (Priority::Realtime, config.minimal_realtime_batch),
                (Priority::High, config.minimal_high_batch),
            ],
            SyncStrategy::BackgroundOnly => {
                vec![(Priority::Background, config.background_only_batch)]
            }
        }
    }

    /// Whether the cycle also pulls remote changes.
    pub fn pulls(&self) -> bool {
        matches!(self, SyncStrategy::Aggressive | SyncStrategy::Conservative)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStrategy::Aggressive => "aggressive",
            SyncStrategy::Conservative => "conservative",
            SyncStrategy::Minimal => "minimal",
            SyncStrategy::BackgroundOnly => "background_only",
        }
    }
}

/// Cycle interval and batch size per tier for one context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleTables {
    pub intervals: TierTable<Duration>,
    pub batch_sizes: TierTable<usize>,
}

impl ScheduleTables {
    pub fn compute(ctx: &SyncContext, config: &SchedulerConfig) -> Self {
        let mut interval_factor = match ctx.network_quality {
            NetworkQuality::Poor => 2,
            NetworkQuality::Minimal => 4,
            _ => 1,
        };
        if ctx.has(ResourceConstraint::Battery) {
            interval_factor *= 2;
        }
        let halve_batches = ctx.network_quality == NetworkQuality::Minimal;

        let intervals = config
            .intervals_secs
            .get(ctx.capability_class)
            .map(|secs| Duration::from_secs(secs.saturating_mul(interval_factor)));
        let batch_sizes = config
            .batch_sizes
            .get(ctx.capability_class)
            .map(|n| if halve_batches { (n / 2).max(1) } else { n.max(1) });

        Self {
            intervals,
            batch_sizes,
        }
    }
}

/// One reading of device resources.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSample {
    pub battery_level: Option<u8>,
    pub is_charging: bool,
    #[serde(rename = "storageFreeMB")]
    pub storage_free_mb: Option<u64>,
    #[serde(rename = "memoryAvailableMB")]
    pub memory_available_mb: Option<u64>,
    pub is_user_active: bool,
}

impl ResourceSample {
    /// Constraints implied by this sample on a device of `class`.
    pub fn constraints(&self, class: CapabilityClass) -> Vec<ResourceConstraint> {
        let mut found = Vec::new();
        if self.battery_level.is_some_and(|b| b < LOW_BATTERY_PERCENT) && !self.is_charging {
            found.push(ResourceConstraint::Battery);
        }
        if self.storage_free_mb.is_some_and(|mb| mb < LOW_STORAGE_MB) {
            found.push(ResourceConstraint::Storage);
        }
        if self.memory_available_mb.is_some_and(|mb| mb < LOW_MEMORY_MB) {
            found.push(ResourceConstraint::Memory);
        }
        if class == CapabilityClass::Constrained {
            found.push(ResourceConstraint::Processing);
        }
        found
    }
}

/// Source of resource readings (OS battery APIs, test fixtures).
#[async_trait]
pub trait ResourceProbe: Send + Sync {
    async fn sample(&self) -> ResourceSample;
}

/// Probe that reports whatever it was last given.
#[derive(Default)]
pub struct StaticResources {
    sample: RwLock<ResourceSample>,
}

impl StaticResources {
    pub fn new(sample: ResourceSample) -> Self {
        Self {
            sample: RwLock::new(sample),
        }
    }

    pub async fn set(&self, sample: ResourceSample) {
        *self.sample.write().await = sample;
    }
}

#[async_trait]
impl ResourceProbe for StaticResources {
    async fn sample(&self) -> ResourceSample {
        self.sample.read().await.clone()
    }
}

/// Samples network quality and resources into a [`SyncContext`].
pub struct ContextMonitor {
    device_type: DeviceType,
    remote: Arc<dyn RemoteStore>,
    probe: Arc<dyn ResourceProbe>,
}

impl ContextMonitor {
    pub fn new(device_type: DeviceType, remote: Arc<dyn RemoteStore>, probe: Arc<dyn ResourceProbe>) -> Self {
        Self {
            device_type,
            remote,
            probe,
        }
    }

    /// Time a ping and classify the link.
    pub async fn network_quality(&self) -> NetworkQuality {
        let started = Instant::now();
        if self.remote.ping().await {
            NetworkQuality::from_latency(started.elapsed())
        } else {
            NetworkQuality::Offline
        }
    }

    pub async fn sample(&self, last_sync: Option<DateTime<Utc>>) -> SyncContext {
        let network_quality = self.network_quality().await;
        let resources = self.probe.sample().await;
        let capability_class = self.device_type.capability_class();

        let ctx = SyncContext {
            device_type: self.device_type,
            capability_class,
            network_quality,
            constraints: resources.constraints(capability_class),
            battery_level: resources.battery_level,
            storage_free_mb: resources.storage_free_mb,
            memory_available_mb: resources.memory_available_mb,
            is_charging: resources.is_charging,
            is_user_active: resources.is_user_active,
            last_sync,
        };
        debug!(
            "Context sampled: network={:?} constraints={:?}",
            ctx.network_quality, ctx.constraints
        );
        ctx
    }
}
