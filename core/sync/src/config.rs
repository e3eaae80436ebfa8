//! Sync configuration.
//!
//! Everything tunable lives in [`SyncConfig`], loaded from a JSON file. Every
//! section is `#[serde(default)]`, so a partial file only overrides what it names.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use buddy_common::{CapabilityClass, ConflictStrategy, Priority, Result};

use crate::retry::RetryConfig;

/// Serde helper storing a [`Duration`] as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Tables whose changes also trigger an immediate sync and default to HIGH.
pub const PRIORITY_TABLES: [&str; 3] = ["conversations", "preferences", "ai_context"];

/// Tables that are synchronized at all.
pub const SYNC_TABLES: [&str; 6] = [
    "conversations",
    "preferences",
    "ai_context",
    "reminders",
    "skill_data",
    "device_settings",
];

/// One value per priority tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierTable<T> {
    pub realtime: T,
    pub high: T,
    pub medium: T,
    pub low: T,
    pub background: T,
}

impl<T: Copy> TierTable<T> {
    pub fn new(values: [T; 5]) -> Self {
        let [realtime, high, medium, low, background] = values;
        Self {
            realtime,
            high,
            medium,
            low,
            background,
        }
    }

    pub fn get(&self, priority: Priority) -> T {
        match priority {
            Priority::Realtime => self.realtime,
            Priority::High => self.high,
            Priority::Medium => self.medium,
            Priority::Low => self.low,
            Priority::Background => self.background,
        }
    }

    /// Apply `f` to every tier.
    pub fn map<U: Copy>(&self, f: impl Fn(T) -> U) -> TierTable<U> {
        TierTable {
            realtime: f(self.realtime),
            high: f(self.high),
            medium: f(self.medium),
            low: f(self.low),
            background: f(self.background),
        }
    }
}

/// One value per capability class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityTable<T> {
    pub high: T,
    pub medium: T,
    pub low: T,
    pub constrained: T,
}

impl<T: Copy> CapabilityTable<T> {
    pub fn get(&self, class: CapabilityClass) -> T {
        match class {
            CapabilityClass::High => self.high,
            CapabilityClass::Medium => self.medium,
            CapabilityClass::Low => self.low,
            CapabilityClass::Constrained => self.constrained,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub engine: EngineConfig,
    pub tracker: TrackerConfig,
    pub scheduler: SchedulerConfig,
    pub retry: RetryConfig,
    /// Capacity of the event bus channel.
    pub event_capacity: usize,
}

impl SyncConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: SyncConfig = serde_json::from_str(&raw)?;
        config.event_capacity = config.event_capacity.max(1);
        Ok(config)
    }

    /// Write configuration as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    /// Deterministic settings: no immediate syncs, no in-place retries, no backoff wait.
    pub fn for_tests() -> Self {
        let mut config = Self::default();
        config.engine.immediate_sync = false;
        config.engine.transport_retries = 0;
        config.scheduler.immediate_sync = false;
        config.retry = config.retry.with_initial_delay(Duration::ZERO);
        config
    }
}

const DEFAULT_EVENT_CAPACITY: usize = 256;

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            tracker: TrackerConfig::default(),
            scheduler: SchedulerConfig::default(),
            retry: RetryConfig::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Spawn a sync right after a priority-table change when online.
    pub immediate_sync: bool,
    pub priority_tables: Vec<String>,
    /// Conflict strategy per table.
    pub table_strategies: HashMap<String, ConflictStrategy>,
    pub default_strategy: ConflictStrategy,
    /// In-place retries of a single remote call before it counts as a failure.
    pub transport_retries: u32,
    #[serde(with = "duration_ms")]
    pub transport_retry_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let table_strategies = HashMap::from([
            ("conversations".to_string(), ConflictStrategy::Merge),
            ("ai_context".to_string(), ConflictStrategy::Merge),
            ("preferences".to_string(), ConflictStrategy::DevicePriority),
        ]);
        Self {
            immediate_sync: true,
            priority_tables: PRIORITY_TABLES.iter().map(|t| t.to_string()).collect(),
            table_strategies,
            default_strategy: ConflictStrategy::LastWriterWins,
            transport_retries: 1,
            transport_retry_delay: Duration::from_millis(200),
        }
    }
}

impl EngineConfig {
    pub fn is_priority_table(&self, table: &str) -> bool {
        self.priority_tables.iter().any(|t| t == table)
    }
}

/// Change tracker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Tables whose changes are synchronized.
    pub allowed_tables: Vec<String>,
    /// Base priority per table.
    pub table_priorities: HashMap<String, Priority>,
    pub default_priority: Priority,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            allowed_tables: SYNC_TABLES.iter().map(|t| t.to_string()).collect(),
            table_priorities: PRIORITY_TABLES
                .iter()
                .map(|t| (t.to_string(), Priority::High))
                .collect(),
            default_priority: Priority::Medium,
        }
    }
}

impl TrackerConfig {
    pub fn is_allowed(&self, table: &str) -> bool {
        self.allowed_tables.iter().any(|t| t == table)
    }

    pub fn priority_for(&self, table: &str) -> Priority {
        self.table_priorities
            .get(table)
            .copied()
            .unwrap_or(self.default_priority)
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Total operations across all tiers.
    pub queue_capacity: usize,
    /// Start a cycle right after a REALTIME/HIGH enqueue.
    pub immediate_sync: bool,
    #[serde(with = "duration_ms")]
    pub context_poll_interval: Duration,
    /// Base cycle interval per tier, in seconds.
    pub intervals_secs: CapabilityTable<TierTable<u64>>,
    /// Base batch size per tier.
    pub batch_sizes: CapabilityTable<TierTable<usize>>,
    /// Batch cap under the conservative strategy.
    pub conservative_batch_cap: usize,
    pub minimal_realtime_batch: usize,
    pub minimal_high_batch: usize,
    pub background_only_batch: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            immediate_sync: true,
            context_poll_interval: Duration::from_secs(30),
            intervals_secs: CapabilityTable {
                high: TierTable::new([1, 5, 30, 120, 600]),
                medium: TierTable::new([2, 10, 60, 300, 1800]),
                low: TierTable::new([5, 30, 180, 900, 3600]),
                constrained: TierTable::new([10, 60, 600, 1800, 7200]),
            },
            batch_sizes: CapabilityTable {
                high: TierTable::new([10, 20, 50, 100, 200]),
                medium: TierTable::new([5, 10, 25, 50, 100]),
                low: TierTable::new([3, 5, 10, 20, 50]),
                constrained: TierTable::new([1, 2, 5, 10, 20]),
            },
            conservative_batch_cap: 10,
            minimal_realtime_batch: 1,
            minimal_high_batch: 2,
            background_only_batch: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.scheduler.queue_capacity, 1000);
        assert_eq!(config.retry.max_retries, 3);
        assert!(config.tracker.is_allowed("skill_data"));
        assert!(!config.tracker.is_allowed("audit_log"));
        assert_eq!(config.tracker.priority_for("ai_context"), Priority::High);
        assert_eq!(config.tracker.priority_for("reminders"), Priority::Medium);
        assert_eq!(
            config.engine.table_strategies.get("preferences"),
            Some(&ConflictStrategy::DevicePriority)
        );
        assert!(config.engine.is_priority_table("conversations"));
    }

    #[test]
    fn test_tables_lookup() {
        let config = SchedulerConfig::default();
        let watch = config.intervals_secs.get(CapabilityClass::Constrained);
        assert_eq!(watch.get(Priority::Background), 7200);
        assert_eq!(config.batch_sizes.get(CapabilityClass::High).get(Priority::Medium), 50);
        assert_eq!(watch.map(|s| s * 2).realtime, 20);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let raw = r#"{"scheduler": {"queue_capacity": 5}, "retry": {"max_retries": 7}}"#;
        let config: SyncConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.scheduler.queue_capacity, 5);
        assert_eq!(config.scheduler.conservative_batch_cap, 10);
        assert_eq!(config.retry.max_retries, 7);
        assert_eq!(config.retry.max_delay, Duration::from_secs(300));
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("sync.json");

        let mut config = SyncConfig::default();
        config.tracker.allowed_tables.push("notes".to_string());
        config.scheduler.context_poll_interval = Duration::from_millis(1500);
        config.save(&path).unwrap();

        let loaded = SyncConfig::load(&path).unwrap();
        assert_eq!(loaded.tracker, config.tracker);
        assert_eq!(loaded.scheduler.context_poll_interval, Duration::from_millis(1500));
        assert_eq!(loaded.event_capacity, DEFAULT_EVENT_CAPACITY);
    }
}
