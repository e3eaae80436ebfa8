//! Common types used throughout Buddy sync.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Identifies a single synchronized row: the table it lives in and its id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordKey {
    pub table_name: String,
    pub record_id: String,
}

impl RecordKey {
    /// Create a new record key.
    ///
    /// # Errors
    /// - Returns error if the table name or record id is empty
    /// - Returns error if the table name contains anything but `[a-z0-9_]`
    pub fn new(table_name: impl Into<String>, record_id: impl Into<String>) -> Result<Self> {
        let table_name = table_name.into();
        let record_id = record_id.into();

        if table_name.is_empty() {
            return Err(Error::InvalidInput("Table name cannot be empty".to_string()));
        }
        if !table_name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(Error::InvalidInput(format!(
                "Invalid table name: {}",
                table_name
            )));
        }
        if record_id.trim().is_empty() {
            return Err(Error::InvalidInput("Record id cannot be empty".to_string()));
        }

        Ok(Self {
            table_name,
            record_id,
        })
    }

    pub fn table(&self) -> &str {
        &self.table_name
    }

    pub fn id(&self) -> &str {
        &self.record_id
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table_name, self.record_id)
    }
}

/// Kind of mutation carried by a sync operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    Create,
    Update,
    Delete,
    Upsert,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "CREATE",
            OperationType::Update => "UPDATE",
            OperationType::Delete => "DELETE",
            OperationType::Upsert => "UPSERT",
        }
    }

    /// Whether the operation carries a full record payload.
    pub fn carries_payload(&self) -> bool {
        !matches!(self, OperationType::Delete)
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "CREATE" | "INSERT" => Ok(OperationType::Create),
            "UPDATE" => Ok(OperationType::Update),
            "DELETE" => Ok(OperationType::Delete),
            "UPSERT" => Ok(OperationType::Upsert),
            other => Err(Error::InvalidInput(format!("Unknown operation: {}", other))),
        }
    }
}

/// Physical form factor of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Mobile,
    Watch,
    Tv,
    Car,
}

impl DeviceType {
    /// Rank used by the device-priority conflict strategy. Higher wins.
    pub fn rank(&self) -> u8 {
        match self {
            DeviceType::Desktop => 4,
            DeviceType::Mobile => 3,
            DeviceType::Watch => 2,
            DeviceType::Tv | DeviceType::Car => 1,
        }
    }

    /// Coarse performance tier of this form factor.
    pub fn capability_class(&self) -> CapabilityClass {
        match self {
            DeviceType::Desktop => CapabilityClass::High,
            DeviceType::Mobile | DeviceType::Tv => CapabilityClass::Medium,
            DeviceType::Car => CapabilityClass::Low,
            DeviceType::Watch => CapabilityClass::Constrained,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Mobile => "mobile",
            DeviceType::Watch => "watch",
            DeviceType::Tv => "tv",
            DeviceType::Car => "car",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "desktop" => Ok(DeviceType::Desktop),
            "mobile" => Ok(DeviceType::Mobile),
            "watch" => Ok(DeviceType::Watch),
            "tv" => Ok(DeviceType::Tv),
            "car" => Ok(DeviceType::Car),
            other => Err(Error::InvalidInput(format!("Unknown device type: {}", other))),
        }
    }
}

/// Coarse performance tier used to tune intervals and batch sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityClass {
    High,
    Medium,
    Low,
    Constrained,
}

/// Presence of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Online,
    Offline,
}

impl ConnectionState {
    pub fn is_online(&self) -> bool {
        matches!(self, ConnectionState::Online)
    }
}

/// Sync urgency tier. Declaration order is drain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Realtime,
    High,
    Medium,
    Low,
    Background,
}

impl Priority {
    /// All tiers, most urgent first.
    pub const ALL: [Priority; 5] = [
        Priority::Realtime,
        Priority::High,
        Priority::Medium,
        Priority::Low,
        Priority::Background,
    ];

    /// Position of this tier in [`Priority::ALL`].
    pub fn index(&self) -> usize {
        match self {
            Priority::Realtime => 0,
            Priority::High => 1,
            Priority::Medium => 2,
            Priority::Low => 3,
            Priority::Background => 4,
        }
    }

    /// Next less urgent tier. `Background` stays where it is.
    pub fn downgrade(&self) -> Self {
        match self {
            Priority::Realtime => Priority::High,
            Priority::High => Priority::Medium,
            Priority::Medium => Priority::Low,
            Priority::Low | Priority::Background => Priority::Background,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Realtime => "REALTIME",
            Priority::High => "HIGH",
            Priority::Medium => "MEDIUM",
            Priority::Low => "LOW",
            Priority::Background => "BACKGROUND",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Priority::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::InvalidInput(format!("Unknown priority: {}", s)))
    }
}

/// Algorithm used to reconcile two divergent versions of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Newer `timestamp` wins.
    LastWriterWins,
    /// Conversation-aware field merge.
    Merge,
    /// Higher-ranked device type wins.
    DevicePriority,
    /// Left in conflict for the user to decide.
    Manual,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::LastWriterWins => "last_writer_wins",
            ConflictStrategy::Merge => "merge",
            ConflictStrategy::DevicePriority => "device_priority",
            ConflictStrategy::Manual => "manual",
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "last_writer_wins" => Ok(ConflictStrategy::LastWriterWins),
            "merge" => Ok(ConflictStrategy::Merge),
            "device_priority" => Ok(ConflictStrategy::DevicePriority),
            "manual" => Ok(ConflictStrategy::Manual),
            other => Err(Error::InvalidInput(format!("Unknown strategy: {}", other))),
        }
    }
}
