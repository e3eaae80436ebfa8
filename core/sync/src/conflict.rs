//! Conflict resolution.
//!
//! Every strategy is a pure function of the two payloads: the same inputs always
//! produce the same output, independent of which device runs it.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

use buddy_common::{ConflictStrategy, DeviceType, Error, Result, SYNC_ENVELOPE_KEY};

use crate::config::EngineConfig;

/// Epoch values above this are milliseconds rather than seconds.
const MILLIS_THRESHOLD: f64 = 1e11;

/// Which side a resolution took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    Local,
    Remote,
    Merged,
}

/// Outcome of an automatic resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub data: Value,
    pub winner: Winner,
}

impl Resolution {
    fn local(data: &Value) -> Self {
        Self {
            data: data.clone(),
            winner: Winner::Local,
        }
    }

    fn remote(data: &Value) -> Self {
        Self {
            data: data.clone(),
            winner: Winner::Remote,
        }
    }
}

/// Result of running the configured strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionResult {
    Resolved(Resolution),
    /// MANUAL strategy: left for the user.
    Pending,
}

/// Picks a strategy per table and applies it.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    default_strategy: ConflictStrategy,
    table_strategies: HashMap<String, ConflictStrategy>,
}

impl ConflictResolver {
    pub fn new(default_strategy: ConflictStrategy) -> Self {
        Self {
            default_strategy,
            table_strategies: HashMap::new(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            default_strategy: config.default_strategy,
            table_strategies: config.table_strategies.clone(),
        }
    }

    /// Override the strategy for one table.
    pub fn with_table_strategy(mut self, table: impl Into<String>, strategy: ConflictStrategy) -> Self {
        self.table_strategies.insert(table.into(), strategy);
        self
    }

    pub fn strategy_for(&self, table: &str) -> ConflictStrategy {
        self.table_strategies
            .get(table)
            .copied()
            .unwrap_or(self.default_strategy)
    }

    /// Resolve with the table's strategy.
    pub fn resolve(&self, table: &str, local: &Value, remote: &Value) -> Result<ResolutionResult> {
        resolve_with(self.strategy_for(table), local, remote)
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Resolve with an explicit strategy.
///
/// # Errors
/// - Validation error if MERGE is asked to combine non-object payloads
pub fn resolve_with(strategy: ConflictStrategy, local: &Value, remote: &Value) -> Result<ResolutionResult> {
    let resolution = match strategy {
        ConflictStrategy::LastWriterWins => last_writer_wins(local, remote),
        ConflictStrategy::DevicePriority => device_priority(local, remote),
        ConflictStrategy::Merge => Resolution {
            data: merge_conversation(local, remote)?,
            winner: Winner::Merged,
        },
        ConflictStrategy::Manual => return Ok(ResolutionResult::Pending),
    };
    Ok(ResolutionResult::Resolved(resolution))
}

/// The newer `timestamp` wins. Ties and unparseable timestamps keep local.
pub fn last_writer_wins(local: &Value, remote: &Value) -> Resolution {
    match (extract_timestamp(local), extract_timestamp(remote)) {
        (Some(l), Some(r)) if r > l => Resolution::remote(remote),
        _ => Resolution::local(local),
    }
}

/// The higher-ranked device type wins. Ties keep local.
pub fn device_priority(local: &Value, remote: &Value) -> Resolution {
    let rank = |v: &Value| extract_device_type(v).map(|t| t.rank()).unwrap_or(0);
    if rank(remote) > rank(local) {
        Resolution::remote(remote)
    } else {
        Resolution::local(local)
    }
}

/// Conversation-aware merge.
///
/// Starts from the remote copy, keeps local `deviceMetadata`, unions `messages`
/// by id (local wins on collision) ordered by timestamp, overlays local
/// `context` keys on remote ones and keeps the later `timestamp`.
pub fn merge_conversation(local: &Value, remote: &Value) -> Result<Value> {
    let (Some(local_map), Some(remote_map)) = (local.as_object(), remote.as_object()) else {
        return Err(Error::Validation(
            "merge needs object payloads on both sides".to_string(),
        ));
    };

    let mut merged = remote_map.clone();

    if let Some(meta) = local_map.get("deviceMetadata") {
        merged.insert("deviceMetadata".to_string(), meta.clone());
    }

    if local_map.contains_key("messages") || remote_map.contains_key("messages") {
        merged.insert(
            "messages".to_string(),
            Value::Array(merge_messages(
                local_map.get("messages"),
                remote_map.get("messages"),
            )),
        );
    }

    let local_ctx = local_map.get("context").and_then(Value::as_object);
    let remote_ctx = remote_map.get("context").and_then(Value::as_object);
    if local_ctx.is_some() || remote_ctx.is_some() {
        let mut context: Map<String, Value> = remote_ctx.cloned().unwrap_or_default();
        if let Some(local_ctx) = local_ctx {
            for (k, v) in local_ctx {
                context.insert(k.clone(), v.clone());
            }
        }
        merged.insert("context".to_string(), Value::Object(context));
    }

    let local_ts = local_map.get("timestamp");
    let remote_ts = remote_map.get("timestamp");
    let later = match (
        local_ts.and_then(parse_timestamp),
        remote_ts.and_then(parse_timestamp),
    ) {
        (Some(l), Some(r)) if r > l => remote_ts,
        (Some(_), _) => local_ts,
        (None, Some(_)) => remote_ts,
        (None, None) => None,
    };
    if let Some(ts) = later {
        merged.insert("timestamp".to_string(), ts.clone());
    }

    Ok(Value::Object(merged))
}

fn merge_messages(local: Option<&Value>, remote: Option<&Value>) -> Vec<Value> {
    let as_slice = |v: Option<&Value>| -> Vec<Value> {
        v.and_then(Value::as_array).cloned().unwrap_or_default()
    };
    let local = as_slice(local);
    let remote = as_slice(remote);

    let local_ids: HashSet<String> = local.iter().filter_map(message_id).collect();

    let mut messages = local;
    messages.extend(
        remote
            .into_iter()
            .filter(|m| message_id(m).is_none_or(|id| !local_ids.contains(&id))),
    );

    // Stable: equal timestamps keep local-before-remote order. Untimed messages go last.
    messages.sort_by_key(|m| {
        let ts = m
            .get("timestamp")
            .or_else(|| m.get("ts"))
            .and_then(parse_timestamp);
        (ts.is_none(), ts)
    });
    messages
}

fn message_id(message: &Value) -> Option<String> {
    match message.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// The payload's `timestamp`, falling back to `_sync.timestamp`.
pub fn extract_timestamp(data: &Value) -> Option<DateTime<Utc>> {
    data.get("timestamp")
        .and_then(parse_timestamp)
        .or_else(|| {
            data.get(SYNC_ENVELOPE_KEY)
                .and_then(|env| env.get("timestamp"))
                .and_then(parse_timestamp)
        })
}

fn extract_device_type(data: &Value) -> Option<DeviceType> {
    data.get("deviceType")
        .or_else(|| data.get(SYNC_ENVELOPE_KEY).and_then(|env| env.get("deviceType")))
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
}

/// Normalize an RFC 3339 string or a numeric epoch to a UTC instant.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| s.trim().parse::<f64>().ok().and_then(from_epoch)),
        Value::Number(n) => n.as_f64().and_then(from_epoch),
        _ => None,
    }
}

fn from_epoch(raw: f64) -> Option<DateTime<Utc>> {
    if !raw.is_finite() {
        return None;
    }
    let millis = if raw.abs() > MILLIS_THRESHOLD {
        raw
    } else {
        raw * 1000.0
    };
    Utc.timestamp_millis_opt(millis as i64).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_last_writer_wins_numeric() {
        let local = json!({"value": "a", "timestamp": 100});
        let remote = json!({"value": "b", "timestamp": 200});
        let resolution = last_writer_wins(&local, &remote);
        assert_eq!(resolution.winner, Winner::Remote);
        assert_eq!(resolution.data, remote);
    }

    #[test]
    fn test_last_writer_wins_mixed_formats() {
        // 2024-01-01T00:00:00Z in millis vs an RFC 3339 string a second later
        let local = json!({"timestamp": 1_704_067_200_000_i64});
        let remote = json!({"timestamp": "2024-01-01T00:00:01Z"});
        assert_eq!(last_writer_wins(&local, &remote).winner, Winner::Remote);

        let remote_older = json!({"timestamp": "2023-12-31T23:59:59Z"});
        assert_eq!(last_writer_wins(&local, &remote_older).winner, Winner::Local);
    }

    #[test]
    fn test_last_writer_wins_envelope_fallback() {
        let local = json!({"v": 1, "_sync": {"timestamp": "2024-05-01T10:00:00Z"}});
        let remote = json!({"v": 2, "_sync": {"timestamp": "2024-05-01T09:00:00Z"}});
        assert_eq!(last_writer_wins(&local, &remote).winner, Winner::Local);
    }

    #[test]
    fn test_last_writer_wins_ties_and_garbage_keep_local() {
        let local = json!({"timestamp": 100});
        assert_eq!(last_writer_wins(&local, &json!({"timestamp": 100})).winner, Winner::Local);
        assert_eq!(last_writer_wins(&local, &json!({"timestamp": "soon"})).winner, Winner::Local);
        assert_eq!(last_writer_wins(&json!({}), &json!({"timestamp": 5})).winner, Winner::Local);
    }

    #[test]
    fn test_merge_conversation_messages() {
        let local = json!({
            "messages": [{"id": 1, "ts": 1}, {"id": 2, "ts": 3}],
            "deviceMetadata": {"device": "d1"},
            "context": {"topic": "travel", "mood": "calm"},
            "timestamp": 10
        });
        let remote = json!({
            "messages": [{"id": 2, "ts": 2}, {"id": 3, "ts": 4}],
            "deviceMetadata": {"device": "d2"},
            "context": {"topic": "work", "lang": "en"},
            "title": "Trip",
            "timestamp": 20
        });

        let merged = merge_conversation(&local, &remote).unwrap();
        assert_eq!(
            merged["messages"],
            json!([{"id": 1, "ts": 1}, {"id": 2, "ts": 3}, {"id": 3, "ts": 4}])
        );
        assert_eq!(merged["deviceMetadata"], json!({"device": "d1"}));
        assert_eq!(
            merged["context"],
            json!({"topic": "travel", "mood": "calm", "lang": "en"})
        );
        assert_eq!(merged["title"], "Trip");
        assert_eq!(merged["timestamp"], 20);
    }

    #[test]
    fn test_merge_rejects_non_objects() {
        assert!(matches!(
            merge_conversation(&json!([1, 2]), &json!({})),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_device_priority() {
        let local = json!({"value": "light", "_sync": {"deviceType": "watch"}});
        let remote = json!({"value": "dark", "deviceType": "desktop"});
        let resolution = device_priority(&local, &remote);
        assert_eq!(resolution.winner, Winner::Remote);
        assert_eq!(resolution.data["value"], "dark");

        let tv = json!({"deviceType": "tv"});
        let car = json!({"deviceType": "car"});
        assert_eq!(device_priority(&tv, &car).winner, Winner::Local);
    }

    #[test]
    fn test_resolver_strategy_per_table() {
        let resolver = ConflictResolver::default();
        assert_eq!(resolver.strategy_for("conversations"), ConflictStrategy::Merge);
        assert_eq!(resolver.strategy_for("preferences"), ConflictStrategy::DevicePriority);
        assert_eq!(resolver.strategy_for("reminders"), ConflictStrategy::LastWriterWins);

        let resolver = resolver.with_table_strategy("reminders", ConflictStrategy::Manual);
        assert_eq!(
            resolver.resolve("reminders", &json!({}), &json!({})).unwrap(),
            ResolutionResult::Pending
        );
    }

    proptest! {
        #[test]
        fn prop_last_writer_wins_is_deterministic(a in 0i64..4_000_000_000, b in 0i64..4_000_000_000) {
            let local = json!({"timestamp": a, "side": "local"});
            let remote = json!({"timestamp": b, "side": "remote"});

            let first = last_writer_wins(&local, &remote);
            let second = last_writer_wins(&local, &remote);
            prop_assert_eq!(&first, &second);

            let expected = if b > a { "remote" } else { "local" };
            prop_assert_eq!(first.data["side"].as_str(), Some(expected));
        }

        #[test]
        fn prop_merge_is_deterministic(ids in proptest::collection::vec((0u8..20, 0u32..100), 0..12)) {
            let (left, right) = ids.split_at(ids.len() / 2);
            let to_msgs = |items: &[(u8, u32)]| -> Value {
                Value::Array(items.iter().map(|(id, ts)| json!({"id": id, "ts": ts})).collect())
            };
            let local = json!({"messages": to_msgs(left)});
            let remote = json!({"messages": to_msgs(right)});

            let first = merge_conversation(&local, &remote).unwrap();
            prop_assert_eq!(&first, &merge_conversation(&local, &remote).unwrap());

            let merged = first["messages"].as_array().unwrap();
            let stamps: Vec<u64> = merged.iter().map(|m| m["ts"].as_u64().unwrap()).collect();
            prop_assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
        }
    }
}
