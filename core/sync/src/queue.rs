//! Five-tier FIFO queue of outbound operations.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, VecDeque};

use buddy_common::{Error, Priority, RecordKey, Result, SyncOperation};

/// One FIFO per priority tier with a shared capacity.
#[derive(Debug)]
pub struct PriorityQueues {
    tiers: [VecDeque<SyncOperation>; 5],
    capacity: usize,
}

impl PriorityQueues {
    pub fn new(capacity: usize) -> Self {
        Self {
            tiers: Default::default(),
            capacity,
        }
    }

    /// Append `op` to its tier.
    ///
    /// An operation already queued for the same record is removed and returned.
    ///
    /// # Errors
    /// - Resource constraint if the queues are full and nothing is replaced
    pub fn push(&mut self, op: SyncOperation) -> Result<Option<SyncOperation>> {
        let key = op.key();
        if !self.contains_key(&key) && self.len() >= self.capacity {
            return Err(Error::ResourceConstraint(format!(
                "Sync queue full ({} operations)",
                self.capacity
            )));
        }
        let replaced = self.remove_by_key(&key);
        self.tiers[op.priority.index()].push_back(op);
        Ok(replaced)
    }

    /// Return `op` to the front of its tier.
    ///
    /// Gives the operation back when its record was queued again meanwhile or
    /// the queues are full.
    pub fn push_front(&mut self, op: SyncOperation) -> std::result::Result<(), SyncOperation> {
        if self.contains_key(&op.key()) || self.len() >= self.capacity {
            return Err(op);
        }
        self.tiers[op.priority.index()].push_front(op);
        Ok(())
    }

    /// Remove up to `max` ready operations from the head side of a tier.
    ///
    /// Operations still waiting on backoff stay where they are.
    pub fn take_ready(&mut self, priority: Priority, max: usize, now: DateTime<Utc>) -> Vec<SyncOperation> {
        let tier = &mut self.tiers[priority.index()];
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(tier.len());
        while let Some(op) = tier.pop_front() {
            if taken.len() < max && op.is_ready(now) {
                taken.push(op);
            } else {
                kept.push_back(op);
            }
        }
        *tier = kept;
        taken
    }

    pub fn remove_by_key(&mut self, key: &RecordKey) -> Option<SyncOperation> {
        for tier in self.tiers.iter_mut() {
            if let Some(pos) = tier.iter().position(|op| same_record(op, key)) {
                return tier.remove(pos);
            }
        }
        None
    }

    pub fn contains_key(&self, key: &RecordKey) -> bool {
        self.tiers
            .iter()
            .flatten()
            .any(|op| same_record(op, key))
    }

    /// Most urgent tier holding anything.
    pub fn highest_non_empty(&self) -> Option<Priority> {
        Priority::ALL
            .into_iter()
            .find(|p| !self.tiers[p.index()].is_empty())
    }

    pub fn tier(&self, priority: Priority) -> impl Iterator<Item = &SyncOperation> {
        self.tiers[priority.index()].iter()
    }

    pub fn depths(&self) -> BTreeMap<Priority, usize> {
        Priority::ALL
            .into_iter()
            .map(|p| (p, self.tiers[p.index()].len()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

fn same_record(op: &SyncOperation, key: &RecordKey) -> bool {
    op.table_name == key.table_name && op.record_id == key.record_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use buddy_common::OperationType;
    use proptest::prelude::*;
    use serde_json::json;

    fn op(id: &str, priority: Priority) -> SyncOperation {
        let key = RecordKey::new("reminders", id).unwrap();
        SyncOperation::new(&key, OperationType::Update, json!({"id": id}), priority, "u1", "d1", 3)
    }

    #[test]
    fn test_push_coalesces_same_key() {
        let mut queues = PriorityQueues::new(10);
        queues.push(op("a", Priority::Medium)).unwrap();
        let replaced = queues.push(op("a", Priority::High)).unwrap();

        assert_eq!(replaced.unwrap().priority, Priority::Medium);
        assert_eq!(queues.len(), 1);
        assert_eq!(queues.highest_non_empty(), Some(Priority::High));
    }

    #[test]
    fn test_capacity_refuses_new_keys_only() {
        let mut queues = PriorityQueues::new(2);
        queues.push(op("a", Priority::Low)).unwrap();
        queues.push(op("b", Priority::Low)).unwrap();

        assert!(matches!(
            queues.push(op("c", Priority::Low)),
            Err(Error::ResourceConstraint(_))
        ));
        assert!(queues.push(op("b", Priority::High)).unwrap().is_some());
        assert_eq!(queues.len(), 2);
    }

    #[test]
    fn test_push_front_keeps_newer_operation() {
        let mut queues = PriorityQueues::new(10);
        let stale = op("a", Priority::High);
        queues.push(op("b", Priority::High)).unwrap();
        let fresh = op("a", Priority::High);
        let fresh_id = fresh.id.clone();
        queues.push(fresh).unwrap();

        let returned = queues.push_front(stale.clone()).unwrap_err();
        assert_eq!(returned.id, stale.id);
        assert_eq!(queues.len(), 2);
        assert!(queues.tier(Priority::High).any(|o| o.id == fresh_id));
    }

    #[test]
    fn test_push_front_respects_capacity() {
        let mut queues = PriorityQueues::new(1);
        queues.push(op("a", Priority::Low)).unwrap();

        assert!(queues.push_front(op("b", Priority::High)).is_err());
        assert_eq!(queues.len(), 1);

        let mut roomy = PriorityQueues::new(2);
        roomy.push(op("a", Priority::High)).unwrap();
        roomy.push_front(op("b", Priority::High)).unwrap();
        let order: Vec<&str> = roomy.tier(Priority::High).map(|o| o.record_id.as_str()).collect();
        assert_eq!(order, vec!["b", "a"]);
    }

    #[test]
    fn test_take_ready_skips_waiting_ops_in_place() {
        let mut queues = PriorityQueues::new(10);
        let mut waiting = op("a", Priority::High);
        waiting.scheduled_at = Utc::now() + chrono::Duration::seconds(60);
        queues.push(waiting).unwrap();
        queues.push(op("b", Priority::High)).unwrap();
        queues.push(op("c", Priority::High)).unwrap();

        let taken = queues.take_ready(Priority::High, 1, Utc::now());
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].record_id, "b");

        let remaining: Vec<&str> = queues.tier(Priority::High).map(|o| o.record_id.as_str()).collect();
        assert_eq!(remaining, vec!["a", "c"]);
    }

    #[test]
    fn test_depths_cover_every_tier() {
        let mut queues = PriorityQueues::new(10);
        queues.push(op("a", Priority::Background)).unwrap();
        let depths = queues.depths();
        assert_eq!(depths.len(), 5);
        assert_eq!(depths[&Priority::Background], 1);
        assert_eq!(depths[&Priority::Realtime], 0);
        assert_eq!(queues.highest_non_empty(), Some(Priority::Background));
    }

    proptest! {
        #[test]
        fn prop_fifo_within_tier(count in 1usize..40, batch in 1usize..10) {
            let mut queues = PriorityQueues::new(100);
            for i in 0..count {
                queues.push(op(&format!("r{:03}", i), Priority::Medium)).unwrap();
            }

            let mut drained = Vec::new();
            loop {
                let taken = queues.take_ready(Priority::Medium, batch, Utc::now());
                if taken.is_empty() {
                    break;
                }
                drained.extend(taken.into_iter().map(|o| o.record_id));
            }

            let expected: Vec<String> = (0..count).map(|i| format!("r{:03}", i)).collect();
            prop_assert_eq!(drained, expected);
        }
    }
}
