// =============================================================================
// FEDERATION DISCOVERY — change_log.rs
// Bounded change history + broadcast dedup set
// =============================================================================
//
//   entries  : applied changes, oldest evicted once over capacity
//   seen     : broadcast ids already handled, FIFO-bounded
//   recent   : debounce index for local changes (subject, type) → last record;
//              a liveness change for a subject clears the other liveness
//              types of that subject
//
// Capacity exhaustion is never an error: the oldest entry goes.
// =============================================================================

use crate::change::{ChangeType, TopologyChange};
use crate::node::{NodeId, NodeStatus};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogStats {
    pub entries: usize,
    pub seen_ids: usize,
    pub last_sequence: u64,
    pub evicted: u64,
    pub coalesced: u64,
    pub seen_evicted: u64,
}

/// What a recorded change looked like, for coalescing its repeats.
#[derive(Debug, Clone, PartialEq)]
struct DebounceMark {
    at: i64,
    status: Option<NodeStatus>,
    route: Option<Vec<NodeId>>,
}

impl DebounceMark {
    fn of(change: &TopologyChange, now_ms: i64) -> Self {
        DebounceMark {
            at: now_ms,
            status: change.resulting_status(),
            route: change.route.as_ref().map(|r| r.path.clone()),
        }
    }

    fn same_content(&self, other: &DebounceMark) -> bool {
        self.status == other.status && self.route == other.route
    }
}

#[derive(Debug)]
pub struct ChangeLog {
    origin_id: NodeId,
    next_sequence: u64,
    entries: VecDeque<TopologyChange>,
    capacity: usize,
    seen: HashSet<String>,
    seen_order: VecDeque<String>,
    seen_capacity: usize,
    debounce_ms: u64,
    recent: HashMap<(NodeId, ChangeType), DebounceMark>,
    evicted: u64,
    coalesced: u64,
    seen_evicted: u64,
}

impl ChangeLog {
    pub fn new(origin_id: &str, capacity: usize, seen_capacity: usize, debounce_ms: u64) -> Self {
        ChangeLog {
            origin_id: origin_id.to_string(),
            next_sequence: 1,
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
            seen_capacity: seen_capacity.max(1),
            debounce_ms,
            recent: HashMap::new(),
            evicted: 0,
            coalesced: 0,
            seen_evicted: 0,
        }
    }

    /// Seal and append a locally observed change.
    ///
    /// Returns `None` when the same logical change (subject, type, resulting
    /// status or route) was already recorded inside the debounce window and
    /// nothing else about that subject was recorded since.
    pub fn record_local(&mut self, mut change: TopologyChange, now_ms: i64) -> Option<TopologyChange> {
        let window = self.debounce_ms as i64;
        self.recent.retain(|_, mark| now_ms.saturating_sub(mark.at) < window);

        let key = (change.subject_node_id.clone(), change.change_type);
        let mark = DebounceMark::of(&change, now_ms);
        if let Some(last) = self.recent.get(&key) {
            if last.same_content(&mark) {
                self.coalesced += 1;
                log::debug!(
                    "[{}] coalesced {:?} for [{}] inside debounce window",
                    self.origin_id,
                    change.change_type,
                    change.subject_node_id
                );
                return None;
            }
        }

        if mark.status.is_some() {
            // a new status for the subject re-arms its other liveness types
            let subject = &change.subject_node_id;
            let kind = change.change_type;
            self.recent
                .retain(|(s, k), last| s != subject || *k == kind || last.status.is_none());
        }

        change.origin_id = self.origin_id.clone();
        change.seal(self.next_sequence);
        self.next_sequence += 1;
        self.recent.insert(key, mark);
        self.append(change.clone());
        Some(change)
    }

    /// Append a change received from another originator and applied locally.
    pub fn record_remote(&mut self, change: TopologyChange) {
        self.append(change);
    }

    fn append(&mut self, change: TopologyChange) {
        self.entries.push_back(change);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
            self.evicted += 1;
        }
    }

    pub fn seen(&self, broadcast_id: &str) -> bool {
        self.seen.contains(broadcast_id)
    }

    /// Returns `true` if the id was not already present.
    pub fn mark_seen(&mut self, broadcast_id: &str) -> bool {
        if !self.seen.insert(broadcast_id.to_string()) {
            return false;
        }
        self.seen_order.push_back(broadcast_id.to_string());
        while self.seen_order.len() > self.seen_capacity {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen.remove(&oldest);
                self.seen_evicted += 1;
            }
        }
        true
    }

    /// The most recent `limit` changes, oldest first.
    pub fn history(&self, limit: usize) -> Vec<TopologyChange> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_sequence(&self) -> u64 {
        self.next_sequence - 1
    }

    pub fn stats(&self) -> ChangeLogStats {
        ChangeLogStats {
            entries: self.entries.len(),
            seen_ids: self.seen.len(),
            last_sequence: self.last_sequence(),
            evicted: self.evicted,
            coalesced: self.coalesced,
            seen_evicted: self.seen_evicted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::DiscoveryMethod;
    use crate::node::{Node, NodeRole};
    use crate::routing::RoutingEntry;

    fn state_change(subject: &str, status: NodeStatus, at: i64) -> TopologyChange {
        let before = Node::new(subject, NodeRole::Peer, 0);
        let mut after = before.clone();
        after.status = status;
        TopologyChange::transition("ignored", before, after, DiscoveryMethod::HealthCheck, at)
    }

    #[test]
    fn test_record_local_assigns_sequence() {
        let mut log = ChangeLog::new("self", 10, 10, 1_000);
        let a = log.record_local(state_change("a", NodeStatus::Degraded, 0), 0).unwrap();
        let b = log.record_local(state_change("b", NodeStatus::Degraded, 0), 0).unwrap();
        assert_eq!(a.sequence, 1);
        assert_eq!(b.sequence, 2);
        assert_eq!(a.origin_id, "self");
        assert!(a.verify_id());
        assert_eq!(log.last_sequence(), 2);
    }

    #[test]
    fn test_debounce_coalesces_duplicates() {
        let mut log = ChangeLog::new("self", 10, 10, 1_000);
        assert!(log.record_local(state_change("a", NodeStatus::Degraded, 0), 0).is_some());
        assert!(log.record_local(state_change("a", NodeStatus::Degraded, 500), 500).is_none());
        // different resulting status is a different logical change
        assert!(log.record_local(state_change("a", NodeStatus::Online, 600), 600).is_some());
        // window elapsed
        assert!(log.record_local(state_change("a", NodeStatus::Degraded, 2_000), 2_000).is_some());

        let stats = log.stats();
        assert_eq!(stats.coalesced, 1);
        assert_eq!(stats.entries, 3);
    }

    #[test]
    fn test_flapping_node_is_reported_every_time() {
        let mut log = ChangeLog::new("self", 10, 10, 1_000);
        assert!(log.record_local(state_change("x", NodeStatus::Offline, 0), 0).is_some());
        assert!(log.record_local(state_change("x", NodeStatus::Online, 200), 200).is_some());
        let again = log.record_local(state_change("x", NodeStatus::Offline, 400), 400);
        assert_eq!(again.map(|c| c.change_type), Some(ChangeType::NodeRemoved));

        // an unrelated subject keeps its own window
        assert!(log.record_local(state_change("y", NodeStatus::Offline, 500), 500).is_some());
        assert!(log.record_local(state_change("x", NodeStatus::Online, 600), 600).is_some());
        assert!(log.record_local(state_change("y", NodeStatus::Offline, 700), 700).is_none());
        assert_eq!(log.stats().coalesced, 1);
    }

    #[test]
    fn test_route_changes_coalesce_only_on_same_path() {
        let w = crate::config::RouteWeights::default();
        let route = |path: &[&str]| {
            let path = path.iter().map(|s| s.to_string()).collect();
            TopologyChange::route_changed("self", RoutingEntry::new(path, 0.0, 1.0, &w).unwrap(), 0)
        };
        let mut log = ChangeLog::new("self", 10, 10, 1_000);
        assert!(log.record_local(route(&["a", "z"]), 0).is_some());
        assert!(log.record_local(route(&["a", "z"]), 100).is_none());
        assert!(log.record_local(route(&["b", "z"]), 200).is_some());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut log = ChangeLog::new("self", 3, 10, 0);
        for i in 0..5 {
            log.record_local(state_change(&format!("n{}", i), NodeStatus::Degraded, i), i);
        }
        assert_eq!(log.len(), 3);
        let history = log.history(10);
        assert_eq!(history[0].subject_node_id, "n2");
        assert_eq!(history[2].subject_node_id, "n4");
        assert_eq!(log.stats().evicted, 2);

        let last_two = log.history(2);
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[0].subject_node_id, "n3");
    }

    #[test]
    fn test_mark_seen_idempotent_and_bounded() {
        let mut log = ChangeLog::new("self", 10, 2, 0);
        assert!(log.mark_seen("m1"));
        assert!(!log.mark_seen("m1"));
        assert!(log.seen("m1"));

        log.mark_seen("m2");
        log.mark_seen("m3");
        assert!(!log.seen("m1"), "oldest id should be evicted first");
        assert!(log.seen("m2") && log.seen("m3"));
        assert_eq!(log.stats().seen_ids, 2);
        assert_eq!(log.stats().seen_evicted, 1);
    }
}
