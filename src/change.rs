// =============================================================================
// FEDERATION DISCOVERY — change.rs
// TopologyChange: one observed delta in the shared topology
// =============================================================================
//
// A change is created unsealed (sequence 0, empty id) by whoever observes it,
// then sealed by the ChangeLog, which assigns the originator's next sequence
// number and derives `change_id` from the content. Transit metadata
// (ttl, hops_traveled) is excluded from the hash so every copy of a change
// carries the same id.
// =============================================================================

use crate::node::{Node, NodeId, NodeStatus};
use crate::routing::RoutingEntry;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeType {
    NodeAdded,
    NodeRemoved,
    StateChanged,
    RouteChanged,
    TopologyRescanned,
}

impl ChangeType {
    pub fn priority(&self) -> Priority {
        match self {
            ChangeType::NodeRemoved => Priority::Critical,
            ChangeType::NodeAdded | ChangeType::RouteChanged => Priority::High,
            ChangeType::StateChanged => Priority::Normal,
            ChangeType::TopologyRescanned => Priority::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiscoveryMethod {
    Heartbeat,
    HealthCheck,
    Scan,
    SelfReport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyChange {
    pub change_id: String,
    pub sequence: u64,
    pub change_type: ChangeType,
    pub subject_node_id: NodeId,
    pub before: Option<Node>,
    pub after: Option<Node>,
    pub route: Option<RoutingEntry>,
    pub discovery_method: DiscoveryMethod,
    pub detected_at: i64,

    // propagation metadata
    pub origin_id: NodeId,
    pub ttl: u8,
    pub hops_traveled: u8,
    pub priority: Priority,
}

impl TopologyChange {
    pub fn new(
        origin_id: &str,
        change_type: ChangeType,
        subject_node_id: &str,
        discovery_method: DiscoveryMethod,
        detected_at: i64,
    ) -> Self {
        TopologyChange {
            change_id: String::new(),
            sequence: 0,
            change_type,
            subject_node_id: subject_node_id.to_string(),
            before: None,
            after: None,
            route: None,
            discovery_method,
            detected_at,
            origin_id: origin_id.to_string(),
            ttl: 0,
            hops_traveled: 0,
            priority: change_type.priority(),
        }
    }

    pub fn node_added(origin_id: &str, node: Node, method: DiscoveryMethod, now_ms: i64) -> Self {
        TopologyChange::new(origin_id, ChangeType::NodeAdded, &node.node_id, method, now_ms).with_after(node)
    }

    /// Offline transitions are reported as NodeRemoved, everything else as
    /// StateChanged.
    pub fn transition(origin_id: &str, before: Node, after: Node, method: DiscoveryMethod, now_ms: i64) -> Self {
        let change_type = if after.status == NodeStatus::Offline {
            ChangeType::NodeRemoved
        } else {
            ChangeType::StateChanged
        };
        TopologyChange::new(origin_id, change_type, &after.node_id, method, now_ms)
            .with_before(before)
            .with_after(after)
    }

    pub fn route_changed(origin_id: &str, route: RoutingEntry, now_ms: i64) -> Self {
        TopologyChange::new(origin_id, ChangeType::RouteChanged, &route.destination_id, DiscoveryMethod::Scan, now_ms)
            .with_route(route)
    }

    pub fn with_before(mut self, node: Node) -> Self {
        self.before = Some(node);
        self
    }

    pub fn with_after(mut self, node: Node) -> Self {
        self.after = Some(node);
        self
    }

    pub fn with_route(mut self, route: RoutingEntry) -> Self {
        self.route = Some(route);
        self
    }

    pub fn is_sealed(&self) -> bool {
        !self.change_id.is_empty() && self.sequence > 0
    }

    pub fn seal(&mut self, sequence: u64) {
        self.sequence = sequence;
        self.change_id = self.compute_id();
    }

    pub fn compute_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.origin_id.as_bytes());
        hasher.update(self.sequence.to_be_bytes());
        hasher.update(format!("{:?}", self.change_type).as_bytes());
        hasher.update(self.subject_node_id.as_bytes());
        hasher.update(format!("{:?}", self.discovery_method).as_bytes());
        hasher.update(self.detected_at.to_be_bytes());
        for part in [
            self.before.as_ref().and_then(|n| serde_json::to_vec(n).ok()),
            self.after.as_ref().and_then(|n| serde_json::to_vec(n).ok()),
            self.route.as_ref().and_then(|r| serde_json::to_vec(r).ok()),
        ] {
            match part {
                Some(bytes) => hasher.update(&bytes),
                None => hasher.update([0u8]),
            }
        }
        hex::encode(hasher.finalize())
    }

    pub fn verify_id(&self) -> bool {
        self.is_sealed() && self.change_id == self.compute_id()
    }

    pub fn resulting_status(&self) -> Option<NodeStatus> {
        self.after.as_ref().map(|n| n.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeRole;

    #[test]
    fn test_priority_derived_from_type() {
        assert_eq!(ChangeType::NodeRemoved.priority(), Priority::Critical);
        assert_eq!(ChangeType::NodeAdded.priority(), Priority::High);
        assert_eq!(ChangeType::RouteChanged.priority(), Priority::High);
        assert_eq!(ChangeType::StateChanged.priority(), Priority::Normal);
        assert_eq!(ChangeType::TopologyRescanned.priority(), Priority::Low);

        let change = TopologyChange::new("a", ChangeType::NodeRemoved, "b", DiscoveryMethod::Heartbeat, 0);
        assert_eq!(change.priority, Priority::Critical);
    }

    #[test]
    fn test_transition_type() {
        let before = Node::new("peer", NodeRole::Peer, 0);
        let mut after = before.clone();
        after.status = NodeStatus::Offline;
        let removed = TopologyChange::transition("self", before.clone(), after, DiscoveryMethod::Heartbeat, 1);
        assert_eq!(removed.change_type, ChangeType::NodeRemoved);

        let mut degraded = before.clone();
        degraded.status = NodeStatus::Degraded;
        let changed = TopologyChange::transition("self", before, degraded, DiscoveryMethod::HealthCheck, 1);
        assert_eq!(changed.change_type, ChangeType::StateChanged);
        assert_eq!(changed.resulting_status(), Some(NodeStatus::Degraded));
    }

    #[test]
    fn test_id_ignores_transit_metadata() {
        let node = Node::new("peer", NodeRole::Peer, 10);
        let mut change = TopologyChange::node_added("self", node, DiscoveryMethod::SelfReport, 10);
        assert!(!change.is_sealed());
        change.seal(1);
        assert!(change.verify_id());
        assert_eq!(change.change_id.len(), 64);

        let mut forwarded = change.clone();
        forwarded.ttl = 3;
        forwarded.hops_traveled = 2;
        assert!(forwarded.verify_id());

        let mut tampered = change.clone();
        tampered.subject_node_id = "someone-else".into();
        assert!(!tampered.verify_id());

        let mut next = change.clone();
        next.seal(2);
        assert_ne!(next.change_id, change.change_id);
    }
}
