// =============================================================================
// FEDERATION DISCOVERY — message.rs
// Wire envelope exchanged through the Transport
// =============================================================================

use crate::change::TopologyChange;
use crate::change::Priority;
use crate::constants::PROTOCOL_VERSION;
use crate::error::{DiscoveryError, Result};
use crate::node::{Node, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Discover,
    Announce,
    Heartbeat,
    ChangeBroadcast,
}

/// Fan-out strategy. Chosen once by the originator from the change
/// priority and carried unchanged on every hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropagationPattern {
    Flood,
    Hierarchical,
    Gossip,
}

impl PropagationPattern {
    pub fn for_priority(priority: Priority) -> Self {
        match priority {
            Priority::Critical => PropagationPattern::Flood,
            Priority::High => PropagationPattern::Hierarchical,
            Priority::Normal | Priority::Low => PropagationPattern::Gossip,
        }
    }

    pub fn requires_ack(&self) -> bool {
        matches!(self, PropagationPattern::Flood)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessagePayload {
    /// Join request; answered with an Announce carrying known peers.
    Discover { node: Node },
    Announce { node: Node, known_peers: Vec<Node> },
    Heartbeat { node_id: NodeId, timestamp: i64 },
    ChangeBroadcast { changes: Vec<TopologyChange> },
}

impl MessagePayload {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessagePayload::Discover { .. } => MessageKind::Discover,
            MessagePayload::Announce { .. } => MessageKind::Announce,
            MessagePayload::Heartbeat { .. } => MessageKind::Heartbeat,
            MessagePayload::ChangeBroadcast { .. } => MessageKind::ChangeBroadcast,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryMessage {
    pub message_id: String,
    pub kind: MessageKind,
    pub origin_id: NodeId,
    pub sequence: u64,
    pub ttl: u8,
    /// Originator first, each relaying node appended.
    pub path: Vec<NodeId>,
    pub pattern: Option<PropagationPattern>,
    pub require_ack: bool,
    pub protocol_version: String,
    pub sent_at: i64,
    pub payload: MessagePayload,
}

impl DiscoveryMessage {
    pub fn new(origin_id: &str, sequence: u64, payload: MessagePayload, now_ms: i64) -> Self {
        DiscoveryMessage {
            message_id: uuid::Uuid::new_v4().to_string(),
            kind: payload.kind(),
            origin_id: origin_id.to_string(),
            sequence,
            ttl: 0,
            path: vec![origin_id.to_string()],
            pattern: None,
            require_ack: false,
            protocol_version: PROTOCOL_VERSION.to_string(),
            sent_at: now_ms,
            payload,
        }
    }

    pub fn discover(node: Node, sequence: u64, now_ms: i64) -> Self {
        let origin = node.node_id.clone();
        DiscoveryMessage::new(&origin, sequence, MessagePayload::Discover { node }, now_ms)
    }

    pub fn announce(node: Node, known_peers: Vec<Node>, sequence: u64, now_ms: i64) -> Self {
        let origin = node.node_id.clone();
        DiscoveryMessage::new(&origin, sequence, MessagePayload::Announce { node, known_peers }, now_ms)
    }

    pub fn heartbeat(node_id: &str, sequence: u64, now_ms: i64) -> Self {
        let payload = MessagePayload::Heartbeat { node_id: node_id.to_string(), timestamp: now_ms };
        DiscoveryMessage::new(node_id, sequence, payload, now_ms)
    }

    /// Envelope for freshly originated changes. The envelope sequence is the
    /// highest change sequence it carries.
    pub fn change_broadcast(
        origin_id: &str,
        mut changes: Vec<TopologyChange>,
        pattern: PropagationPattern,
        ttl: u8,
        now_ms: i64,
    ) -> Self {
        for change in changes.iter_mut() {
            change.ttl = ttl;
        }
        let sequence = changes.iter().map(|c| c.sequence).max().unwrap_or(0);
        let mut msg = DiscoveryMessage::new(origin_id, sequence, MessagePayload::ChangeBroadcast { changes }, now_ms);
        msg.ttl = ttl;
        msg.pattern = Some(pattern);
        msg.require_ack = pattern.requires_ack();
        msg
    }

    pub fn changes(&self) -> &[TopologyChange] {
        match &self.payload {
            MessagePayload::ChangeBroadcast { changes } => changes,
            _ => &[],
        }
    }

    /// The neighbour that handed us this message.
    pub fn sender(&self) -> Option<&NodeId> {
        self.path.last()
    }

    /// Copy for the next hop: ttl decremented, relay appended to the path.
    /// Same message id, so every node dedups every copy.
    pub fn forwarded(&self, relay_id: &str, now_ms: i64) -> Option<Self> {
        if self.ttl == 0 {
            return None;
        }
        let mut next = self.clone();
        next.ttl -= 1;
        next.path.push(relay_id.to_string());
        next.sent_at = now_ms;
        if let MessagePayload::ChangeBroadcast { changes } = &mut next.payload {
            for change in changes.iter_mut() {
                change.ttl = next.ttl;
                change.hops_traveled = change.hops_traveled.saturating_add(1);
            }
        }
        Some(next)
    }

    pub fn validate(&self, max_ttl: u8) -> Result<()> {
        let malformed = |reason: String| DiscoveryError::Malformed {
            message_id: self.message_id.clone(),
            reason,
        };

        if self.message_id.trim().is_empty() {
            return Err(malformed("empty message id".into()));
        }
        if self.origin_id.trim().is_empty() {
            return Err(malformed("empty origin id".into()));
        }
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(malformed(format!("incompatible protocol {}", self.protocol_version)));
        }
        if self.kind != self.payload.kind() {
            return Err(malformed(format!("kind {:?} does not match payload {:?}", self.kind, self.payload.kind())));
        }
        if self.ttl > max_ttl {
            return Err(malformed(format!("ttl {} exceeds max {}", self.ttl, max_ttl)));
        }
        if self.path.first() != Some(&self.origin_id) {
            return Err(malformed("path does not start at the origin".into()));
        }
        let mut hops = HashSet::with_capacity(self.path.len());
        if !self.path.iter().all(|hop| !hop.is_empty() && hops.insert(hop)) {
            return Err(malformed("path contains a cycle or empty hop".into()));
        }

        match &self.payload {
            MessagePayload::Discover { node } | MessagePayload::Announce { node, .. } => {
                if node.node_id != self.origin_id {
                    return Err(malformed(format!("announced node {} is not the origin", node.node_id)));
                }
            }
            MessagePayload::Heartbeat { node_id, .. } => {
                if node_id != &self.origin_id {
                    return Err(malformed(format!("heartbeat for {} sent by {}", node_id, self.origin_id)));
                }
            }
            MessagePayload::ChangeBroadcast { changes } => {
                if changes.is_empty() {
                    return Err(malformed("broadcast carries no changes".into()));
                }
                if self.pattern.is_none() {
                    return Err(malformed("broadcast without a propagation pattern".into()));
                }
                for change in changes {
                    if change.subject_node_id.is_empty() {
                        return Err(malformed("change without a subject".into()));
                    }
                    if change.priority != change.change_type.priority() {
                        return Err(malformed(format!("change {} has inconsistent priority", change.change_id)));
                    }
                    if !change.verify_id() {
                        return Err(malformed(format!("change {} fails its content hash", change.change_id)));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::DiscoveryMethod;
    use crate::node::NodeRole;

    fn broadcast() -> DiscoveryMessage {
        let mut change = TopologyChange::node_added(
            "origin",
            Node::new("origin", NodeRole::Peer, 0),
            DiscoveryMethod::SelfReport,
            0,
        );
        change.seal(4);
        DiscoveryMessage::change_broadcast("origin", vec![change], PropagationPattern::Hierarchical, 3, 0)
    }

    #[test]
    fn test_pattern_for_priority() {
        assert_eq!(PropagationPattern::for_priority(Priority::Critical), PropagationPattern::Flood);
        assert_eq!(PropagationPattern::for_priority(Priority::High), PropagationPattern::Hierarchical);
        assert_eq!(PropagationPattern::for_priority(Priority::Normal), PropagationPattern::Gossip);
        assert_eq!(PropagationPattern::for_priority(Priority::Low), PropagationPattern::Gossip);
        assert!(PropagationPattern::Flood.requires_ack());
        assert!(!PropagationPattern::Gossip.requires_ack());
    }

    #[test]
    fn test_forwarding_decrements_ttl() {
        let msg = broadcast();
        assert_eq!(msg.sequence, 4);
        assert!(msg.validate(10).is_ok());

        let hop1 = msg.forwarded("relay1", 1).unwrap();
        assert_eq!(hop1.message_id, msg.message_id);
        assert_eq!(hop1.ttl, 2);
        assert_eq!(hop1.path, vec!["origin".to_string(), "relay1".to_string()]);
        assert_eq!(hop1.changes()[0].hops_traveled, 1);
        assert_eq!(hop1.pattern, Some(PropagationPattern::Hierarchical));
        assert!(hop1.validate(10).is_ok(), "forwarding keeps change ids valid");

        let hop3 = hop1.forwarded("relay2", 2).unwrap().forwarded("relay3", 3).unwrap();
        assert_eq!(hop3.ttl, 0);
        assert!(hop3.forwarded("relay4", 4).is_none());
    }

    #[test]
    fn test_validation_catches_malformed() {
        let mut kind_mismatch = broadcast();
        kind_mismatch.kind = MessageKind::Heartbeat;
        assert!(kind_mismatch.validate(10).is_err());

        let mut looped = broadcast();
        looped.path = vec!["origin".into(), "a".into(), "origin".into()];
        assert!(looped.validate(10).is_err());

        let mut too_long = broadcast();
        too_long.ttl = 11;
        assert!(too_long.validate(10).is_err());

        let mut forged = broadcast();
        if let MessagePayload::ChangeBroadcast { changes } = &mut forged.payload {
            changes[0].sequence = 99;
        }
        assert!(forged.validate(10).is_err());

        let spoofed = DiscoveryMessage {
            origin_id: "mallory".into(),
            path: vec!["mallory".into()],
            ..DiscoveryMessage::heartbeat("alice", 1, 0)
        };
        assert!(spoofed.validate(10).is_err());
    }

    #[test]
    fn test_json_codec() {
        let msg = broadcast();
        let json = msg.to_json().unwrap();
        assert!(json.contains("ChangeBroadcast"));
        assert_eq!(DiscoveryMessage::from_json(&json).unwrap(), msg);
        assert!(DiscoveryMessage::from_json("{not json").is_err());
    }

    #[test]
    fn test_json_keeps_change_ids_with_measured_estimates() {
        let mut node = Node::new("measured", NodeRole::Relay, 0);
        for i in 0..500i64 {
            if i % 3 == 0 {
                node.record_failure();
            } else {
                node.record_success(Some(1.0 + (i % 17) as f64 * 0.37), i);
            }

            let mut change = TopologyChange::node_added("origin", node.clone(), DiscoveryMethod::HealthCheck, i);
            change.seal(i as u64 + 1);
            let msg = DiscoveryMessage::change_broadcast("origin", vec![change], PropagationPattern::Hierarchical, 3, i);

            let decoded = DiscoveryMessage::from_json(&msg.to_json().unwrap()).unwrap();
            assert!(decoded.validate(10).is_ok(), "change id broken after decode at step {}", i);
            assert_eq!(decoded.changes()[0].change_id, msg.changes()[0].change_id);
        }
    }
}
