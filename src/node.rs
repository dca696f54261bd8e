// =============================================================================
// FEDERATION DISCOVERY — node.rs
// Known peers: identity, endpoints, capabilities, liveness
// =============================================================================

use crate::constants::RELIABILITY_ALPHA;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

pub type NodeId = String;

// -----------------------------------------------------------------------------
// NodeRole / NodeStatus
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeRole {
    Coordinator, // cluster head; fans hierarchical broadcasts out to its region
    Relay,
    Peer,
}

impl FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "coordinator" => Ok(NodeRole::Coordinator),
            "relay" => Ok(NodeRole::Relay),
            "peer" => Ok(NodeRole::Peer),
            other => Err(format!("unknown node role: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeStatus {
    Online,
    Degraded,
    Offline,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Online => "online",
            NodeStatus::Degraded => "degraded",
            NodeStatus::Offline => "offline",
        };
        f.write_str(s)
    }
}

// -----------------------------------------------------------------------------
// Endpoint
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub protocol: String,
    pub address: String,
}

impl Endpoint {
    pub fn new(protocol: &str, address: &str) -> Self {
        Endpoint { protocol: protocol.to_string(), address: address.to_string() }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.address)
    }
}

// -----------------------------------------------------------------------------
// Capability
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Capability {
    Relay,
    Storage,
    Consensus,
    Compute,
    Custom(String),
}

impl FromStr for Capability {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "relay" => Capability::Relay,
            "storage" => Capability::Storage,
            "consensus" => Capability::Consensus,
            "compute" => Capability::Compute,
            _ => Capability::Custom(s.trim().to_string()),
        })
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Relay => f.write_str("relay"),
            Capability::Storage => f.write_str("storage"),
            Capability::Consensus => f.write_str("consensus"),
            Capability::Compute => f.write_str("compute"),
            Capability::Custom(name) => f.write_str(name),
        }
    }
}

pub type Capabilities = BTreeSet<Capability>;

/// Blank entries are skipped.
pub fn parse_capabilities<I, S>(raw: I) -> Capabilities
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    raw.into_iter()
        .filter(|s| !s.as_ref().trim().is_empty())
        .filter_map(|s| s.as_ref().parse().ok())
        .collect()
}

// -----------------------------------------------------------------------------
// Node
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: NodeId,
    pub role: NodeRole,
    pub region: Option<String>,
    pub endpoints: Vec<Endpoint>,
    pub capabilities: Capabilities,
    pub status: NodeStatus,
    pub first_seen: i64,
    pub last_seen: i64,
    pub latency_estimate_ms: f64,
    pub reliability_score: f64,
}

impl Node {
    pub fn new(node_id: &str, role: NodeRole, now_ms: i64) -> Self {
        Node {
            node_id: node_id.to_string(),
            role,
            region: None,
            endpoints: vec![],
            capabilities: Capabilities::new(),
            status: NodeStatus::Online,
            first_seen: now_ms,
            last_seen: now_ms,
            latency_estimate_ms: 0.0,
            reliability_score: 1.0,
        }
    }

    pub fn with_region(mut self, region: &str) -> Self {
        self.region = Some(region.to_string());
        self
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn is_online(&self) -> bool {
        self.status == NodeStatus::Online
    }

    pub fn is_reachable(&self) -> bool {
        self.status != NodeStatus::Offline
    }

    pub fn silence_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.last_seen)
    }

    pub fn same_region(&self, other: &Node) -> bool {
        match (&self.region, &other.region) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Successful probe or heartbeat: refresh `last_seen`, fold the sample
    /// into the latency and reliability averages.
    pub fn record_success(&mut self, latency_ms: Option<f64>, now_ms: i64) {
        self.last_seen = self.last_seen.max(now_ms);
        self.reliability_score =
            (self.reliability_score * (1.0 - RELIABILITY_ALPHA) + RELIABILITY_ALPHA).min(1.0);
        if let Some(sample) = latency_ms {
            self.latency_estimate_ms = if self.latency_estimate_ms <= 0.0 {
                sample
            } else {
                self.latency_estimate_ms * (1.0 - RELIABILITY_ALPHA) + sample * RELIABILITY_ALPHA
            };
        }
    }

    pub fn record_failure(&mut self) {
        self.reliability_score = (self.reliability_score * (1.0 - RELIABILITY_ALPHA)).max(0.0);
    }
}

// -----------------------------------------------------------------------------
// NodeFilter: used by RoutingTable::list_nodes
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    pub status: Option<NodeStatus>,
    pub role: Option<NodeRole>,
    pub region: Option<String>,
    pub capability: Option<Capability>,
    pub exclude: Option<NodeId>,
}

impl NodeFilter {
    pub fn status(status: NodeStatus) -> Self {
        NodeFilter { status: Some(status), ..Default::default() }
    }

    pub fn role(role: NodeRole) -> Self {
        NodeFilter { role: Some(role), ..Default::default() }
    }

    pub fn excluding(mut self, node_id: &str) -> Self {
        self.exclude = Some(node_id.to_string());
        self
    }

    pub fn matches(&self, node: &Node) -> bool {
        if let Some(status) = self.status {
            if node.status != status { return false; }
        }
        if let Some(role) = self.role {
            if node.role != role { return false; }
        }
        if let Some(ref region) = self.region {
            if node.region.as_deref() != Some(region.as_str()) { return false; }
        }
        if let Some(ref cap) = self.capability {
            if !node.capabilities.contains(cap) { return false; }
        }
        if let Some(ref excluded) = self.exclude {
            if &node.node_id == excluded { return false; }
        }
        true
    }
}
