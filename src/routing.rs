use crate::config::RouteWeights;
use crate::error::{DiscoveryError, Result};
use crate::node::NodeId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;

/// A path from the local node to `destination_id`.
///
/// `path` lists the hops after the local node, ending at the destination,
/// so `path[0] == next_hop` and `path.len() == hop_count`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingEntry {
    pub destination_id: NodeId,
    pub next_hop: NodeId,
    pub hop_count: usize,
    pub path: Vec<NodeId>,
    pub cost_estimate: f64,
    pub preferred: bool,
}

impl RoutingEntry {
    pub fn new(path: Vec<NodeId>, latency_ms: f64, reliability: f64, weights: &RouteWeights) -> Result<Self> {
        let destination_id = path.last().cloned().ok_or_else(|| DiscoveryError::InvalidRoute {
            destination: String::new(),
            reason: "empty path".into(),
        })?;
        let hop_count = path.len();
        Ok(RoutingEntry {
            next_hop: path[0].clone(),
            destination_id,
            hop_count,
            cost_estimate: weights.cost(hop_count, latency_ms, reliability),
            path,
            preferred: false,
        })
    }

    pub fn direct(destination: &str, latency_ms: f64, reliability: f64, weights: &RouteWeights) -> Self {
        RoutingEntry {
            destination_id: destination.to_string(),
            next_hop: destination.to_string(),
            hop_count: 1,
            path: vec![destination.to_string()],
            cost_estimate: weights.cost(1, latency_ms, reliability),
            preferred: false,
        }
    }

    pub fn has_cycle(&self) -> bool {
        let mut seen = HashSet::with_capacity(self.path.len());
        !self.path.iter().all(|hop| seen.insert(hop))
    }

    pub fn traverses(&self, node_id: &str) -> bool {
        self.path.iter().any(|hop| hop == node_id)
    }

    /// Same next hop and path: the two entries describe one route.
    pub fn same_route(&self, other: &RoutingEntry) -> bool {
        self.destination_id == other.destination_id && self.path == other.path
    }

    pub fn validate(&self, max_hops: usize) -> Result<()> {
        let reject = |reason: String| DiscoveryError::InvalidRoute {
            destination: self.destination_id.clone(),
            reason,
        };
        if self.path.is_empty() {
            return Err(reject("empty path".into()));
        }
        if self.path.last() != Some(&self.destination_id) {
            return Err(reject("path does not end at destination".into()));
        }
        if self.path[0] != self.next_hop {
            return Err(reject(format!("next hop {} is not the first path element", self.next_hop)));
        }
        if self.hop_count != self.path.len() {
            return Err(reject(format!("hop count {} != path length {}", self.hop_count, self.path.len())));
        }
        if self.hop_count > max_hops {
            return Err(reject(format!("{} hops exceeds max {}", self.hop_count, max_hops)));
        }
        if self.has_cycle() {
            return Err(reject("path contains a cycle".into()));
        }
        if !self.cost_estimate.is_finite() || self.cost_estimate < 0.0 {
            return Err(reject(format!("cost {} is not a valid estimate", self.cost_estimate)));
        }
        Ok(())
    }

    /// Ordering for best-route selection: cost, then hop count, then next hop.
    pub fn rank(&self, other: &RoutingEntry) -> Ordering {
        self.cost_estimate
            .total_cmp(&other.cost_estimate)
            .then(self.hop_count.cmp(&other.hop_count))
            .then_with(|| self.next_hop.cmp(&other.next_hop))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(ids: &[&str]) -> Vec<NodeId> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_entry_from_path() {
        let weights = RouteWeights::default();
        let entry = RoutingEntry::new(path(&["B", "C", "D"]), 20.0, 1.0, &weights).unwrap();
        assert_eq!(entry.destination_id, "D");
        assert_eq!(entry.next_hop, "B");
        assert_eq!(entry.hop_count, 3);
        assert!(entry.validate(10).is_ok());
        assert!(entry.traverses("C"));
        assert!(RoutingEntry::new(vec![], 0.0, 1.0, &weights).is_err());
    }

    #[test]
    fn test_cycles_and_hop_limit_rejected() {
        let weights = RouteWeights::default();
        let cyclic = RoutingEntry::new(path(&["B", "C", "B", "D"]), 0.0, 1.0, &weights).unwrap();
        assert!(cyclic.has_cycle());
        assert!(cyclic.validate(10).is_err());

        let long: Vec<String> = (0..11).map(|i| format!("n{}", i)).collect();
        let entry = RoutingEntry::new(long, 0.0, 1.0, &weights).unwrap();
        assert!(entry.validate(10).is_err());
        assert!(entry.validate(11).is_ok());
    }

    #[test]
    fn test_rank_tie_breaks() {
        let weights = RouteWeights { hop: 0.0, latency: 0.0, unreliability: 0.0 };
        let via_c = RoutingEntry::new(path(&["C", "D"]), 0.0, 1.0, &weights).unwrap();
        let via_b = RoutingEntry::new(path(&["B", "D"]), 0.0, 1.0, &weights).unwrap();
        let direct = RoutingEntry::direct("D", 0.0, 1.0, &weights);

        // equal cost: fewer hops wins, then smallest next hop
        assert_eq!(direct.rank(&via_b), Ordering::Less);
        assert_eq!(via_b.rank(&via_c), Ordering::Less);

        let weighted = RouteWeights::default();
        let fast = RoutingEntry::new(path(&["C", "D"]), 5.0, 1.0, &weighted).unwrap();
        let slow = RoutingEntry::new(path(&["B", "D"]), 500.0, 1.0, &weighted).unwrap();
        assert_eq!(fast.rank(&slow), Ordering::Less);
    }
}
