// =============================================================================
// FEDERATION DISCOVERY — routing_table.rs
// Known nodes, routing entries, versioned topology snapshots
// =============================================================================
//
// Invariants enforced here:
//   - every accepted mutation bumps `version` exactly once
//   - at most one preferred entry per destination, alternates bounded
//   - no entry with a cycle or more than `max_hops` hops
//   - a change id is applied at most once
//   - per originator, a change with sequence <= last applied is stale
//   - per destination, a RouteChanged with a lower sequence than the one
//     currently installed is stale; a newer one replaces the route the
//     previous announcement installed and is ranked against the rest
//
// Local observations (liveness updates, heartbeat route refreshes, recompute)
// that move a destination's preferred route onto a different path are queued
// in `rerouted` until the coordinator takes them for broadcast. Changes
// applied from other nodes never queue anything.
// =============================================================================

use crate::change::{ChangeType, TopologyChange};
use crate::config::{DiscoveryConfig, RouteWeights};
use crate::error::Result;
use crate::node::{Node, NodeFilter, NodeId, NodeStatus};
use crate::routing::RoutingEntry;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

pub const APPLIED_ID_CAPACITY: usize = 4096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub nodes: Vec<Node>,
    pub routes: Vec<RoutingEntry>,
    pub version: u64,
    pub last_updated: i64,
}

impl TopologySnapshot {
    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    pub fn preferred_route(&self, destination: &str) -> Option<&RoutingEntry> {
        self.routes.iter().find(|r| r.destination_id == destination && r.preferred)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied,
    /// change id already applied, or our own change coming back
    Duplicate,
    /// sequence not newer than what was already applied
    Stale,
    /// accepted for ordering purposes but nothing to change locally
    Ignored,
    Rejected(String),
}

#[derive(Debug)]
pub struct RoutingTable {
    local_id: NodeId,
    nodes: HashMap<NodeId, Node>,
    routes: HashMap<NodeId, Vec<RoutingEntry>>,
    version: u64,
    last_updated: i64,

    max_hops: usize,
    max_alternates: usize,
    weights: RouteWeights,

    applied_ids: HashSet<String>,
    applied_order: VecDeque<String>,
    origin_sequences: HashMap<NodeId, u64>,
    route_watermarks: HashMap<NodeId, u64>,
    announced_routes: HashMap<NodeId, Vec<NodeId>>,
    rerouted: HashSet<NodeId>,
}

impl RoutingTable {
    pub fn new(local_id: &str, max_hops: usize, max_alternates: usize, weights: RouteWeights) -> Self {
        RoutingTable {
            local_id: local_id.to_string(),
            nodes: HashMap::new(),
            routes: HashMap::new(),
            version: 0,
            last_updated: 0,
            max_hops,
            max_alternates,
            weights,
            applied_ids: HashSet::new(),
            applied_order: VecDeque::new(),
            origin_sequences: HashMap::new(),
            route_watermarks: HashMap::new(),
            announced_routes: HashMap::new(),
            rerouted: HashSet::new(),
        }
    }

    pub fn from_config(config: &DiscoveryConfig) -> Self {
        RoutingTable::new(&config.node_id, config.max_hops, config.max_alternate_routes, config.route_weights)
    }

    fn bump(&mut self, now_ms: i64) {
        self.version += 1;
        self.last_updated = now_ms.max(self.last_updated);
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn last_updated(&self) -> i64 {
        self.last_updated
    }

    pub fn weights(&self) -> &RouteWeights {
        &self.weights
    }

    // -------------------------------------------------------------------------
    // Nodes
    // -------------------------------------------------------------------------

    pub fn upsert_node(&mut self, node: Node, now_ms: i64) {
        self.nodes.insert(node.node_id.clone(), node);
        self.bump(now_ms);
    }

    /// Liveness update: like `upsert_node`, but an Offline node also loses
    /// every route through it. One version bump either way.
    pub fn update_node(&mut self, node: Node, now_ms: i64) -> usize {
        let purged = if node.status == NodeStatus::Offline {
            let before = self.preferred_paths();
            let purged = self.purge_routes_via(&node.node_id);
            self.note_reroutes(before);
            purged
        } else {
            0
        };
        self.upsert_node(node, now_ms);
        purged
    }

    /// Hard removal. The protocol itself never calls this; offline nodes are
    /// retained for re-discovery.
    pub fn remove_node(&mut self, node_id: &str, now_ms: i64) -> bool {
        if self.nodes.remove(node_id).is_none() {
            return false;
        }
        self.routes.remove(node_id);
        for entries in self.routes.values_mut() {
            entries.retain(|e| !e.traverses(node_id));
        }
        self.routes.retain(|_, entries| !entries.is_empty());
        self.mark_preferred_all();
        self.bump(now_ms);
        true
    }

    pub fn get_node(&self, node_id: &str) -> Option<Node> {
        self.nodes.get(node_id).cloned()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Sorted by node id.
    pub fn list_nodes(&self, filter: Option<&NodeFilter>) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .nodes
            .values()
            .filter(|n| filter.map_or(true, |f| f.matches(n)))
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    /// Every known node other than ourselves that is not Offline.
    pub fn peers(&self) -> Vec<Node> {
        self.list_nodes(None)
            .into_iter()
            .filter(|n| n.node_id != self.local_id && n.is_reachable())
            .collect()
    }

    // -------------------------------------------------------------------------
    // Routes
    // -------------------------------------------------------------------------

    pub fn upsert_route(&mut self, entry: RoutingEntry, now_ms: i64) -> Result<()> {
        self.insert_route(entry)?;
        self.bump(now_ms);
        Ok(())
    }

    fn insert_route(&mut self, mut entry: RoutingEntry) -> Result<()> {
        entry.validate(self.max_hops)?;
        if entry.traverses(&self.local_id) {
            return Err(crate::error::DiscoveryError::InvalidRoute {
                destination: entry.destination_id.clone(),
                reason: "path loops back through the local node".into(),
            });
        }
        entry.preferred = false;
        let limit = 1 + self.max_alternates;
        let entries = self.routes.entry(entry.destination_id.clone()).or_default();
        entries.retain(|e| !e.same_route(&entry));
        entries.push(entry);
        entries.sort_by(|a, b| a.rank(b));
        entries.truncate(limit);
        mark_preferred(entries);
        Ok(())
    }

    fn mark_preferred_all(&mut self) {
        for entries in self.routes.values_mut() {
            entries.sort_by(|a, b| a.rank(b));
            mark_preferred(entries);
        }
    }

    pub fn best_route(&self, destination_id: &str) -> Option<RoutingEntry> {
        self.routes.get(destination_id).and_then(|e| e.first()).cloned()
    }

    pub fn routes_to(&self, destination_id: &str) -> Vec<RoutingEntry> {
        self.routes.get(destination_id).cloned().unwrap_or_default()
    }

    /// Refresh the direct (one-hop) route to `node_id` from its current
    /// latency and reliability estimates.
    pub fn touch_direct_route(&mut self, node_id: &str, now_ms: i64) -> Result<()> {
        let node = match self.nodes.get(node_id) {
            Some(n) => n,
            None => return Ok(()),
        };
        let entry = RoutingEntry::direct(node_id, node.latency_estimate_ms, node.reliability_score, &self.weights);
        let before: HashMap<NodeId, Vec<NodeId>> = self
            .preferred_path(node_id)
            .map(|path| (node_id.to_string(), path))
            .into_iter()
            .collect();
        self.upsert_route(entry, now_ms)?;
        self.note_reroutes(before);
        Ok(())
    }

    fn preferred_path(&self, destination_id: &str) -> Option<Vec<NodeId>> {
        self.routes.get(destination_id).and_then(|e| e.first()).map(|e| e.path.clone())
    }

    fn preferred_paths(&self) -> HashMap<NodeId, Vec<NodeId>> {
        self.routes
            .iter()
            .filter_map(|(destination, entries)| entries.first().map(|e| (destination.clone(), e.path.clone())))
            .collect()
    }

    /// Queue every destination that still has a preferred route, but on a
    /// different path than in `before`.
    fn note_reroutes(&mut self, before: HashMap<NodeId, Vec<NodeId>>) {
        for (destination, old_path) in before {
            if let Some(path) = self.preferred_path(&destination) {
                if path != old_path {
                    self.rerouted.insert(destination);
                }
            }
        }
    }

    /// Current preferred route of every destination rerouted by a local
    /// observation since the last call, sorted by destination.
    pub fn take_rerouted(&mut self) -> Vec<RoutingEntry> {
        let mut destinations: Vec<NodeId> = self.rerouted.drain().collect();
        destinations.sort();
        destinations.into_iter().filter_map(|d| self.best_route(&d)).collect()
    }

    fn purge_routes_via(&mut self, node_id: &str) -> usize {
        let mut purged = 0;
        for entries in self.routes.values_mut() {
            let before = entries.len();
            entries.retain(|e| !e.traverses(node_id));
            purged += before - entries.len();
        }
        self.routes.retain(|_, entries| !entries.is_empty());
        if purged > 0 {
            self.mark_preferred_all();
        }
        purged
    }

    fn purge_invalid(&mut self) -> usize {
        let offline: HashSet<NodeId> = self
            .nodes
            .values()
            .filter(|n| n.status == NodeStatus::Offline)
            .map(|n| n.node_id.clone())
            .collect();
        let max_hops = self.max_hops;

        let mut purged = 0;
        for entries in self.routes.values_mut() {
            let before = entries.len();
            entries.retain(|e| e.validate(max_hops).is_ok() && !e.path.iter().any(|hop| offline.contains(hop)));
            purged += before - entries.len();
        }
        self.routes.retain(|_, entries| !entries.is_empty());
        if purged > 0 {
            self.mark_preferred_all();
        }
        purged
    }

    /// Drop entries crossing an Offline node or breaking the hop limit.
    pub fn purge_invalid_routes(&mut self, now_ms: i64) -> usize {
        let before = self.preferred_paths();
        let purged = self.purge_invalid();
        if purged > 0 {
            self.note_reroutes(before);
            self.bump(now_ms);
        }
        purged
    }

    /// Purge like `purge_invalid_routes`, then re-cost what is left from
    /// current node estimates. Returns the number of purged entries; bumps
    /// the version once if anything changed.
    pub fn recompute_routes(&mut self, now_ms: i64) -> usize {
        let before = self.preferred_paths();
        let purged = self.purge_invalid();

        let mut changed = false;
        let weights = self.weights;
        let nodes = &self.nodes;
        for entries in self.routes.values_mut() {
            for entry in entries.iter_mut() {
                let (latency, reliability) = path_estimates(nodes, &entry.path);
                let cost = weights.cost(entry.hop_count, latency, reliability);
                if (cost - entry.cost_estimate).abs() > f64::EPSILON {
                    entry.cost_estimate = cost;
                    changed = true;
                }
            }
        }
        if changed {
            self.mark_preferred_all();
        }

        if purged > 0 || changed {
            self.note_reroutes(before);
            self.bump(now_ms);
        }
        purged
    }

    // -------------------------------------------------------------------------
    // Inbound change application
    // -------------------------------------------------------------------------

    /// Apply a change received from another node.
    ///
    /// `via` is the broadcast path the change travelled, originator first and
    /// the sending neighbour last; it is used to learn a route to the
    /// change's subject.
    pub fn apply_change(&mut self, change: &TopologyChange, via: &[NodeId], now_ms: i64) -> ApplyOutcome {
        if !change.verify_id() {
            return ApplyOutcome::Rejected(format!("change id mismatch for {}", change.change_id));
        }
        if change.origin_id == self.local_id || self.applied_ids.contains(&change.change_id) {
            return ApplyOutcome::Duplicate;
        }
        if let Some(&last) = self.origin_sequences.get(&change.origin_id) {
            if change.sequence <= last {
                return ApplyOutcome::Stale;
            }
        }

        let outcome = match change.change_type {
            ChangeType::NodeAdded | ChangeType::StateChanged | ChangeType::NodeRemoved => {
                self.apply_node_change(change, via)
            }
            ChangeType::RouteChanged => self.apply_route_change(change, via),
            ChangeType::TopologyRescanned => match change.after {
                Some(_) => self.apply_node_change(change, via),
                None => ApplyOutcome::Ignored,
            },
        };

        match outcome {
            ApplyOutcome::Applied | ApplyOutcome::Ignored => {
                self.remember_applied(change);
                if outcome == ApplyOutcome::Applied {
                    self.bump(now_ms);
                }
            }
            _ => {}
        }
        outcome
    }

    fn remember_applied(&mut self, change: &TopologyChange) {
        self.origin_sequences.insert(change.origin_id.clone(), change.sequence);
        if self.applied_ids.insert(change.change_id.clone()) {
            self.applied_order.push_back(change.change_id.clone());
            while self.applied_order.len() > APPLIED_ID_CAPACITY {
                if let Some(oldest) = self.applied_order.pop_front() {
                    self.applied_ids.remove(&oldest);
                }
            }
        }
    }

    fn apply_node_change(&mut self, change: &TopologyChange, via: &[NodeId]) -> ApplyOutcome {
        let Some(mut incoming) = change.after.clone() else {
            return ApplyOutcome::Rejected(format!("{:?} without an after snapshot", change.change_type));
        };
        if incoming.node_id != change.subject_node_id {
            return ApplyOutcome::Rejected("after snapshot does not match subject".into());
        }
        if incoming.node_id == self.local_id {
            // we are the authority on our own liveness
            return ApplyOutcome::Ignored;
        }
        if change.change_type == ChangeType::NodeRemoved {
            incoming.status = NodeStatus::Offline;
        }

        if let Some(existing) = self.nodes.get(&incoming.node_id) {
            incoming.first_seen = existing.first_seen.min(incoming.first_seen);
            incoming.last_seen = existing.last_seen.max(incoming.last_seen);
        }

        let subject = incoming.node_id.clone();
        let reachable = incoming.is_reachable();
        let (latency, reliability) = (incoming.latency_estimate_ms, incoming.reliability_score);
        self.nodes.insert(subject.clone(), incoming);

        if reachable {
            if let Some(path) = self.path_via(via, &subject) {
                if let Ok(entry) = RoutingEntry::new(path, latency, reliability, &self.weights) {
                    if let Err(e) = self.insert_route(entry) {
                        log::debug!("[{}] learned route to [{}] discarded: {}", self.local_id, subject, e);
                    }
                }
            }
        } else {
            let purged = self.purge_routes_via(&subject);
            if purged > 0 {
                log::debug!("[{}] purged {} routes through offline [{}]", self.local_id, purged, subject);
            }
        }
        ApplyOutcome::Applied
    }

    fn apply_route_change(&mut self, change: &TopologyChange, via: &[NodeId]) -> ApplyOutcome {
        let Some(route) = change.route.as_ref() else {
            return ApplyOutcome::Rejected("RouteChanged without a route".into());
        };
        if route.destination_id != change.subject_node_id {
            return ApplyOutcome::Rejected("route destination does not match subject".into());
        }
        if route.destination_id == self.local_id {
            return ApplyOutcome::Ignored;
        }
        if let Some(&mark) = self.route_watermarks.get(&route.destination_id) {
            if change.sequence <= mark {
                return ApplyOutcome::Stale;
            }
        }

        // re-root the originator's route at us: back along the broadcast path,
        // then the originator's own hops
        let mut path: Vec<NodeId> = via.iter().rev().cloned().collect();
        path.extend(route.path.iter().cloned());
        let entry = match RoutingEntry::new(path, 0.0, 1.0, &self.weights) {
            Ok(mut e) => {
                e.cost_estimate = route.cost_estimate + e.hop_count.saturating_sub(route.hop_count) as f64 * self.weights.hop;
                e
            }
            Err(e) => return ApplyOutcome::Rejected(e.to_string()),
        };
        if let Err(e) = entry.validate(self.max_hops) {
            return ApplyOutcome::Rejected(e.to_string());
        }
        if entry.traverses(&self.local_id) {
            // the originator reaches the destination through us
            return ApplyOutcome::Ignored;
        }

        let destination = entry.destination_id.clone();
        let path = entry.path.clone();
        if let (Some(previous), Some(entries)) =
            (self.announced_routes.get(&destination), self.routes.get_mut(&destination))
        {
            entries.retain(|e| &e.path != previous);
        }
        if let Err(e) = self.insert_route(entry) {
            return ApplyOutcome::Rejected(e.to_string());
        }
        self.announced_routes.insert(destination.clone(), path);
        self.route_watermarks.insert(destination, change.sequence);
        ApplyOutcome::Applied
    }

    /// Path from us to `subject` back along the broadcast path, cut at the
    /// first occurrence of the subject.
    fn path_via(&self, via: &[NodeId], subject: &str) -> Option<Vec<NodeId>> {
        if via.is_empty() {
            return None;
        }
        let mut path = Vec::new();
        for hop in via.iter().rev() {
            if hop == &self.local_id {
                return None;
            }
            path.push(hop.clone());
            if hop == subject {
                return Some(path);
            }
        }
        path.push(subject.to_string());
        Some(path)
    }

    // -------------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------------

    pub fn snapshot_topology(&self) -> TopologySnapshot {
        let mut routes: Vec<RoutingEntry> = self.routes.values().flatten().cloned().collect();
        routes.sort_by(|a, b| {
            a.destination_id
                .cmp(&b.destination_id)
                .then(b.preferred.cmp(&a.preferred))
                .then_with(|| a.rank(b))
        });
        TopologySnapshot {
            nodes: self.list_nodes(None),
            routes,
            version: self.version,
            last_updated: self.last_updated,
        }
    }

    pub fn route_count(&self) -> usize {
        self.routes.values().map(|e| e.len()).sum()
    }
}

fn mark_preferred(entries: &mut [RoutingEntry]) {
    for (i, entry) in entries.iter_mut().enumerate() {
        entry.preferred = i == 0;
    }
}

/// Summed latency and product of reliabilities of the known hops.
fn path_estimates(nodes: &HashMap<NodeId, Node>, path: &[NodeId]) -> (f64, f64) {
    path.iter().filter_map(|hop| nodes.get(hop)).fold((0.0, 1.0), |(lat, rel), n| {
        (lat + n.latency_estimate_ms, rel * n.reliability_score)
    })
}
