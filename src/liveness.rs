// =============================================================================
// FEDERATION DISCOVERY — liveness.rs
// Heartbeat silence scan + bounded health probes
// =============================================================================
//
// Per-node state machine:
//
//   Online ──(1 failed probe)──▶ Degraded ──(2nd failed probe)──▶ Offline
//     ▲                                                             │
//     └──────────(successful probe or heartbeat)────────────────────┘
//
//   Any non-Offline node silent for longer than heartbeat_timeout goes
//   straight to Offline.
//
// Transitions are the only local source of StateChanged / NodeRemoved.
// A probe error or timeout is a failed probe, never an error to the caller.
// =============================================================================

use crate::change::{DiscoveryMethod, TopologyChange};
use crate::config::DiscoveryConfig;
use crate::constants::OFFLINE_AFTER_FAILED_PROBES;
use crate::metrics::DiscoveryMetrics;
use crate::node::{Node, NodeId, NodeStatus};
use crate::routing_table::RoutingTable;
use crate::transport::{HealthResult, Transport};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::{timeout, Duration};

// -----------------------------------------------------------------------------
// HealthChecker: probe side, holds no table state
// -----------------------------------------------------------------------------

#[derive(Clone)]
pub struct HealthChecker {
    transport: Arc<dyn Transport>,
    probe_timeout: Duration,
    metrics: Arc<DiscoveryMetrics>,
}

impl HealthChecker {
    pub fn new(transport: Arc<dyn Transport>, probe_timeout: Duration, metrics: Arc<DiscoveryMetrics>) -> Self {
        HealthChecker { transport, probe_timeout, metrics }
    }

    /// Probe one node. Errors and timeouts come back as an unhealthy result.
    pub async fn health_check(&self, node: &Node) -> HealthResult {
        match timeout(self.probe_timeout, self.transport.probe(&node.node_id)).await {
            Ok(Ok(result)) => {
                if result.healthy {
                    DiscoveryMetrics::incr(&self.metrics.probes_ok);
                } else {
                    DiscoveryMetrics::incr(&self.metrics.probe_failures);
                }
                result
            }
            Ok(Err(e)) => {
                log::debug!("probe [{}] failed: {}", node.node_id, e);
                DiscoveryMetrics::incr(&self.metrics.probe_failures);
                HealthResult::unhealthy()
            }
            Err(_) => {
                log::warn!("⏱️ probe [{}] timed out after {:?}", node.node_id, self.probe_timeout);
                DiscoveryMetrics::incr(&self.metrics.probe_timeouts);
                HealthResult::unhealthy()
            }
        }
    }

    /// Probe all nodes concurrently; results come back sorted by node id.
    pub async fn check_all(&self, nodes: Vec<Node>) -> Vec<(NodeId, HealthResult)> {
        let mut set = JoinSet::new();
        for node in nodes {
            let checker = self.clone();
            set.spawn(async move {
                let result = checker.health_check(&node).await;
                (node.node_id, result)
            });
        }

        let mut results = Vec::with_capacity(set.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(pair) => results.push(pair),
                Err(e) => log::error!("probe task failed: {}", e),
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }
}

// -----------------------------------------------------------------------------
// LivenessMonitor: state machine over the routing table
// -----------------------------------------------------------------------------

pub struct LivenessMonitor {
    local_id: NodeId,
    heartbeat_timeout_ms: u64,
    failed_probes: HashMap<NodeId, u32>,
}

impl LivenessMonitor {
    pub fn new(local_id: &str, heartbeat_timeout_ms: u64) -> Self {
        LivenessMonitor {
            local_id: local_id.to_string(),
            heartbeat_timeout_ms,
            failed_probes: HashMap::new(),
        }
    }

    pub fn from_config(config: &DiscoveryConfig) -> Self {
        LivenessMonitor::new(&config.node_id, config.heartbeat_timeout_ms)
    }

    pub fn failed_probes(&self, node_id: &str) -> u32 {
        self.failed_probes.get(node_id).copied().unwrap_or(0)
    }

    /// Take every node silent for longer than the heartbeat timeout Offline.
    pub fn scan_heartbeats(&mut self, table: &mut RoutingTable, now_ms: i64) -> Vec<TopologyChange> {
        let mut changes = Vec::new();
        for node in table.list_nodes(None) {
            if node.node_id == self.local_id || node.status == NodeStatus::Offline {
                continue;
            }
            if node.silence_ms(now_ms) <= self.heartbeat_timeout_ms as i64 {
                continue;
            }

            let before = node.clone();
            let mut after = node;
            after.status = NodeStatus::Offline;
            log::warn!(
                "[{}] 💀 [{}] silent for {}ms, marking offline",
                self.local_id,
                after.node_id,
                after.silence_ms(now_ms)
            );
            self.failed_probes.remove(&after.node_id);
            table.update_node(after.clone(), now_ms);
            changes.push(TopologyChange::transition(&self.local_id, before, after, DiscoveryMethod::Heartbeat, now_ms));
        }
        changes
    }

    /// Fold one probe result into the node's state.
    pub fn apply_probe(
        &mut self,
        table: &mut RoutingTable,
        node_id: &str,
        result: &HealthResult,
        now_ms: i64,
    ) -> Option<TopologyChange> {
        if node_id == self.local_id {
            return None;
        }
        let before = table.get_node(node_id)?;
        let mut after = before.clone();

        if result.healthy {
            self.failed_probes.remove(node_id);
            after.record_success(Some(result.latency_ms), now_ms);
            after.status = NodeStatus::Online;
            table.update_node(after.clone(), now_ms);
            if let Err(e) = table.touch_direct_route(node_id, now_ms) {
                log::debug!("[{}] direct route to [{}] not stored: {}", self.local_id, node_id, e);
            }
        } else {
            let failures = {
                let count = self.failed_probes.entry(node_id.to_string()).or_insert(0);
                *count += 1;
                *count
            };
            after.record_failure();
            after.status = if failures >= OFFLINE_AFTER_FAILED_PROBES {
                NodeStatus::Offline
            } else if before.status == NodeStatus::Online {
                NodeStatus::Degraded
            } else {
                before.status
            };
            table.update_node(after.clone(), now_ms);
        }

        if after.status == before.status {
            return None;
        }
        log::info!(
            "[{}] 🔁 [{}] {} → {} (health check)",
            self.local_id,
            node_id,
            before.status,
            after.status
        );
        Some(TopologyChange::transition(&self.local_id, before, after, DiscoveryMethod::HealthCheck, now_ms))
    }

    /// Inbound heartbeat or announce from `node_id`.
    pub fn record_heartbeat(&mut self, table: &mut RoutingTable, node_id: &str, now_ms: i64) -> Option<TopologyChange> {
        if node_id == self.local_id {
            return None;
        }
        let before = table.get_node(node_id)?;
        let mut after = before.clone();
        self.failed_probes.remove(node_id);
        after.record_success(None, now_ms);
        after.status = NodeStatus::Online;
        table.update_node(after.clone(), now_ms);

        if before.status == NodeStatus::Online {
            return None;
        }
        log::info!("[{}] 💓 [{}] back online ({} → online)", self.local_id, node_id, before.status);
        Some(TopologyChange::transition(&self.local_id, before, after, DiscoveryMethod::Heartbeat, now_ms))
    }
}
