// =============================================================================
// FEDERATION DISCOVERY — broadcast.rs
// Priority-tiered propagation: flood / hierarchical / gossip
// =============================================================================
//
//   Critical (NodeRemoved)            → flood         ttl = max_ttl, ack
//   High (NodeAdded, RouteChanged)    → hierarchical  coordinators fan out
//                                                     within their region
//   Normal / Low                      → gossip        ⌈peers/3⌉ random peers
//
// Inbound: dedup on message id → apply each change → forward with ttl-1 and
// our id appended to the path, keeping the pattern the originator chose.
// Per-peer send failures are counted and logged, never retried, never fatal.
// =============================================================================

use crate::change::{Priority, TopologyChange};
use crate::change_log::ChangeLog;
use crate::clock::Clock;
use crate::config::DiscoveryConfig;
use crate::constants::GOSSIP_DIVISOR;
use crate::message::{DiscoveryMessage, MessageKind, PropagationPattern};
use crate::metrics::DiscoveryMetrics;
use crate::node::{Node, NodeId, NodeRole};
use crate::routing_table::{ApplyOutcome, RoutingTable};
use crate::transport::Transport;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropagationReport {
    pub message_id: String,
    pub pattern: PropagationPattern,
    pub ttl: u8,
    pub targets: Vec<NodeId>,
    pub delivered: usize,
    pub acked: usize,
    pub failed: Vec<(NodeId, String)>,
}

impl PropagationReport {
    pub fn failure_count(&self) -> usize {
        self.failed.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundOutcome {
    Duplicate,
    Malformed(String),
    Processed {
        applied: usize,
        stale: usize,
        skipped: usize,
        forwarded: Option<PropagationReport>,
    },
}

pub struct BroadcastRouter {
    local_id: NodeId,
    local_role: NodeRole,
    local_region: Option<String>,
    max_ttl: u8,
    default_ttl: u8,

    transport: Arc<dyn Transport>,
    table: Arc<RwLock<RoutingTable>>,
    change_log: Arc<Mutex<ChangeLog>>,
    clock: Arc<dyn Clock>,
    metrics: Arc<DiscoveryMetrics>,
    events: broadcast::Sender<TopologyChange>,
    rng: Mutex<StdRng>,
}

impl BroadcastRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &DiscoveryConfig,
        transport: Arc<dyn Transport>,
        table: Arc<RwLock<RoutingTable>>,
        change_log: Arc<Mutex<ChangeLog>>,
        clock: Arc<dyn Clock>,
        metrics: Arc<DiscoveryMetrics>,
        events: broadcast::Sender<TopologyChange>,
    ) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        BroadcastRouter {
            local_id: config.node_id.clone(),
            local_role: config.role,
            local_region: config.region.clone(),
            max_ttl: config.max_ttl,
            default_ttl: config.default_ttl,
            transport,
            table,
            change_log,
            clock,
            metrics,
            events,
            rng: Mutex::new(rng),
        }
    }

    pub fn select_pattern(priority: Priority) -> PropagationPattern {
        PropagationPattern::for_priority(priority)
    }

    pub fn initial_ttl(&self, pattern: PropagationPattern) -> u8 {
        match pattern {
            PropagationPattern::Flood => self.max_ttl,
            PropagationPattern::Hierarchical | PropagationPattern::Gossip => self.default_ttl,
        }
    }

    /// Peers that should receive a message with the given pattern. Nodes
    /// already on `visited` (the message path) never receive it again.
    pub async fn select_targets(&self, pattern: PropagationPattern, peers: &[Node], visited: &[NodeId]) -> Vec<NodeId> {
        let candidates: Vec<&Node> = peers
            .iter()
            .filter(|n| n.node_id != self.local_id && n.is_reachable() && !visited.contains(&n.node_id))
            .collect();

        let chosen: Vec<&Node> = match pattern {
            PropagationPattern::Flood => candidates,
            PropagationPattern::Hierarchical => self.hierarchical_targets(candidates),
            PropagationPattern::Gossip => {
                let fanout = candidates.len().div_ceil(GOSSIP_DIVISOR);
                let mut rng = self.rng.lock().await;
                candidates.choose_multiple(&mut *rng, fanout).copied().collect()
            }
        };

        let mut ids: Vec<NodeId> = chosen.into_iter().map(|n| n.node_id.clone()).collect();
        ids.sort();
        ids
    }

    fn hierarchical_targets<'a>(&self, candidates: Vec<&'a Node>) -> Vec<&'a Node> {
        if self.local_role == NodeRole::Coordinator {
            // cluster head: own region plus the other heads
            return match &self.local_region {
                Some(region) => candidates
                    .into_iter()
                    .filter(|n| n.role == NodeRole::Coordinator || n.region.as_deref() == Some(region.as_str()))
                    .collect(),
                None => candidates,
            };
        }

        let coordinators: Vec<&Node> = candidates
            .iter()
            .copied()
            .filter(|n| n.role == NodeRole::Coordinator)
            .collect();
        if coordinators.is_empty() {
            log::debug!("[{}] no coordinators known, hierarchical falls back to flood", self.local_id);
            candidates
        } else {
            coordinators
        }
    }

    /// Originate a broadcast for one locally recorded change.
    pub async fn propagate(&self, change: TopologyChange, peers: &[Node]) -> PropagationReport {
        let pattern = Self::select_pattern(change.priority);
        let ttl = self.initial_ttl(pattern);
        let now = self.clock.now_ms();
        let msg = DiscoveryMessage::change_broadcast(&self.local_id, vec![change], pattern, ttl, now);

        // our own broadcast must not be re-applied when it echoes back
        self.change_log.lock().await.mark_seen(&msg.message_id);

        let targets = self.select_targets(pattern, peers, &msg.path).await;
        DiscoveryMetrics::incr(&self.metrics.broadcasts_originated);
        let report = self.fan_out(&msg, targets).await;
        log::info!(
            "[{}] 📡 {:?} broadcast {} ttl={} → {}/{} peers",
            self.local_id,
            pattern,
            &msg.message_id[..8.min(msg.message_id.len())],
            ttl,
            report.delivered,
            report.targets.len()
        );
        report
    }

    async fn fan_out(&self, msg: &DiscoveryMessage, targets: Vec<NodeId>) -> PropagationReport {
        let mut delivered = 0;
        let mut failed = Vec::new();
        for peer_id in &targets {
            match self.transport.send(peer_id, msg.clone()).await {
                Ok(()) => {
                    delivered += 1;
                    DiscoveryMetrics::incr(&self.metrics.sends_ok);
                }
                Err(e) => {
                    log::warn!("[{}] ⚠️ send to [{}] failed: {}", self.local_id, peer_id, e);
                    DiscoveryMetrics::incr(&self.metrics.send_failures);
                    failed.push((peer_id.clone(), e.to_string()));
                }
            }
        }
        PropagationReport {
            message_id: msg.message_id.clone(),
            pattern: msg.pattern.unwrap_or(PropagationPattern::Flood),
            ttl: msg.ttl,
            targets,
            delivered,
            acked: if msg.require_ack { delivered } else { 0 },
            failed,
        }
    }

    /// Handle a ChangeBroadcast received from a neighbour.
    pub async fn handle_inbound(&self, msg: DiscoveryMessage) -> InboundOutcome {
        DiscoveryMetrics::incr(&self.metrics.messages_received);

        if let Err(e) = msg.validate(self.max_ttl) {
            DiscoveryMetrics::incr(&self.metrics.malformed_dropped);
            log::warn!("[{}] 🚫 dropped malformed broadcast: {}", self.local_id, e);
            return InboundOutcome::Malformed(e.to_string());
        }
        if msg.kind != MessageKind::ChangeBroadcast {
            DiscoveryMetrics::incr(&self.metrics.malformed_dropped);
            return InboundOutcome::Malformed(format!("{:?} is not a change broadcast", msg.kind));
        }
        let Some(pattern) = msg.pattern else {
            DiscoveryMetrics::incr(&self.metrics.malformed_dropped);
            return InboundOutcome::Malformed("broadcast without a propagation pattern".into());
        };

        {
            let mut log = self.change_log.lock().await;
            if !log.mark_seen(&msg.message_id) {
                DiscoveryMetrics::incr(&self.metrics.duplicates_dropped);
                return InboundOutcome::Duplicate;
            }
        }

        let now = self.clock.now_ms();
        let mut applied = Vec::new();
        let (mut stale, mut skipped) = (0, 0);
        {
            let mut table = self.table.write().await;
            for change in msg.changes() {
                match table.apply_change(change, &msg.path, now) {
                    ApplyOutcome::Applied => applied.push(change.clone()),
                    ApplyOutcome::Stale => {
                        stale += 1;
                        DiscoveryMetrics::incr(&self.metrics.stale_dropped);
                    }
                    ApplyOutcome::Duplicate | ApplyOutcome::Ignored => {
                        skipped += 1;
                        DiscoveryMetrics::incr(&self.metrics.duplicates_dropped);
                    }
                    ApplyOutcome::Rejected(reason) => {
                        skipped += 1;
                        DiscoveryMetrics::incr(&self.metrics.changes_rejected);
                        log::debug!("[{}] change {} rejected: {}", self.local_id, change.change_id, reason);
                    }
                }
            }
        }

        if !applied.is_empty() {
            DiscoveryMetrics::add(&self.metrics.changes_applied, applied.len() as u64);
            let mut log = self.change_log.lock().await;
            for change in &applied {
                log.record_remote(change.clone());
            }
        }
        for change in &applied {
            // no subscribers is fine
            let _ = self.events.send(change.clone());
        }

        let forwarded = match msg.forwarded(&self.local_id, now) {
            Some(next) => {
                let peers = self.table.read().await.peers();
                let targets = self.select_targets(pattern, &peers, &next.path).await;
                if targets.is_empty() {
                    None
                } else {
                    DiscoveryMetrics::incr(&self.metrics.broadcasts_forwarded);
                    Some(self.fan_out(&next, targets).await)
                }
            }
            None => None,
        };

        log::debug!(
            "[{}] broadcast {} from [{}]: applied={} stale={} skipped={} forwarded={}",
            self.local_id,
            msg.message_id,
            msg.origin_id,
            applied.len(),
            stale,
            skipped,
            forwarded.as_ref().map_or(0, |r| r.delivered)
        );

        InboundOutcome::Processed { applied: applied.len(), stale, skipped, forwarded }
    }
}
