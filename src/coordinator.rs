// =============================================================================
// FEDERATION DISCOVERY — coordinator.rs
// Lifecycle, periodic loops, inbound dispatch, public API
// =============================================================================
//
//   Stopped ──start()──▶ Starting ──▶ Running ──stop()──▶ Stopping ──▶ Stopped
//
//   Running spawns three loops, all cancelled by one CancellationToken:
//     announce   (30s)  self-announce + retry unreached seeds
//     heartbeat  (10s)  heartbeats out, silence scan
//     reconcile (120s)  probe every known node, recompute routes
//
//   Local change:   ChangeLog::record_local → subscribers → BroadcastRouter
//   Reroutes:       drained from the table after every local mutation and
//                   announced as RouteChanged
//   Inbound:        Discover / Announce / Heartbeat handled here,
//                   ChangeBroadcast delegated to the router
//
// No lock is held across a network call.
// =============================================================================

use crate::broadcast::{BroadcastRouter, InboundOutcome, PropagationReport};
use crate::change::{ChangeType, DiscoveryMethod, TopologyChange};
use crate::change_log::{ChangeLog, ChangeLogStats};
use crate::clock::Clock;
use crate::config::DiscoveryConfig;
use crate::constants::EVENT_CHANNEL_CAPACITY;
use crate::error::Result;
use crate::liveness::{HealthChecker, LivenessMonitor};
use crate::message::{DiscoveryMessage, MessagePayload};
use crate::metrics::{DiscoveryMetrics, MetricsSnapshot};
use crate::node::{parse_capabilities, Node, NodeFilter, NodeId, NodeStatus};
use crate::routing_table::{RoutingTable, TopologySnapshot};
use crate::transport::{Inbox, Transport};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinatorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryStats {
    pub node_id: NodeId,
    pub state: CoordinatorState,
    pub topology_version: u64,
    pub last_updated: i64,
    pub known_nodes: usize,
    pub online_nodes: usize,
    pub degraded_nodes: usize,
    pub offline_nodes: usize,
    pub routes: usize,
    pub subscribers: usize,
    pub change_log: ChangeLogStats,
    pub metrics: MetricsSnapshot,
}

impl std::fmt::Display for DiscoveryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {:?} v{} | nodes {} (online {}, degraded {}, offline {}) | routes {} | changes {} | sent {} failed {}",
            self.node_id,
            self.state,
            self.topology_version,
            self.known_nodes,
            self.online_nodes,
            self.degraded_nodes,
            self.offline_nodes,
            self.routes,
            self.change_log.entries,
            self.metrics.sends_ok,
            self.metrics.send_failures,
        )
    }
}

struct Lifecycle {
    state: CoordinatorState,
    cancel: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct DiscoveryCoordinator {
    config: DiscoveryConfig,
    table: Arc<RwLock<RoutingTable>>,
    change_log: Arc<Mutex<ChangeLog>>,
    liveness: Mutex<LivenessMonitor>,
    checker: HealthChecker,
    router: BroadcastRouter,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    metrics: Arc<DiscoveryMetrics>,
    events: broadcast::Sender<TopologyChange>,
    lifecycle: Mutex<Lifecycle>,
    message_sequence: AtomicU64,
}

impl DiscoveryCoordinator {
    pub fn new(config: DiscoveryConfig, transport: Arc<dyn Transport>, clock: Arc<dyn Clock>) -> Result<Arc<Self>> {
        config.validate()?;

        let table = Arc::new(RwLock::new(RoutingTable::from_config(&config)));
        let change_log = Arc::new(Mutex::new(ChangeLog::new(
            &config.node_id,
            config.change_log_capacity,
            config.seen_capacity,
            config.debounce_ms,
        )));
        let metrics = Arc::new(DiscoveryMetrics::new());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let router = BroadcastRouter::new(
            &config,
            Arc::clone(&transport),
            Arc::clone(&table),
            Arc::clone(&change_log),
            Arc::clone(&clock),
            Arc::clone(&metrics),
            events.clone(),
        );
        let checker = HealthChecker::new(Arc::clone(&transport), config.probe_timeout(), Arc::clone(&metrics));

        Ok(Arc::new(DiscoveryCoordinator {
            liveness: Mutex::new(LivenessMonitor::from_config(&config)),
            config,
            table,
            change_log,
            checker,
            router,
            transport,
            clock,
            metrics,
            events,
            lifecycle: Mutex::new(Lifecycle {
                state: CoordinatorState::Stopped,
                cancel: None,
                tasks: Vec::new(),
            }),
            message_sequence: AtomicU64::new(0),
        }))
    }

    pub fn local_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub async fn state(&self) -> CoordinatorState {
        self.lifecycle.lock().await.state
    }

    fn next_sequence(&self) -> u64 {
        self.message_sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Register (if not done yet), contact seeds, start the periodic loops.
    /// Calling it while running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut lifecycle = self.lifecycle.lock().await;
        if matches!(lifecycle.state, CoordinatorState::Starting | CoordinatorState::Running) {
            log::debug!("[{}] start ignored, already {:?}", self.config.node_id, lifecycle.state);
            return;
        }
        lifecycle.state = CoordinatorState::Starting;
        log::info!("[{}] 🚀 discovery starting", self.config.node_id);

        let registered = self.table.read().await.contains(&self.config.node_id);
        if !registered {
            self.register_self(Vec::<String>::new()).await;
        }
        self.bootstrap().await;

        let token = CancellationToken::new();
        let tasks = vec![
            self.spawn_periodic("announce", self.config.announce_interval_ms, token.clone(), |c| async move {
                c.announce_once().await;
            }),
            self.spawn_periodic("heartbeat", self.config.heartbeat_scan_interval_ms, token.clone(), |c| async move {
                c.heartbeat_tick().await;
            }),
            self.spawn_periodic("reconcile", self.config.reconcile_interval_ms, token.clone(), |c| async move {
                c.reconcile_once().await;
            }),
        ];

        lifecycle.cancel = Some(token);
        lifecycle.tasks = tasks;
        lifecycle.state = CoordinatorState::Running;
        log::info!("[{}] ✅ discovery running", self.config.node_id);
    }

    /// Cancel every loop and wait for them to finish. Sends already
    /// dispatched are not retracted. Calling it while stopped is a no-op.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if matches!(lifecycle.state, CoordinatorState::Stopped | CoordinatorState::Stopping) {
            return;
        }
        lifecycle.state = CoordinatorState::Stopping;
        if let Some(token) = lifecycle.cancel.take() {
            token.cancel();
        }
        for handle in std::mem::take(&mut lifecycle.tasks) {
            if let Err(e) = handle.await {
                log::warn!("[{}] loop ended abnormally: {}", self.config.node_id, e);
            }
        }
        lifecycle.state = CoordinatorState::Stopped;
        log::info!("[{}] 🛑 discovery stopped", self.config.node_id);
    }

    fn spawn_periodic<F, Fut>(
        self: &Arc<Self>,
        name: &'static str,
        period_ms: u64,
        token: CancellationToken,
        tick: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(period_ms));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            log::debug!("[{}] {} loop started ({}ms)", coordinator.config.node_id, name, period_ms);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => tick(Arc::clone(&coordinator)).await,
                }
            }
            log::debug!("[{}] {} loop stopped", coordinator.config.node_id, name);
        })
    }

    /// Send a join request to every configured seed we have not met yet.
    pub async fn bootstrap(&self) -> usize {
        let now = self.clock.now_ms();
        let pending: Vec<NodeId> = {
            let table = self.table.read().await;
            self.config
                .seeds
                .iter()
                .filter(|s| s.node_id != self.config.node_id && !table.contains(&s.node_id))
                .map(|s| s.node_id.clone())
                .collect()
        };
        if pending.is_empty() {
            return 0;
        }

        let local = self.local_node(now).await;
        let mut reached = 0;
        for seed in &pending {
            let msg = DiscoveryMessage::discover(local.clone(), self.next_sequence(), now);
            if self.send_direct(seed, msg).await {
                reached += 1;
            }
        }
        log::info!("[{}] 🌱 bootstrap: {}/{} seeds reached", self.config.node_id, reached, pending.len());
        reached
    }

    // -------------------------------------------------------------------------
    // Public API
    // -------------------------------------------------------------------------

    /// Put ourselves into the table and announce it to the network.
    pub async fn register_self<I, S>(&self, capabilities: I) -> Option<TopologyChange>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let now = self.clock.now_ms();
        let mut node = Node::new(&self.config.node_id, self.config.role, now)
            .with_capabilities(parse_capabilities(capabilities));
        if let Some(region) = &self.config.region {
            node = node.with_region(region);
        }
        log::info!(
            "[{}] 📝 registered as {:?} with {} capabilities",
            self.config.node_id,
            node.role,
            node.capabilities.len()
        );
        self.table.write().await.upsert_node(node.clone(), now);

        let change = TopologyChange::node_added(&self.config.node_id, node, DiscoveryMethod::SelfReport, now);
        self.emit_local(change).await.map(|(recorded, _)| recorded)
    }

    pub async fn get_topology_snapshot(&self) -> TopologySnapshot {
        self.table.read().await.snapshot_topology()
    }

    pub async fn recent_changes(&self, limit: usize) -> Vec<TopologyChange> {
        self.change_log.lock().await.history(limit)
    }

    pub async fn get_stats(&self) -> DiscoveryStats {
        let state = self.state().await;
        let (topology_version, last_updated, nodes, routes) = {
            let table = self.table.read().await;
            let others = NodeFilter::default().excluding(&self.config.node_id);
            (table.version(), table.last_updated(), table.list_nodes(Some(&others)), table.route_count())
        };
        let count = |status: NodeStatus| nodes.iter().filter(|n| n.status == status).count();

        DiscoveryStats {
            node_id: self.config.node_id.clone(),
            state,
            topology_version,
            last_updated,
            known_nodes: nodes.len(),
            online_nodes: count(NodeStatus::Online),
            degraded_nodes: count(NodeStatus::Degraded),
            offline_nodes: count(NodeStatus::Offline),
            routes,
            subscribers: self.events.receiver_count(),
            change_log: self.change_log.lock().await.stats(),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Raw event stream: every locally recorded change and every remote
    /// change applied here.
    pub fn subscribe(&self) -> broadcast::Receiver<TopologyChange> {
        self.events.subscribe()
    }

    /// Run `callback` for every topology change on its own task, so a slow
    /// callback never stalls discovery.
    pub fn on_topology_change<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(TopologyChange) + Send + Sync + 'static,
    {
        let mut rx = self.events.subscribe();
        let node_id = self.config.node_id.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(change) => callback(change),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        log::warn!("[{}] topology subscriber lagged, {} events missed", node_id, missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    // -------------------------------------------------------------------------
    // Inbound
    // -------------------------------------------------------------------------

    /// Entry point for every message the transport delivers to this node.
    pub async fn handle_message(&self, msg: DiscoveryMessage) -> InboundOutcome {
        if let MessagePayload::ChangeBroadcast { .. } = msg.payload {
            return self.router.handle_inbound(msg).await;
        }

        DiscoveryMetrics::incr(&self.metrics.messages_received);
        if let Err(e) = msg.validate(self.config.max_ttl) {
            DiscoveryMetrics::incr(&self.metrics.malformed_dropped);
            log::warn!("[{}] 🚫 dropped malformed {:?}: {}", self.config.node_id, msg.kind, e);
            return InboundOutcome::Malformed(e.to_string());
        }
        if msg.origin_id == self.config.node_id {
            return InboundOutcome::Duplicate;
        }

        let now = self.clock.now_ms();
        let mut changes = Vec::new();
        let mut replies: Vec<(NodeId, DiscoveryMessage)> = Vec::new();

        match msg.payload {
            MessagePayload::Discover { node } => {
                let requester = node.node_id.clone();
                changes.extend(self.observe_peer(node, now).await);
                let reply = self.announce_message(Some(&requester), now).await;
                replies.push((requester, reply));
            }
            MessagePayload::Announce { node, known_peers } => {
                changes.extend(self.observe_peer(node, now).await);
                // peer exchange: introduce ourselves to anyone we have not met
                let unknown: Vec<NodeId> = {
                    let table = self.table.read().await;
                    known_peers
                        .into_iter()
                        .filter(|p| p.node_id != self.config.node_id && !table.contains(&p.node_id))
                        .map(|p| p.node_id)
                        .collect()
                };
                if !unknown.is_empty() {
                    let local = self.local_node(now).await;
                    for peer_id in unknown {
                        replies.push((peer_id, DiscoveryMessage::discover(local.clone(), self.next_sequence(), now)));
                    }
                }
            }
            MessagePayload::Heartbeat { node_id, .. } => {
                let known = self.table.read().await.contains(&node_id);
                if known {
                    let mut liveness = self.liveness.lock().await;
                    let mut table = self.table.write().await;
                    changes.extend(liveness.record_heartbeat(&mut table, &node_id, now));
                    if let Err(e) = table.touch_direct_route(&node_id, now) {
                        log::debug!("[{}] direct route to [{}] not stored: {}", self.config.node_id, node_id, e);
                    }
                    changes.extend(self.reroute_changes(&mut table, now));
                } else {
                    // it knows us, we do not know it
                    let local = self.local_node(now).await;
                    replies.push((node_id, DiscoveryMessage::discover(local, self.next_sequence(), now)));
                }
            }
            MessagePayload::ChangeBroadcast { .. } => {}
        }

        let produced = changes.len();
        for change in changes {
            self.emit_local(change).await;
        }
        for (peer_id, reply) in replies {
            self.send_direct(&peer_id, reply).await;
        }

        InboundOutcome::Processed { applied: produced, stale: 0, skipped: 0, forwarded: None }
    }

    /// Feed every message arriving on `inbox` into `handle_message` until
    /// the channel closes.
    pub fn spawn_inbox(self: &Arc<Self>, mut inbox: Inbox) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(msg) = inbox.recv().await {
                coordinator.handle_message(msg).await;
            }
            log::debug!("[{}] inbox closed", coordinator.config.node_id);
        })
    }

    /// A node spoke to us directly. New nodes become a NodeAdded; known ones
    /// get their self-description refreshed and count as a heartbeat.
    async fn observe_peer(&self, mut node: Node, now: i64) -> Vec<TopologyChange> {
        if node.node_id == self.config.node_id {
            return Vec::new();
        }
        let mut liveness = self.liveness.lock().await;
        let mut table = self.table.write().await;

        let change = match table.get_node(&node.node_id) {
            Some(existing) => {
                if existing.role != node.role
                    || existing.region != node.region
                    || existing.endpoints != node.endpoints
                    || existing.capabilities != node.capabilities
                {
                    let mut merged = existing;
                    merged.role = node.role;
                    merged.region = node.region;
                    merged.endpoints = node.endpoints;
                    merged.capabilities = node.capabilities;
                    table.upsert_node(merged, now);
                }
                liveness.record_heartbeat(&mut table, &node.node_id, now)
            }
            None => {
                // liveness estimates are ours to make, not the peer's
                node.status = NodeStatus::Online;
                node.first_seen = now;
                node.last_seen = now;
                node.latency_estimate_ms = 0.0;
                node.reliability_score = 1.0;
                log::info!("[{}] 🆕 discovered [{}] ({:?})", self.config.node_id, node.node_id, node.role);
                table.upsert_node(node.clone(), now);
                Some(TopologyChange::node_added(&self.config.node_id, node.clone(), DiscoveryMethod::SelfReport, now))
            }
        };
        if let Err(e) = table.touch_direct_route(&node.node_id, now) {
            log::debug!("[{}] direct route to [{}] not stored: {}", self.config.node_id, node.node_id, e);
        }
        let mut changes: Vec<TopologyChange> = change.into_iter().collect();
        changes.extend(self.reroute_changes(&mut table, now));
        changes
    }

    /// One RouteChanged per destination whose preferred path moved.
    fn reroute_changes(&self, table: &mut RoutingTable, now: i64) -> Vec<TopologyChange> {
        table
            .take_rerouted()
            .into_iter()
            .map(|route| {
                log::info!(
                    "[{}] 🔀 preferred route to [{}] now via [{}] ({} hops)",
                    self.config.node_id,
                    route.destination_id,
                    route.next_hop,
                    route.hop_count
                );
                TopologyChange::route_changed(&self.config.node_id, route, now)
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Local changes
    // -------------------------------------------------------------------------

    /// Record → notify → propagate. Returns `None` if the change was
    /// coalesced into one already recorded.
    pub async fn emit_local(&self, change: TopologyChange) -> Option<(TopologyChange, PropagationReport)> {
        let now = self.clock.now_ms();
        let recorded = self.change_log.lock().await.record_local(change, now)?;
        DiscoveryMetrics::incr(&self.metrics.local_changes);

        // no subscribers is fine
        let _ = self.events.send(recorded.clone());

        let peers = self.table.read().await.peers();
        let report = self.router.propagate(recorded.clone(), &peers).await;
        Some((recorded, report))
    }

    // -------------------------------------------------------------------------
    // Periodic work (also callable directly)
    // -------------------------------------------------------------------------

    pub async fn announce_once(&self) -> usize {
        let now = self.clock.now_ms();
        let msg = self.announce_message(None, now).await;
        let peers = self.table.read().await.peers();

        let mut delivered = 0;
        for peer in &peers {
            if self.send_direct(&peer.node_id, msg.clone()).await {
                delivered += 1;
            }
        }
        // seeds that never answered get another join request
        self.bootstrap().await;

        log::debug!("[{}] 📣 announced to {}/{} peers", self.config.node_id, delivered, peers.len());
        delivered
    }

    pub async fn send_heartbeats(&self) -> usize {
        let now = self.clock.now_ms();
        let peers = self.table.read().await.peers();
        let msg = DiscoveryMessage::heartbeat(&self.config.node_id, self.next_sequence(), now);

        let mut delivered = 0;
        for peer in &peers {
            if self.send_direct(&peer.node_id, msg.clone()).await {
                delivered += 1;
            }
        }
        delivered
    }

    /// Silence scan only; returns the number of changes recorded.
    pub async fn heartbeat_scan_once(&self) -> usize {
        let now = self.clock.now_ms();
        let changes = {
            let mut liveness = self.liveness.lock().await;
            let mut table = self.table.write().await;
            let mut changes = liveness.scan_heartbeats(&mut table, now);
            changes.extend(self.reroute_changes(&mut table, now));
            changes
        };
        let mut recorded = 0;
        for change in changes {
            if self.emit_local(change).await.is_some() {
                recorded += 1;
            }
        }
        recorded
    }

    async fn heartbeat_tick(&self) {
        self.send_heartbeats().await;
        self.heartbeat_scan_once().await;
    }

    /// Probe every known node, fold the results in, recompute routes.
    /// Returns the number of changes recorded.
    pub async fn reconcile_once(&self) -> usize {
        let nodes = {
            let table = self.table.read().await;
            table.list_nodes(Some(&NodeFilter::default().excluding(&self.config.node_id)))
        };
        let probed = nodes.len();
        let results = self.checker.check_all(nodes).await;

        let now = self.clock.now_ms();
        let (changes, reroutes, purged) = {
            let mut liveness = self.liveness.lock().await;
            let mut table = self.table.write().await;
            let changes: Vec<TopologyChange> = results
                .iter()
                .filter_map(|(node_id, result)| liveness.apply_probe(&mut table, node_id, result, now))
                .collect();
            let purged = table.recompute_routes(now);
            (changes, self.reroute_changes(&mut table, now), purged)
        };

        let mut recorded = 0;
        let transitions = changes.len();
        let rerouted = reroutes.len();
        for change in changes.into_iter().chain(reroutes) {
            if self.emit_local(change).await.is_some() {
                recorded += 1;
            }
        }
        if transitions > 0 || rerouted > 0 || purged > 0 {
            let rescan = TopologyChange::new(
                &self.config.node_id,
                ChangeType::TopologyRescanned,
                &self.config.node_id,
                DiscoveryMethod::Scan,
                now,
            );
            if self.emit_local(rescan).await.is_some() {
                recorded += 1;
            }
        }

        log::info!(
            "[{}] 🔍 reconcile: probed {} nodes, {} transitions, {} reroutes, {} routes purged",
            self.config.node_id,
            probed,
            transitions,
            rerouted,
            purged
        );
        recorded
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    async fn local_node(&self, now: i64) -> Node {
        if let Some(node) = self.table.read().await.get_node(&self.config.node_id) {
            return node;
        }
        let node = Node::new(&self.config.node_id, self.config.role, now);
        match &self.config.region {
            Some(region) => node.with_region(region),
            None => node,
        }
    }

    async fn announce_message(&self, exclude: Option<&str>, now: i64) -> DiscoveryMessage {
        let local = self.local_node(now).await;
        let known_peers: Vec<Node> = self
            .table
            .read()
            .await
            .peers()
            .into_iter()
            .filter(|p| Some(p.node_id.as_str()) != exclude)
            .collect();
        DiscoveryMessage::announce(local, known_peers, self.next_sequence(), now)
    }

    async fn send_direct(&self, peer_id: &str, msg: DiscoveryMessage) -> bool {
        match self.transport.send(peer_id, msg).await {
            Ok(()) => {
                DiscoveryMetrics::incr(&self.metrics.sends_ok);
                true
            }
            Err(e) => {
                DiscoveryMetrics::incr(&self.metrics.send_failures);
                log::debug!("[{}] send to [{}] failed: {}", self.config.node_id, peer_id, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::SeedNode;
    use crate::message::{MessageKind, PropagationPattern};
    use crate::node::NodeRole;
    use crate::transport::{LinkState, MemoryNetwork};

    async fn node(net: &MemoryNetwork, config: DiscoveryConfig, clock: &Arc<ManualClock>) -> (Arc<DiscoveryCoordinator>, Inbox) {
        let (transport, inbox) = net.register(&config.node_id).await;
        let coordinator = DiscoveryCoordinator::new(config, transport, clock.clone()).unwrap();
        (coordinator, inbox)
    }

    /// Deliver queued messages until the network is quiet.
    async fn settle(nodes: &[Arc<DiscoveryCoordinator>], inboxes: &mut [Inbox]) {
        for _ in 0..100 {
            let mut moved = 0;
            for (coordinator, inbox) in nodes.iter().zip(inboxes.iter_mut()) {
                while let Ok(msg) = inbox.try_recv() {
                    coordinator.handle_message(msg).await;
                    moved += 1;
                }
            }
            if moved == 0 {
                return;
            }
        }
        panic!("network did not settle");
    }

    fn added_broadcast(origin: &str) -> DiscoveryMessage {
        let mut change = TopologyChange::node_added(
            origin,
            Node::new(origin, NodeRole::Peer, 0),
            DiscoveryMethod::SelfReport,
            0,
        );
        change.seal(1);
        DiscoveryMessage::change_broadcast(origin, vec![change], PropagationPattern::Hierarchical, 5, 0)
    }

    #[tokio::test]
    async fn test_register_self_and_three_broadcasts() {
        let net = MemoryNetwork::new();
        let clock = Arc::new(ManualClock::new(1_000));
        let (a, _inbox) = node(&net, DiscoveryConfig::new("A"), &clock).await;

        a.register_self(["relay", "storage"]).await.unwrap();
        assert_eq!(a.get_topology_snapshot().await.version, 1);

        for origin in ["n1", "n2", "n3"] {
            let outcome = a.handle_message(added_broadcast(origin)).await;
            assert!(matches!(outcome, InboundOutcome::Processed { applied: 1, .. }));
        }

        let snapshot = a.get_topology_snapshot().await;
        assert_eq!(snapshot.nodes.len(), 4);
        assert_eq!(snapshot.version, 4);
        assert_eq!(snapshot.node("A").unwrap().capabilities.len(), 2);
    }

    #[tokio::test]
    async fn test_silent_peer_goes_offline_once() {
        let net = MemoryNetwork::new();
        let clock = Arc::new(ManualClock::new(0));
        let (a, _inbox) = node(&net, DiscoveryConfig::new("A"), &clock).await;
        a.register_self(Vec::<String>::new()).await;

        let announce = DiscoveryMessage::announce(Node::new("quiet", NodeRole::Peer, 0), vec![], 1, 0);
        a.handle_message(announce).await;

        let removed = |changes: &[TopologyChange]| {
            changes.iter().filter(|c| c.change_type == ChangeType::NodeRemoved).count()
        };

        for tick in 1..=6 {
            clock.set_ms(tick * 10_000);
            a.send_heartbeats().await;
            a.heartbeat_scan_once().await;

            let status = a.get_topology_snapshot().await.node("quiet").unwrap().status;
            if tick < 4 {
                assert_eq!(status, NodeStatus::Online, "tick {}", tick);
            } else {
                assert_eq!(status, NodeStatus::Offline, "tick {}", tick);
            }
        }
        assert_eq!(removed(&a.recent_changes(100).await), 1);
        assert_eq!(a.get_stats().await.offline_nodes, 1);
    }

    #[tokio::test]
    async fn test_discover_is_answered_with_announce() {
        let net = MemoryNetwork::new();
        let clock = Arc::new(ManualClock::new(1_000));
        let (a, _a_inbox) = node(&net, DiscoveryConfig::new("A"), &clock).await;
        let (_probe, mut b_inbox) = net.register("B").await;
        a.register_self(Vec::<String>::new()).await;
        a.handle_message(DiscoveryMessage::announce(Node::new("C", NodeRole::Relay, 0), vec![], 1, 0))
            .await;

        a.handle_message(DiscoveryMessage::discover(Node::new("B", NodeRole::Peer, 0), 1, 1_000))
            .await;

        let mut kinds = Vec::new();
        while let Ok(msg) = b_inbox.try_recv() {
            if let MessagePayload::Announce { node, known_peers } = &msg.payload {
                assert_eq!(node.node_id, "A");
                let ids: Vec<&str> = known_peers.iter().map(|p| p.node_id.as_str()).collect();
                assert_eq!(ids, vec!["C"]);
            }
            kinds.push(msg.kind);
        }
        assert!(kinds.contains(&MessageKind::Announce));
        assert!(kinds.contains(&MessageKind::ChangeBroadcast));
        assert!(a.get_topology_snapshot().await.node("B").is_some());
    }

    #[tokio::test]
    async fn test_cluster_converges_and_detects_failure() {
        let net = MemoryNetwork::new();
        let clock = Arc::new(ManualClock::new(1_000));
        let seeds = vec![SeedNode::new("A", "mem://A", "EU")];

        let (a, a_inbox) = node(&net, DiscoveryConfig::new("A").with_rng_seed(1), &clock).await;
        let (b, b_inbox) = node(&net, DiscoveryConfig::new("B").with_seeds(seeds.clone()).with_rng_seed(2), &clock).await;
        let (c, c_inbox) = node(&net, DiscoveryConfig::new("C").with_seeds(seeds).with_rng_seed(3), &clock).await;
        let nodes = vec![a.clone(), b.clone(), c.clone()];
        let mut inboxes = vec![a_inbox, b_inbox, c_inbox];

        for n in &nodes {
            n.register_self(Vec::<String>::new()).await;
        }
        assert_eq!(b.bootstrap().await, 1);
        assert_eq!(c.bootstrap().await, 1);
        settle(&nodes, &mut inboxes).await;

        for n in &nodes {
            let snapshot = n.get_topology_snapshot().await;
            assert_eq!(snapshot.nodes.len(), 3, "{} knows everyone", n.local_id());
            assert!(snapshot.nodes.iter().all(|x| x.status == NodeStatus::Online));
        }
        assert!(a.get_topology_snapshot().await.preferred_route("C").is_some());

        net.set_link("C", LinkState::Down).await;
        clock.advance_ms(40_000);
        a.send_heartbeats().await;
        b.send_heartbeats().await;
        settle(&nodes, &mut inboxes).await;

        assert_eq!(a.heartbeat_scan_once().await, 1);
        settle(&nodes, &mut inboxes).await;

        for n in [&a, &b] {
            let snapshot = n.get_topology_snapshot().await;
            assert_eq!(snapshot.node("C").unwrap().status, NodeStatus::Offline, "seen by {}", n.local_id());
            assert_eq!(snapshot.node(if n.local_id() == "A" { "B" } else { "A" }).unwrap().status, NodeStatus::Online);
            assert!(snapshot.preferred_route("C").is_none());
        }
    }

    #[tokio::test]
    async fn test_subscribers_see_local_and_remote_changes() {
        let net = MemoryNetwork::new();
        let clock = Arc::new(ManualClock::new(1_000));
        let (a, _inbox) = node(&net, DiscoveryConfig::new("A"), &clock).await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _handle = a.on_topology_change(move |change| {
            let _ = tx.send(change.subject_node_id);
        });

        a.register_self(Vec::<String>::new()).await;
        a.handle_message(added_broadcast("n1")).await;

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(first.as_deref(), Some("A"));
        assert_eq!(second.as_deref(), Some("n1"));
        assert_eq!(a.get_stats().await.subscribers, 1);
    }

    #[tokio::test]
    async fn test_reconcile_probes_and_rescans() {
        let net = MemoryNetwork::new();
        let clock = Arc::new(ManualClock::new(1_000));
        let (a, _inbox) = node(&net, DiscoveryConfig::new("A"), &clock).await;
        let (_b, _b_inbox) = net.register("B").await;
        a.register_self(Vec::<String>::new()).await;
        a.handle_message(DiscoveryMessage::announce(Node::new("B", NodeRole::Peer, 0), vec![], 1, 0))
            .await;

        net.set_link("B", LinkState::Down).await;
        assert!(a.reconcile_once().await >= 2, "Degraded transition plus rescan");
        assert_eq!(a.get_topology_snapshot().await.node("B").unwrap().status, NodeStatus::Degraded);

        clock.advance_ms(2_000);
        a.reconcile_once().await;
        assert_eq!(a.get_topology_snapshot().await.node("B").unwrap().status, NodeStatus::Offline);

        net.set_link("B", LinkState::Up).await;
        clock.advance_ms(2_000);
        a.reconcile_once().await;
        let snapshot = a.get_topology_snapshot().await;
        assert_eq!(snapshot.node("B").unwrap().status, NodeStatus::Online);
        assert!(snapshot.preferred_route("B").is_some());

        let history = a.recent_changes(100).await;
        assert!(history.iter().any(|c| c.change_type == ChangeType::TopologyRescanned));
        assert!(a.get_stats().await.metrics.probe_failures >= 2);
    }

    fn drain(inbox: &mut Inbox) -> Vec<DiscoveryMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = inbox.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn test_direct_contact_reroutes_and_broadcasts_route_change() {
        let net = MemoryNetwork::new();
        let clock = Arc::new(ManualClock::new(1_000));
        let (a, mut a_inbox) = node(&net, DiscoveryConfig::new("A"), &clock).await;
        let (b, mut b_inbox) = node(&net, DiscoveryConfig::new("B"), &clock).await;
        let (_mid, _mid_inbox) = net.register("mid").await;
        let (_far, _far_inbox) = net.register("far").await;

        a.register_self(Vec::<String>::new()).await;
        b.register_self(Vec::<String>::new()).await;
        a.handle_message(DiscoveryMessage::announce(Node::new("mid", NodeRole::Relay, 0), vec![], 1, 1_000)).await;
        a.handle_message(DiscoveryMessage::announce(Node::new("B", NodeRole::Peer, 0), vec![], 1, 1_000)).await;
        b.handle_message(DiscoveryMessage::announce(Node::new("A", NodeRole::Peer, 0), vec![], 1, 1_000)).await;
        drain(&mut a_inbox);
        drain(&mut b_inbox);

        // "far" first becomes known through a broadcast relayed by "mid"
        let mut far_added = TopologyChange::node_added("far", Node::new("far", NodeRole::Peer, 0), DiscoveryMethod::SelfReport, 0);
        far_added.seal(1);
        let relayed = DiscoveryMessage::change_broadcast("far", vec![far_added], PropagationPattern::Hierarchical, 1, 0)
            .forwarded("mid", 0)
            .unwrap();
        a.handle_message(relayed).await;
        assert_eq!(a.get_topology_snapshot().await.preferred_route("far").unwrap().next_hop, "mid");
        drain(&mut b_inbox);

        // then it talks to us directly
        a.handle_message(DiscoveryMessage::heartbeat("far", 2, 1_000)).await;

        let history = a.recent_changes(10).await;
        let rerouted = history.iter().find(|c| c.change_type == ChangeType::RouteChanged).unwrap();
        assert_eq!(rerouted.subject_node_id, "far");
        assert_eq!(rerouted.route.as_ref().unwrap().path, vec!["far".to_string()]);

        let delivered = drain(&mut b_inbox);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].pattern, Some(PropagationPattern::Hierarchical));
        assert_eq!(delivered[0].changes()[0].change_type, ChangeType::RouteChanged);

        let outcome = b.handle_message(delivered[0].clone()).await;
        assert!(matches!(outcome, InboundOutcome::Processed { applied: 1, .. }));
        let route = b.get_topology_snapshot().await.preferred_route("far").cloned().unwrap();
        assert_eq!(route.path, vec!["A".to_string(), "far".to_string()]);
    }

    #[tokio::test]
    async fn test_broadcast_stops_after_ttl_hops() {
        const TTL: u8 = 3;
        let net = MemoryNetwork::new();
        let clock = Arc::new(ManualClock::new(1_000));
        let ids: Vec<String> = (0..TTL as usize + 4).map(|i| format!("n{}", i)).collect();

        let mut nodes = Vec::new();
        let mut inboxes = Vec::new();
        for id in &ids {
            let (coordinator, inbox) = node(&net, DiscoveryConfig::new(id), &clock).await;
            coordinator.register_self(Vec::<String>::new()).await;
            nodes.push(coordinator);
            inboxes.push(inbox);
        }
        // a line: each node only knows its two neighbours
        for i in 0..nodes.len() {
            for j in [i.wrapping_sub(1), i + 1] {
                if let Some(neighbour) = ids.get(j) {
                    let hello = DiscoveryMessage::announce(Node::new(neighbour, NodeRole::Peer, 0), vec![], 1, 1_000);
                    nodes[i].handle_message(hello).await;
                }
            }
        }
        for inbox in inboxes.iter_mut() {
            drain(inbox);
        }

        let mut seen_before = Vec::new();
        for n in &nodes {
            seen_before.push(n.get_stats().await.change_log.seen_ids);
        }

        let mut change = TopologyChange::node_added("src", Node::new("src", NodeRole::Peer, 0), DiscoveryMethod::SelfReport, 0);
        change.seal(1);
        let msg = DiscoveryMessage::change_broadcast("src", vec![change], PropagationPattern::Flood, TTL, 0);
        nodes[0].handle_message(msg).await;
        settle(&nodes, &mut inboxes).await;

        let mut applied = 0;
        for (i, n) in nodes.iter().enumerate() {
            let knows_src = n.get_topology_snapshot().await.node("src").is_some();
            assert_eq!(knows_src, i <= TTL as usize, "{}", ids[i]);
            applied += knows_src as usize;

            let grown = n.get_stats().await.change_log.seen_ids - seen_before[i];
            assert!(grown <= 1, "{} marked {} ids", ids[i], grown);
        }
        assert_eq!(applied, TTL as usize + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_idempotent() {
        let net = MemoryNetwork::new();
        let clock = Arc::new(ManualClock::new(1_000));
        let (a, _inbox) = node(&net, DiscoveryConfig::new("A"), &clock).await;

        assert_eq!(a.state().await, CoordinatorState::Stopped);
        a.start().await;
        a.start().await;
        assert_eq!(a.state().await, CoordinatorState::Running);
        assert_eq!(a.get_topology_snapshot().await.nodes.len(), 1, "start registers self");

        tokio::time::sleep(Duration::from_secs(65)).await;

        a.stop().await;
        a.stop().await;
        assert_eq!(a.state().await, CoordinatorState::Stopped);

        a.start().await;
        assert_eq!(a.state().await, CoordinatorState::Running);
        a.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let net = MemoryNetwork::new();
        let (transport, _inbox) = net.register("A").await;
        let mut config = DiscoveryConfig::new("A");
        config.heartbeat_scan_interval_ms = 20_000;
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        assert!(DiscoveryCoordinator::new(config, transport, clock).is_err());
    }
}
