// =============================================================================
// FEDERATION DISCOVERY — transport.rs
// Transport collaborator + in-process network
// =============================================================================
//
// The discovery core never opens sockets. It talks to peers through the
// `Transport` trait:
//   send(peer, message)  best effort, may fail
//   probe(peer)          health check; callers bound it with a timeout
//
// MemoryNetwork is a hub of mailboxes that lets several coordinators run in
// one process (demo binary, cluster tests). Links can be taken down or
// stalled to simulate failures.
// =============================================================================

use crate::error::TransportError;
use crate::message::DiscoveryMessage;
use crate::node::NodeId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResult {
    pub healthy: bool,
    pub latency_ms: f64,
}

impl HealthResult {
    pub fn healthy(latency_ms: f64) -> Self {
        HealthResult { healthy: true, latency_ms }
    }

    pub fn unhealthy() -> Self {
        HealthResult { healthy: false, latency_ms: 0.0 }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, peer_id: &str, message: DiscoveryMessage) -> Result<(), TransportError>;

    async fn probe(&self, peer_id: &str) -> Result<HealthResult, TransportError>;
}

// -----------------------------------------------------------------------------
// MemoryNetwork
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Up,
    /// sends and probes fail immediately
    Down,
    /// sends are dropped, probes never answer
    Stalled,
}

pub type Inbox = mpsc::UnboundedReceiver<DiscoveryMessage>;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct NetworkStats {
    pub registered: usize,
    pub delivered: u64,
    pub failed: u64,
}

#[derive(Default)]
struct NetworkState {
    mailboxes: HashMap<NodeId, mpsc::UnboundedSender<DiscoveryMessage>>,
    links: HashMap<NodeId, LinkState>,
    latency_ms: HashMap<NodeId, f64>,
    delivered: u64,
    failed: u64,
}

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<RwLock<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node; returns its transport handle and inbox.
    pub async fn register(&self, node_id: &str) -> (Arc<MemoryTransport>, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.write().await;
        state.mailboxes.insert(node_id.to_string(), tx);
        state.links.insert(node_id.to_string(), LinkState::Up);
        let transport = MemoryTransport { local_id: node_id.to_string(), network: self.clone() };
        (Arc::new(transport), rx)
    }

    pub async fn set_link(&self, node_id: &str, link: LinkState) {
        self.state.write().await.links.insert(node_id.to_string(), link);
    }

    pub async fn set_latency(&self, node_id: &str, latency_ms: f64) {
        self.state.write().await.latency_ms.insert(node_id.to_string(), latency_ms);
    }

    pub async fn stats(&self) -> NetworkStats {
        let state = self.state.read().await;
        NetworkStats {
            registered: state.mailboxes.len(),
            delivered: state.delivered,
            failed: state.failed,
        }
    }

    async fn link(&self, node_id: &str) -> Option<LinkState> {
        self.state.read().await.links.get(node_id).copied()
    }
}

pub struct MemoryTransport {
    local_id: NodeId,
    network: MemoryNetwork,
}

impl MemoryTransport {
    pub fn local_id(&self) -> &str {
        &self.local_id
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, peer_id: &str, message: DiscoveryMessage) -> Result<(), TransportError> {
        let own = self.network.link(&self.local_id).await;
        let peer = self.network.link(peer_id).await;

        let mut state = self.network.state.write().await;
        let outcome = match (own, peer) {
            (_, None) => Err(TransportError::UnknownPeer(peer_id.to_string())),
            (Some(LinkState::Down), _) | (_, Some(LinkState::Down)) => {
                Err(TransportError::Unreachable(peer_id.to_string()))
            }
            // stalled links swallow traffic without reporting an error
            (Some(LinkState::Stalled), _) | (_, Some(LinkState::Stalled)) => Ok(()),
            _ => match state.mailboxes.get(peer_id) {
                Some(tx) => tx.send(message).map_err(|e| TransportError::SendFailed {
                    peer: peer_id.to_string(),
                    reason: e.to_string(),
                }),
                None => Err(TransportError::UnknownPeer(peer_id.to_string())),
            },
        };
        match outcome {
            Ok(()) => state.delivered += 1,
            Err(_) => state.failed += 1,
        }
        outcome
    }

    async fn probe(&self, peer_id: &str) -> Result<HealthResult, TransportError> {
        match self.network.link(peer_id).await {
            None => Err(TransportError::UnknownPeer(peer_id.to_string())),
            Some(LinkState::Down) => Err(TransportError::Unreachable(peer_id.to_string())),
            Some(LinkState::Stalled) => {
                // callers are expected to wrap probes in a timeout
                tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;
                Err(TransportError::Unreachable(peer_id.to_string()))
            }
            Some(LinkState::Up) => {
                let latency = self
                    .network
                    .state
                    .read()
                    .await
                    .latency_ms
                    .get(peer_id)
                    .copied()
                    .unwrap_or(1.0);
                Ok(HealthResult::healthy(latency))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Node, NodeRole};

    #[tokio::test]
    async fn test_memory_network_delivery() {
        let net = MemoryNetwork::new();
        let (a, _a_inbox) = net.register("a").await;
        let (_b, mut b_inbox) = net.register("b").await;

        let msg = DiscoveryMessage::heartbeat("a", 1, 0);
        a.send("b", msg.clone()).await.unwrap();
        assert_eq!(b_inbox.recv().await.unwrap(), msg);

        let err = a.send("ghost", msg.clone()).await.unwrap_err();
        assert_eq!(err, TransportError::UnknownPeer("ghost".into()));

        let stats = net.stats().await;
        assert_eq!(stats.registered, 2);
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_down_link_fails_fast() {
        let net = MemoryNetwork::new();
        let (a, _) = net.register("a").await;
        let (_b, _) = net.register("b").await;
        net.set_link("b", LinkState::Down).await;

        let announce = DiscoveryMessage::announce(Node::new("a", NodeRole::Peer, 0), vec![], 1, 0);
        assert!(matches!(a.send("b", announce).await, Err(TransportError::Unreachable(_))));
        assert!(a.probe("b").await.is_err());

        net.set_link("b", LinkState::Up).await;
        net.set_latency("b", 12.5).await;
        assert_eq!(a.probe("b").await.unwrap(), HealthResult::healthy(12.5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_probe_needs_timeout() {
        let net = MemoryNetwork::new();
        let (a, _) = net.register("a").await;
        let (_b, _) = net.register("b").await;
        net.set_link("b", LinkState::Stalled).await;

        let probe = tokio::time::timeout(Duration::from_secs(2), a.probe("b")).await;
        assert!(probe.is_err(), "stalled probe must hit the timeout");
    }
}
