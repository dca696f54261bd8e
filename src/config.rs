// =============================================================================
// FEDERATION DISCOVERY — config.rs
// Tunables, env overrides, seed list
// =============================================================================
//
// Every value has a default in constants.rs. `from_env()` applies overrides:
//   DISCOVERY_NODE_ID, DISCOVERY_ROLE, DISCOVERY_REGION
//   DISCOVERY_ANNOUNCE_INTERVAL_MS, DISCOVERY_SCAN_INTERVAL_MS,
//   DISCOVERY_RECONCILE_INTERVAL_MS, DISCOVERY_HEARTBEAT_TIMEOUT_MS,
//   DISCOVERY_PROBE_TIMEOUT_MS, DISCOVERY_MAX_TTL, DISCOVERY_DEFAULT_TTL
//   DISCOVERY_SEEDS="node_id,address,region;node_id,address,region"
// =============================================================================

use crate::constants::*;
use crate::error::{DiscoveryError, Result};
use crate::node::NodeRole;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const MAX_SEED_NODES: usize = 8;

// -----------------------------------------------------------------------------
// SeedNode: bootstrap contact
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedNode {
    pub node_id: String,
    pub address: String,
    pub region: String,
}

impl SeedNode {
    pub fn new(node_id: &str, address: &str, region: &str) -> Self {
        SeedNode {
            node_id: node_id.to_string(),
            address: address.to_string(),
            region: region.to_string(),
        }
    }
}

/// Parse `node_id,address,region;...`. Malformed entries are skipped.
pub fn parse_seeds(raw: &str) -> Vec<SeedNode> {
    let mut out = Vec::new();
    for item in raw.split(';') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let parts: Vec<&str> = item.split(',').map(|s| s.trim()).collect();
        if parts.len() < 3 || parts.iter().any(|p| p.is_empty()) {
            log::warn!("DISCOVERY_SEEDS entry ignored (need 3 parts): {}", item);
            continue;
        }
        out.push(SeedNode::new(parts[0], parts[1], parts[2]));
        if out.len() >= MAX_SEED_NODES {
            break;
        }
    }
    out
}

// -----------------------------------------------------------------------------
// RouteWeights
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RouteWeights {
    pub hop: f64,
    pub latency: f64,
    pub unreliability: f64,
}

impl Default for RouteWeights {
    fn default() -> Self {
        RouteWeights {
            hop: DEFAULT_HOP_WEIGHT,
            latency: DEFAULT_LATENCY_WEIGHT,
            unreliability: DEFAULT_UNRELIABILITY_WEIGHT,
        }
    }
}

impl RouteWeights {
    pub fn cost(&self, hop_count: usize, latency_ms: f64, reliability: f64) -> f64 {
        hop_count as f64 * self.hop
            + latency_ms.max(0.0) * self.latency
            + (1.0 - reliability.clamp(0.0, 1.0)) * self.unreliability
    }
}

// -----------------------------------------------------------------------------
// DiscoveryConfig
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub node_id: String,
    pub role: NodeRole,
    pub region: Option<String>,
    pub seeds: Vec<SeedNode>,

    pub announce_interval_ms: u64,
    pub heartbeat_scan_interval_ms: u64,
    pub reconcile_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub probe_timeout_ms: u64,

    pub max_ttl: u8,
    pub default_ttl: u8,

    pub change_log_capacity: usize,
    pub seen_capacity: usize,
    pub debounce_ms: u64,

    pub max_hops: usize,
    pub max_alternate_routes: usize,
    pub route_weights: RouteWeights,

    /// Fixed seed for gossip peer selection; `None` draws from entropy.
    pub rng_seed: Option<u64>,
}

impl DiscoveryConfig {
    pub fn new(node_id: &str) -> Self {
        DiscoveryConfig {
            node_id: node_id.to_string(),
            role: NodeRole::Peer,
            region: None,
            seeds: vec![],
            announce_interval_ms: DEFAULT_ANNOUNCE_INTERVAL_MS,
            heartbeat_scan_interval_ms: DEFAULT_HEARTBEAT_SCAN_INTERVAL_MS,
            reconcile_interval_ms: DEFAULT_RECONCILE_INTERVAL_MS,
            heartbeat_timeout_ms: DEFAULT_HEARTBEAT_TIMEOUT_MS,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            max_ttl: MAX_TTL,
            default_ttl: DEFAULT_TTL,
            change_log_capacity: DEFAULT_CHANGE_LOG_CAPACITY,
            seen_capacity: DEFAULT_SEEN_CAPACITY,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            max_hops: DEFAULT_MAX_HOPS,
            max_alternate_routes: MAX_ALTERNATE_ROUTES,
            route_weights: RouteWeights::default(),
            rng_seed: None,
        }
    }

    pub fn with_role(mut self, role: NodeRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_region(mut self, region: &str) -> Self {
        self.region = Some(region.to_string());
        self
    }

    pub fn with_seeds(mut self, seeds: Vec<SeedNode>) -> Self {
        self.seeds = seeds;
        self
    }

    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Defaults overlaid with `DISCOVERY_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let node_id = std::env::var("DISCOVERY_NODE_ID")
            .unwrap_or_else(|_| format!("node-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]));
        let mut config = DiscoveryConfig::new(&node_id);

        if let Ok(role) = std::env::var("DISCOVERY_ROLE") {
            config.role = role.parse().map_err(DiscoveryError::InvalidConfig)?;
        }
        if let Ok(region) = std::env::var("DISCOVERY_REGION") {
            if !region.trim().is_empty() {
                config.region = Some(region.trim().to_string());
            }
        }
        if let Ok(raw) = std::env::var("DISCOVERY_SEEDS") {
            config.seeds = parse_seeds(&raw);
        }

        env_override("DISCOVERY_ANNOUNCE_INTERVAL_MS", &mut config.announce_interval_ms)?;
        env_override("DISCOVERY_SCAN_INTERVAL_MS", &mut config.heartbeat_scan_interval_ms)?;
        env_override("DISCOVERY_RECONCILE_INTERVAL_MS", &mut config.reconcile_interval_ms)?;
        env_override("DISCOVERY_HEARTBEAT_TIMEOUT_MS", &mut config.heartbeat_timeout_ms)?;
        env_override("DISCOVERY_PROBE_TIMEOUT_MS", &mut config.probe_timeout_ms)?;
        env_override("DISCOVERY_MAX_TTL", &mut config.max_ttl)?;
        env_override("DISCOVERY_DEFAULT_TTL", &mut config.default_ttl)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(DiscoveryError::InvalidConfig("node_id must not be empty".into()));
        }
        if self.heartbeat_scan_interval_ms == 0
            || self.announce_interval_ms == 0
            || self.reconcile_interval_ms == 0
        {
            return Err(DiscoveryError::InvalidConfig("intervals must be non-zero".into()));
        }
        if self.heartbeat_scan_interval_ms * 3 > self.heartbeat_timeout_ms {
            return Err(DiscoveryError::InvalidConfig(format!(
                "heartbeat scan interval {}ms must be <= 1/3 of heartbeat timeout {}ms",
                self.heartbeat_scan_interval_ms, self.heartbeat_timeout_ms
            )));
        }
        if self.probe_timeout_ms == 0 {
            return Err(DiscoveryError::InvalidConfig("probe timeout must be non-zero".into()));
        }
        if self.default_ttl > self.max_ttl {
            return Err(DiscoveryError::InvalidConfig(format!(
                "default ttl {} exceeds max ttl {}",
                self.default_ttl, self.max_ttl
            )));
        }
        if self.change_log_capacity == 0 || self.seen_capacity == 0 {
            return Err(DiscoveryError::InvalidConfig("capacities must be non-zero".into()));
        }
        if self.max_hops == 0 {
            return Err(DiscoveryError::InvalidConfig("max_hops must be non-zero".into()));
        }
        Ok(())
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig::new("local")
    }
}

fn env_override<T: std::str::FromStr>(key: &str, slot: &mut T) -> Result<()> {
    if let Ok(raw) = std::env::var(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|_| DiscoveryError::InvalidConfig(format!("{}={} is not a valid value", key, raw)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = DiscoveryConfig::new("node_a");
        assert!(config.validate().is_ok());
        assert_eq!(config.heartbeat_timeout(), Duration::from_secs(30));
        assert_eq!(config.probe_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_scan_interval_must_fit_timeout() {
        let mut config = DiscoveryConfig::new("node_a");
        config.heartbeat_scan_interval_ms = 15_000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("1/3"), "{}", err);
    }

    #[test]
    fn test_default_ttl_bounded() {
        let mut config = DiscoveryConfig::new("node_a");
        config.default_ttl = 11;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_seeds() {
        let seeds = parse_seeds("seed-01,10.0.0.1:7777,EU-DE; broken ; seed-02,10.0.0.2:7777,US-E;");
        assert_eq!(seeds.len(), 2);
        assert_eq!(seeds[0], SeedNode::new("seed-01", "10.0.0.1:7777", "EU-DE"));
        assert_eq!(seeds[1].region, "US-E");
    }

    #[test]
    fn test_route_cost() {
        let weights = RouteWeights { hop: 10.0, latency: 0.5, unreliability: 100.0 };
        let cost = weights.cost(2, 30.0, 0.9);
        assert!((cost - (20.0 + 15.0 + 10.0)).abs() < 1e-9);
        // reliability is clamped
        assert!((weights.cost(1, 0.0, 1.5) - 10.0).abs() < 1e-9);
    }
}
