//! Protocol constants for Federation Discovery
//!
//! Defaults for every tunable in `DiscoveryConfig` live here so the
//! config layer, the tests and the binary agree on one set of numbers.

/// The name of the discovery layer
pub const NETWORK_NAME: &str = "Federation Discovery";

/// Protocol version carried in every envelope
pub const PROTOCOL_VERSION: &str = "1.0.0-alpha";

/// Project tagline
pub const TAGLINE: &str = "Eventually-consistent topology without a central coordinator";

// ═══════════════════════════════════════════════════════════════
// Scheduling
// ═══════════════════════════════════════════════════════════════

pub const DEFAULT_ANNOUNCE_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_HEARTBEAT_SCAN_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_RECONCILE_INTERVAL_MS: u64 = 120_000;
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 2_000;

// ═══════════════════════════════════════════════════════════════
// Propagation
// ═══════════════════════════════════════════════════════════════

/// Flood TTL; also the upper bound accepted on inbound envelopes
pub const MAX_TTL: u8 = 10;

/// TTL for hierarchical and gossip broadcasts
pub const DEFAULT_TTL: u8 = 5;

/// Gossip sends to ⌈peers / GOSSIP_DIVISOR⌉ peers
pub const GOSSIP_DIVISOR: usize = 3;

// ═══════════════════════════════════════════════════════════════
// Capacities
// ═══════════════════════════════════════════════════════════════

pub const DEFAULT_CHANGE_LOG_CAPACITY: usize = 1000;
pub const DEFAULT_SEEN_CAPACITY: usize = 1000;
pub const DEFAULT_DEBOUNCE_MS: u64 = 1_000;
pub const MAX_ALTERNATE_ROUTES: usize = 3;
pub const DEFAULT_MAX_HOPS: usize = 10;

/// Topology events buffered per subscriber before it starts lagging
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

// ═══════════════════════════════════════════════════════════════
// Route cost & liveness scoring
// ═══════════════════════════════════════════════════════════════

pub const DEFAULT_HOP_WEIGHT: f64 = 10.0;
pub const DEFAULT_LATENCY_WEIGHT: f64 = 0.1;
pub const DEFAULT_UNRELIABILITY_WEIGHT: f64 = 50.0;

/// EWMA factor for reliability and latency estimates
pub const RELIABILITY_ALPHA: f64 = 0.2;

/// Consecutive failed probes that take a node Offline
pub const OFFLINE_AFTER_FAILED_PROBES: u32 = 2;

/// Print the node banner
pub fn print_banner() {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              FEDERATION DISCOVERY NODE                    ║");
    println!("║                                                            ║");
    println!("║  Routing table • Liveness • Flood / Hierarchy / Gossip    ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    println!();
    println!("  {} v{}", NETWORK_NAME, PROTOCOL_VERSION);
    println!("  {}", TAGLINE);
    println!();
}
