use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Error and traffic counters shared by the router, the liveness monitor and
/// the coordinator. Nothing in the protocol raises an error to the caller;
/// these counters are where failures become visible.
#[derive(Debug, Default)]
pub struct DiscoveryMetrics {
    pub broadcasts_originated: AtomicU64,
    pub broadcasts_forwarded: AtomicU64,
    pub sends_ok: AtomicU64,
    pub send_failures: AtomicU64,
    pub messages_received: AtomicU64,
    pub duplicates_dropped: AtomicU64,
    pub stale_dropped: AtomicU64,
    pub malformed_dropped: AtomicU64,
    pub changes_applied: AtomicU64,
    pub changes_rejected: AtomicU64,
    pub probes_ok: AtomicU64,
    pub probe_failures: AtomicU64,
    pub probe_timeouts: AtomicU64,
    pub local_changes: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub broadcasts_originated: u64,
    pub broadcasts_forwarded: u64,
    pub sends_ok: u64,
    pub send_failures: u64,
    pub messages_received: u64,
    pub duplicates_dropped: u64,
    pub stale_dropped: u64,
    pub malformed_dropped: u64,
    pub changes_applied: u64,
    pub changes_rejected: u64,
    pub probes_ok: u64,
    pub probe_failures: u64,
    pub probe_timeouts: u64,
    pub local_changes: u64,
}

impl DiscoveryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            broadcasts_originated: get(&self.broadcasts_originated),
            broadcasts_forwarded: get(&self.broadcasts_forwarded),
            sends_ok: get(&self.sends_ok),
            send_failures: get(&self.send_failures),
            messages_received: get(&self.messages_received),
            duplicates_dropped: get(&self.duplicates_dropped),
            stale_dropped: get(&self.stale_dropped),
            malformed_dropped: get(&self.malformed_dropped),
            changes_applied: get(&self.changes_applied),
            changes_rejected: get(&self.changes_rejected),
            probes_ok: get(&self.probes_ok),
            probe_failures: get(&self.probe_failures),
            probe_timeouts: get(&self.probe_timeouts),
            local_changes: get(&self.local_changes),
        }
    }
}
