//! Federation Discovery
//!
//! Peer discovery and topology change-broadcast for Federation nodes. Each
//! node keeps an eventually consistent routing table, watches its peers'
//! liveness, and spreads topology changes with a priority-dependent
//! propagation pattern (flood, hierarchical or gossip).
//!
//! The wire transport is injected through [`transport::Transport`];
//! [`transport::MemoryNetwork`] wires nodes together in-process.

pub mod api;
pub mod broadcast;
pub mod change;
pub mod change_log;
pub mod clock;
pub mod config;
pub mod constants;
pub mod coordinator;
pub mod error;
pub mod liveness;
pub mod message;
pub mod metrics;
pub mod node;
pub mod routing;
pub mod routing_table;
pub mod transport;

pub use change::{ChangeType, DiscoveryMethod, Priority, TopologyChange};
pub use config::DiscoveryConfig;
pub use coordinator::{CoordinatorState, DiscoveryCoordinator, DiscoveryStats};
pub use error::{DiscoveryError, Result, TransportError};
pub use node::{Node, NodeId, NodeRole, NodeStatus};
pub use routing_table::{RoutingTable, TopologySnapshot};
pub use transport::{MemoryNetwork, Transport};
