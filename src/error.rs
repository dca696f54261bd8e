use thiserror::Error;

/// Failures reported by a `Transport` implementation.
///
/// All of these are transient from the protocol's point of view: they are
/// logged and counted, never propagated out of a broadcast or a scan.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("peer {0} is unknown to the transport")]
    UnknownPeer(String),

    #[error("peer {0} is unreachable")]
    Unreachable(String),

    #[error("probe of {peer} timed out after {timeout_ms}ms")]
    Timeout { peer: String, timeout_ms: u64 },

    #[error("send to {peer} failed: {reason}")]
    SendFailed { peer: String, reason: String },
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("malformed message {message_id}: {reason}")]
    Malformed { message_id: String, reason: String },

    #[error("message codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("route to {destination} rejected: {reason}")]
    InvalidRoute { destination: String, reason: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;
