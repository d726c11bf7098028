//! Typed failures surfaced by the public networking API.
//!
//! Internal plumbing uses `anyhow` with context; anything a caller is expected
//! to branch on (dial, publish, lookups, stream operations) is reported as a
//! [`NetworkError`]. The type is `Clone` so a single coalesced dial result can
//! be handed to every waiting caller.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Transport-level dial failure. Retryable by the caller.
    Unreachable(String),
    /// Authentication or key exchange failed. Never retried against the same identity.
    HandshakeFailed(String),
    /// The connection carrying the operation went away.
    ConnectionClosed,
    /// The peer store holds no address for the requested peer.
    NoAddressKnown,
    /// Publish found no peers to send to and zero-peer publishing is disabled.
    NoPeers,
    /// A DHT lookup exhausted its candidates.
    NotFound,
    /// The remote side has no handler for the requested stream protocol.
    ProtocolNotSupported(String),
    /// An operation exceeded its time budget.
    Timeout,
    /// An address could not be parsed or is unusable.
    InvalidAddress(String),
    /// The node (or component) is not running.
    NotRunning,
    /// The request was refused locally (validation, limits).
    Rejected(String),
}

impl NetworkError {
    /// Transient failures worth another attempt with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Timeout | Self::ConnectionClosed)
    }
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreachable(reason) => write!(f, "peer unreachable: {}", reason),
            Self::HandshakeFailed(reason) => write!(f, "secure handshake failed: {}", reason),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::NoAddressKnown => write!(f, "no address known for peer"),
            Self::NoPeers => write!(f, "no peers to publish to"),
            Self::NotFound => write!(f, "not found"),
            Self::ProtocolNotSupported(proto) => write!(f, "protocol not supported: {}", proto),
            Self::Timeout => write!(f, "operation timed out"),
            Self::InvalidAddress(addr) => write!(f, "invalid address: {}", addr),
            Self::NotRunning => write!(f, "node is not running"),
            Self::Rejected(reason) => write!(f, "rejected: {}", reason),
        }
    }
}

impl std::error::Error for NetworkError {}

impl From<tokio::time::error::Elapsed> for NetworkError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Timeout
    }
}
