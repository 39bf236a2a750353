//! Error taxonomy for the membership protocol.
//!
//! Handshake failures are a closed set of tagged outcomes so callers can
//! classify them without inspecting error chains: a `Rejected` peer stays
//! a candidate for later, a `Transport` failure means the address may be
//! unreachable gossip noise and gets dropped from every table.

use crate::types::NodeAddress;
use thiserror::Error;

/// Failures reported by the transport layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no route to {0}")]
    Unreachable(NodeAddress),
    #[error("connection is closed")]
    ConnectionClosed,
    #[error("operation timed out")]
    TimedOut,
    #[error("codec error: {0}")]
    Codec(String),
}

/// Outcome of a failed authentication handshake.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// The peer explicitly refused the request (tie-break loser,
    /// already-authenticated duplicate). The peer remains a candidate.
    #[error("peer rejected the authentication request")]
    Rejected,
    /// Protocol violation or identity mismatch during the exchange.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    /// The peer could not be reached or the connection died.
    #[error("transport failure during handshake: {0}")]
    Transport(#[from] TransportError),
    /// The handshake was cancelled locally.
    #[error("handshake cancelled")]
    Cancelled,
}

impl HandshakeError {
    /// Whether this failure means the address should be purged from all
    /// peer tables rather than only clearing the handshake slot.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, HandshakeError::Transport(_))
    }
}

/// Precondition and lifecycle errors of the peer manager API. These are
/// programming errors on the caller side, not runtime conditions, and
/// are never retried internally.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerManagerError {
    #[error("seed node addresses must be configured before bootstrap")]
    SeedNodesNotConfigured,
    #[error("peer manager is shut down")]
    ShutDown,
}
