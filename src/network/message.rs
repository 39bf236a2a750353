//! Wire messages of the membership protocol.
//!
//! Authentication is a three-leg nonce exchange; the two gossip-bearing
//! legs piggy-back reported peers so that authentication and peer
//! discovery cost a single round trip. Application payloads ride in
//! `Data` as opaque bytes; their encoding is not this layer's business.

use crate::types::{NodeAddress, ReportedPeer};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Envelope {
    /// Initiator opens the exchange with a fresh nonce.
    AuthenticationRequest {
        sender: NodeAddress,
        requester_nonce: u64,
    },
    /// Responder echoes the requester's nonce, adds its own challenge
    /// and its current peer gossip.
    AuthenticationResponse {
        sender: NodeAddress,
        requester_nonce: u64,
        responder_nonce: u64,
        reported_peers: Vec<ReportedPeer>,
    },
    /// Initiator proves it saw the response by echoing the responder's
    /// nonce, and ships its own gossip back.
    AuthenticationConfirmation {
        sender: NodeAddress,
        responder_nonce: u64,
        reported_peers: Vec<ReportedPeer>,
    },
    /// Explicit refusal; the tie-break signal for simultaneous dials.
    AuthenticationRejection { sender: NodeAddress },
    /// Opaque application payload broadcast between authenticated peers.
    Data {
        sender: NodeAddress,
        payload: Vec<u8>,
    },
}

impl Envelope {
    /// Short tag for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::AuthenticationRequest { .. } => "AuthenticationRequest",
            Envelope::AuthenticationResponse { .. } => "AuthenticationResponse",
            Envelope::AuthenticationConfirmation { .. } => "AuthenticationConfirmation",
            Envelope::AuthenticationRejection { .. } => "AuthenticationRejection",
            Envelope::Data { .. } => "Data",
        }
    }
}
