//! The mutual-authentication handshake for exactly one peer address.
//!
//! A nonce exchange in three legs: the initiator's request, the
//! responder's response echoing the request nonce and carrying its own
//! challenge plus gossip, and the initiator's confirmation echoing the
//! challenge with gossip of its own. Each side proves it saw the other's
//! fresh nonce; gossip rides along so discovery costs no extra round
//! trip.
//!
//! The handshake is a pure state machine. The peer manager owns the
//! table of live handshakes, routes messages in, performs the sends, and
//! decides all capacity policy after success. At most one handshake per
//! address exists at a time; that invariant lives in the orchestrator,
//! not here.

use crate::error::{HandshakeError, TransportError};
use crate::network::message::Envelope;
use crate::network::transport::ConnectionId;
use crate::types::{NodeAddress, ReportedPeer};
use rand::Rng;
use tokio::sync::oneshot;
use tracing::debug;

pub type HandshakeResult = Result<ConnectionId, HandshakeError>;

/// Why this handshake was started; decides how the bootstrap chain
/// continues after it settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPurpose {
    FirstSeedNode,
    RemainingSeedNode,
    ReportedPeer,
    DirectMessage,
    InboundRequest,
}

enum HandshakeState {
    /// Initiator sent (or is sending) the request.
    AwaitingResponse { requester_nonce: u64 },
    /// Initiator validated the response and must deliver the
    /// confirmation before the exchange counts.
    SendingConfirmation { connection: ConnectionId },
    /// Responder sent its response and waits for the echo.
    AwaitingConfirmation { responder_nonce: u64 },
    Complete,
}

pub struct AuthenticationHandshake {
    peer_address: NodeAddress,
    purpose: AuthPurpose,
    /// Manager-assigned, strictly increasing. Lets a scheduled timeout
    /// recognize that it belongs to a superseded instance.
    generation: u64,
    state: HandshakeState,
    waiters: Vec<oneshot::Sender<HandshakeResult>>,
}

impl AuthenticationHandshake {
    /// Start as initiator; returns the request to send.
    pub fn initiator(
        own_address: NodeAddress,
        peer_address: NodeAddress,
        purpose: AuthPurpose,
        generation: u64,
        rng: &mut impl Rng,
    ) -> (Self, Envelope) {
        let requester_nonce: u64 = rng.gen();
        let request = Envelope::AuthenticationRequest {
            sender: own_address,
            requester_nonce,
        };
        let handshake = Self {
            peer_address,
            purpose,
            generation,
            state: HandshakeState::AwaitingResponse { requester_nonce },
            waiters: Vec::new(),
        };
        (handshake, request)
    }

    /// Start as responder to an incoming request; returns the response
    /// to send, gossip included.
    pub fn responder(
        own_address: NodeAddress,
        peer_address: NodeAddress,
        requester_nonce: u64,
        reported_peers: Vec<ReportedPeer>,
        generation: u64,
        rng: &mut impl Rng,
    ) -> (Self, Envelope) {
        let responder_nonce: u64 = rng.gen();
        let response = Envelope::AuthenticationResponse {
            sender: own_address,
            requester_nonce,
            responder_nonce,
            reported_peers,
        };
        let handshake = Self {
            peer_address,
            purpose: AuthPurpose::InboundRequest,
            generation,
            state: HandshakeState::AwaitingConfirmation { responder_nonce },
            waiters: Vec::new(),
        };
        (handshake, response)
    }

    pub fn purpose(&self) -> AuthPurpose {
        self.purpose
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Initiator: process the responder's reply. On success returns the
    /// confirmation envelope to send on the same connection.
    pub fn handle_response(
        &mut self,
        own_address: NodeAddress,
        requester_nonce: u64,
        responder_nonce: u64,
        reported_peers: Vec<ReportedPeer>,
        connection: ConnectionId,
    ) -> Result<Envelope, HandshakeError> {
        match self.state {
            HandshakeState::AwaitingResponse {
                requester_nonce: expected,
            } => {
                if requester_nonce != expected {
                    return Err(HandshakeError::AuthenticationFailed(format!(
                        "nonce mismatch in response from {}",
                        self.peer_address
                    )));
                }
                debug!("valid authentication response from {}", self.peer_address);
                self.state = HandshakeState::SendingConfirmation { connection };
                Ok(Envelope::AuthenticationConfirmation {
                    sender: own_address,
                    responder_nonce,
                    reported_peers,
                })
            }
            _ => Err(HandshakeError::AuthenticationFailed(format!(
                "unexpected authentication response from {}",
                self.peer_address
            ))),
        }
    }

    /// Initiator: outcome of delivering the confirmation. Success
    /// completes the handshake with the authenticated connection.
    pub fn confirmation_sent(
        &mut self,
        result: Result<(), TransportError>,
    ) -> HandshakeResult {
        match self.state {
            HandshakeState::SendingConfirmation { connection } => match result {
                Ok(()) => {
                    self.state = HandshakeState::Complete;
                    Ok(connection)
                }
                Err(e) => Err(HandshakeError::Transport(e)),
            },
            _ => Err(HandshakeError::AuthenticationFailed(
                "confirmation settled in unexpected state".to_string(),
            )),
        }
    }

    /// Responder: process the initiator's confirmation.
    pub fn handle_confirmation(
        &mut self,
        responder_nonce: u64,
        connection: ConnectionId,
    ) -> HandshakeResult {
        match self.state {
            HandshakeState::AwaitingConfirmation {
                responder_nonce: expected,
            } => {
                if responder_nonce != expected {
                    return Err(HandshakeError::AuthenticationFailed(format!(
                        "nonce mismatch in confirmation from {}",
                        self.peer_address
                    )));
                }
                self.state = HandshakeState::Complete;
                Ok(connection)
            }
            _ => Err(HandshakeError::AuthenticationFailed(format!(
                "unexpected authentication confirmation from {}",
                self.peer_address
            ))),
        }
    }

    /// Register a caller waiting for this handshake's result (used by
    /// direct-message authentication to reuse an in-flight exchange).
    pub fn add_waiter(&mut self, waiter: oneshot::Sender<HandshakeResult>) {
        self.waiters.push(waiter);
    }

    /// Detach the registered waiters, e.g. to carry them over to a
    /// replacement handshake after a simultaneous-dial tie-break.
    pub fn take_waiters(&mut self) -> Vec<oneshot::Sender<HandshakeResult>> {
        std::mem::take(&mut self.waiters)
    }

    /// Deliver the final result to every registered waiter.
    pub fn notify_waiters(&mut self, result: &HandshakeResult) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    /// Cooperative cancellation: waiters learn the handshake died; any
    /// in-flight transport operation completes and is discarded by the
    /// manager. Safe to call more than once.
    pub fn cancel(&mut self) {
        self.notify_waiters(&Err(HandshakeError::Cancelled));
        self.state = HandshakeState::Complete;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn alice() -> NodeAddress {
        NodeAddress::new("alice", 1)
    }

    fn bob() -> NodeAddress {
        NodeAddress::new("bob", 2)
    }

    #[test]
    fn full_exchange_authenticates_both_sides() {
        let mut rng = StdRng::seed_from_u64(1);
        let (mut initiator, request) =
            AuthenticationHandshake::initiator(alice(), bob(), AuthPurpose::FirstSeedNode, 1, &mut rng);

        let requester_nonce = match request {
            Envelope::AuthenticationRequest {
                requester_nonce, ..
            } => requester_nonce,
            other => panic!("unexpected envelope: {}", other.kind()),
        };

        let (mut responder, response) = AuthenticationHandshake::responder(
            bob(),
            alice(),
            requester_nonce,
            vec![],
            1,
            &mut rng,
        );
        let responder_nonce = match response {
            Envelope::AuthenticationResponse {
                requester_nonce: echoed,
                responder_nonce,
                ..
            } => {
                assert_eq!(echoed, requester_nonce);
                responder_nonce
            }
            other => panic!("unexpected envelope: {}", other.kind()),
        };

        let conn = ConnectionId(5);
        let confirmation = initiator
            .handle_response(alice(), requester_nonce, responder_nonce, vec![], conn)
            .unwrap();
        assert_eq!(initiator.confirmation_sent(Ok(())).unwrap(), conn);

        match confirmation {
            Envelope::AuthenticationConfirmation {
                responder_nonce: echoed,
                ..
            } => {
                let inbound_conn = ConnectionId(9);
                assert_eq!(
                    responder.handle_confirmation(echoed, inbound_conn).unwrap(),
                    inbound_conn
                );
            }
            other => panic!("unexpected envelope: {}", other.kind()),
        }
    }

    #[test]
    fn wrong_request_nonce_fails_authentication() {
        let mut rng = StdRng::seed_from_u64(2);
        let (mut initiator, _request) =
            AuthenticationHandshake::initiator(alice(), bob(), AuthPurpose::ReportedPeer, 1, &mut rng);

        let err = initiator
            .handle_response(alice(), 0xdead_beef, 1, vec![], ConnectionId(1))
            .unwrap_err();
        assert!(matches!(err, HandshakeError::AuthenticationFailed(_)));
    }

    #[test]
    fn wrong_responder_nonce_fails_authentication() {
        let mut rng = StdRng::seed_from_u64(3);
        let (mut responder, _response) =
            AuthenticationHandshake::responder(bob(), alice(), 7, vec![], 1, &mut rng);
        let err = responder
            .handle_confirmation(0xbad_c0de, ConnectionId(1))
            .unwrap_err();
        assert!(matches!(err, HandshakeError::AuthenticationFailed(_)));
    }

    #[test]
    fn failed_confirmation_send_is_a_transport_failure() {
        let mut rng = StdRng::seed_from_u64(4);
        let (mut initiator, request) =
            AuthenticationHandshake::initiator(alice(), bob(), AuthPurpose::DirectMessage, 1, &mut rng);
        let nonce = match request {
            Envelope::AuthenticationRequest {
                requester_nonce, ..
            } => requester_nonce,
            _ => unreachable!(),
        };
        initiator
            .handle_response(alice(), nonce, 11, vec![], ConnectionId(1))
            .unwrap();
        let err = initiator
            .confirmation_sent(Err(TransportError::ConnectionClosed))
            .unwrap_err();
        assert!(err.is_transport_failure());
    }

    #[test]
    fn cancel_notifies_waiters_and_is_idempotent() {
        let mut rng = StdRng::seed_from_u64(5);
        let (mut handshake, _request) =
            AuthenticationHandshake::initiator(alice(), bob(), AuthPurpose::DirectMessage, 1, &mut rng);

        let (tx, rx) = oneshot::channel();
        handshake.add_waiter(tx);
        handshake.cancel();
        handshake.cancel();

        assert_eq!(
            rx.blocking_recv().unwrap(),
            Err(HandshakeError::Cancelled)
        );
    }
}
