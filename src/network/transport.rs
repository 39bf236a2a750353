//! Transport abstraction consumed by the membership core.
//!
//! The real anonymizing transport (hidden-service lifecycle, framing,
//! circuit management) lives outside this crate. The core only needs the
//! `Transport` trait: open-or-reuse sends, a stream of connect /
//! disconnect / message events, and per-connection priority and activity
//! metadata used by the eviction policy.
//!
//! `ChannelTransport` is the in-process implementation backing the
//! simulation binary and the integration tests. It routes JSON-encoded
//! envelopes between registered nodes through a shared `Hub`, so the
//! wire shape gets exercised without any sockets.

use crate::error::TransportError;
use crate::network::message::Envelope;
use crate::types::{unix_millis_now, NodeAddress};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Opaque handle for one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Priority tag deciding eviction order. Ordering matters:
/// `Passive < Active < AuthRequest`, and `AuthRequest` connections are
/// never auto-evicted while their handshake is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionPriority {
    Passive,
    Active,
    AuthRequest,
}

/// Read-only view of a connection's metadata.
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    /// Protocol-visible peer address. Inbound connections start without
    /// one until the peer identifies itself.
    pub peer: Option<NodeAddress>,
    pub priority: ConnectionPriority,
    pub authenticated: bool,
    /// Unix millis of the last traffic on this connection.
    pub last_activity: i64,
}

/// Events marshaled from the transport to the membership core.
#[derive(Debug)]
pub enum TransportEvent {
    Connected {
        id: ConnectionId,
        peer: Option<NodeAddress>,
    },
    Disconnected {
        id: ConnectionId,
        peer: Option<NodeAddress>,
    },
    Message {
        id: ConnectionId,
        envelope: Envelope,
    },
    Error {
        id: Option<ConnectionId>,
        error: TransportError,
    },
}

/// The service surface the peer manager consumes.
#[async_trait]
pub trait Transport: Send + Sync {
    fn local_address(&self) -> NodeAddress;

    /// Open-or-reuse semantics: sends on the existing connection to
    /// `address` or establishes a new outbound one.
    async fn send(
        &self,
        address: &NodeAddress,
        envelope: Envelope,
    ) -> Result<ConnectionId, TransportError>;

    /// Send on an already-established connection.
    async fn send_on(&self, id: ConnectionId, envelope: Envelope) -> Result<(), TransportError>;

    fn connections(&self) -> Vec<ConnectionSnapshot>;

    fn connection_to(&self, address: &NodeAddress) -> Option<ConnectionSnapshot>;

    /// Attach the protocol-visible peer address to a connection, so a
    /// later reply finds the inbound connection instead of dialing out.
    fn set_peer_address(&self, id: ConnectionId, address: NodeAddress);

    fn set_priority(&self, id: ConnectionId, priority: ConnectionPriority);

    fn set_authenticated(&self, id: ConnectionId);

    async fn close(&self, id: ConnectionId);
}

enum Frame {
    Payload { from: NodeAddress, bytes: Vec<u8> },
    Close { from: NodeAddress },
}

/// Routing table shared by all in-process nodes.
#[derive(Clone, Default)]
pub struct Hub {
    routes: Arc<Mutex<HashMap<NodeAddress, mpsc::UnboundedSender<Frame>>>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node and get its transport plus the event stream the
    /// peer manager consumes.
    pub fn register(
        &self,
        address: NodeAddress,
    ) -> (Arc<ChannelTransport>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        self.routes
            .lock()
            .expect("hub routes lock poisoned")
            .insert(address.clone(), frame_tx);

        let transport = Arc::new(ChannelTransport {
            local: address,
            hub: self.clone(),
            state: Mutex::new(State::default()),
            next_id: AtomicU64::new(1),
            events: event_tx,
        });

        let driver = Arc::clone(&transport);
        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                driver.handle_frame(frame);
            }
        });

        (transport, event_rx)
    }

    fn route(&self, to: &NodeAddress) -> Option<mpsc::UnboundedSender<Frame>> {
        self.routes
            .lock()
            .expect("hub routes lock poisoned")
            .get(to)
            .cloned()
    }

    fn unregister(&self, address: &NodeAddress) {
        self.routes
            .lock()
            .expect("hub routes lock poisoned")
            .remove(address);
    }
}

struct Meta {
    /// Address frames are routed to. Always known, even for inbound
    /// connections whose protocol-visible peer is still unset.
    remote: NodeAddress,
    peer: Option<NodeAddress>,
    priority: ConnectionPriority,
    authenticated: bool,
    last_activity: i64,
}

#[derive(Default)]
struct State {
    by_remote: HashMap<NodeAddress, ConnectionId>,
    meta: HashMap<ConnectionId, Meta>,
}

/// In-process transport connecting nodes registered on the same `Hub`.
pub struct ChannelTransport {
    local: NodeAddress,
    hub: Hub,
    state: Mutex<State>,
    next_id: AtomicU64,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl ChannelTransport {
    fn emit(&self, event: TransportEvent) {
        // Receiver gone means the node is shutting down; drop the event.
        let _ = self.events.send(event);
    }

    fn ensure_connection(&self, remote: &NodeAddress, outbound: bool) -> ConnectionId {
        let mut state = self.state.lock().expect("transport state lock poisoned");
        if let Some(id) = state.by_remote.get(remote) {
            return *id;
        }
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let peer = outbound.then(|| remote.clone());
        state.by_remote.insert(remote.clone(), id);
        state.meta.insert(
            id,
            Meta {
                remote: remote.clone(),
                peer: peer.clone(),
                priority: ConnectionPriority::Passive,
                authenticated: false,
                last_activity: unix_millis_now(),
            },
        );
        drop(state);
        trace!("{}: new {} to {}", self.local, id, remote);
        self.emit(TransportEvent::Connected { id, peer });
        id
    }

    fn bump_activity(&self, id: ConnectionId) {
        let mut state = self.state.lock().expect("transport state lock poisoned");
        if let Some(meta) = state.meta.get_mut(&id) {
            meta.last_activity = unix_millis_now();
        }
    }

    fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Payload { from, bytes } => {
                let id = self.ensure_connection(&from, false);
                self.bump_activity(id);
                match serde_json::from_slice::<Envelope>(&bytes) {
                    Ok(envelope) => {
                        trace!("{}: {} from {}", self.local, envelope.kind(), from);
                        self.emit(TransportEvent::Message { id, envelope });
                    }
                    Err(e) => {
                        warn!("{}: undecodable frame from {}: {}", self.local, from, e);
                        self.emit(TransportEvent::Error {
                            id: Some(id),
                            error: TransportError::Codec(e.to_string()),
                        });
                    }
                }
            }
            Frame::Close { from } => {
                let removed = {
                    let mut state = self.state.lock().expect("transport state lock poisoned");
                    state
                        .by_remote
                        .remove(&from)
                        .and_then(|id| state.meta.remove(&id).map(|meta| (id, meta.peer)))
                };
                if let Some((id, peer)) = removed {
                    debug!("{}: {} closed by remote {}", self.local, id, from);
                    self.emit(TransportEvent::Disconnected { id, peer });
                }
            }
        }
    }

    fn drop_connection(&self, id: ConnectionId) -> Option<NodeAddress> {
        let mut state = self.state.lock().expect("transport state lock poisoned");
        let meta = state.meta.remove(&id)?;
        state.by_remote.remove(&meta.remote);
        drop(state);
        self.emit(TransportEvent::Disconnected {
            id,
            peer: meta.peer,
        });
        Some(meta.remote)
    }

    fn deliver(&self, remote: &NodeAddress, envelope: &Envelope) -> Result<(), TransportError> {
        let bytes =
            serde_json::to_vec(envelope).map_err(|e| TransportError::Codec(e.to_string()))?;
        let route = self
            .hub
            .route(remote)
            .ok_or_else(|| TransportError::Unreachable(remote.clone()))?;
        route
            .send(Frame::Payload {
                from: self.local.clone(),
                bytes,
            })
            .map_err(|_| TransportError::Unreachable(remote.clone()))
    }

    /// Close every connection and leave the hub. Used at node shutdown.
    pub fn shut_down(&self) {
        self.hub.unregister(&self.local);
        let ids: Vec<ConnectionId> = {
            let state = self.state.lock().expect("transport state lock poisoned");
            state.meta.keys().copied().collect()
        };
        for id in ids {
            if let Some(remote) = self.drop_connection(id) {
                if let Some(route) = self.hub.route(&remote) {
                    let _ = route.send(Frame::Close {
                        from: self.local.clone(),
                    });
                }
            }
        }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn local_address(&self) -> NodeAddress {
        self.local.clone()
    }

    async fn send(
        &self,
        address: &NodeAddress,
        envelope: Envelope,
    ) -> Result<ConnectionId, TransportError> {
        let id = self.ensure_connection(address, true);
        match self.deliver(address, &envelope) {
            Ok(()) => {
                self.bump_activity(id);
                Ok(id)
            }
            Err(e) => {
                // The route is gone; tear the connection down so state
                // does not keep a dead entry.
                self.drop_connection(id);
                Err(e)
            }
        }
    }

    async fn send_on(&self, id: ConnectionId, envelope: Envelope) -> Result<(), TransportError> {
        let remote = {
            let state = self.state.lock().expect("transport state lock poisoned");
            state
                .meta
                .get(&id)
                .map(|meta| meta.remote.clone())
                .ok_or(TransportError::ConnectionClosed)?
        };
        match self.deliver(&remote, &envelope) {
            Ok(()) => {
                self.bump_activity(id);
                Ok(())
            }
            Err(e) => {
                self.drop_connection(id);
                Err(e)
            }
        }
    }

    fn connections(&self) -> Vec<ConnectionSnapshot> {
        let state = self.state.lock().expect("transport state lock poisoned");
        state
            .meta
            .iter()
            .map(|(id, meta)| ConnectionSnapshot {
                id: *id,
                peer: meta.peer.clone(),
                priority: meta.priority,
                authenticated: meta.authenticated,
                last_activity: meta.last_activity,
            })
            .collect()
    }

    fn connection_to(&self, address: &NodeAddress) -> Option<ConnectionSnapshot> {
        let state = self.state.lock().expect("transport state lock poisoned");
        state.by_remote.get(address).and_then(|id| {
            state.meta.get(id).map(|meta| ConnectionSnapshot {
                id: *id,
                peer: meta.peer.clone(),
                priority: meta.priority,
                authenticated: meta.authenticated,
                last_activity: meta.last_activity,
            })
        })
    }

    fn set_peer_address(&self, id: ConnectionId, address: NodeAddress) {
        let mut state = self.state.lock().expect("transport state lock poisoned");
        if let Some(meta) = state.meta.get_mut(&id) {
            meta.peer = Some(address);
        }
    }

    fn set_priority(&self, id: ConnectionId, priority: ConnectionPriority) {
        let mut state = self.state.lock().expect("transport state lock poisoned");
        if let Some(meta) = state.meta.get_mut(&id) {
            meta.priority = priority;
        }
    }

    fn set_authenticated(&self, id: ConnectionId) {
        let mut state = self.state.lock().expect("transport state lock poisoned");
        if let Some(meta) = state.meta.get_mut(&id) {
            meta.authenticated = true;
        }
    }

    async fn close(&self, id: ConnectionId) {
        if let Some(remote) = self.drop_connection(id) {
            debug!("{}: closing {} to {}", self.local, id, remote);
            if let Some(route) = self.hub.route(&remote) {
                let _ = route.send(Frame::Close {
                    from: self.local.clone(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(name: &str, port: u16) -> NodeAddress {
        NodeAddress::new(name, port)
    }

    #[tokio::test]
    async fn send_establishes_connections_on_both_sides() {
        let hub = Hub::new();
        let (alice, mut alice_rx) = hub.register(addr("alice", 1));
        let (bob, mut bob_rx) = hub.register(addr("bob", 2));

        let id = alice
            .send(
                &bob.local_address(),
                Envelope::Data {
                    sender: alice.local_address(),
                    payload: b"hi".to_vec(),
                },
            )
            .await
            .unwrap();

        // Outbound side knows the peer address immediately.
        match alice_rx.recv().await.unwrap() {
            TransportEvent::Connected { id: got, peer } => {
                assert_eq!(got, id);
                assert_eq!(peer, Some(bob.local_address()));
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // Inbound side sees a connection with no peer address yet, then
        // the message itself.
        match bob_rx.recv().await.unwrap() {
            TransportEvent::Connected { peer, .. } => assert!(peer.is_none()),
            other => panic!("unexpected event: {:?}", other),
        }
        match bob_rx.recv().await.unwrap() {
            TransportEvent::Message { envelope, .. } => {
                assert_eq!(envelope.kind(), "Data");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn send_to_unknown_address_is_unreachable() {
        let hub = Hub::new();
        let (alice, _rx) = hub.register(addr("alice", 1));
        let err = alice
            .send(
                &addr("ghost", 9),
                Envelope::Data {
                    sender: alice.local_address(),
                    payload: vec![],
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)));
        assert!(alice.connections().is_empty());
    }

    #[tokio::test]
    async fn close_propagates_disconnect_to_the_remote() {
        let hub = Hub::new();
        let (alice, _alice_rx) = hub.register(addr("alice", 1));
        let (bob, mut bob_rx) = hub.register(addr("bob", 2));

        let id = alice
            .send(
                &bob.local_address(),
                Envelope::Data {
                    sender: alice.local_address(),
                    payload: vec![],
                },
            )
            .await
            .unwrap();
        // Drain bob's Connected + Message events.
        bob_rx.recv().await.unwrap();
        bob_rx.recv().await.unwrap();

        alice.close(id).await;
        match bob_rx.recv().await.unwrap() {
            TransportEvent::Disconnected { .. } => {}
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(alice.connections().is_empty());
        assert!(bob.connections().is_empty());
    }

    #[tokio::test]
    async fn metadata_setters_are_visible_in_snapshots() {
        let hub = Hub::new();
        let (alice, _rx) = hub.register(addr("alice", 1));
        let (bob, _bob_rx) = hub.register(addr("bob", 2));

        let id = alice
            .send(
                &bob.local_address(),
                Envelope::Data {
                    sender: alice.local_address(),
                    payload: vec![],
                },
            )
            .await
            .unwrap();

        alice.set_priority(id, ConnectionPriority::Active);
        alice.set_authenticated(id);

        let snap = alice.connection_to(&bob.local_address()).unwrap();
        assert_eq!(snap.id, id);
        assert_eq!(snap.priority, ConnectionPriority::Active);
        assert!(snap.authenticated);
    }
}
