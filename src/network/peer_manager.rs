//! The membership orchestrator.
//!
//! A single tokio task owns every piece of mutable membership state: the
//! authenticated-peer table, the handshake table, the gossip book and
//! the bootstrap chain. Callers interact through a cloneable
//! [`PeerManagerHandle`] whose methods post commands onto the task's
//! channel, and transport I/O runs in spawned helper tasks that marshal
//! their results back the same way. Nothing mutates membership state
//! from outside the loop, so there are no locks and no ordering races.
//!
//! Bootstrap walks a chain: one seed node first, then the remaining
//! seeds, then randomly drawn reported peers, then a batch of persisted
//! peers promoted back into the reported set. When the chain runs dry it
//! re-arms itself with the full seed list after a randomized delay. A
//! periodic connectivity check makes sure at least one seed connection
//! survives steady state.

use crate::config::{Config, ConfigError};
use crate::error::{HandshakeError, PeerManagerError, TransportError};
use crate::network::eviction::{select_connection_to_close, ConnectionLimits};
use crate::network::handshake::{
    AuthPurpose, AuthenticationHandshake, HandshakeResult,
};
use crate::network::message::Envelope;
use crate::network::peer_exchange::PeerBook;
use crate::network::transport::{
    ConnectionId, ConnectionPriority, Transport, TransportEvent,
};
use crate::storage::PeerStore;
use crate::types::{NodeAddress, ReportedPeer};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// How many persisted peers get promoted back into the reported set when
/// the bootstrap chain runs out of candidates.
const PERSISTED_PROMOTION_BATCH: usize = 5;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Runtime parameters of the peer manager, decoupled from the on-disk
/// config so tests can compress every delay.
#[derive(Debug, Clone)]
pub struct PeerManagerConfig {
    pub own_address: NodeAddress,
    pub seed_nodes: Vec<NodeAddress>,
    pub limits: ConnectionLimits,
    pub handshake_timeout: Duration,
    pub retry_delay_min: Duration,
    pub retry_delay_max: Duration,
    pub seed_check_min: Duration,
    pub seed_check_max: Duration,
    pub seed_retry_delay: Duration,
}

impl PeerManagerConfig {
    pub fn new(own_address: NodeAddress, seed_nodes: Vec<NodeAddress>) -> Self {
        Self {
            own_address,
            seed_nodes,
            limits: ConnectionLimits::default(),
            handshake_timeout: Duration::from_secs(30),
            retry_delay_min: Duration::from_secs(10),
            retry_delay_max: Duration::from_secs(20),
            seed_check_min: Duration::from_secs(120),
            seed_check_max: Duration::from_secs(180),
            seed_retry_delay: Duration::from_secs(2),
        }
    }

    pub fn from_app_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            own_address: config.own_address()?,
            seed_nodes: config.seed_node_addresses()?,
            limits: ConnectionLimits::new(config.network.max_connections_low),
            handshake_timeout: Duration::from_secs(config.network.handshake_timeout_secs),
            retry_delay_min: Duration::from_secs(config.bootstrap.retry_delay_min_secs),
            retry_delay_max: Duration::from_secs(config.bootstrap.retry_delay_max_secs),
            seed_check_min: Duration::from_secs(config.bootstrap.seed_check_min_secs),
            seed_check_max: Duration::from_secs(config.bootstrap.seed_check_max_secs),
            seed_retry_delay: Duration::from_secs(config.bootstrap.seed_retry_delay_secs),
        })
    }
}

/// Membership changes observable by the application.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    PeerAuthenticated {
        address: NodeAddress,
        connection: ConnectionId,
    },
    PeerDisconnected {
        address: NodeAddress,
    },
    Message {
        from: NodeAddress,
        payload: Vec<u8>,
    },
}

enum Command {
    Bootstrap {
        reply: oneshot::Sender<Result<(), PeerManagerError>>,
    },
    Authenticate {
        address: NodeAddress,
        reply: oneshot::Sender<HandshakeResult>,
    },
    Broadcast {
        payload: Vec<u8>,
        exclude: Option<NodeAddress>,
    },
    SendDirect {
        address: NodeAddress,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    AuthenticatedPeers {
        reply: oneshot::Sender<Vec<NodeAddress>>,
    },
    IsAuthenticating {
        address: NodeAddress,
        reply: oneshot::Sender<bool>,
    },
    ReportedPeers {
        reply: oneshot::Sender<Vec<ReportedPeer>>,
    },
    PersistedPeers {
        reply: oneshot::Sender<Vec<ReportedPeer>>,
    },
    DebugReport {
        reply: oneshot::Sender<String>,
    },
    ShutDown {
        reply: oneshot::Sender<()>,
    },

    // Results marshaled back from spawned I/O tasks.
    RequestSent {
        peer: NodeAddress,
        generation: u64,
        result: Result<ConnectionId, TransportError>,
    },
    ResponseSent {
        peer: NodeAddress,
        generation: u64,
        result: Result<(), TransportError>,
    },
    ConfirmationSent {
        peer: NodeAddress,
        generation: u64,
        result: Result<(), TransportError>,
    },
    SendFailed {
        peer: NodeAddress,
        error: TransportError,
    },

    // Timer expirations.
    HandshakeTimedOut {
        peer: NodeAddress,
        generation: u64,
    },
    RetryBootstrap,
    RetryReportedPeers,
    SeedCheck,
    RetrySeedAuthentication,
    CheckConnections {
        limit: usize,
    },
}

/// A timer that posts one command when it fires. Dropping it cancels the
/// timer, which gives the same clear-before-rearm discipline as nulling
/// a timer field.
struct ScheduledTask {
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    fn once(delay: Duration, tx: mpsc::UnboundedSender<Command>, command: Command) -> Self {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(command);
        });
        Self { handle }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Cloneable front end of the peer manager task.
#[derive(Clone)]
pub struct PeerManagerHandle {
    command_tx: mpsc::UnboundedSender<Command>,
    events_tx: broadcast::Sender<PeerEvent>,
}

impl PeerManagerHandle {
    /// Start the bootstrap chain. Fails fast when no seed nodes are
    /// configured; actual authentication progress is reported through
    /// [`PeerEvent`]s.
    pub async fn bootstrap(&self) -> Result<(), PeerManagerError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(Command::Bootstrap { reply })
            .map_err(|_| PeerManagerError::ShutDown)?;
        rx.await.map_err(|_| PeerManagerError::ShutDown)?
    }

    /// Authenticate to one specific peer, reusing an in-flight handshake
    /// or the existing authenticated connection when there is one.
    pub async fn authenticate(&self, address: NodeAddress) -> HandshakeResult {
        let (reply, rx) = oneshot::channel();
        if self
            .command_tx
            .send(Command::Authenticate { address, reply })
            .is_err()
        {
            return Err(HandshakeError::Cancelled);
        }
        rx.await.unwrap_or(Err(HandshakeError::Cancelled))
    }

    /// Send an application payload to one peer, authenticating first if
    /// needed.
    pub async fn send_to(
        &self,
        address: NodeAddress,
        payload: Vec<u8>,
    ) -> Result<(), HandshakeError> {
        self.authenticate(address.clone()).await?;
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(Command::SendDirect {
                address,
                payload,
                reply,
            })
            .map_err(|_| HandshakeError::Cancelled)?;
        match rx.await {
            Ok(result) => result.map_err(HandshakeError::Transport),
            Err(_) => Err(HandshakeError::Cancelled),
        }
    }

    /// Fan an application payload out to every authenticated peer,
    /// optionally skipping the peer it came from.
    pub fn broadcast(&self, payload: Vec<u8>, exclude: Option<NodeAddress>) {
        let _ = self.command_tx.send(Command::Broadcast { payload, exclude });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events_tx.subscribe()
    }

    pub async fn authenticated_peers(&self) -> Vec<NodeAddress> {
        self.query(|reply| Command::AuthenticatedPeers { reply })
            .await
            .unwrap_or_default()
    }

    /// Whether a handshake with this address is currently in flight.
    pub async fn is_authenticating(&self, address: NodeAddress) -> bool {
        self.query(|reply| Command::IsAuthenticating { address, reply })
            .await
            .unwrap_or(false)
    }

    pub async fn reported_peers(&self) -> Vec<ReportedPeer> {
        self.query(|reply| Command::ReportedPeers { reply })
            .await
            .unwrap_or_default()
    }

    pub async fn persisted_peers(&self) -> Vec<ReportedPeer> {
        self.query(|reply| Command::PersistedPeers { reply })
            .await
            .unwrap_or_default()
    }

    /// Human-readable snapshot of all peer tables, for periodic logging.
    pub async fn debug_report(&self) -> String {
        self.query(|reply| Command::DebugReport { reply })
            .await
            .unwrap_or_default()
    }

    /// Stop the manager: cancel handshakes, persist the peer set, close
    /// every connection. Idempotent from the caller's point of view.
    pub async fn shut_down(&self) {
        let (reply, rx) = oneshot::channel();
        if self.command_tx.send(Command::ShutDown { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    async fn query<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.command_tx.send(make(reply)).ok()?;
        rx.await.ok()
    }
}

/// The orchestrator task state. Constructed and consumed by
/// [`PeerManager::spawn`]; all methods run on the single manager task.
pub struct PeerManager {
    config: PeerManagerConfig,
    seed_set: HashSet<NodeAddress>,
    transport: Arc<dyn Transport>,
    store: Option<PeerStore>,
    book: PeerBook,
    authenticated: HashMap<NodeAddress, ConnectionId>,
    handshakes: HashMap<NodeAddress, AuthenticationHandshake>,
    /// Working copy of the seed list consumed by the bootstrap chain.
    remaining_seeds: Vec<NodeAddress>,
    next_generation: u64,
    retry_timer: Option<ScheduledTask>,
    seed_check_timer: Option<ScheduledTask>,
    seed_retry_timer: Option<ScheduledTask>,
    command_tx: mpsc::UnboundedSender<Command>,
    events_tx: broadcast::Sender<PeerEvent>,
    rng: StdRng,
    shutting_down: bool,
}

impl PeerManager {
    /// Spawn the manager task and return its handle.
    pub fn spawn(
        config: PeerManagerConfig,
        transport: Arc<dyn Transport>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        store: Option<PeerStore>,
        cancel: CancellationToken,
    ) -> PeerManagerHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let persisted = store.as_ref().map(|s| s.load()).unwrap_or_default();
        let seed_set = config.seed_nodes.iter().cloned().collect();

        let manager = PeerManager {
            config,
            seed_set,
            transport,
            store,
            book: PeerBook::new(persisted),
            authenticated: HashMap::new(),
            handshakes: HashMap::new(),
            remaining_seeds: Vec::new(),
            next_generation: 0,
            retry_timer: None,
            seed_check_timer: None,
            seed_retry_timer: None,
            command_tx: command_tx.clone(),
            events_tx: events_tx.clone(),
            rng: StdRng::from_entropy(),
            shutting_down: false,
        };

        tokio::spawn(manager.run(command_rx, transport_events, cancel));

        PeerManagerHandle {
            command_tx,
            events_tx,
        }
    }

    async fn run(
        mut self,
        mut command_rx: mpsc::UnboundedReceiver<Command>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        cancel: CancellationToken,
    ) {
        info!("peer manager for {} started", self.config.own_address);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.shut_down_internal().await;
                    break;
                }
                command = command_rx.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).await {
                            break;
                        }
                    }
                    // Every handle is gone; nobody can drive us anymore.
                    None => {
                        self.shut_down_internal().await;
                        break;
                    }
                },
                event = transport_events.recv() => match event {
                    Some(event) => self.handle_transport_event(event),
                    None => {
                        warn!("transport event stream ended");
                        self.shut_down_internal().await;
                        break;
                    }
                },
            }
        }
    }

    /// Returns true when the loop should stop.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Bootstrap { reply } => {
                let _ = reply.send(self.begin_bootstrap());
            }
            Command::Authenticate { address, reply } => {
                self.authenticate_on_demand(address, reply);
            }
            Command::Broadcast { payload, exclude } => {
                self.broadcast(payload, exclude);
            }
            Command::SendDirect {
                address,
                payload,
                reply,
            } => {
                self.send_direct(address, payload, reply);
            }
            Command::AuthenticatedPeers { reply } => {
                let _ = reply.send(self.authenticated.keys().cloned().collect());
            }
            Command::IsAuthenticating { address, reply } => {
                let _ = reply.send(self.handshakes.contains_key(&address));
            }
            Command::ReportedPeers { reply } => {
                let _ = reply.send(self.book.reported().iter().cloned().collect());
            }
            Command::PersistedPeers { reply } => {
                let _ = reply.send(self.book.persisted().iter().cloned().collect());
            }
            Command::DebugReport { reply } => {
                let _ = reply.send(self.debug_report());
            }
            Command::ShutDown { reply } => {
                self.shut_down_internal().await;
                let _ = reply.send(());
                return true;
            }
            Command::RequestSent {
                peer,
                generation,
                result,
            } => self.on_request_sent(peer, generation, result),
            Command::ResponseSent {
                peer,
                generation,
                result,
            } => self.on_response_sent(peer, generation, result),
            Command::ConfirmationSent {
                peer,
                generation,
                result,
            } => self.on_confirmation_sent(peer, generation, result),
            Command::SendFailed { peer, error } => self.on_send_failed(peer, error),
            Command::HandshakeTimedOut { peer, generation } => {
                if self.handshake_generation(&peer) == Some(generation) {
                    warn!("authentication with {} timed out", peer);
                    self.settle_handshake(&peer, Err(TransportError::TimedOut.into()));
                }
            }
            Command::RetryBootstrap => {
                self.retry_timer = None;
                info!("retrying bootstrap with the full seed list");
                self.remaining_seeds = self.config.seed_nodes.clone();
                self.authenticate_to_remaining_seed_node();
            }
            Command::RetryReportedPeers => {
                self.retry_timer = None;
                self.authenticate_to_remaining_reported_peer();
            }
            Command::SeedCheck => {
                self.seed_check_timer = None;
                self.check_seed_connectivity();
                self.schedule_seed_check();
            }
            Command::RetrySeedAuthentication => {
                self.seed_retry_timer = None;
                self.retry_seed_authentication();
            }
            Command::CheckConnections { limit } => self.maintain_connections(limit),
        }
        false
    }

    // ----- transport events ---------------------------------------------

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { id, peer } => {
                trace!("{} up (peer {:?})", id, peer);
            }
            TransportEvent::Disconnected { peer, .. } => {
                if let Some(address) = peer {
                    // A live handshake to this address is left alone; its
                    // own timeout settles it if the peer is really gone.
                    if self.authenticated.remove(&address).is_some() {
                        info!("connection to {} lost", address);
                        if self.book.remove(&address) {
                            self.queue_save();
                        }
                        self.emit(PeerEvent::PeerDisconnected { address });
                        self.schedule_reported_peer_retry();
                    }
                }
            }
            TransportEvent::Message { id, envelope } => self.handle_envelope(id, envelope),
            TransportEvent::Error { id, error } => {
                warn!("transport error on {:?}: {}", id, error);
            }
        }
    }

    fn handle_envelope(&mut self, connection: ConnectionId, envelope: Envelope) {
        match envelope {
            Envelope::AuthenticationRequest {
                sender,
                requester_nonce,
            } => self.on_authentication_request(connection, sender, requester_nonce),
            Envelope::AuthenticationResponse {
                sender,
                requester_nonce,
                responder_nonce,
                reported_peers,
            } => self.on_authentication_response(
                connection,
                sender,
                requester_nonce,
                responder_nonce,
                reported_peers,
            ),
            Envelope::AuthenticationConfirmation {
                sender,
                responder_nonce,
                reported_peers,
            } => self.on_authentication_confirmation(
                connection,
                sender,
                responder_nonce,
                reported_peers,
            ),
            Envelope::AuthenticationRejection { sender } => {
                match self.handshakes.get(&sender).map(|h| h.purpose()) {
                    // A rejection answering a request we already
                    // cancelled must not settle the responder exchange
                    // that replaced it.
                    Some(AuthPurpose::InboundRequest) => {
                        debug!("ignoring stale rejection from {}", sender);
                    }
                    Some(_) => {
                        debug!("{} rejected our authentication request", sender);
                        self.settle_handshake(&sender, Err(HandshakeError::Rejected));
                    }
                    None => {}
                }
            }
            Envelope::Data { sender, payload } => {
                if self.authenticated.contains_key(&sender) {
                    self.emit(PeerEvent::Message {
                        from: sender,
                        payload,
                    });
                } else {
                    warn!("dropping data message from unauthenticated {}", sender);
                }
            }
        }
    }

    fn on_authentication_request(
        &mut self,
        connection: ConnectionId,
        sender: NodeAddress,
        requester_nonce: u64,
    ) {
        if self.shutting_down {
            return;
        }
        if sender == self.config.own_address {
            warn!("ignoring authentication request claiming our own address");
            return;
        }
        if self.authenticated.contains_key(&sender) {
            debug!("{} is already authenticated, rejecting duplicate request", sender);
            self.send_rejection(connection);
            return;
        }

        let existing_purpose = self.handshakes.get(&sender).map(|h| h.purpose());
        let waiters = match existing_purpose {
            Some(purpose) if purpose != AuthPurpose::InboundRequest => {
                // Simultaneous dial. Both sides reject the incoming
                // request and cancel their own outgoing exchange; the
                // retry machinery converges on one connection afterwards.
                debug!(
                    "simultaneous dial with {}, rejecting and cancelling",
                    sender
                );
                self.send_rejection(connection);
                self.settle_handshake(&sender, Err(HandshakeError::Cancelled));
                return;
            }
            Some(_) => match self.handshakes.remove(&sender) {
                // A repeated request supersedes the previous responder
                // exchange.
                Some(mut stale) => stale.take_waiters(),
                None => Vec::new(),
            },
            None => Vec::new(),
        };

        self.start_responder_handshake(sender, connection, requester_nonce, waiters);
    }

    fn on_authentication_response(
        &mut self,
        connection: ConnectionId,
        sender: NodeAddress,
        requester_nonce: u64,
        responder_nonce: u64,
        reported_peers: Vec<ReportedPeer>,
    ) {
        if !self.handshakes.contains_key(&sender) {
            debug!("stray authentication response from {}", sender);
            return;
        }
        if !self.absorb_gossip(connection, &sender, reported_peers) {
            self.settle_handshake(
                &sender,
                Err(HandshakeError::AuthenticationFailed(format!(
                    "peer report flood from {}",
                    sender
                ))),
            );
            return;
        }

        let gossip = self
            .book
            .authenticated_and_reported(self.authenticated.keys(), &self.seed_set);
        let own_address = self.config.own_address.clone();
        let outcome = match self.handshakes.get_mut(&sender) {
            Some(handshake) => handshake.handle_response(
                own_address,
                requester_nonce,
                responder_nonce,
                gossip,
                connection,
            ),
            None => return,
        };

        match outcome {
            Ok(confirmation) => {
                let generation = self.handshake_generation(&sender).unwrap_or(0);
                let transport = Arc::clone(&self.transport);
                let tx = self.command_tx.clone();
                tokio::spawn(async move {
                    let result = transport.send_on(connection, confirmation).await;
                    let _ = tx.send(Command::ConfirmationSent {
                        peer: sender,
                        generation,
                        result,
                    });
                });
            }
            Err(e) => self.settle_handshake(&sender, Err(e)),
        }
    }

    fn on_authentication_confirmation(
        &mut self,
        connection: ConnectionId,
        sender: NodeAddress,
        responder_nonce: u64,
        reported_peers: Vec<ReportedPeer>,
    ) {
        if !self.handshakes.contains_key(&sender) {
            debug!("stray authentication confirmation from {}", sender);
            return;
        }
        if !self.absorb_gossip(connection, &sender, reported_peers) {
            self.settle_handshake(
                &sender,
                Err(HandshakeError::AuthenticationFailed(format!(
                    "peer report flood from {}",
                    sender
                ))),
            );
            return;
        }
        let result = match self.handshakes.get_mut(&sender) {
            Some(handshake) => handshake.handle_confirmation(responder_nonce, connection),
            None => return,
        };
        self.settle_handshake(&sender, result);
    }

    /// Merge a gossip batch into the book. Returns false when the batch
    /// was a flood, in which case the connection gets closed and nothing
    /// was merged.
    fn absorb_gossip(
        &mut self,
        connection: ConnectionId,
        sender: &NodeAddress,
        batch: Vec<ReportedPeer>,
    ) -> bool {
        let authenticated: HashSet<NodeAddress> = self.authenticated.keys().cloned().collect();
        match self.book.merge_reported(
            batch,
            &self.config.own_address,
            &self.seed_set,
            &authenticated,
            self.config.limits.low(),
            &mut self.rng,
        ) {
            Ok(adjusted) => {
                if self.book.update_persisted(&adjusted, authenticated) {
                    self.queue_save();
                }
                true
            }
            Err(flood) => {
                warn!("{} from {}, closing connection", flood, sender);
                let transport = Arc::clone(&self.transport);
                tokio::spawn(async move { transport.close(connection).await });
                false
            }
        }
    }

    // ----- handshake lifecycle ------------------------------------------

    fn handshake_generation(&self, peer: &NodeAddress) -> Option<u64> {
        self.handshakes.get(peer).map(|h| h.generation())
    }

    fn start_handshake(
        &mut self,
        peer: NodeAddress,
        purpose: AuthPurpose,
        waiter: Option<oneshot::Sender<HandshakeResult>>,
    ) {
        debug!("requesting authentication from {} ({:?})", peer, purpose);
        self.next_generation += 1;
        let generation = self.next_generation;

        let (mut handshake, request) = AuthenticationHandshake::initiator(
            self.config.own_address.clone(),
            peer.clone(),
            purpose,
            generation,
            &mut self.rng,
        );
        if let Some(waiter) = waiter {
            handshake.add_waiter(waiter);
        }
        // An address is reported, handshaking or authenticated, never
        // two of those at once.
        self.book.remove_reported(&peer);
        self.handshakes.insert(peer.clone(), handshake);

        let transport = Arc::clone(&self.transport);
        let tx = self.command_tx.clone();
        let target = peer.clone();
        tokio::spawn(async move {
            let result = transport.send(&target, request).await;
            let _ = tx.send(Command::RequestSent {
                peer: target,
                generation,
                result,
            });
        });
        self.arm_handshake_timeout(peer, generation);
    }

    fn start_responder_handshake(
        &mut self,
        peer: NodeAddress,
        connection: ConnectionId,
        requester_nonce: u64,
        waiters: Vec<oneshot::Sender<HandshakeResult>>,
    ) {
        debug!("answering authentication request from {}", peer);
        self.next_generation += 1;
        let generation = self.next_generation;

        let gossip = self
            .book
            .authenticated_and_reported(self.authenticated.keys(), &self.seed_set);
        let (mut handshake, response) = AuthenticationHandshake::responder(
            self.config.own_address.clone(),
            peer.clone(),
            requester_nonce,
            gossip,
            generation,
            &mut self.rng,
        );
        for waiter in waiters {
            handshake.add_waiter(waiter);
        }
        self.book.remove_reported(&peer);
        self.handshakes.insert(peer.clone(), handshake);

        // The inbound connection becomes addressable and eviction-proof
        // for the duration of the exchange.
        self.transport.set_peer_address(connection, peer.clone());
        self.transport
            .set_priority(connection, ConnectionPriority::AuthRequest);

        let transport = Arc::clone(&self.transport);
        let tx = self.command_tx.clone();
        let target = peer.clone();
        tokio::spawn(async move {
            let result = transport.send_on(connection, response).await;
            let _ = tx.send(Command::ResponseSent {
                peer: target,
                generation,
                result,
            });
        });
        self.arm_handshake_timeout(peer, generation);
    }

    fn arm_handshake_timeout(&self, peer: NodeAddress, generation: u64) {
        let tx = self.command_tx.clone();
        let timeout = self.config.handshake_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(Command::HandshakeTimedOut { peer, generation });
        });
    }

    fn on_request_sent(
        &mut self,
        peer: NodeAddress,
        generation: u64,
        result: Result<ConnectionId, TransportError>,
    ) {
        if self.handshake_generation(&peer) != Some(generation) {
            return;
        }
        match result {
            Ok(connection) => {
                self.transport
                    .set_priority(connection, ConnectionPriority::AuthRequest);
            }
            Err(e) => self.settle_handshake(&peer, Err(e.into())),
        }
    }

    fn on_response_sent(
        &mut self,
        peer: NodeAddress,
        generation: u64,
        result: Result<(), TransportError>,
    ) {
        if self.handshake_generation(&peer) != Some(generation) {
            return;
        }
        if let Err(e) = result {
            self.settle_handshake(&peer, Err(e.into()));
        }
    }

    fn on_confirmation_sent(
        &mut self,
        peer: NodeAddress,
        generation: u64,
        result: Result<(), TransportError>,
    ) {
        if self.handshake_generation(&peer) != Some(generation) {
            return;
        }
        let outcome = match self.handshakes.get_mut(&peer) {
            Some(handshake) => handshake.confirmation_sent(result),
            None => return,
        };
        self.settle_handshake(&peer, outcome);
    }

    /// Finalize a handshake: notify waiters, update the tables, and keep
    /// the bootstrap chain moving.
    fn settle_handshake(&mut self, peer: &NodeAddress, result: HandshakeResult) {
        let Some(mut handshake) = self.handshakes.remove(peer) else {
            return;
        };
        handshake.notify_waiters(&result);
        let purpose = handshake.purpose();

        match result {
            Ok(connection) => self.on_peer_authenticated(peer.clone(), connection, purpose),
            Err(e) => {
                warn!("authentication with {} failed: {}", peer, e);
                if e.is_transport_failure() {
                    // Unreachable addresses are gossip noise; purge them
                    // everywhere. Rejections keep the peer a candidate.
                    if self.book.remove(peer) {
                        self.queue_save();
                    }
                    if let Some(snapshot) = self.transport.connection_to(peer) {
                        if !snapshot.authenticated {
                            let transport = Arc::clone(&self.transport);
                            tokio::spawn(async move { transport.close(snapshot.id).await });
                        }
                    }
                }
                if self.shutting_down {
                    return;
                }
                match purpose {
                    AuthPurpose::FirstSeedNode => self.authenticate_to_first_seed_node(),
                    AuthPurpose::RemainingSeedNode => self.authenticate_to_remaining_seed_node(),
                    AuthPurpose::ReportedPeer => self.authenticate_to_remaining_reported_peer(),
                    AuthPurpose::DirectMessage | AuthPurpose::InboundRequest => {}
                }
            }
        }
    }

    fn on_peer_authenticated(
        &mut self,
        peer: NodeAddress,
        connection: ConnectionId,
        purpose: AuthPurpose,
    ) {
        info!("authenticated {} on {} ({:?})", peer, connection, purpose);
        self.authenticated.insert(peer.clone(), connection);
        self.transport.set_authenticated(connection);
        // We keep connections we asked for; ones the peer opened toward
        // us are the first to go under pressure.
        let priority = if purpose == AuthPurpose::InboundRequest {
            ConnectionPriority::Passive
        } else {
            ConnectionPriority::Active
        };
        self.transport.set_priority(connection, priority);

        self.book.remove_reported(&peer);
        if self.book.update_persisted(&[], [peer.clone()]) {
            self.queue_save();
        }

        self.emit(PeerEvent::PeerAuthenticated {
            address: peer,
            connection,
        });
        debug!("\n{}", self.debug_report());
        self.maintain_connections(self.config.limits.low() + 2);

        if self.shutting_down {
            return;
        }
        match purpose {
            AuthPurpose::FirstSeedNode | AuthPurpose::RemainingSeedNode => {
                self.authenticate_to_remaining_seed_node()
            }
            AuthPurpose::ReportedPeer => self.authenticate_to_remaining_reported_peer(),
            AuthPurpose::DirectMessage | AuthPurpose::InboundRequest => {}
        }
    }

    // ----- bootstrap chain ----------------------------------------------

    fn begin_bootstrap(&mut self) -> Result<(), PeerManagerError> {
        if self.config.seed_nodes.is_empty() {
            return Err(PeerManagerError::SeedNodesNotConfigured);
        }
        info!(
            "bootstrapping with {} seed node(s)",
            self.config.seed_nodes.len()
        );
        self.retry_timer = None;
        self.remaining_seeds = self.config.seed_nodes.clone();
        // Armed here, not on the first successful seed handshake, so
        // the connectivity check also covers nodes that only ever reach
        // the network through reported peers.
        self.schedule_seed_check();
        self.authenticate_to_first_seed_node();
        Ok(())
    }

    /// Next unconnected seed in configured order.
    fn take_first_seed(&mut self) -> Option<NodeAddress> {
        let live = self.live_addresses();
        self.remaining_seeds.retain(|s| !live.contains(s));
        if self.remaining_seeds.is_empty() {
            return None;
        }
        Some(self.remaining_seeds.remove(0))
    }

    fn take_random_seed(&mut self) -> Option<NodeAddress> {
        let live = self.live_addresses();
        self.remaining_seeds.retain(|s| !live.contains(s));
        if self.remaining_seeds.is_empty() {
            return None;
        }
        let index = self.rng.gen_range(0..self.remaining_seeds.len());
        Some(self.remaining_seeds.swap_remove(index))
    }

    fn authenticate_to_first_seed_node(&mut self) {
        match self.take_first_seed() {
            Some(seed) => self.start_handshake(seed, AuthPurpose::FirstSeedNode, None),
            None => {
                debug!("no seed node available, moving on to reported peers");
                self.authenticate_to_remaining_reported_peer();
            }
        }
    }

    fn has_enough_connections(&self) -> bool {
        if self.authenticated.len() >= self.config.limits.low() {
            debug!(
                "{} authenticated peers, not looking for more",
                self.authenticated.len()
            );
            return true;
        }
        false
    }

    fn authenticate_to_remaining_seed_node(&mut self) {
        if self.has_enough_connections() {
            return;
        }
        match self.take_random_seed() {
            Some(seed) => self.start_handshake(seed, AuthPurpose::RemainingSeedNode, None),
            None => self.authenticate_to_remaining_reported_peer(),
        }
    }

    fn authenticate_to_remaining_reported_peer(&mut self) {
        if self.has_enough_connections() {
            return;
        }
        let live = self.live_addresses();
        if let Some(candidate) = self.book.take_random_reported_candidate(&live, &mut self.rng) {
            self.start_handshake(candidate.address, AuthPurpose::ReportedPeer, None);
        } else if self.book.promote_persisted(PERSISTED_PROMOTION_BATCH, &live) > 0 {
            debug!("promoted persisted peers into the candidate pool");
            self.authenticate_to_remaining_reported_peer();
        } else if self.config.seed_nodes.is_empty() {
            // Without seeds there is nothing to fall back on; stay quiet
            // until gossip or a direct request brings new candidates.
            debug!("no candidates and no seed nodes configured");
        } else {
            self.remaining_seeds = self.config.seed_nodes.clone();
            self.schedule_bootstrap_retry();
        }
    }

    /// Re-enter the candidate chain after losing a peer, unless a retry
    /// is already pending or there is nothing to dial.
    fn schedule_reported_peer_retry(&mut self) {
        if self.shutting_down || self.retry_timer.is_some() {
            return;
        }
        let live = self.live_addresses();
        if self.config.seed_nodes.is_empty()
            && !self.book.has_reported_candidates(&live)
            && self.book.persisted().is_empty()
        {
            return;
        }
        let delay = self.random_delay(self.config.retry_delay_min, self.config.retry_delay_max);
        debug!("scheduling peer retry in {:?}", delay);
        self.retry_timer = Some(ScheduledTask::once(
            delay,
            self.command_tx.clone(),
            Command::RetryReportedPeers,
        ));
    }

    fn schedule_bootstrap_retry(&mut self) {
        let delay = self.random_delay(self.config.retry_delay_min, self.config.retry_delay_max);
        info!("no more candidates, retrying bootstrap in {:?}", delay);
        self.retry_timer = Some(ScheduledTask::once(
            delay,
            self.command_tx.clone(),
            Command::RetryBootstrap,
        ));
    }

    // ----- seed connectivity check --------------------------------------

    fn schedule_seed_check(&mut self) {
        let delay = self.random_delay(self.config.seed_check_min, self.config.seed_check_max);
        self.seed_check_timer = Some(ScheduledTask::once(
            delay,
            self.command_tx.clone(),
            Command::SeedCheck,
        ));
    }

    fn check_seed_connectivity(&mut self) {
        let has_seed = self
            .authenticated
            .keys()
            .any(|address| self.seed_set.contains(address));
        if has_seed {
            trace!("seed connectivity check passed");
            return;
        }
        let live = self.live_addresses();
        let remaining: Vec<&NodeAddress> = self
            .config
            .seed_nodes
            .iter()
            .filter(|s| !live.contains(s))
            .collect();
        if remaining.is_empty() {
            return;
        }
        info!("no authenticated seed node, making room to reconnect");
        let target = self
            .config
            .limits
            .low()
            .saturating_sub(remaining.len())
            .saturating_sub(2);
        self.maintain_connections(target);
        self.seed_retry_timer = Some(ScheduledTask::once(
            self.config.seed_retry_delay,
            self.command_tx.clone(),
            Command::RetrySeedAuthentication,
        ));
    }

    fn retry_seed_authentication(&mut self) {
        let live = self.live_addresses();
        let candidates: Vec<NodeAddress> = self
            .config
            .seed_nodes
            .iter()
            .filter(|s| !live.contains(s))
            .cloned()
            .collect();
        if candidates.is_empty() {
            return;
        }
        let seed = candidates[self.rng.gen_range(0..candidates.len())].clone();
        self.start_handshake(seed, AuthPurpose::RemainingSeedNode, None);
    }

    // ----- capacity -----------------------------------------------------

    fn maintain_connections(&mut self, limit: usize) {
        let snapshot = self.transport.connections();
        // Count from the snapshot, not the peer table: a just-closed
        // victim leaves the snapshot before its disconnect event reaches
        // this task, so the post-close re-check cannot over-evict.
        let authenticated_count = snapshot.iter().filter(|c| c.authenticated).count();
        let victim = select_connection_to_close(
            &snapshot,
            authenticated_count,
            limit,
            &self.config.limits,
            &self.seed_set,
        );
        if let Some(id) = victim {
            info!(
                "{} authenticated connections exceed limit {}, closing {}",
                authenticated_count, limit, id
            );
            let transport = Arc::clone(&self.transport);
            let tx = self.command_tx.clone();
            tokio::spawn(async move {
                transport.close(id).await;
                // One close per pass; re-check afterwards so pressure
                // drains in converging steps.
                let _ = tx.send(Command::CheckConnections { limit });
            });
        }
    }

    // ----- application traffic ------------------------------------------

    fn authenticate_on_demand(
        &mut self,
        address: NodeAddress,
        reply: oneshot::Sender<HandshakeResult>,
    ) {
        if address == self.config.own_address {
            let _ = reply.send(Err(HandshakeError::AuthenticationFailed(
                "cannot authenticate to own address".to_string(),
            )));
        } else if let Some(&connection) = self.authenticated.get(&address) {
            let _ = reply.send(Ok(connection));
        } else if let Some(handshake) = self.handshakes.get_mut(&address) {
            handshake.add_waiter(reply);
        } else {
            self.start_handshake(address, AuthPurpose::DirectMessage, Some(reply));
        }
    }

    fn broadcast(&mut self, payload: Vec<u8>, exclude: Option<NodeAddress>) {
        let recipients: Vec<(NodeAddress, ConnectionId)> = self
            .authenticated
            .iter()
            .filter(|(peer, _)| exclude.as_ref() != Some(*peer))
            .map(|(peer, &conn)| (peer.clone(), conn))
            .collect();
        debug!(
            "broadcasting {} byte(s) to {} peer(s)",
            payload.len(),
            recipients.len()
        );
        for (peer, connection) in recipients {
            let envelope = Envelope::Data {
                sender: self.config.own_address.clone(),
                payload: payload.clone(),
            };
            let transport = Arc::clone(&self.transport);
            let tx = self.command_tx.clone();
            tokio::spawn(async move {
                if let Err(error) = transport.send_on(connection, envelope).await {
                    let _ = tx.send(Command::SendFailed { peer, error });
                }
            });
        }
    }

    fn send_direct(
        &mut self,
        address: NodeAddress,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<(), TransportError>>,
    ) {
        let Some(&connection) = self.authenticated.get(&address) else {
            let _ = reply.send(Err(TransportError::ConnectionClosed));
            return;
        };
        let envelope = Envelope::Data {
            sender: self.config.own_address.clone(),
            payload,
        };
        let transport = Arc::clone(&self.transport);
        let tx = self.command_tx.clone();
        tokio::spawn(async move {
            let result = transport.send_on(connection, envelope).await;
            if let Err(error) = &result {
                let _ = tx.send(Command::SendFailed {
                    peer: address,
                    error: error.clone(),
                });
            }
            let _ = reply.send(result);
        });
    }

    /// A send to an authenticated peer failed: the peer is dead, drop it
    /// from every table.
    fn on_send_failed(&mut self, peer: NodeAddress, error: TransportError) {
        let Some(connection) = self.authenticated.remove(&peer) else {
            return;
        };
        warn!("sending to {} failed ({}), removing peer", peer, error);
        if self.book.remove(&peer) {
            self.queue_save();
        }
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move { transport.close(connection).await });
        self.emit(PeerEvent::PeerDisconnected { address: peer });
    }

    fn send_rejection(&self, connection: ConnectionId) {
        let envelope = Envelope::AuthenticationRejection {
            sender: self.config.own_address.clone(),
        };
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            let _ = transport.send_on(connection, envelope).await;
        });
    }

    // ----- helpers ------------------------------------------------------

    /// Addresses that are authenticated or mid-handshake; excluded from
    /// candidate selection.
    fn live_addresses(&self) -> HashSet<NodeAddress> {
        self.authenticated
            .keys()
            .chain(self.handshakes.keys())
            .cloned()
            .collect()
    }

    fn random_delay(&mut self, min: Duration, max: Duration) -> Duration {
        if max <= min {
            return min;
        }
        let span = (max - min).as_millis() as u64;
        min + Duration::from_millis(self.rng.gen_range(0..=span))
    }

    fn queue_save(&self) {
        if let Some(store) = &self.store {
            store.queue_save(self.book.persisted().clone());
        }
    }

    fn emit(&self, event: PeerEvent) {
        // No subscribers is fine.
        let _ = self.events_tx.send(event);
    }

    fn debug_report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "node {}", self.config.own_address);
        let _ = writeln!(out, "authenticated peers ({}):", self.authenticated.len());
        let mut authenticated: Vec<_> = self.authenticated.iter().collect();
        authenticated.sort_by_key(|(peer, _)| peer.full_address());
        for (peer, connection) in authenticated {
            let _ = writeln!(out, "  {} on {}", peer, connection);
        }
        let _ = writeln!(out, "pending handshakes ({}):", self.handshakes.len());
        for (peer, handshake) in &self.handshakes {
            let _ = writeln!(out, "  {} ({:?})", peer, handshake.purpose());
        }
        let _ = writeln!(
            out,
            "reported peers: {}, persisted peers: {}",
            self.book.reported().len(),
            self.book.persisted().len()
        );
        out
    }

    async fn shut_down_internal(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        info!("peer manager for {} shutting down", self.config.own_address);

        self.retry_timer = None;
        self.seed_check_timer = None;
        self.seed_retry_timer = None;

        for handshake in self.handshakes.values_mut() {
            handshake.cancel();
        }
        self.handshakes.clear();

        if let Some(store) = &self.store {
            if let Err(e) = store.save_now(self.book.persisted()) {
                warn!("final peer set save failed: {}", e);
            }
        }

        for snapshot in self.transport.connections() {
            self.transport.close(snapshot.id).await;
        }
        self.authenticated.clear();
    }
}
