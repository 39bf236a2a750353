//! Decentralized peer membership over an anonymizing transport.
//!
//! Nodes discover each other through gossip piggy-backed on a mutual
//! authentication handshake, keep their connection count bounded with a
//! priority-tiered eviction policy, and persist a bounded peer snapshot
//! so later restarts can bootstrap without a seed node.
//!
//! The entry point is [`PeerManager::spawn`], which starts the single
//! orchestrator task and hands back a cloneable [`PeerManagerHandle`].

pub mod config;
pub mod error;
pub mod network;
pub mod shutdown;
pub mod storage;
pub mod types;

pub use config::Config;
pub use error::{HandshakeError, PeerManagerError, TransportError};
pub use network::eviction::ConnectionLimits;
pub use network::message::Envelope;
pub use network::peer_manager::{
    PeerEvent, PeerManager, PeerManagerConfig, PeerManagerHandle,
};
pub use network::transport::{
    ChannelTransport, ConnectionId, ConnectionPriority, Hub, Transport, TransportEvent,
};
pub use shutdown::ShutdownManager;
pub use storage::PeerStore;
pub use types::{NodeAddress, ReportedPeer};
