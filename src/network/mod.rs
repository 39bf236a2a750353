//! The gossip membership network: wire messages, transport seam,
//! handshake, peer bookkeeping, eviction policy and the orchestrator
//! tying them together.

pub mod eviction;
pub mod handshake;
pub mod message;
pub mod peer_exchange;
pub mod peer_manager;
pub mod transport;
