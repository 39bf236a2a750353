//! Connection eviction policy.
//!
//! Keeps the authenticated connection count near a soft ceiling without
//! starving connections that are mid-handshake (`AuthRequest` priority)
//! and without cutting the seed-node backbone. Candidates are chosen in
//! widening tiers (passive first, then passive+active once the normal
//! ceiling is exceeded, then everything but `AuthRequest` above the high
//! ceiling), and within a tier the connection idle the longest goes
//! first. Exactly one connection is selected per pass; the orchestrator
//! re-runs the check after each close completes, so pressure converges
//! over repeated small steps instead of one batch of closes.

use crate::network::transport::{ConnectionId, ConnectionPriority, ConnectionSnapshot};
use crate::types::NodeAddress;
use std::collections::HashSet;

/// Connection ceilings derived from the configured low-priority cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimits {
    low: usize,
}

impl ConnectionLimits {
    pub fn new(low: usize) -> Self {
        Self { low }
    }

    pub fn low(&self) -> usize {
        self.low
    }

    pub fn normal(&self) -> usize {
        self.low + 6
    }

    pub fn high(&self) -> usize {
        self.low + 12
    }
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        // Matches the historical default of 10 low-priority slots.
        Self::new(10)
    }
}

fn is_seed(conn: &ConnectionSnapshot, seed_nodes: &HashSet<NodeAddress>) -> bool {
    conn.peer
        .as_ref()
        .map(|peer| seed_nodes.contains(peer))
        .unwrap_or(false)
}

fn tier<'a>(
    connections: &'a [ConnectionSnapshot],
    seed_nodes: &HashSet<NodeAddress>,
    allowed: impl Fn(ConnectionPriority) -> bool + 'a,
) -> Vec<&'a ConnectionSnapshot> {
    connections
        .iter()
        .filter(|c| c.authenticated)
        .filter(|c| allowed(c.priority))
        .filter(|c| !is_seed(c, seed_nodes))
        .collect()
}

/// Pick the single connection to close, or `None` when the count is
/// within `limit` or no closable candidate exists.
pub fn select_connection_to_close(
    connections: &[ConnectionSnapshot],
    authenticated_count: usize,
    limit: usize,
    limits: &ConnectionLimits,
    seed_nodes: &HashSet<NodeAddress>,
) -> Option<ConnectionId> {
    if authenticated_count <= limit {
        return None;
    }

    let mut candidates = tier(connections, seed_nodes, |p| p == ConnectionPriority::Passive);

    if candidates.is_empty() && authenticated_count > limits.normal() {
        candidates = tier(connections, seed_nodes, |p| {
            p == ConnectionPriority::Passive || p == ConnectionPriority::Active
        });

        if candidates.is_empty() && authenticated_count > limits.high() {
            candidates = tier(connections, seed_nodes, |p| {
                p != ConnectionPriority::AuthRequest
            });
        }
    }

    candidates
        .into_iter()
        .min_by_key(|c| c.last_activity)
        .map(|c| c.id)
}
