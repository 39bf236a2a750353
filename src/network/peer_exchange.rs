//! Gossip bookkeeping: the in-memory reported-peer cache and the durable
//! persisted-peer set.
//!
//! Reports arrive piggy-backed on authentication exchanges. Merging
//! smooths timestamps (midpoint of old and new) instead of trusting the
//! latest claim, caps memory with randomized eviction so an attacker
//! cannot game an oldest-first policy, and keeps a bounded oldest-first
//! snapshot for cold-start bootstrap across restarts.

use crate::types::{NodeAddress, ReportedPeer};
use rand::Rng;
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, trace};

/// In-memory cap for gossiped peers.
pub const MAX_REPORTED_PEERS: usize = 1000;
/// Durable snapshot cap.
pub const MAX_PERSISTED_PEERS: usize = 500;

/// A single batch above this size is hostile by definition; the sender
/// gets disconnected and the batch discarded.
pub fn flood_cap(low_connection_cap: usize) -> usize {
    MAX_REPORTED_PEERS + 3 * low_connection_cap
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("peer reported {reported} peers at once (cap {cap})")]
pub struct FloodDetected {
    pub reported: usize,
    pub cap: usize,
}

/// Reported + persisted peer sets, owned by the peer manager.
pub struct PeerBook {
    reported: HashSet<ReportedPeer>,
    persisted: HashSet<ReportedPeer>,
}

impl PeerBook {
    pub fn new(persisted: HashSet<ReportedPeer>) -> Self {
        Self {
            reported: HashSet::new(),
            persisted,
        }
    }

    pub fn reported(&self) -> &HashSet<ReportedPeer> {
        &self.reported
    }

    pub fn persisted(&self) -> &HashSet<ReportedPeer> {
        &self.persisted
    }

    /// Merge a gossip batch into the reported set.
    ///
    /// Returns the adjusted records that were accepted (input for
    /// `update_persisted`), or `FloodDetected`, in which case no local
    /// state was touched at all.
    pub fn merge_reported(
        &mut self,
        batch: Vec<ReportedPeer>,
        own_address: &NodeAddress,
        seed_nodes: &HashSet<NodeAddress>,
        authenticated: &HashSet<NodeAddress>,
        low_connection_cap: usize,
        rng: &mut impl Rng,
    ) -> Result<Vec<ReportedPeer>, FloodDetected> {
        let cap = flood_cap(low_connection_cap);
        if batch.len() > cap {
            return Err(FloodDetected {
                reported: batch.len(),
                cap,
            });
        }

        let mut adjusted = Vec::new();
        for incoming in batch {
            if &incoming.address == own_address
                || seed_nodes.contains(&incoming.address)
                || authenticated.contains(&incoming.address)
            {
                continue;
            }
            let record = match self.reported.get(&incoming) {
                Some(existing) => {
                    // Midpoint of the stored and the claimed timestamp,
                    // smoothing injected time data. Computed without the
                    // sum: timestamps come off the wire, and a hostile
                    // extreme pair must not overflow.
                    let (old, new) = (existing.last_activity, incoming.last_activity);
                    let mid = old / 2 + new / 2 + (old % 2 + new % 2) / 2;
                    ReportedPeer::new(incoming.address, mid)
                }
                None => incoming,
            };
            // Replace semantics: identity is the address, so the stale
            // record has to go before the adjusted one lands.
            self.reported.remove(&record);
            self.reported.insert(record.clone());
            adjusted.push(record);
        }

        self.purge_reported_if_exceeds(rng);
        trace!(
            "merged {} report(s), {} reported peers total",
            adjusted.len(),
            self.reported.len()
        );
        Ok(adjusted)
    }

    /// Drop uniformly-random entries until the reported cache is back at
    /// its cap. Deliberately not oldest-first.
    fn purge_reported_if_exceeds(&mut self, rng: &mut impl Rng) {
        let excess = self.reported.len().saturating_sub(MAX_REPORTED_PEERS);
        if excess == 0 {
            return;
        }
        debug!(
            "reported peers over cap ({}), purging {} random entries",
            self.reported.len(),
            excess
        );
        let mut entries: Vec<ReportedPeer> = self.reported.iter().cloned().collect();
        for _ in 0..excess {
            let victim = entries.swap_remove(rng.gen_range(0..entries.len()));
            self.reported.remove(&victim);
        }
    }

    /// Fold accepted reports plus every live (authenticated or
    /// handshaking) address into the persisted set, then evict the
    /// strictly oldest entries beyond the cap. Already-present addresses
    /// keep their recorded timestamp. Returns whether anything changed.
    pub fn update_persisted(
        &mut self,
        adjusted: &[ReportedPeer],
        live: impl IntoIterator<Item = NodeAddress>,
    ) -> bool {
        let mut changed = false;
        for record in adjusted {
            changed |= self.persisted.insert(record.clone());
        }
        for address in live {
            changed |= self.persisted.insert(ReportedPeer::seen_now(address));
        }

        let excess = self.persisted.len().saturating_sub(MAX_PERSISTED_PEERS);
        if excess > 0 {
            let mut entries: Vec<ReportedPeer> = self.persisted.iter().cloned().collect();
            entries.sort_by_key(|p| p.last_activity);
            for victim in entries.into_iter().take(excess) {
                self.persisted.remove(&victim);
            }
            changed = true;
        }
        changed
    }

    /// Move up to `max` persisted peers (excluding live addresses) into
    /// the reported set, making them bootstrap candidates. Returns how
    /// many were promoted.
    pub fn promote_persisted(&mut self, max: usize, exclude: &HashSet<NodeAddress>) -> usize {
        let batch: Vec<ReportedPeer> = self
            .persisted
            .iter()
            .filter(|p| !exclude.contains(&p.address))
            .take(max)
            .cloned()
            .collect();
        for peer in &batch {
            self.persisted.remove(peer);
            self.reported.insert(peer.clone());
        }
        batch.len()
    }

    pub fn remove_reported(&mut self, address: &NodeAddress) {
        self.reported
            .remove(&ReportedPeer::new(address.clone(), 0));
    }

    /// Drop an address from both sets. Returns whether the persisted set
    /// changed (the caller then queues a save).
    pub fn remove(&mut self, address: &NodeAddress) -> bool {
        let probe = ReportedPeer::new(address.clone(), 0);
        self.reported.remove(&probe);
        self.persisted.remove(&probe)
    }

    /// Whether any reported peer is neither authenticated nor mid
    /// handshake.
    pub fn has_reported_candidates(&self, exclude: &HashSet<NodeAddress>) -> bool {
        self.reported
            .iter()
            .any(|p| !exclude.contains(&p.address))
    }

    /// Remove and return a uniformly-random reported candidate.
    pub fn take_random_reported_candidate(
        &mut self,
        exclude: &HashSet<NodeAddress>,
        rng: &mut impl Rng,
    ) -> Option<ReportedPeer> {
        let candidates: Vec<ReportedPeer> = self
            .reported
            .iter()
            .filter(|p| !exclude.contains(&p.address))
            .cloned()
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let chosen = candidates[rng.gen_range(0..candidates.len())].clone();
        self.reported.remove(&chosen);
        Some(chosen)
    }

    /// Gossip payload for a handshake: everything we have reported plus
    /// our authenticated peers stamped now, seed nodes excluded.
    pub fn authenticated_and_reported<'a>(
        &self,
        authenticated: impl IntoIterator<Item = &'a NodeAddress>,
        seed_nodes: &HashSet<NodeAddress>,
    ) -> Vec<ReportedPeer> {
        let mut all: HashSet<ReportedPeer> = self.reported.clone();
        for address in authenticated {
            if seed_nodes.contains(address) {
                continue;
            }
            let record = ReportedPeer::seen_now(address.clone());
            all.remove(&record);
            all.insert(record);
        }
        all.into_iter().collect()
    }
}
