//! Core identity types for the membership layer.
//!
//! `NodeAddress` identifies a reachable endpoint; `ReportedPeer` is an
//! address we learned about through gossip together with the last time
//! anyone claims to have seen it alive. Two reports for the same address
//! are the same entity no matter what their timestamps say; merge and
//! dedup logic relies on that.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use thiserror::Error;

/// Host + port of a peer endpoint. Equality and hashing are by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// "host:port" form used in config files and log output.
    pub fn full_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("address '{0}' is missing a ':port' suffix")]
    MissingPort(String),
    #[error("address '{0}' has an invalid port")]
    InvalidPort(String),
    #[error("address has an empty host part")]
    EmptyHost,
}

impl FromStr for NodeAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddressParseError::MissingPort(s.to_string()))?;
        if host.is_empty() {
            return Err(AddressParseError::EmptyHost);
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| AddressParseError::InvalidPort(s.to_string()))?;
        Ok(NodeAddress::new(host, port))
    }
}

/// Current unix time in milliseconds, the timestamp unit used for peer
/// activity dates throughout the crate.
pub fn unix_millis_now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A peer address learned via gossip, not (necessarily) authenticated.
///
/// Identity is the address alone: `Eq` and `Hash` ignore `last_activity`,
/// so a `HashSet<ReportedPeer>` holds at most one record per address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportedPeer {
    pub address: NodeAddress,
    /// Unix millis of the last claimed activity for this address.
    pub last_activity: i64,
}

impl ReportedPeer {
    pub fn new(address: NodeAddress, last_activity: i64) -> Self {
        Self {
            address,
            last_activity,
        }
    }

    /// A report stamped with the current time, used when we vouch for a
    /// peer ourselves (e.g. a currently authenticated one).
    pub fn seen_now(address: NodeAddress) -> Self {
        Self::new(address, unix_millis_now())
    }
}

impl PartialEq for ReportedPeer {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for ReportedPeer {}

impl Hash for ReportedPeer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl fmt::Display for ReportedPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (last seen {})", self.address, self.last_activity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn parse_full_address() {
        let addr: NodeAddress = "tzyd3mq7pxl4.onion:9999".parse().unwrap();
        assert_eq!(addr.host, "tzyd3mq7pxl4.onion");
        assert_eq!(addr.port, 9999);
        assert_eq!(addr.full_address(), "tzyd3mq7pxl4.onion:9999");
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(matches!(
            "no-port".parse::<NodeAddress>(),
            Err(AddressParseError::MissingPort(_))
        ));
        assert!(matches!(
            "host:notaport".parse::<NodeAddress>(),
            Err(AddressParseError::InvalidPort(_))
        ));
        assert!(matches!(
            ":1234".parse::<NodeAddress>(),
            Err(AddressParseError::EmptyHost)
        ));
    }

    #[test]
    fn reported_peer_identity_ignores_timestamp() {
        let addr = NodeAddress::new("peer", 1000);
        let a = ReportedPeer::new(addr.clone(), 1);
        let b = ReportedPeer::new(addr, 999_999);
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        // Same address, different timestamp: not a second entry.
        assert!(!set.insert(b));
        assert_eq!(set.len(), 1);
    }
}
