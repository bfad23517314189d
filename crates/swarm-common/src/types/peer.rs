//! Peer identity.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a peer by its transport address (`ip:port`).
///
/// Peers compare equal when their addresses do, and are totally ordered
/// lexicographically by address. The order is load-bearing: the
/// distributed lock uses it to break ties between simultaneous lock
/// attempts and to release peers in reverse order.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Creates a peer id from an `ip:port` address.
    #[must_use]
    pub fn new(ip_port: impl Into<String>) -> Self {
        Self(ip_port.into())
    }

    /// The invalid (empty-address) peer id.
    #[must_use]
    pub fn invalid() -> Self {
        Self(String::new())
    }

    /// Returns the transport address.
    #[inline]
    #[must_use]
    pub fn ip_port(&self) -> &str {
        &self.0
    }

    /// Checks whether this peer id carries a usable address.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && self.0.contains(':')
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "PeerId(INVALID)")
        } else {
            write!(f, "PeerId({})", self.0)
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validity() {
        assert!(PeerId::new("127.0.0.1:5050").is_valid());
        assert!(!PeerId::invalid().is_valid());
        assert!(!PeerId::new("no-port").is_valid());
    }

    #[test]
    fn test_equality_by_address() {
        assert_eq!(PeerId::new("10.0.0.1:1"), PeerId::new("10.0.0.1:1"));
        assert_ne!(PeerId::new("10.0.0.1:1"), PeerId::new("10.0.0.1:2"));
    }

    #[test]
    fn test_lexicographic_order() {
        // The tiebreak order is plain string comparison of addresses.
        let a = PeerId::new("10.0.0.1:5050");
        let b = PeerId::new("10.0.0.2:5050");
        let c = PeerId::new("10.0.0.10:5050");
        assert!(a < b);
        assert!(c < b); // "10" sorts before "2" lexicographically
    }
}
