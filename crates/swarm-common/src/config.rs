//! Store configuration.

use crate::error::{SwarmError, SwarmResult};

/// How a new peer integrates into the discovery ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMode {
    /// Join by taking over a key range immediately. Not supported.
    Clean,
    /// Join passively and let periodic stabilization integrate the peer.
    Stabilize,
}

/// Configuration for one store peer.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// This peer's bind address.
    pub ip_port: String,
    /// Ring integration mode; only `Stabilize` is accepted.
    pub join_mode: JoinMode,
    /// Ring stabilization period, in microseconds.
    pub stabilize_period_us: u64,
    /// When true, applying an update also records on the superseded
    /// revision the time of the revision that replaced it.
    pub cru_linked: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            ip_port: String::new(),
            join_mode: JoinMode::Stabilize,
            stabilize_period_us: 100_000,
            cru_linked: false,
        }
    }
}

impl StoreConfig {
    /// Creates a config bound to the given address.
    #[must_use]
    pub fn new(ip_port: impl Into<String>) -> Self {
        Self {
            ip_port: ip_port.into(),
            ..Default::default()
        }
    }

    /// Sets the join mode.
    #[must_use]
    pub fn with_join_mode(mut self, mode: JoinMode) -> Self {
        self.join_mode = mode;
        self
    }

    /// Sets the stabilization period.
    #[must_use]
    pub fn with_stabilize_period_us(mut self, period: u64) -> Self {
        self.stabilize_period_us = period;
        self
    }

    /// Enables linked update histories.
    #[must_use]
    pub fn with_linked_updates(mut self, linked: bool) -> Self {
        self.cru_linked = linked;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SwarmResult<()> {
        if self.ip_port.is_empty() {
            return Err(SwarmError::InvalidConfig {
                message: "ip_port must be set".to_string(),
            });
        }
        if self.join_mode == JoinMode::Clean {
            return Err(SwarmError::InvalidConfig {
                message: "clean join is not supported, use stabilize".to_string(),
            });
        }
        if self.stabilize_period_us == 0 {
            return Err(SwarmError::InvalidConfig {
                message: "stabilize_period_us must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_validates_after_bind() {
        assert!(StoreConfig::default().validate().is_err());
        assert!(StoreConfig::new("127.0.0.1:5050").validate().is_ok());
    }

    #[test]
    fn test_clean_join_rejected() {
        let config = StoreConfig::new("127.0.0.1:5050").with_join_mode(JoinMode::Clean);
        assert!(matches!(
            config.validate(),
            Err(SwarmError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_builder() {
        let config = StoreConfig::new("10.0.0.1:1")
            .with_stabilize_period_us(42)
            .with_linked_updates(true);
        assert_eq!(config.stabilize_period_us, 42);
        assert!(config.cru_linked);
    }
}
