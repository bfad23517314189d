//! Error handling for swarmstore.
//!
//! One unified error type covers every component. Protocol violations
//! (two leaders in a term, committed-entry conflicts, lock release
//! without a prior acquire) are not represented here: those crash the
//! peer at the detection site with diagnostic context, because no caller
//! can meaningfully recover from them.

use thiserror::Error;

use crate::time::LogicalTime;
use crate::types::{PeerId, RecordId};

/// Result type alias for swarmstore operations.
pub type SwarmResult<T> = std::result::Result<T, SwarmError>;

/// The unified error type for swarmstore operations.
#[derive(Debug, Error)]
pub enum SwarmError {
    /// Field type or arity disagrees with the table descriptor.
    #[error("schema mismatch: {message}")]
    SchemaMismatch {
        /// What disagreed.
        message: String,
    },

    /// Insert of an id that already exists.
    #[error("record {id} already exists")]
    Duplicate {
        /// The duplicated record id.
        id: RecordId,
    },

    /// Update whose target head is newer than the transaction begin time.
    #[error("stale update of {id}: head at {head_time}, transaction began at {begin_time}")]
    StaleUpdate {
        /// The record being updated.
        id: RecordId,
        /// Time of the current head.
        head_time: LogicalTime,
        /// Begin time of the losing transaction.
        begin_time: LogicalTime,
    },

    /// A declared conflict-condition query matched at commit time.
    #[error("conflict condition matched on field {field_index}")]
    ConflictCondition {
        /// Index of the conflicting field.
        field_index: usize,
    },

    /// A multi-chunk commit lost a race; the client may re-read and retry.
    #[error("transaction conflict, retry: {message}")]
    ConflictRetry {
        /// What conflicted.
        message: String,
    },

    /// A remote peer declined a lock request.
    #[error("lock declined by {peer}")]
    LockDeclined {
        /// The declining peer.
        peer: PeerId,
    },

    /// An RPC failed at the transport level.
    #[error("transport failure talking to {peer}: {reason}")]
    Transport {
        /// The unreachable peer.
        peer: PeerId,
        /// Failure detail.
        reason: String,
    },

    /// A write was attempted on a replica that is not the leader.
    #[error("not the leader, leader is {leader:?}")]
    NotLeader {
        /// The last known leader, so the client can redirect.
        leader: Option<PeerId>,
    },

    /// Wire data could not be decoded.
    #[error("corrupt data: {message}")]
    Corruption {
        /// What failed to decode.
        message: String,
    },

    /// I/O error from the underlying system.
    #[error("I/O error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// What was rejected.
        message: String,
    },

    /// Internal error; indicates a bug.
    #[error("internal error: {message}")]
    Internal {
        /// Error detail.
        message: String,
    },
}

impl SwarmError {
    /// Returns true if retrying the operation may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockDeclined { .. } | Self::Transport { .. } | Self::NotLeader { .. }
        )
    }

    /// Returns true if this error is a transaction conflict.
    ///
    /// Conflicts are never retried automatically; the client must
    /// re-read before trying again.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::Duplicate { .. }
                | Self::StaleUpdate { .. }
                | Self::ConflictCondition { .. }
                | Self::ConflictRetry { .. }
        )
    }

    /// Creates a schema-mismatch error.
    #[must_use]
    pub fn schema_mismatch(message: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    #[must_use]
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = SwarmError::Duplicate {
            id: RecordId::from_u64(3),
        };
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn test_retryable() {
        assert!(SwarmError::NotLeader { leader: None }.is_retryable());
        assert!(SwarmError::LockDeclined {
            peer: PeerId::new("a:1")
        }
        .is_retryable());
        assert!(!SwarmError::Duplicate {
            id: RecordId::from_u64(1)
        }
        .is_retryable());
    }

    #[test]
    fn test_conflict() {
        let stale = SwarmError::StaleUpdate {
            id: RecordId::from_u64(1),
            head_time: LogicalTime::new(9),
            begin_time: LogicalTime::new(5),
        };
        assert!(stale.is_conflict());
        assert!(!stale.is_retryable());
        assert!(!SwarmError::internal("x").is_conflict());
    }
}
