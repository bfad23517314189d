//! # swarm-raft
//!
//! Per-chunk replicated consensus for swarmstore.
//!
//! Each consensus-mode chunk runs one [`RaftNode`]: a replicated log
//! whose committed entries drive the chunk's data container, its
//! replica set, and its write-lock lease. Elections and replication
//! follow Raft, adapted to the chunk swarm:
//!
//! - at most one new log entry per AppendEntries message,
//! - a follower that knows a different current leader answers
//!   `Rejected` instead of voting the sender in,
//! - lock acquisition and release are themselves log entries, which
//!   ties the chunk write lock to log order across leader changes.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Raft log storage and the follower append rules.
pub mod log;

/// The chunk write-lock lease driven by committed log entries.
pub mod lock;

/// The per-chunk raft node.
pub mod node;

/// RPC message types.
pub mod rpc;

/// A position in the raft log.
pub type LogIndex = u64;

/// A raft term number.
pub type Term = u64;

pub use lock::ChunkLockState;
pub use log::{ChunkLogEntry, LogPayload, RaftLog};
pub use node::{ChunkStateMachine, RaftNode, RaftNodeConfig, Role};
