//! # swarm-store
//!
//! The chunk store: per-chunk history containers, the distributed
//! read/write lock, chunks in their two replication modes, staged
//! chunk transactions, the multi-chunk transaction coordinator, and
//! the net table registry.
//!
//! A *chunk* is the unit of replication: the records sharing one
//! `chunk_id`, hosted on a dynamic subset of peers. Legacy chunks keep
//! replicas consistent with the distributed lock plus patch broadcasts;
//! consensus chunks order every mutation through their raft log.

#![warn(clippy::all)]

pub mod chunk;
pub mod container;
pub mod lock;
pub mod net_transaction;
pub mod table;
pub mod transaction;

pub use chunk::{Chunk, ChunkMode};
pub use container::ChunkDataContainer;
pub use lock::{DistributedRwLock, LockReply};
pub use net_transaction::NetTableTransaction;
pub use table::{ChunkLookup, NetTable, TableRegistry};
pub use transaction::ChunkTransaction;
