//! # swarm-common
//!
//! Common types, errors, and utilities for swarmstore.
//!
//! This crate provides the foundational types used across all swarmstore
//! components:
//!
//! - **Types**: Core identifiers (`Id`, `ChunkId`, `RecordId`, `PeerId`)
//! - **Time**: The process-wide monotone logical clock
//! - **Errors**: Unified error handling with `SwarmError`
//! - **Config**: Store configuration structures
//! - **Constants**: Protocol timing constants

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod constants;
pub mod error;
pub mod time;
pub mod types;

pub use config::{JoinMode, StoreConfig};
pub use error::{SwarmError, SwarmResult};
pub use time::{LogicalClock, LogicalTime};
pub use types::{ChunkId, Id, PeerId, RecordId};
