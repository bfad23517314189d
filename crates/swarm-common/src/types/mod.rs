//! Core identifier types for swarmstore.

mod ids;
mod peer;

pub use ids::{ChunkId, Id, RecordId};
pub use peer::PeerId;
