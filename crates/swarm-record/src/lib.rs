//! # swarm-record
//!
//! The versioned record model: table descriptors, the typed value union,
//! the revision envelope, its wire codec, and snapshot file IO.
//!
//! A [`Revision`] is an immutable versioned record value. Revisions are
//! positional: field slots are addressed by index and schema-checked
//! against the owning table's [`TableDescriptor`]. The wire codec in
//! [`wire`] is the single serialization used for RPC payloads and
//! snapshot files alike.

#![warn(clippy::all)]

pub mod descriptor;
pub mod revision;
pub mod snapshot;
pub mod value;
pub mod wire;

pub use descriptor::{FieldType, TableDescriptor};
pub use revision::Revision;
pub use value::Value;
