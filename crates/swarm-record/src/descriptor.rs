//! Table descriptors.
//!
//! A descriptor is the ordered list of `(field_name, field_type)` pairs
//! that defines a table's positional schema. Descriptors are immutable
//! once published; schema evolution is append-only, so a field index
//! remains stable for the lifetime of the table.
//!
//! The well-known envelope data (`id`, `insert_time`, `update_time`,
//! `chunk_id`, `removed`) is carried on every revision directly and is
//! not part of the positional field list.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::revision::Revision;

/// The type of one positional field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    /// Boolean.
    Bool,
    /// 32-bit signed integer.
    Int32,
    /// 64-bit signed integer.
    Int64,
    /// 64-bit float.
    Double,
    /// UTF-8 string.
    String,
    /// Raw bytes.
    Bytes,
    /// A 128-bit id hash.
    Hash,
    /// A logical-clock time.
    LogicalTime,
    /// An embedded serialized message.
    Message,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The immutable schema of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    name: String,
    fields: Vec<(String, FieldType)>,
    updatable: bool,
}

impl TableDescriptor {
    /// Starts a descriptor for the named table.
    ///
    /// Tables support updates by default; see [`Self::without_updates`]
    /// for insert-only tables.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            updatable: true,
        }
    }

    /// Appends a field. Field order defines field indices.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push((name.into(), field_type));
        self
    }

    /// Marks the table insert-only: staged updates are rejected.
    #[must_use]
    pub fn without_updates(mut self) -> Self {
        self.updatable = false;
        self
    }

    /// Publishes the descriptor. After this point it never changes.
    #[must_use]
    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Returns the table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of positional fields.
    #[must_use]
    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    /// Returns the type of the field at `index`.
    #[must_use]
    pub fn field_type(&self, index: usize) -> Option<FieldType> {
        self.fields.get(index).map(|(_, t)| *t)
    }

    /// Returns the name of the field at `index`.
    #[must_use]
    pub fn field_name(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(|(n, _)| n.as_str())
    }

    /// Looks up a field index by name.
    #[must_use]
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|(n, _)| n == name)
    }

    /// Returns whether the table supports updates.
    #[must_use]
    pub fn is_updatable(&self) -> bool {
        self.updatable
    }

    /// Checks append-only evolution: `self` must be a prefix of `newer`,
    /// with names and types agreeing at every shared index.
    #[must_use]
    pub fn is_prefix_of(&self, newer: &TableDescriptor) -> bool {
        self.name == newer.name
            && self.fields.len() <= newer.fields.len()
            && self.fields.iter().zip(newer.fields.iter()).all(|(a, b)| a == b)
    }

    /// Produces an empty revision with one unset slot per field.
    ///
    /// Templates are the starting point for staged insertions and for
    /// find-by-field value holders.
    #[must_use]
    pub fn template(self: &Arc<Self>) -> Revision {
        Revision::empty(Arc::clone(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Arc<TableDescriptor> {
        TableDescriptor::new("poses")
            .with_field("frame", FieldType::Int32)
            .with_field("payload", FieldType::Bytes)
            .build()
    }

    #[test]
    fn test_field_lookup() {
        let descriptor = sample();
        assert_eq!(descriptor.num_fields(), 2);
        assert_eq!(descriptor.field_type(0), Some(FieldType::Int32));
        assert_eq!(descriptor.field_type(2), None);
        assert_eq!(descriptor.field_index("payload"), Some(1));
        assert_eq!(descriptor.field_name(1), Some("payload"));
    }

    #[test]
    fn test_append_only_evolution() {
        let v1 = TableDescriptor::new("poses").with_field("frame", FieldType::Int32);
        let v2 = TableDescriptor::new("poses")
            .with_field("frame", FieldType::Int32)
            .with_field("payload", FieldType::Bytes);
        assert!(v1.is_prefix_of(&v2));
        assert!(!v2.is_prefix_of(&v1));

        let renamed = TableDescriptor::new("poses").with_field("other", FieldType::Int32);
        assert!(!v1.is_prefix_of(&renamed));
    }

    #[test]
    fn test_template_arity() {
        let descriptor = sample();
        let template = descriptor.template();
        assert_eq!(template.num_fields(), 2);
        assert!(template.get(0).is_err()); // unset slot
    }

    #[test]
    fn test_updatable_flag() {
        assert!(sample().is_updatable());
        let frozen = TableDescriptor::new("log").without_updates().build();
        assert!(!frozen.is_updatable());
    }
}
