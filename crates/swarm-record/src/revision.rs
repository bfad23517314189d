//! The revision envelope.
//!
//! A revision is one immutable version of one record: the record id, the
//! owning chunk, the insert and update times, a tombstone flag, and the
//! positional typed fields. A record's history is a list of revisions;
//! the newest revision at or before a query time is the record's head at
//! that time.
//!
//! Revisions are mutable while staged in a transaction and shared
//! immutably (behind `Arc`) once published to a container or put on the
//! wire.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use swarm_common::{ChunkId, LogicalTime, RecordId, SwarmError, SwarmResult};

use crate::descriptor::TableDescriptor;
use crate::value::Value;
use crate::wire;

/// One immutable version of one record.
#[derive(Clone)]
pub struct Revision {
    descriptor: Arc<TableDescriptor>,
    id: RecordId,
    chunk_id: ChunkId,
    insert_time: LogicalTime,
    update_time: LogicalTime,
    removed: bool,
    fields: Vec<Option<Value>>,
}

impl Revision {
    /// Creates an empty revision with one unset slot per descriptor
    /// field. Prefer [`TableDescriptor::template`].
    #[must_use]
    pub fn empty(descriptor: Arc<TableDescriptor>) -> Self {
        let fields = vec![None; descriptor.num_fields()];
        Self {
            descriptor,
            id: RecordId::INVALID,
            chunk_id: ChunkId::INVALID,
            insert_time: LogicalTime::ZERO,
            update_time: LogicalTime::ZERO,
            removed: false,
            fields,
        }
    }

    /// Rebuilds a revision from decoded parts. Used by the wire codec.
    pub(crate) fn from_parts(
        descriptor: Arc<TableDescriptor>,
        id: RecordId,
        chunk_id: ChunkId,
        insert_time: LogicalTime,
        update_time: LogicalTime,
        removed: bool,
        fields: Vec<Option<Value>>,
    ) -> Self {
        Self {
            descriptor,
            id,
            chunk_id,
            insert_time,
            update_time,
            removed,
            fields,
        }
    }

    /// Returns the table descriptor this revision is checked against.
    #[must_use]
    pub fn descriptor(&self) -> &Arc<TableDescriptor> {
        &self.descriptor
    }

    /// Returns the record id.
    #[must_use]
    pub fn id(&self) -> RecordId {
        self.id
    }

    /// Sets the record id.
    pub fn set_id(&mut self, id: RecordId) {
        self.id = id;
    }

    /// Returns the owning chunk id.
    #[must_use]
    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    /// Sets the owning chunk id.
    pub fn set_chunk_id(&mut self, chunk_id: ChunkId) {
        self.chunk_id = chunk_id;
    }

    /// Returns the insert time.
    #[must_use]
    pub fn insert_time(&self) -> LogicalTime {
        self.insert_time
    }

    /// Sets the insert time.
    pub fn set_insert_time(&mut self, time: LogicalTime) {
        self.insert_time = time;
    }

    /// Returns the update time. For the first revision of a record this
    /// equals the insert time.
    #[must_use]
    pub fn update_time(&self) -> LogicalTime {
        self.update_time
    }

    /// Sets the update time.
    pub fn set_update_time(&mut self, time: LogicalTime) {
        self.update_time = time;
    }

    /// Returns true if this revision is a tombstone.
    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.removed
    }

    /// Sets the tombstone flag.
    pub fn set_removed(&mut self, removed: bool) {
        self.removed = removed;
    }

    /// Derives the tombstone revision that removes this record.
    #[must_use]
    pub fn as_tombstone(&self) -> Revision {
        let mut tombstone = self.clone();
        tombstone.removed = true;
        tombstone
    }

    /// Returns the number of positional field slots.
    #[must_use]
    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    /// Sets the field at `index`.
    ///
    /// Fails with `SchemaMismatch` when the index is out of range or the
    /// value's type disagrees with the descriptor.
    pub fn set(&mut self, index: usize, value: Value) -> SwarmResult<()> {
        let expected = self.descriptor.field_type(index).ok_or_else(|| {
            SwarmError::schema_mismatch(format!(
                "field index {} out of range for table {} ({} fields)",
                index,
                self.descriptor.name(),
                self.fields.len()
            ))
        })?;
        if value.field_type() != expected {
            return Err(SwarmError::schema_mismatch(format!(
                "field {} of table {} is {}, got {}",
                index,
                self.descriptor.name(),
                expected,
                value.field_type()
            )));
        }
        self.fields[index] = Some(value);
        Ok(())
    }

    /// Gets the field at `index`.
    ///
    /// Fails with `SchemaMismatch` when the index is out of range or the
    /// slot was never set.
    pub fn get(&self, index: usize) -> SwarmResult<&Value> {
        self.fields
            .get(index)
            .ok_or_else(|| {
                SwarmError::schema_mismatch(format!(
                    "field index {} out of range for table {}",
                    index,
                    self.descriptor.name()
                ))
            })?
            .as_ref()
            .ok_or_else(|| {
                SwarmError::schema_mismatch(format!(
                    "field {} of table {} is not set",
                    index,
                    self.descriptor.name()
                ))
            })
    }

    /// Returns the field slot at `index` without erroring on unset.
    #[must_use]
    pub fn field(&self, index: usize) -> Option<&Value> {
        self.fields.get(index).and_then(Option::as_ref)
    }

    /// Returns true iff `other` has the same field names, types, and
    /// order.
    #[must_use]
    pub fn structure_match(&self, other: &Revision) -> bool {
        Arc::ptr_eq(&self.descriptor, &other.descriptor)
            || *self.descriptor == *other.descriptor
    }

    /// Returns true iff the field at `index` is set and equals `value`.
    #[must_use]
    pub fn verify_equal(&self, index: usize, value: &Value) -> bool {
        self.field(index) == Some(value)
    }

    /// Serializes this revision to its wire form.
    #[must_use]
    pub fn serialize(&self) -> Bytes {
        wire::encode(self)
    }

    /// Parses a revision from its wire form, checking it against the
    /// descriptor.
    pub fn parse(bytes: &[u8], descriptor: &Arc<TableDescriptor>) -> SwarmResult<Revision> {
        wire::decode(bytes, descriptor)
    }

    /// Returns the serialized size in bytes.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.serialize().len()
    }
}

impl PartialEq for Revision {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.chunk_id == other.chunk_id
            && self.insert_time == other.insert_time
            && self.update_time == other.update_time
            && self.removed == other.removed
            && self.fields == other.fields
            && self.structure_match(other)
    }
}

impl fmt::Debug for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Revision")
            .field("id", &self.id)
            .field("chunk_id", &self.chunk_id)
            .field("insert_time", &self.insert_time)
            .field("update_time", &self.update_time)
            .field("removed", &self.removed)
            .field("fields", &self.fields)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{FieldType, TableDescriptor};

    fn descriptor() -> Arc<TableDescriptor> {
        TableDescriptor::new("things")
            .with_field("count", FieldType::Int32)
            .with_field("label", FieldType::String)
            .build()
    }

    #[test]
    fn test_set_get_roundtrip() {
        let mut revision = descriptor().template();
        revision.set(0, Value::Int32(42)).unwrap();
        assert_eq!(revision.get(0).unwrap().as_i32(), Some(42));
    }

    #[test]
    fn test_set_wrong_type_fails() {
        let mut revision = descriptor().template();
        let err = revision.set(0, Value::Int64(42)).unwrap_err();
        assert!(matches!(err, SwarmError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_set_out_of_range_fails() {
        let mut revision = descriptor().template();
        assert!(revision.set(5, Value::Int32(1)).is_err());
    }

    #[test]
    fn test_get_unset_fails() {
        let revision = descriptor().template();
        assert!(matches!(
            revision.get(1),
            Err(SwarmError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn test_structure_match() {
        let d = descriptor();
        let a = d.template();
        let b = d.template();
        assert!(a.structure_match(&b));

        let other = TableDescriptor::new("things")
            .with_field("count", FieldType::Int64)
            .with_field("label", FieldType::String)
            .build();
        assert!(!a.structure_match(&other.template()));
    }

    #[test]
    fn test_tombstone_derivation() {
        let mut revision = descriptor().template();
        revision.set_id(RecordId::from_u64(1));
        let tombstone = revision.as_tombstone();
        assert!(tombstone.is_removed());
        assert_eq!(tombstone.id(), revision.id());
        assert!(!revision.is_removed());
    }

    #[test]
    fn test_verify_equal() {
        let mut revision = descriptor().template();
        revision.set(0, Value::Int32(7)).unwrap();
        assert!(revision.verify_equal(0, &Value::Int32(7)));
        assert!(!revision.verify_equal(0, &Value::Int32(8)));
        assert!(!revision.verify_equal(1, &Value::Int32(7)));
    }
}
