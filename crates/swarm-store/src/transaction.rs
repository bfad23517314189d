//! Per-chunk transaction staging.
//!
//! A chunk transaction batches insertions and updates against one
//! chunk, reads at its begin time, and is validated on the chunk
//! holder under the write primitive at commit time. A record id may
//! appear in at most one of the staged maps.

use std::collections::BTreeMap;
use std::sync::Arc;

use swarm_common::{LogicalTime, RecordId, SwarmError, SwarmResult};
use swarm_record::{Revision, Value};

use crate::container::ChunkDataContainer;

/// A staged "fail if a record matching this field exists" predicate.
#[derive(Debug, Clone)]
pub struct ConflictCondition {
    /// The queried field index.
    pub field_index: usize,
    /// The value that must not match any record.
    pub value: Value,
}

/// Staged insertions and updates against one chunk.
pub struct ChunkTransaction {
    begin_time: LogicalTime,
    container: Arc<ChunkDataContainer>,
    template: Revision,
    insertions: BTreeMap<RecordId, Revision>,
    updates: BTreeMap<RecordId, Revision>,
    conflict_conditions: Vec<ConflictCondition>,
}

impl ChunkTransaction {
    /// Creates a transaction reading at `begin_time`.
    #[must_use]
    pub fn new(begin_time: LogicalTime, container: Arc<ChunkDataContainer>) -> Self {
        let template = container.descriptor().template();
        Self {
            begin_time,
            container,
            template,
            insertions: BTreeMap::new(),
            updates: BTreeMap::new(),
            conflict_conditions: Vec::new(),
        }
    }

    /// Returns the begin time.
    #[must_use]
    pub fn begin_time(&self) -> LogicalTime {
        self.begin_time
    }

    /// Returns true if nothing is staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.insertions.is_empty() && self.updates.is_empty()
    }

    fn check_structure(&self, revision: &Revision) -> SwarmResult<()> {
        if !revision.structure_match(&self.template) {
            return Err(SwarmError::schema_mismatch(format!(
                "revision structure does not match table {}",
                self.container.descriptor().name()
            )));
        }
        assert!(revision.id().is_valid(), "staged revision has no id");
        Ok(())
    }

    /// Stages an insertion.
    pub fn insert(&mut self, revision: Revision) -> SwarmResult<()> {
        self.check_structure(&revision)?;
        let id = revision.id();
        if self.insertions.contains_key(&id) || self.updates.contains_key(&id) {
            return Err(SwarmError::Duplicate { id });
        }
        self.insertions.insert(id, revision);
        Ok(())
    }

    /// Stages an update.
    pub fn update(&mut self, revision: Revision) -> SwarmResult<()> {
        assert!(
            self.container.descriptor().is_updatable(),
            "table {} does not support updates",
            self.container.descriptor().name()
        );
        self.check_structure(&revision)?;
        let id = revision.id();
        if self.insertions.contains_key(&id) || self.updates.contains_key(&id) {
            return Err(SwarmError::Duplicate { id });
        }
        self.updates.insert(id, revision);
        Ok(())
    }

    /// Declares a conflict condition checked at commit time.
    pub fn add_conflict_condition(&mut self, field_index: usize, value: Value) {
        self.conflict_conditions.push(ConflictCondition {
            field_index,
            value,
        });
    }

    /// Returns the staged revision for `id`, if any.
    #[must_use]
    pub fn get_from_staged(&self, id: RecordId) -> Option<&Revision> {
        self.updates.get(&id).or_else(|| self.insertions.get(&id))
    }

    /// Returns the staged revision for `id`, or the chunk head at the
    /// begin time.
    #[must_use]
    pub fn get_by_id(&self, id: RecordId) -> Option<Revision> {
        if let Some(staged) = self.get_from_staged(id) {
            return Some(staged.clone());
        }
        self.container
            .get_by_id(id, self.begin_time)
            .map(|arc| (*arc).clone())
    }

    /// Returns the staged insertions.
    #[must_use]
    pub fn insertions(&self) -> &BTreeMap<RecordId, Revision> {
        &self.insertions
    }

    /// Returns the staged updates.
    #[must_use]
    pub fn updates(&self) -> &BTreeMap<RecordId, Revision> {
        &self.updates
    }

    /// Returns the declared conflict conditions.
    #[must_use]
    pub fn conflict_conditions(&self) -> &[ConflictCondition] {
        &self.conflict_conditions
    }
}
