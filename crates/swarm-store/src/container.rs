//! The in-memory chunk data container.
//!
//! Per record, the container keeps the full revision history, newest
//! first. The head of a record at time `t` is the newest revision with
//! `update_time <= t`; a tombstone head means the record is absent at
//! `t`. Query results are filtered accordingly.
//!
//! `patch` is the replication entry point: an idempotent,
//! position-correct application of a revision received from a peer.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use swarm_common::{ChunkId, LogicalClock, LogicalTime, RecordId, SwarmError, SwarmResult};
use swarm_record::{Revision, TableDescriptor, Value};

/// One record's revisions, newest first.
#[derive(Debug, Default, Clone)]
struct History {
    entries: Vec<HistoryEntry>,
}

#[derive(Debug, Clone)]
struct HistoryEntry {
    revision: Arc<Revision>,
    /// With linked updates, the time of the revision that replaced this
    /// one.
    superseded_at: Option<LogicalTime>,
}

impl History {
    fn head(&self) -> Option<&Arc<Revision>> {
        self.entries.first().map(|e| &e.revision)
    }

    /// The newest revision with `update_time <= time`.
    fn latest_at(&self, time: LogicalTime) -> Option<&Arc<Revision>> {
        self.entries
            .iter()
            .find(|e| e.revision.update_time() <= time)
            .map(|e| &e.revision)
    }

    fn push_head(&mut self, revision: Arc<Revision>, link_time: Option<LogicalTime>) {
        if let (Some(link_time), Some(prior)) = (link_time, self.entries.first_mut()) {
            prior.superseded_at = Some(link_time);
        }
        self.entries.insert(
            0,
            HistoryEntry {
                revision,
                superseded_at: None,
            },
        );
    }

    /// Inserts `revision` at its position in descending `update_time`
    /// order; a revision with an already-present time is dropped.
    fn patch(&mut self, revision: Arc<Revision>, linked: bool) {
        let time = revision.update_time();
        let index = match self
            .entries
            .iter()
            .position(|e| e.revision.update_time() <= time)
        {
            Some(index) if self.entries[index].revision.update_time() == time => return,
            Some(index) => index,
            None => self.entries.len(),
        };
        let superseded_at = (linked && index > 0)
            .then(|| self.entries[index - 1].revision.update_time());
        self.entries.insert(
            index,
            HistoryEntry {
                revision,
                superseded_at,
            },
        );
        if linked && index + 1 < self.entries.len() {
            self.entries[index + 1].superseded_at = Some(time);
        }
    }
}

/// The per-chunk history container.
pub struct ChunkDataContainer {
    chunk_id: ChunkId,
    descriptor: Arc<TableDescriptor>,
    clock: Arc<LogicalClock>,
    linked_updates: bool,
    histories: RwLock<HashMap<RecordId, History>>,
}

impl ChunkDataContainer {
    /// Creates an empty container for `chunk_id`.
    #[must_use]
    pub fn new(
        chunk_id: ChunkId,
        descriptor: Arc<TableDescriptor>,
        clock: Arc<LogicalClock>,
        linked_updates: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            chunk_id,
            descriptor,
            clock,
            linked_updates,
            histories: RwLock::new(HashMap::new()),
        })
    }

    /// Returns the chunk this container belongs to.
    #[must_use]
    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    /// Returns the table descriptor.
    #[must_use]
    pub fn descriptor(&self) -> &Arc<TableDescriptor> {
        &self.descriptor
    }

    /// Inserts a fresh record at time `time`.
    ///
    /// The revision is stamped with `insert_time == update_time ==
    /// time` and published. Fails with `Duplicate` when the id already
    /// has a history.
    pub fn insert(&self, time: LogicalTime, mut revision: Revision) -> SwarmResult<Arc<Revision>> {
        assert_eq!(
            revision.chunk_id(),
            self.chunk_id,
            "revision belongs to chunk {}, container holds {}",
            revision.chunk_id(),
            self.chunk_id
        );
        assert!(revision.id().is_valid(), "revision has no id");
        revision.set_insert_time(time);
        revision.set_update_time(time);
        let revision = Arc::new(revision);

        let mut histories = self.histories.write();
        if histories.contains_key(&revision.id()) {
            return Err(SwarmError::Duplicate { id: revision.id() });
        }
        histories
            .entry(revision.id())
            .or_default()
            .push_head(Arc::clone(&revision), None);
        Ok(revision)
    }

    /// Inserts a batch atomically: if any id collides, nothing is
    /// applied.
    pub fn bulk_insert(
        &self,
        time: LogicalTime,
        revisions: Vec<Revision>,
    ) -> SwarmResult<Vec<Arc<Revision>>> {
        let mut histories = self.histories.write();
        let mut batch_ids = BTreeSet::new();
        for revision in &revisions {
            assert_eq!(revision.chunk_id(), self.chunk_id);
            assert!(revision.id().is_valid(), "revision has no id");
            if histories.contains_key(&revision.id()) || !batch_ids.insert(revision.id()) {
                return Err(SwarmError::Duplicate {
                    id: revision.id(),
                });
            }
        }

        let mut published = Vec::with_capacity(revisions.len());
        for mut revision in revisions {
            revision.set_insert_time(time);
            revision.set_update_time(time);
            let revision = Arc::new(revision);
            histories
                .entry(revision.id())
                .or_default()
                .push_head(Arc::clone(&revision), None);
            published.push(revision);
        }
        Ok(published)
    }

    /// Appends a new head for an existing record at time `time`.
    pub fn update(&self, time: LogicalTime, mut revision: Revision) -> SwarmResult<Arc<Revision>> {
        assert_eq!(revision.chunk_id(), self.chunk_id);
        let mut histories = self.histories.write();
        let history = histories.get_mut(&revision.id()).unwrap_or_else(|| {
            panic!("update of unknown record {}", revision.id())
        });
        let head = history.head().expect("non-empty history");
        assert!(
            time > head.update_time(),
            "update at {} not after head at {}",
            time,
            head.update_time()
        );
        revision.set_insert_time(head.insert_time());
        revision.set_update_time(time);
        let revision = Arc::new(revision);
        let link = self.linked_updates.then_some(time);
        history.push_head(Arc::clone(&revision), link);
        Ok(revision)
    }

    /// Removes a record at time `time` by appending a tombstone head.
    pub fn remove(&self, time: LogicalTime, revision: Revision) -> SwarmResult<Arc<Revision>> {
        self.update(time, revision.as_tombstone())
    }

    /// Applies a revision received from a peer.
    ///
    /// Idempotent: a revision whose `(id, update_time)` is already
    /// present is dropped. A revision newer than the head becomes the
    /// new head; an older one is filed at its position in the history.
    pub fn patch(&self, revision: Arc<Revision>) -> SwarmResult<()> {
        assert_eq!(revision.chunk_id(), self.chunk_id);
        self.clock.merge(revision.update_time());
        let mut histories = self.histories.write();
        histories
            .entry(revision.id())
            .or_default()
            .patch(revision, self.linked_updates);
        Ok(())
    }

    /// Returns the record's head at `time`, or `None` if absent or
    /// removed.
    #[must_use]
    pub fn get_by_id(&self, id: RecordId, time: LogicalTime) -> Option<Arc<Revision>> {
        let histories = self.histories.read();
        let revision = histories.get(&id)?.latest_at(time)?;
        if revision.is_removed() {
            None
        } else {
            Some(Arc::clone(revision))
        }
    }

    /// Returns the heads at `time` whose field `key` equals `value`.
    /// With `key == None`, every live head matches (a dump).
    #[must_use]
    pub fn find_by_field(
        &self,
        key: Option<usize>,
        value: &Value,
        time: LogicalTime,
    ) -> HashMap<RecordId, Arc<Revision>> {
        let histories = self.histories.read();
        let mut found = HashMap::new();
        for (id, history) in histories.iter() {
            let Some(revision) = history.latest_at(time) else {
                continue;
            };
            if revision.is_removed() {
                continue;
            }
            let matches = match key {
                None => true,
                Some(index) => revision.verify_equal(index, value),
            };
            if matches {
                found.insert(*id, Arc::clone(revision));
            }
        }
        found
    }

    /// Counts the heads matching `find_by_field`.
    #[must_use]
    pub fn count_by_field(&self, key: Option<usize>, value: &Value, time: LogicalTime) -> usize {
        self.find_by_field(key, value, time).len()
    }

    /// Returns the single head matching the query.
    ///
    /// # Panics
    ///
    /// Panics when more than one record matches; unique lookups are a
    /// caller-declared invariant.
    #[must_use]
    pub fn find_unique(
        &self,
        key: usize,
        value: &Value,
        time: LogicalTime,
    ) -> Option<Arc<Revision>> {
        let found = self.find_by_field(Some(key), value, time);
        assert!(
            found.len() <= 1,
            "{} records match supposedly unique field {} of table {}",
            found.len(),
            key,
            self.descriptor.name()
        );
        found.into_values().next()
    }

    /// Returns the ids live at `time`.
    #[must_use]
    pub fn available_ids(&self, time: LogicalTime) -> Vec<RecordId> {
        let histories = self.histories.read();
        histories
            .iter()
            .filter(|(_, history)| {
                history
                    .latest_at(time)
                    .is_some_and(|revision| !revision.is_removed())
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Counts the ids live at `time`.
    #[must_use]
    pub fn num_available_ids(&self, time: LogicalTime) -> usize {
        self.available_ids(time).len()
    }

    /// Returns every live head at `time`.
    #[must_use]
    pub fn dump(&self, time: LogicalTime) -> HashMap<RecordId, Arc<Revision>> {
        self.find_by_field(None, &Value::Bool(false), time)
    }

    /// Returns one record's full history, newest first.
    #[must_use]
    pub fn history(&self, id: RecordId) -> Vec<Arc<Revision>> {
        let histories = self.histories.read();
        histories
            .get(&id)
            .map(|history| history.entries.iter().map(|e| Arc::clone(&e.revision)).collect())
            .unwrap_or_default()
    }

    /// Returns, per record, the revisions of `chunk_id` visible at
    /// `time` (newest first).
    #[must_use]
    pub fn chunk_history(
        &self,
        chunk_id: ChunkId,
        time: LogicalTime,
    ) -> HashMap<RecordId, Vec<Arc<Revision>>> {
        let histories = self.histories.read();
        let mut result = HashMap::new();
        for (id, history) in histories.iter() {
            let revisions: Vec<Arc<Revision>> = history
                .entries
                .iter()
                .filter(|e| {
                    e.revision.chunk_id() == chunk_id && e.revision.update_time() <= time
                })
                .map(|e| Arc::clone(&e.revision))
                .collect();
            if !revisions.is_empty() {
                result.insert(*id, revisions);
            }
        }
        result
    }

    /// Returns the distinct commit times present at `time`.
    #[must_use]
    pub fn commit_times(&self, time: LogicalTime) -> BTreeSet<LogicalTime> {
        let histories = self.histories.read();
        let mut times = BTreeSet::new();
        for history in histories.values() {
            for entry in &history.entries {
                if entry.revision.update_time() <= time {
                    times.insert(entry.revision.update_time());
                }
            }
        }
        times
    }

    /// Returns the serialized size of the live heads at `time`.
    #[must_use]
    pub fn items_size_bytes(&self, time: LogicalTime) -> usize {
        self.dump(time).values().map(|r| r.byte_size()).sum()
    }

    /// Returns every revision in the container, for snapshots sent to
    /// joining peers.
    #[must_use]
    pub fn all_revisions(&self) -> Vec<Arc<Revision>> {
        let histories = self.histories.read();
        histories
            .values()
            .flat_map(|history| history.entries.iter().map(|e| Arc::clone(&e.revision)))
            .collect()
    }

    /// With linked updates, returns the time at which the revision of
    /// `id` at `time` was superseded.
    #[must_use]
    pub fn superseded_at(&self, id: RecordId, time: LogicalTime) -> Option<LogicalTime> {
        let histories = self.histories.read();
        let history = histories.get(&id)?;
        history
            .entries
            .iter()
            .find(|e| e.revision.update_time() <= time)
            .and_then(|e| e.superseded_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_record::FieldType;

    fn fixture() -> (Arc<ChunkDataContainer>, Arc<TableDescriptor>, Arc<LogicalClock>) {
        let descriptor = TableDescriptor::new("container_test")
            .with_field("n", FieldType::Int32)
            .build();
        let clock = Arc::new(LogicalClock::new());
        let container = ChunkDataContainer::new(
            ChunkId::from_u64(7),
            Arc::clone(&descriptor),
            Arc::clone(&clock),
            false,
        );
        (container, descriptor, clock)
    }

    fn revision(descriptor: &Arc<TableDescriptor>, id: u64, n: i32) -> Revision {
        let mut revision = descriptor.template();
        revision.set_id(RecordId::from_u64(id));
        revision.set_chunk_id(ChunkId::from_u64(7));
        revision.set(0, Value::Int32(n)).unwrap();
        revision
    }

    #[test]
    fn test_insert_and_get() {
        let (container, descriptor, _) = fixture();
        let t = LogicalTime::new(10);
        container.insert(t, revision(&descriptor, 1, 42)).unwrap();

        let head = container.get_by_id(RecordId::from_u64(1), t).unwrap();
        assert_eq!(head.get(0).unwrap().as_i32(), Some(42));
        assert_eq!(head.insert_time(), t);
        assert_eq!(head.update_time(), t);

        // Not visible before the insert time.
        assert!(container
            .get_by_id(RecordId::from_u64(1), LogicalTime::new(9))
            .is_none());
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let (container, descriptor, _) = fixture();
        let t = LogicalTime::new(10);
        container.insert(t, revision(&descriptor, 1, 1)).unwrap();
        let err = container
            .insert(LogicalTime::new(11), revision(&descriptor, 1, 2))
            .unwrap_err();
        assert!(matches!(err, SwarmError::Duplicate { .. }));
    }

    #[test]
    fn test_bulk_insert_is_all_or_none() {
        let (container, descriptor, _) = fixture();
        container
            .insert(LogicalTime::new(5), revision(&descriptor, 2, 0))
            .unwrap();

        let batch = vec![revision(&descriptor, 3, 1), revision(&descriptor, 2, 2)];
        let err = container.bulk_insert(LogicalTime::new(6), batch).unwrap_err();
        assert!(matches!(err, SwarmError::Duplicate { .. }));
        // The non-colliding member must not have been applied.
        assert!(container
            .get_by_id(RecordId::from_u64(3), LogicalTime::new(6))
            .is_none());
    }

    #[test]
    fn test_update_supersedes_head() {
        let (container, descriptor, _) = fixture();
        container
            .insert(LogicalTime::new(10), revision(&descriptor, 1, 1))
            .unwrap();
        container
            .update(LogicalTime::new(20), revision(&descriptor, 1, 2))
            .unwrap();

        let at_15 = container
            .get_by_id(RecordId::from_u64(1), LogicalTime::new(15))
            .unwrap();
        assert_eq!(at_15.get(0).unwrap().as_i32(), Some(1));

        let at_25 = container
            .get_by_id(RecordId::from_u64(1), LogicalTime::new(25))
            .unwrap();
        assert_eq!(at_25.get(0).unwrap().as_i32(), Some(2));
        assert_eq!(at_25.insert_time(), LogicalTime::new(10));
    }

    #[test]
    fn test_remove_filters_reads() {
        let (container, descriptor, _) = fixture();
        container
            .insert(LogicalTime::new(10), revision(&descriptor, 1, 1))
            .unwrap();
        container
            .remove(LogicalTime::new(20), revision(&descriptor, 1, 1))
            .unwrap();

        assert!(container
            .get_by_id(RecordId::from_u64(1), LogicalTime::new(25))
            .is_none());
        assert!(container
            .get_by_id(RecordId::from_u64(1), LogicalTime::new(15))
            .is_some());
        assert_eq!(container.num_available_ids(LogicalTime::new(25)), 0);
        assert_eq!(container.num_available_ids(LogicalTime::new(15)), 1);
        // History still exposes the tombstone.
        assert_eq!(container.history(RecordId::from_u64(1)).len(), 2);
    }

    #[test]
    fn test_patch_is_idempotent() {
        let (container, descriptor, _) = fixture();
        let mut revision = revision(&descriptor, 1, 1);
        revision.set_insert_time(LogicalTime::new(10));
        revision.set_update_time(LogicalTime::new(10));
        let revision = Arc::new(revision);

        container.patch(Arc::clone(&revision)).unwrap();
        container.patch(Arc::clone(&revision)).unwrap();
        assert_eq!(container.history(RecordId::from_u64(1)).len(), 1);
    }

    #[test]
    fn test_patch_files_old_revision_in_place() {
        let (container, descriptor, _) = fixture();
        let mut newer = revision(&descriptor, 1, 2);
        newer.set_insert_time(LogicalTime::new(10));
        newer.set_update_time(LogicalTime::new(30));
        container.patch(Arc::new(newer)).unwrap();

        let mut older = revision(&descriptor, 1, 1);
        older.set_insert_time(LogicalTime::new(10));
        older.set_update_time(LogicalTime::new(10));
        container.patch(Arc::new(older)).unwrap();

        let history = container.history(RecordId::from_u64(1));
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].update_time(), LogicalTime::new(30));
        assert_eq!(history[1].update_time(), LogicalTime::new(10));

        // Head-at-time picks the right revision.
        let at_20 = container
            .get_by_id(RecordId::from_u64(1), LogicalTime::new(20))
            .unwrap();
        assert_eq!(at_20.get(0).unwrap().as_i32(), Some(1));
    }

    #[test]
    fn test_patch_absorbs_remote_time() {
        let (container, descriptor, clock) = fixture();
        let mut remote = revision(&descriptor, 1, 1);
        remote.set_insert_time(LogicalTime::new(500));
        remote.set_update_time(LogicalTime::new(500));
        container.patch(Arc::new(remote)).unwrap();
        assert!(clock.sample() > LogicalTime::new(500));
    }

    #[test]
    fn test_find_by_field() {
        let (container, descriptor, _) = fixture();
        let t = LogicalTime::new(10);
        container.insert(t, revision(&descriptor, 1, 5)).unwrap();
        container.insert(t, revision(&descriptor, 2, 5)).unwrap();
        container.insert(t, revision(&descriptor, 3, 6)).unwrap();

        let found = container.find_by_field(Some(0), &Value::Int32(5), t);
        assert_eq!(found.len(), 2);
        assert_eq!(container.count_by_field(Some(0), &Value::Int32(6), t), 1);
    }

    #[test]
    #[should_panic(expected = "unique")]
    fn test_find_unique_with_duplicates_is_fatal() {
        let (container, descriptor, _) = fixture();
        let t = LogicalTime::new(10);
        container.insert(t, revision(&descriptor, 1, 5)).unwrap();
        container.insert(t, revision(&descriptor, 2, 5)).unwrap();
        let _ = container.find_unique(0, &Value::Int32(5), t);
    }

    #[test]
    fn test_dump_matches_available_ids() {
        let (container, descriptor, _) = fixture();
        let t = LogicalTime::new(10);
        container.insert(t, revision(&descriptor, 1, 1)).unwrap();
        container.insert(t, revision(&descriptor, 2, 2)).unwrap();
        container
            .remove(LogicalTime::new(20), revision(&descriptor, 2, 2))
            .unwrap();

        let late = LogicalTime::new(30);
        let dump = container.dump(late);
        assert_eq!(dump.len(), container.num_available_ids(late));
        assert!(dump.contains_key(&RecordId::from_u64(1)));
        assert!(!dump.contains_key(&RecordId::from_u64(2)));
    }

    #[test]
    fn test_commit_times() {
        let (container, descriptor, _) = fixture();
        container
            .insert(LogicalTime::new(10), revision(&descriptor, 1, 1))
            .unwrap();
        container
            .update(LogicalTime::new(20), revision(&descriptor, 1, 2))
            .unwrap();

        let times = container.commit_times(LogicalTime::new(15));
        assert_eq!(times.len(), 1);
        let times = container.commit_times(LogicalTime::new(25));
        assert_eq!(times.len(), 2);
    }

    #[test]
    fn test_linked_updates_record_back_pointer() {
        let descriptor = TableDescriptor::new("linked")
            .with_field("n", FieldType::Int32)
            .build();
        let clock = Arc::new(LogicalClock::new());
        let container = ChunkDataContainer::new(
            ChunkId::from_u64(7),
            Arc::clone(&descriptor),
            clock,
            true,
        );

        let mut first = descriptor.template();
        first.set_id(RecordId::from_u64(1));
        first.set_chunk_id(ChunkId::from_u64(7));
        first.set(0, Value::Int32(1)).unwrap();
        container.insert(LogicalTime::new(10), first).unwrap();

        let mut second = descriptor.template();
        second.set_id(RecordId::from_u64(1));
        second.set_chunk_id(ChunkId::from_u64(7));
        second.set(0, Value::Int32(2)).unwrap();
        container.update(LogicalTime::new(20), second).unwrap();

        assert_eq!(
            container.superseded_at(RecordId::from_u64(1), LogicalTime::new(10)),
            Some(LogicalTime::new(20))
        );
        assert_eq!(
            container.superseded_at(RecordId::from_u64(1), LogicalTime::new(20)),
            None
        );
    }
}
