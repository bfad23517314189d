//! The multi-chunk transaction coordinator.
//!
//! A net-table transaction routes staged writes into per-chunk
//! transactions and commits them two-phase: acquire every touched
//! chunk's write primitive in ascending chunk-id order, check all,
//! apply all at one commit time, release in reverse order. The
//! ascending lock order makes concurrent multi-chunk commits
//! deadlock-free; the single commit time makes the commit atomic under
//! time-travel reads.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use swarm_common::{ChunkId, LogicalClock, LogicalTime, RecordId, SwarmError, SwarmResult};
use swarm_record::Revision;

use crate::chunk::Chunk;
use crate::table::NetTable;
use crate::transaction::ChunkTransaction;

/// A transaction spanning one or more chunks of a table.
pub struct NetTableTransaction {
    begin_time: LogicalTime,
    clock: Arc<LogicalClock>,
    table: Arc<NetTable>,
    // BTreeMap: iteration order is the lock order.
    chunk_transactions: BTreeMap<ChunkId, (Arc<Chunk>, ChunkTransaction)>,
}

impl NetTableTransaction {
    /// Opens a transaction on `table` reading at `begin_time`.
    #[must_use]
    pub fn new(table: Arc<NetTable>, begin_time: LogicalTime, clock: Arc<LogicalClock>) -> Self {
        Self {
            begin_time,
            clock,
            table,
            chunk_transactions: BTreeMap::new(),
        }
    }

    /// Returns the begin time.
    #[must_use]
    pub fn begin_time(&self) -> LogicalTime {
        self.begin_time
    }

    fn transaction_of(&mut self, chunk: &Arc<Chunk>) -> &mut ChunkTransaction {
        let begin_time = self.begin_time;
        &mut self
            .chunk_transactions
            .entry(chunk.id())
            .or_insert_with(|| {
                let transaction =
                    ChunkTransaction::new(begin_time, Arc::clone(chunk.container()));
                (Arc::clone(chunk), transaction)
            })
            .1
    }

    /// Stages an insertion into `chunk`.
    pub fn insert(&mut self, chunk: &Arc<Chunk>, revision: Revision) -> SwarmResult<()> {
        self.transaction_of(chunk).insert(revision)
    }

    /// Stages an update, routed by the revision's chunk id.
    pub fn update(&mut self, revision: Revision) -> SwarmResult<()> {
        let chunk_id = revision.chunk_id();
        let chunk = self.table.get_chunk(chunk_id).ok_or_else(|| {
            SwarmError::internal(format!("no active chunk {} to update", chunk_id))
        })?;
        self.transaction_of(&chunk).update(revision)
    }

    /// Declares a conflict condition on `chunk`.
    pub fn add_conflict_condition(
        &mut self,
        chunk: &Arc<Chunk>,
        field_index: usize,
        value: swarm_record::Value,
    ) {
        self.transaction_of(chunk)
            .add_conflict_condition(field_index, value);
    }

    /// Returns the staged revision for `id` from any touched chunk, or
    /// the table's head at the begin time.
    #[must_use]
    pub fn get_by_id(&self, id: RecordId) -> Option<Revision> {
        for (_, (_, transaction)) in &self.chunk_transactions {
            if let Some(staged) = transaction.get_from_staged(id) {
                return Some(staged.clone());
            }
        }
        self.table.get_by_id(id, self.begin_time)
    }

    /// Commits all staged writes atomically.
    ///
    /// Conflicts surface as `ConflictRetry`; the caller may re-read and
    /// open a new transaction, but is never retried automatically.
    ///
    /// # Panics
    ///
    /// Panics when a participant fails to apply after every check has
    /// passed: by then earlier participants have already committed, so
    /// no caller can meaningfully recover.
    pub fn commit(self) -> SwarmResult<()> {
        let participants: Vec<&(Arc<Chunk>, ChunkTransaction)> =
            self.chunk_transactions.values().collect();

        // Phase 1: lock in ascending chunk-id order.
        let mut locked = 0;
        for (chunk, _) in &participants {
            if let Err(e) = chunk.lock() {
                Self::unlock_first(&participants, locked);
                return Err(e);
            }
            locked += 1;
        }

        // Phase 2: validate everything before touching anything.
        for (chunk, transaction) in &participants {
            if let Err(e) = chunk.check(transaction) {
                debug!(chunk = %chunk.id(), error = %e, "commit check failed");
                Self::unlock_first(&participants, locked);
                return Err(SwarmError::ConflictRetry {
                    message: e.to_string(),
                });
            }
        }

        // Phase 3: apply at a single commit time. Every participant
        // passed its check under the write primitive, so every staged
        // write must land; `checked_commit` is fatal otherwise.
        let commit_time = self.clock.sample();
        for (chunk, transaction) in &participants {
            chunk.checked_commit(transaction, commit_time);
        }

        // Phase 4: release in reverse order.
        Self::unlock_first(&participants, locked);
        Ok(())
    }

    fn unlock_first(participants: &[&(Arc<Chunk>, ChunkTransaction)], count: usize) {
        for (chunk, _) in participants[..count].iter().rev() {
            if let Err(e) = chunk.unlock() {
                debug!(chunk = %chunk.id(), error = %e, "unlock failed");
            }
        }
    }
}
