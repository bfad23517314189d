//! Net tables and the message routing registry.
//!
//! A [`NetTable`] is the registry of a table's active chunks on this
//! peer: it creates chunks, adopts chunks from snapshots and joining
//! handshakes, and routes reads. The [`TableRegistry`] is the
//! process-wide dispatcher wiring the hub's chunk and raft message
//! kinds to the right table and chunk; it is an explicitly passed
//! handle with a process lifecycle, not a global.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use swarm_common::constants::RPC_TIMEOUT_MS;
use swarm_common::{
    ChunkId, LogicalClock, LogicalTime, PeerId, RecordId, StoreConfig, SwarmError,
    SwarmResult,
};
use swarm_net::{Hub, Message};
use swarm_raft::rpc::{
    AppendEntriesRequest, VoteRequest, APPEND_ENTRIES, APPEND_ENTRIES_RESPONSE, VOTE_REQUEST,
    VOTE_RESPONSE,
};
use swarm_record::{snapshot, Revision, TableDescriptor};

use crate::chunk::{
    self, Chunk, ChunkMode, ChunkRequestMetadata, InitRequest, LeaseResponse, LockRequest,
    NewPeerRequest, PatchRequest, UnlockRequest,
};
use crate::net_transaction::NetTableTransaction;

/// Remote record lookup, backed by the discovery ring. External
/// collaborator: the ring itself is out of scope.
pub trait ChunkLookup: Send + Sync {
    /// Fetches the head of `id` at `time` from whichever peer holds it.
    fn fetch(&self, table: &str, id: RecordId, time: LogicalTime) -> Option<Revision>;
}

/// The registry of one table's chunks on this peer.
pub struct NetTable {
    descriptor: Arc<TableDescriptor>,
    mode: ChunkMode,
    hub: Arc<Hub>,
    clock: Arc<LogicalClock>,
    linked_updates: bool,
    heartbeat_period_ms: u64,
    chunks: RwLock<HashMap<ChunkId, Arc<Chunk>>>,
    lookup: Mutex<Option<Arc<dyn ChunkLookup>>>,
}

impl NetTable {
    /// Creates a table registry for this peer.
    #[must_use]
    pub fn new(
        descriptor: Arc<TableDescriptor>,
        mode: ChunkMode,
        hub: Arc<Hub>,
        clock: Arc<LogicalClock>,
        config: &StoreConfig,
    ) -> Arc<Self> {
        Self::with_heartbeat_period_ms(
            descriptor,
            mode,
            hub,
            clock,
            config,
            swarm_common::constants::HEARTBEAT_PERIOD_MS,
        )
    }

    /// Like [`Self::new`] with an explicit consensus heartbeat period
    /// (tests shrink it).
    #[must_use]
    pub fn with_heartbeat_period_ms(
        descriptor: Arc<TableDescriptor>,
        mode: ChunkMode,
        hub: Arc<Hub>,
        clock: Arc<LogicalClock>,
        config: &StoreConfig,
        heartbeat_period_ms: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            descriptor,
            mode,
            hub,
            clock,
            linked_updates: config.cru_linked,
            heartbeat_period_ms,
            chunks: RwLock::new(HashMap::new()),
            lookup: Mutex::new(None),
        })
    }

    /// Returns the table name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    /// Returns the table descriptor.
    #[must_use]
    pub fn descriptor(&self) -> &Arc<TableDescriptor> {
        &self.descriptor
    }

    /// Installs the remote-lookup collaborator.
    pub fn set_lookup(&self, lookup: Arc<dyn ChunkLookup>) {
        *self.lookup.lock() = Some(lookup);
    }

    /// Creates a fresh chunk with a generated id, held by this peer
    /// alone until others participate.
    #[must_use]
    pub fn create_chunk(&self) -> Arc<Chunk> {
        self.new_chunk(ChunkId::generate())
    }

    /// Creates a fresh chunk under a caller-chosen id (snapshot
    /// restore).
    #[must_use]
    pub fn new_chunk(&self, id: ChunkId) -> Arc<Chunk> {
        let chunk = match self.mode {
            ChunkMode::Legacy => Chunk::new_legacy(
                id,
                Arc::clone(&self.descriptor),
                Arc::clone(&self.hub),
                Arc::clone(&self.clock),
                self.linked_updates,
            ),
            ChunkMode::Consensus => Chunk::new_consensus(
                id,
                Arc::clone(&self.descriptor),
                Arc::clone(&self.hub),
                Arc::clone(&self.clock),
                self.linked_updates,
                self.heartbeat_period_ms,
            ),
        };
        self.chunks.write().insert(id, Arc::clone(&chunk));
        chunk
    }

    /// Adopts a chunk from a `chunk.init` snapshot.
    pub fn new_chunk_from_init(
        &self,
        init: &InitRequest,
        sender: &PeerId,
    ) -> SwarmResult<Arc<Chunk>> {
        let chunk = match self.mode {
            ChunkMode::Legacy => Chunk::new_legacy_from_init(
                Arc::clone(&self.descriptor),
                Arc::clone(&self.hub),
                Arc::clone(&self.clock),
                self.linked_updates,
                init,
                sender,
            )?,
            ChunkMode::Consensus => Chunk::new_consensus_from_init(
                Arc::clone(&self.descriptor),
                Arc::clone(&self.hub),
                Arc::clone(&self.clock),
                self.linked_updates,
                self.heartbeat_period_ms,
                init,
            )?,
        };
        self.chunks
            .write()
            .insert(init.metadata.chunk_id, Arc::clone(&chunk));
        Ok(chunk)
    }

    /// Returns an active chunk.
    #[must_use]
    pub fn get_chunk(&self, id: ChunkId) -> Option<Arc<Chunk>> {
        self.chunks.read().get(&id).cloned()
    }

    /// Returns every active chunk.
    #[must_use]
    pub fn active_chunks(&self) -> Vec<Arc<Chunk>> {
        self.chunks.read().values().cloned().collect()
    }

    /// Returns the head of `id` at `time`, searching active chunks
    /// first, then the remote lookup.
    #[must_use]
    pub fn get_by_id(&self, id: RecordId, time: LogicalTime) -> Option<Revision> {
        for chunk in self.active_chunks() {
            if let Some(revision) = chunk.container().get_by_id(id, time) {
                return Some((*revision).clone());
            }
        }
        let lookup = self.lookup.lock().clone();
        lookup.and_then(|lookup| lookup.fetch(self.name(), id, time))
    }

    /// Opens a multi-chunk transaction reading now.
    #[must_use]
    pub fn new_transaction(self: &Arc<Self>) -> NetTableTransaction {
        NetTableTransaction::new(
            Arc::clone(self),
            self.clock.sample(),
            Arc::clone(&self.clock),
        )
    }

    /// Opens a multi-chunk transaction reading at `time`.
    #[must_use]
    pub fn new_transaction_at(self: &Arc<Self>, time: LogicalTime) -> NetTableTransaction {
        NetTableTransaction::new(Arc::clone(self), time, Arc::clone(&self.clock))
    }

    /// Joins an existing chunk hosted by `holder`.
    ///
    /// Legacy holders acknowledge and send the snapshot asynchronously;
    /// consensus holders answer with the snapshot directly (or a leader
    /// hint to follow).
    pub fn join_chunk(&self, chunk_id: ChunkId, holder: &PeerId) -> SwarmResult<Arc<Chunk>> {
        if let Some(chunk) = self.get_chunk(chunk_id) {
            return Ok(chunk);
        }

        let mut target = holder.clone();
        for _ in 0..8 {
            let metadata = ChunkRequestMetadata {
                table: self.name().to_string(),
                chunk_id,
            };
            let response = self.hub.try_request(
                &target,
                Message::impose(chunk::CONNECT, self.hub.self_id().clone(), &metadata),
            )?;

            if response.is_ack() {
                // Consensus holders put the snapshot in the ack.
                if let Ok(init) = response.extract::<InitRequest>() {
                    return self.new_chunk_from_init(&init, response.sender());
                }
                // Legacy: the holder sends chunk.init from a background
                // thread once it owns the write lock.
                let deadline = Instant::now() + Duration::from_millis(RPC_TIMEOUT_MS);
                while Instant::now() < deadline {
                    if let Some(chunk) = self.get_chunk(chunk_id) {
                        return Ok(chunk);
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                return Err(SwarmError::Transport {
                    peer: target,
                    reason: "holder acknowledged but never sent the snapshot".to_string(),
                });
            }

            // Declined: follow the leader hint if one was given.
            match response.extract::<LeaseResponse>() {
                Ok(lease) if lease.leader_hint.is_some() => {
                    target = lease.leader_hint.expect("checked");
                }
                _ => {
                    return Err(SwarmError::LockDeclined { peer: target });
                }
            }
        }
        Err(SwarmError::Transport {
            peer: target,
            reason: "no holder admitted us".to_string(),
        })
    }

    /// Writes the table's live heads at `time` as a snapshot stream.
    pub fn store_snapshot<W: Write>(&self, sink: W, time: LogicalTime) -> SwarmResult<()> {
        let mut revisions = Vec::new();
        for chunk in self.active_chunks() {
            revisions.extend(chunk.container().dump(time).into_values());
        }
        snapshot::write_snapshot(sink, &revisions)
    }

    /// Restores chunks and records from a snapshot stream. Original
    /// revision times are preserved, so time-travel reads keep working
    /// across a restore.
    pub fn restore_snapshot<R: Read>(&self, source: R) -> SwarmResult<()> {
        let grouped = snapshot::read_snapshot_grouped(source, &self.descriptor)?;
        for (chunk_id, revisions) in grouped {
            let chunk = match self.get_chunk(chunk_id) {
                Some(chunk) => chunk,
                None => self.new_chunk(chunk_id),
            };
            for revision in revisions {
                chunk.container().patch(Arc::new(revision))?;
            }
        }
        Ok(())
    }

    /// Stops every chunk's background machinery.
    pub fn shutdown(&self) {
        for chunk in self.active_chunks() {
            chunk.shutdown();
        }
    }
}

/// The process-wide dispatcher from hub message kinds to tables and
/// chunks.
pub struct TableRegistry {
    hub: Arc<Hub>,
    tables: DashMap<String, Arc<NetTable>>,
}

impl TableRegistry {
    /// Creates the registry and wires the chunk and raft handlers into
    /// the hub.
    #[must_use]
    pub fn new(hub: &Arc<Hub>) -> Arc<Self> {
        let registry = Arc::new(Self {
            hub: Arc::clone(hub),
            tables: DashMap::new(),
        });
        registry.register_handlers();
        registry
    }

    /// Registers a table for routing.
    pub fn add_table(&self, table: Arc<NetTable>) {
        self.tables.insert(table.name().to_string(), table);
    }

    /// Returns a registered table.
    #[must_use]
    pub fn get_table(&self, name: &str) -> Option<Arc<NetTable>> {
        self.tables.get(name).map(|entry| Arc::clone(entry.value()))
    }

    fn table_of(&self, name: &str) -> Option<Arc<NetTable>> {
        let table = self.get_table(name);
        if table.is_none() {
            debug!(table = name, "message for unknown table");
        }
        table
    }

    fn chunk_of(&self, metadata: &ChunkRequestMetadata) -> Option<Arc<Chunk>> {
        self.table_of(&metadata.table)?.get_chunk(metadata.chunk_id)
    }

    fn register_handlers(self: &Arc<Self>) {
        self.register(chunk::CONNECT, |registry, message| {
            let metadata: ChunkRequestMetadata = message.extract().ok()?;
            let chunk = registry.chunk_of(&metadata)?;
            Some(chunk.handle_connect(message.sender()))
        });

        self.register(chunk::INIT, |registry, message| {
            let init: InitRequest = message.extract().ok()?;
            let table = registry.table_of(&init.metadata.table)?;
            if table.get_chunk(init.metadata.chunk_id).is_some() {
                // Already participating; a second init is harmless.
                return Some(Message::ack(table.hub.self_id().clone()));
            }
            match table.new_chunk_from_init(&init, message.sender()) {
                Ok(_) => Some(Message::ack(table.hub.self_id().clone())),
                Err(e) => {
                    warn!(error = %e, "init snapshot rejected");
                    None
                }
            }
        });

        self.register(chunk::INSERT, |registry, message| {
            let request: PatchRequest = message.extract().ok()?;
            let chunk = registry.chunk_of(&request.metadata)?;
            Some(chunk.handle_insert(&request, message.sender()))
        });

        self.register(chunk::UPDATE, |registry, message| {
            let request: PatchRequest = message.extract().ok()?;
            let chunk = registry.chunk_of(&request.metadata)?;
            Some(chunk.handle_update(&request, message.sender()))
        });

        self.register(chunk::LOCK, |registry, message| {
            let request: LockRequest = message.extract().ok()?;
            let chunk = registry.chunk_of(&request.metadata)?;
            Some(chunk.handle_lock(&request, message.sender()))
        });

        self.register(chunk::UNLOCK, |registry, message| {
            let request: UnlockRequest = message.extract().ok()?;
            let chunk = registry.chunk_of(&request.metadata)?;
            Some(chunk.handle_unlock(&request, message.sender()))
        });

        self.register(chunk::NEW_PEER, |registry, message| {
            let request: NewPeerRequest = message.extract().ok()?;
            let chunk = registry.chunk_of(&request.metadata)?;
            Some(chunk.handle_new_peer(&request, message.sender()))
        });

        self.register(chunk::LEAVE, |registry, message| {
            let metadata: ChunkRequestMetadata = message.extract().ok()?;
            let chunk = registry.chunk_of(&metadata)?;
            Some(chunk.handle_leave(message.sender()))
        });

        self.register(APPEND_ENTRIES, |registry, message| {
            let request: AppendEntriesRequest = message.extract().ok()?;
            let chunk = registry.chunk_of(&ChunkRequestMetadata {
                table: request.table.clone(),
                chunk_id: request.chunk_id,
            })?;
            let node = chunk.raft_node()?;
            let response = node.handle_append_entries(&request, message.sender());
            Some(Message::impose(
                APPEND_ENTRIES_RESPONSE,
                registry.hub.self_id().clone(),
                &response,
            ))
        });

        self.register(VOTE_REQUEST, |registry, message| {
            let request: VoteRequest = message.extract().ok()?;
            let chunk = registry.chunk_of(&ChunkRequestMetadata {
                table: request.table.clone(),
                chunk_id: request.chunk_id,
            })?;
            let node = chunk.raft_node()?;
            let response = node.handle_vote_request(&request, message.sender());
            Some(Message::impose(
                VOTE_RESPONSE,
                registry.hub.self_id().clone(),
                &response,
            ))
        });
    }

    fn register<F>(self: &Arc<Self>, kind: &str, handler: F)
    where
        F: Fn(&Arc<TableRegistry>, &Message) -> Option<Message> + Send + Sync + 'static,
    {
        // Weak: the hub outlives nothing here, and a strong capture
        // would cycle hub -> handler -> registry -> hub.
        let registry: Weak<TableRegistry> = Arc::downgrade(self);
        let self_peer = self.hub.self_id().clone();
        self.hub.register_handler(kind, move |message| {
            let Some(registry) = registry.upgrade() else {
                return Message::decline(self_peer.clone());
            };
            handler(&registry, message).unwrap_or_else(|| Message::decline(self_peer.clone()))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_net::HubNetwork;
    use swarm_record::{FieldType, Value};

    fn descriptor() -> Arc<TableDescriptor> {
        TableDescriptor::new("table_test")
            .with_field("n", FieldType::Int32)
            .build()
    }

    fn fixture(mode: ChunkMode) -> (Arc<TableRegistry>, Arc<NetTable>) {
        let network = HubNetwork::new();
        let hub = Hub::create(&network, PeerId::new("127.0.0.1:6100"));
        let clock = Arc::new(LogicalClock::new());
        let registry = TableRegistry::new(&hub);
        let table = NetTable::new(
            descriptor(),
            mode,
            hub,
            clock,
            &StoreConfig::new("127.0.0.1:6100"),
        );
        registry.add_table(Arc::clone(&table));
        (registry, table)
    }

    fn revision(table: &NetTable, id: u64, n: i32) -> Revision {
        let mut revision = table.descriptor().template();
        revision.set_id(RecordId::from_u64(id));
        revision.set(0, Value::Int32(n)).unwrap();
        revision
    }

    #[test]
    fn test_create_and_get_chunk() {
        let (_registry, table) = fixture(ChunkMode::Legacy);
        let chunk = table.create_chunk();
        assert!(chunk.id().is_valid());
        assert!(table.get_chunk(chunk.id()).is_some());
        assert_eq!(table.active_chunks().len(), 1);
    }

    #[test]
    fn test_get_by_id_searches_active_chunks() {
        let (_registry, table) = fixture(ChunkMode::Legacy);
        let chunk = table.create_chunk();
        chunk.insert(revision(&table, 1, 42)).unwrap();

        let found = table
            .get_by_id(RecordId::from_u64(1), LogicalTime::new(1000))
            .unwrap();
        assert_eq!(found.get(0).unwrap().as_i32(), Some(42));
        assert!(table
            .get_by_id(RecordId::from_u64(9), LogicalTime::new(1000))
            .is_none());
    }

    #[test]
    fn test_lookup_fallback() {
        struct FixedLookup(Arc<TableDescriptor>);
        impl ChunkLookup for FixedLookup {
            fn fetch(&self, _table: &str, id: RecordId, _time: LogicalTime) -> Option<Revision> {
                let mut revision = self.0.template();
                revision.set_id(id);
                revision.set(0, Value::Int32(77)).ok()?;
                Some(revision)
            }
        }

        let (_registry, table) = fixture(ChunkMode::Legacy);
        table.set_lookup(Arc::new(FixedLookup(Arc::clone(table.descriptor()))));
        let found = table
            .get_by_id(RecordId::from_u64(5), LogicalTime::new(10))
            .unwrap();
        assert_eq!(found.get(0).unwrap().as_i32(), Some(77));
    }

    #[test]
    fn test_multi_chunk_transaction_commit() {
        let (_registry, table) = fixture(ChunkMode::Legacy);
        let first = table.create_chunk();
        let second = table.create_chunk();

        let mut txn = table.new_transaction();
        txn.insert(&first, revision(&table, 1, 1)).unwrap();
        txn.insert(&second, revision(&table, 2, 2)).unwrap();
        txn.commit().unwrap();

        let now = LogicalTime::new(10_000);
        assert_eq!(first.num_items(now) + second.num_items(now), 2);
    }

    #[test]
    fn test_transaction_atomicity_on_conflict() {
        let (_registry, table) = fixture(ChunkMode::Legacy);
        let first = table.create_chunk();
        let second = table.create_chunk();
        second.insert(revision(&table, 2, 0)).unwrap();

        // The second staged insert collides, so nothing may land.
        let mut txn = table.new_transaction();
        txn.insert(&first, revision(&table, 1, 1)).unwrap();
        txn.insert(&second, revision(&table, 2, 2)).unwrap();
        let err = txn.commit().unwrap_err();
        assert!(matches!(err, SwarmError::ConflictRetry { .. }));

        let now = LogicalTime::new(10_000);
        assert_eq!(first.num_items(now), 0);
        assert_eq!(second.num_items(now), 1);
    }

    #[test]
    fn test_snapshot_roundtrip_preserves_chunks() {
        let (_registry, table) = fixture(ChunkMode::Legacy);
        let chunk = table.create_chunk();
        chunk.insert(revision(&table, 1, 5)).unwrap();
        chunk.insert(revision(&table, 2, 6)).unwrap();

        let mut file = Vec::new();
        table.store_snapshot(&mut file, LogicalTime::new(1000)).unwrap();

        let (_registry2, restored) = fixture(ChunkMode::Legacy);
        restored.restore_snapshot(file.as_slice()).unwrap();
        assert_eq!(restored.active_chunks().len(), 1);
        assert_eq!(restored.active_chunks()[0].id(), chunk.id());
        let found = restored
            .get_by_id(RecordId::from_u64(1), LogicalTime::new(1000))
            .unwrap();
        assert_eq!(found.get(0).unwrap().as_i32(), Some(5));
    }

    #[test]
    fn test_restore_accepts_empty_snapshot() {
        let (_registry, table) = fixture(ChunkMode::Legacy);
        table.restore_snapshot(&[] as &[u8]).unwrap();
        assert!(table.active_chunks().is_empty());
    }
}
