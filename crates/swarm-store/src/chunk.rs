//! The chunk: unit of replication.
//!
//! A chunk couples its data container with a replication mode:
//!
//! - **Legacy**: mutations happen locally under the distributed
//!   read/write lock and are pushed to every replica as patch
//!   broadcasts that each recipient must acknowledge.
//! - **Consensus**: every mutation, membership change, and write-lock
//!   lease is an entry of the chunk's raft log; replicas apply the
//!   committed prefix.
//!
//! Both modes expose the same surface. Inbound chunk messages are
//! routed here by the table registry; any handler that must take the
//! chunk lock hands the work to a background thread and acknowledges
//! immediately, so the transport worker can never deadlock on a lock
//! its own caller holds.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use swarm_common::constants::{LEASE_RETRY_BACKOFF_MS, LOCK_RETRY_BACKOFF_MS};
use swarm_common::{
    ChunkId, LogicalClock, LogicalTime, PeerId, RecordId, SwarmError, SwarmResult,
};
use swarm_net::{Hub, Message};
use swarm_raft::node::ChunkStateMachine;
use swarm_raft::{LogPayload, RaftNode, RaftNodeConfig};
use swarm_record::{Revision, TableDescriptor};

use crate::container::ChunkDataContainer;
use crate::lock::{DistributedRwLock, LockReply, UnlockAction};
use crate::transaction::ChunkTransaction;

/// Wire token: a peer asks a holder to join the chunk swarm.
pub const CONNECT: &str = "chunk.connect";
/// Wire token: snapshot + peer list for a joining peer.
pub const INIT: &str = "chunk.init";
/// Wire token: patch one inserted revision.
pub const INSERT: &str = "chunk.insert";
/// Wire token: patch one updated revision.
pub const UPDATE: &str = "chunk.update";
/// Wire token: distributed lock request (legacy) / lease request
/// (consensus).
pub const LOCK: &str = "chunk.lock";
/// Wire token: distributed unlock / lease release.
pub const UNLOCK: &str = "chunk.unlock";
/// Wire token: announce an admitted peer to the old swarm.
pub const NEW_PEER: &str = "chunk.new_peer";
/// Wire token: a peer relinquishes the chunk.
pub const LEAVE: &str = "chunk.leave";

/// How long a consensus client waits for its lease entry to apply
/// locally before retrying with a fresh serial.
const LEASE_APPLY_WAIT_MS: u64 = 2000;

/// Bounded retries for redirected consensus submissions.
const SUBMIT_RETRIES: usize = 20;

/// Routing metadata carried by every chunk request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRequestMetadata {
    /// Owning table name.
    pub table: String,
    /// Target chunk.
    pub chunk_id: ChunkId,
}

/// A serialized revision pushed to replicas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchRequest {
    /// Routing metadata.
    pub metadata: ChunkRequestMetadata,
    /// The revision in wire form.
    pub serialized_revision: Vec<u8>,
}

/// Snapshot and peer list for a joining peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitRequest {
    /// Routing metadata.
    pub metadata: ChunkRequestMetadata,
    /// The replica set, sender included.
    pub peers: Vec<PeerId>,
    /// Every revision of the chunk, in wire form.
    pub revisions: Vec<Vec<u8>>,
}

/// Announces a freshly admitted peer to the old swarm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPeerRequest {
    /// Routing metadata.
    pub metadata: ChunkRequestMetadata,
    /// The admitted peer.
    pub new_peer: PeerId,
}

/// Lock / lease request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRequest {
    /// Routing metadata.
    pub metadata: ChunkRequestMetadata,
    /// Consensus request serial; unused by legacy chunks.
    pub serial: u64,
}

/// Unlock / lease release request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnlockRequest {
    /// Routing metadata.
    pub metadata: ChunkRequestMetadata,
    /// Consensus request serial; unused by legacy chunks.
    pub serial: u64,
    /// Committed index of the matching acquisition (consensus).
    pub prior_index: u64,
}

/// Consensus response carrying a committed index, or 0 plus a leader
/// hint for redirection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseResponse {
    /// Committed log index of the request, 0 on failure.
    pub index: u64,
    /// Where to redirect when `index == 0`.
    pub leader_hint: Option<PeerId>,
}

type TriggerFn = Arc<dyn Fn(&BTreeSet<RecordId>, &BTreeSet<RecordId>) + Send + Sync>;

/// Trigger bookkeeping: ids touched by the current remote commit span,
/// fired when the span's lock is released.
#[derive(Default)]
struct Triggers {
    callbacks: Mutex<Vec<TriggerFn>>,
    pending_inserts: Mutex<BTreeSet<RecordId>>,
    pending_updates: Mutex<BTreeSet<RecordId>>,
    /// Serializes trigger execution; held while callbacks run.
    run_lock: Mutex<()>,
}

impl Triggers {
    fn record(&self, container: &ChunkDataContainer, revision: &Revision) {
        // A revision whose id already had history is an update.
        if container.history(revision.id()).len() > 1 {
            self.pending_updates.lock().insert(revision.id());
        } else {
            self.pending_inserts.lock().insert(revision.id());
        }
    }

    fn fire(self: &Arc<Self>) {
        let inserts = std::mem::take(&mut *self.pending_inserts.lock());
        let updates = std::mem::take(&mut *self.pending_updates.lock());
        if inserts.is_empty() && updates.is_empty() {
            return;
        }
        let callbacks: Vec<TriggerFn> = self.callbacks.lock().clone();
        if callbacks.is_empty() {
            return;
        }
        let triggers = Arc::clone(self);
        thread::spawn(move || {
            let _running = triggers.run_lock.lock();
            for callback in callbacks {
                callback(&inserts, &updates);
            }
        });
    }

    /// Blocks until any in-flight trigger run completes.
    fn drain(&self) {
        drop(self.run_lock.lock());
    }
}

/// Adapter feeding committed raft payloads into the container and the
/// trigger bookkeeping.
struct ContainerMachine {
    container: Arc<ChunkDataContainer>,
    triggers: Arc<Triggers>,
}

impl ChunkStateMachine for ContainerMachine {
    fn apply_revision(&self, revision: &Arc<Revision>) {
        if let Err(e) = self.container.patch(Arc::clone(revision)) {
            warn!(error = %e, "dropping unappliable committed revision");
            return;
        }
        self.triggers.record(&self.container, revision);
    }

    fn snapshot_revisions(&self) -> Vec<Arc<Revision>> {
        self.container.all_revisions()
    }

    fn on_lock_released(&self) {
        self.triggers.fire();
    }
}

/// Legacy replication state: the distributed lock plus the replica set.
struct Legacy {
    lock: DistributedRwLock,
    peers: RwLock<BTreeSet<PeerId>>,
    /// Guards `relinquished` against concurrently running handlers.
    leave_lock: RwLock<()>,
    /// Serializes peer admission against lock release fan-out.
    add_peer_mutex: Mutex<()>,
}

/// Consensus-side local write bookkeeping.
#[derive(Debug, Default)]
struct ConsensusWriteState {
    locked: bool,
    depth: u64,
    lock_index: u64,
}

struct Consensus {
    node: Arc<RaftNode>,
    write_state: Mutex<ConsensusWriteState>,
}

/// The replication mode of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkMode {
    /// Distributed-lock-and-broadcast replication.
    Legacy,
    /// Raft-replicated log.
    Consensus,
}

enum ModeState {
    Legacy(Legacy),
    Consensus(Consensus),
}

/// A chunk: the records sharing one `chunk_id`, their container, and
/// the replication machinery keeping the replicas consistent.
pub struct Chunk {
    id: ChunkId,
    descriptor: Arc<TableDescriptor>,
    container: Arc<ChunkDataContainer>,
    hub: Arc<Hub>,
    clock: Arc<LogicalClock>,
    triggers: Arc<Triggers>,
    mode: ModeState,
}

impl Chunk {
    /// Creates a fresh legacy chunk with this peer as sole holder.
    #[must_use]
    pub fn new_legacy(
        id: ChunkId,
        descriptor: Arc<TableDescriptor>,
        hub: Arc<Hub>,
        clock: Arc<LogicalClock>,
        linked_updates: bool,
    ) -> Arc<Self> {
        let container =
            ChunkDataContainer::new(id, Arc::clone(&descriptor), Arc::clone(&clock), linked_updates);
        Arc::new(Self {
            id,
            descriptor,
            container,
            hub,
            clock,
            triggers: Arc::new(Triggers::default()),
            mode: ModeState::Legacy(Legacy {
                lock: DistributedRwLock::new(),
                peers: RwLock::new(BTreeSet::new()),
                leave_lock: RwLock::new(()),
                add_peer_mutex: Mutex::new(()),
            }),
        })
    }

    /// Creates a legacy chunk from a `chunk.init` snapshot. The lock
    /// arrives held by the snapshot's sender.
    pub fn new_legacy_from_init(
        descriptor: Arc<TableDescriptor>,
        hub: Arc<Hub>,
        clock: Arc<LogicalClock>,
        linked_updates: bool,
        init: &InitRequest,
        sender: &PeerId,
    ) -> SwarmResult<Arc<Self>> {
        let chunk = Self::new_legacy(
            init.metadata.chunk_id,
            descriptor,
            hub,
            clock,
            linked_updates,
        );
        chunk.adopt_init(init, sender)?;
        let ModeState::Legacy(legacy) = &chunk.mode else {
            unreachable!("constructed legacy");
        };
        legacy.lock.adopt_remote_writer(sender.clone());
        Ok(chunk)
    }

    /// Creates a fresh consensus chunk, leading a single-replica swarm.
    #[must_use]
    pub fn new_consensus(
        id: ChunkId,
        descriptor: Arc<TableDescriptor>,
        hub: Arc<Hub>,
        clock: Arc<LogicalClock>,
        linked_updates: bool,
        heartbeat_period_ms: u64,
    ) -> Arc<Self> {
        let chunk = Self::consensus_shell(
            id,
            descriptor,
            hub,
            clock,
            linked_updates,
            heartbeat_period_ms,
        );
        let ModeState::Consensus(consensus) = &chunk.mode else {
            unreachable!("constructed consensus");
        };
        consensus.node.start_as_leader();
        chunk
    }

    /// Creates a consensus chunk from a `chunk.init` snapshot and joins
    /// as a follower.
    pub fn new_consensus_from_init(
        descriptor: Arc<TableDescriptor>,
        hub: Arc<Hub>,
        clock: Arc<LogicalClock>,
        linked_updates: bool,
        heartbeat_period_ms: u64,
        init: &InitRequest,
    ) -> SwarmResult<Arc<Self>> {
        let chunk = Self::consensus_shell(
            init.metadata.chunk_id,
            descriptor,
            hub,
            clock,
            linked_updates,
            heartbeat_period_ms,
        );
        let ModeState::Consensus(consensus) = &chunk.mode else {
            unreachable!("constructed consensus");
        };
        let mut revisions = Vec::with_capacity(init.revisions.len());
        for bytes in &init.revisions {
            revisions.push(Revision::parse(bytes, &chunk.descriptor)?);
        }
        consensus.node.initialize_from_snapshot(init.peers.clone(), revisions);
        consensus.node.start();
        Ok(chunk)
    }

    fn consensus_shell(
        id: ChunkId,
        descriptor: Arc<TableDescriptor>,
        hub: Arc<Hub>,
        clock: Arc<LogicalClock>,
        linked_updates: bool,
        heartbeat_period_ms: u64,
    ) -> Arc<Self> {
        let container =
            ChunkDataContainer::new(id, Arc::clone(&descriptor), Arc::clone(&clock), linked_updates);
        let triggers = Arc::new(Triggers::default());
        let machine = Arc::new(ContainerMachine {
            container: Arc::clone(&container),
            triggers: Arc::clone(&triggers),
        });
        let node = RaftNode::new(
            RaftNodeConfig::new(descriptor.name(), id, hub.self_id().clone())
                .with_heartbeat_period_ms(heartbeat_period_ms),
            Arc::clone(&hub),
            Arc::clone(&clock),
            Arc::clone(&descriptor),
            machine as Arc<dyn ChunkStateMachine>,
        );
        Arc::new(Self {
            id,
            descriptor,
            container,
            hub,
            clock,
            triggers,
            mode: ModeState::Consensus(Consensus {
                node,
                write_state: Mutex::new(ConsensusWriteState::default()),
            }),
        })
    }

    fn adopt_init(&self, init: &InitRequest, sender: &PeerId) -> SwarmResult<()> {
        let ModeState::Legacy(legacy) = &self.mode else {
            unreachable!("legacy init adoption");
        };
        {
            let mut peers = legacy.peers.write();
            peers.insert(sender.clone());
            for peer in &init.peers {
                if peer != self.hub.self_id() {
                    peers.insert(peer.clone());
                }
            }
        }
        for bytes in &init.revisions {
            let revision = Revision::parse(bytes, &self.descriptor)?;
            self.container.patch(Arc::new(revision))?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Returns the chunk id.
    #[must_use]
    pub fn id(&self) -> ChunkId {
        self.id
    }

    /// Returns the owning table's name.
    #[must_use]
    pub fn table_name(&self) -> &str {
        self.descriptor.name()
    }

    /// Returns the data container.
    #[must_use]
    pub fn container(&self) -> &Arc<ChunkDataContainer> {
        &self.container
    }

    /// Returns the replication mode.
    #[must_use]
    pub fn mode(&self) -> ChunkMode {
        match &self.mode {
            ModeState::Legacy(_) => ChunkMode::Legacy,
            ModeState::Consensus(_) => ChunkMode::Consensus,
        }
    }

    /// Returns the raft node of a consensus chunk.
    #[must_use]
    pub fn raft_node(&self) -> Option<&Arc<RaftNode>> {
        match &self.mode {
            ModeState::Legacy(_) => None,
            ModeState::Consensus(consensus) => Some(&consensus.node),
        }
    }

    /// Returns the replica-set size, self included.
    #[must_use]
    pub fn num_peers(&self) -> usize {
        match &self.mode {
            ModeState::Legacy(legacy) => legacy.peers.read().len() + 1,
            ModeState::Consensus(consensus) => consensus.node.num_peers(),
        }
    }

    /// Returns the other replicas.
    #[must_use]
    pub fn replica_peers(&self) -> BTreeSet<PeerId> {
        match &self.mode {
            ModeState::Legacy(legacy) => legacy.peers.read().clone(),
            ModeState::Consensus(consensus) => consensus.node.peers(),
        }
    }

    fn self_peer(&self) -> &PeerId {
        self.hub.self_id()
    }

    fn metadata(&self) -> ChunkRequestMetadata {
        ChunkRequestMetadata {
            table: self.descriptor.name().to_string(),
            chunk_id: self.id,
        }
    }

    /// Registers a callback invoked after each remote commit span with
    /// the inserted and updated ids of that span.
    pub fn attach_trigger<F>(&self, callback: F)
    where
        F: Fn(&BTreeSet<RecordId>, &BTreeSet<RecordId>) + Send + Sync + 'static,
    {
        self.triggers.callbacks.lock().push(Arc::new(callback));
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Returns every live record at `time`.
    #[must_use]
    pub fn dump(&self, time: LogicalTime) -> HashMap<RecordId, Arc<Revision>> {
        match &self.mode {
            ModeState::Legacy(legacy) => {
                legacy.lock.read_lock(self.self_peer());
                let items = self.container.dump(time);
                self.legacy_unlock(legacy);
                items
            }
            ModeState::Consensus(_) => self.container.dump(time),
        }
    }

    /// Counts the live records at `time`.
    #[must_use]
    pub fn num_items(&self, time: LogicalTime) -> usize {
        match &self.mode {
            ModeState::Legacy(legacy) => {
                legacy.lock.read_lock(self.self_peer());
                let count = self.container.num_available_ids(time);
                self.legacy_unlock(legacy);
                count
            }
            ModeState::Consensus(_) => self.container.num_available_ids(time),
        }
    }

    /// Returns the serialized size of the live records at `time`.
    #[must_use]
    pub fn items_size_bytes(&self, time: LogicalTime) -> usize {
        self.container.items_size_bytes(time)
    }

    /// Returns one record's history, newest first.
    #[must_use]
    pub fn history(&self, id: RecordId) -> Vec<Arc<Revision>> {
        self.container.history(id)
    }

    /// Returns the distinct commit times present at `time`.
    #[must_use]
    pub fn commit_times(&self, time: LogicalTime) -> BTreeSet<LogicalTime> {
        self.container.commit_times(time)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Inserts a record and replicates it.
    pub fn insert(&self, mut revision: Revision) -> SwarmResult<()> {
        revision.set_chunk_id(self.id);
        match &self.mode {
            ModeState::Legacy(legacy) => {
                // Read lock: keeps the peer set stable during the
                // broadcast without excluding other writers' readers.
                legacy.lock.read_lock(self.self_peer());
                let result = self.legacy_insert_inner(legacy, revision);
                self.legacy_unlock(legacy);
                result
            }
            ModeState::Consensus(consensus) => {
                self.consensus_write_lock(consensus)?;
                let result = self.consensus_insert_inner(consensus, revision);
                self.consensus_unlock(consensus)?;
                result
            }
        }
    }

    fn legacy_insert_inner(&self, legacy: &Legacy, revision: Revision) -> SwarmResult<()> {
        let published = self.container.insert(self.clock.sample(), revision)?;
        self.broadcast_patch(&legacy.peers.read(), INSERT, &published);
        Ok(())
    }

    fn consensus_insert_inner(
        &self,
        consensus: &Consensus,
        mut revision: Revision,
    ) -> SwarmResult<()> {
        let time = self.clock.sample();
        if self.container.get_by_id(revision.id(), time).is_some() {
            return Err(SwarmError::Duplicate { id: revision.id() });
        }
        revision.set_insert_time(time);
        revision.set_update_time(time);
        self.consensus_submit(consensus, LogPayload::Insert(Arc::new(revision)))
            .map(|_| ())
    }

    /// Inserts a batch atomically and replicates it.
    pub fn bulk_insert(&self, revisions: Vec<Revision>) -> SwarmResult<()> {
        match &self.mode {
            ModeState::Legacy(legacy) => {
                legacy.lock.read_lock(self.self_peer());
                let result = self.legacy_bulk_insert_inner(legacy, revisions);
                self.legacy_unlock(legacy);
                result
            }
            ModeState::Consensus(consensus) => {
                self.consensus_write_lock(consensus)?;
                let mut result = Ok(());
                for revision in revisions {
                    let mut revision = revision;
                    revision.set_chunk_id(self.id);
                    result = self.consensus_insert_inner(consensus, revision);
                    if result.is_err() {
                        break;
                    }
                }
                self.consensus_unlock(consensus)?;
                result
            }
        }
    }

    fn legacy_bulk_insert_inner(
        &self,
        legacy: &Legacy,
        mut revisions: Vec<Revision>,
    ) -> SwarmResult<()> {
        for revision in &mut revisions {
            revision.set_chunk_id(self.id);
        }
        let published = self.container.bulk_insert(self.clock.sample(), revisions)?;
        let peers = legacy.peers.read();
        for revision in &published {
            self.broadcast_patch(&peers, INSERT, revision);
        }
        Ok(())
    }

    /// Updates a record to a new head and replicates it.
    pub fn update(&self, mut revision: Revision) -> SwarmResult<()> {
        assert!(
            self.descriptor.is_updatable(),
            "table {} does not support updates",
            self.descriptor.name()
        );
        revision.set_chunk_id(self.id);
        match &self.mode {
            ModeState::Legacy(legacy) => {
                self.legacy_write_lock(legacy);
                let result = self.legacy_update_inner(legacy, revision, false);
                self.legacy_unlock(legacy);
                result
            }
            ModeState::Consensus(consensus) => {
                self.consensus_write_lock(consensus)?;
                let result = self.consensus_update_inner(consensus, revision, false);
                self.consensus_unlock(consensus)?;
                result
            }
        }
    }

    /// Removes a record (tombstone head) and replicates it.
    pub fn remove(&self, mut revision: Revision) -> SwarmResult<()> {
        revision.set_chunk_id(self.id);
        match &self.mode {
            ModeState::Legacy(legacy) => {
                self.legacy_write_lock(legacy);
                let result = self.legacy_update_inner(legacy, revision, true);
                self.legacy_unlock(legacy);
                result
            }
            ModeState::Consensus(consensus) => {
                self.consensus_write_lock(consensus)?;
                let result = self.consensus_update_inner(consensus, revision, true);
                self.consensus_unlock(consensus)?;
                result
            }
        }
    }

    fn legacy_update_inner(
        &self,
        legacy: &Legacy,
        revision: Revision,
        remove: bool,
    ) -> SwarmResult<()> {
        let time = self.clock.sample();
        let published = if remove {
            self.container.remove(time, revision)?
        } else {
            self.container.update(time, revision)?
        };
        self.broadcast_patch(&legacy.peers.read(), UPDATE, &published);
        Ok(())
    }

    fn consensus_update_inner(
        &self,
        consensus: &Consensus,
        mut revision: Revision,
        remove: bool,
    ) -> SwarmResult<()> {
        let time = self.clock.sample();
        let head = self
            .container
            .get_by_id(revision.id(), time)
            .unwrap_or_else(|| panic!("update of unknown record {}", revision.id()));
        revision.set_insert_time(head.insert_time());
        revision.set_update_time(time);
        revision.set_removed(remove);
        let payload = if remove {
            LogPayload::Remove(Arc::new(revision))
        } else {
            LogPayload::Update(Arc::new(revision))
        };
        self.consensus_submit(consensus, payload).map(|_| ())
    }

    /// Requires every replica to acknowledge `message`. A decline or an
    /// unreachable replica after the local mutation already landed
    /// means the replica set has diverged.
    fn undisputable_or_fatal(&self, peers: &BTreeSet<PeerId>, message: &Message, what: &str) {
        if let Err(e) = self.hub.undisputable_broadcast_to(peers, message) {
            panic!(
                "protocol violation: {} of chunk {} not universally acknowledged: {}",
                what, self.id, e
            );
        }
    }

    fn broadcast_patch(&self, peers: &BTreeSet<PeerId>, kind: &str, revision: &Arc<Revision>) {
        if peers.is_empty() {
            return;
        }
        let request = PatchRequest {
            metadata: self.metadata(),
            serialized_revision: revision.serialize().to_vec(),
        };
        self.undisputable_or_fatal(
            peers,
            &Message::impose(kind, self.self_peer().clone(), &request),
            kind,
        );
    }

    // ------------------------------------------------------------------
    // Locking
    // ------------------------------------------------------------------

    /// Acquires the chunk write primitive.
    pub fn lock(&self) -> SwarmResult<()> {
        match &self.mode {
            ModeState::Legacy(legacy) => {
                self.legacy_write_lock(legacy);
                Ok(())
            }
            ModeState::Consensus(consensus) => self.consensus_write_lock(consensus),
        }
    }

    /// Releases the chunk write primitive.
    pub fn unlock(&self) -> SwarmResult<()> {
        match &self.mode {
            ModeState::Legacy(legacy) => {
                self.legacy_unlock(legacy);
                Ok(())
            }
            ModeState::Consensus(consensus) => self.consensus_unlock(consensus),
        }
    }

    fn legacy_write_lock(&self, legacy: &Legacy) {
        if legacy.lock.write_lock_recursive(self.self_peer()) {
            return;
        }
        loop {
            legacy.lock.begin_attempt(self.self_peer());
            // Ascending address order: the lowest-address peer decides
            // ties, so it must be asked first.
            let peers: Vec<PeerId> = legacy.peers.read().iter().cloned().collect();
            let request = Message::impose(
                LOCK,
                self.self_peer().clone(),
                &LockRequest {
                    metadata: self.metadata(),
                    serial: 0,
                },
            );
            let mut declined = false;
            for peer in &peers {
                let response = self.hub.request(peer, request.clone());
                if response.is_decline() {
                    declined = true;
                    break;
                }
                debug!(peer = %self.self_peer(), from = %peer, "got lock ack");
            }
            if declined {
                legacy.lock.abort_attempt();
                thread::sleep(Duration::from_millis(LOCK_RETRY_BACKOFF_MS));
                continue;
            }
            legacy.lock.win_attempt(self.self_peer());
            return;
        }
    }

    fn legacy_unlock(&self, legacy: &Legacy) {
        match legacy.lock.begin_unlock(self.self_peer()) {
            UnlockAction::Done => {}
            UnlockAction::ReleaseRemote => {
                let _admission = legacy.add_peer_mutex.lock();
                let request = Message::impose(
                    UNLOCK,
                    self.self_peer().clone(),
                    &UnlockRequest {
                        metadata: self.metadata(),
                        serial: 0,
                        prior_index: 0,
                    },
                );
                // Release in reverse address order; the local peer
                // unlocks exactly when every strictly-greater-address
                // peer has been released.
                let peers: Vec<PeerId> =
                    legacy.peers.read().iter().rev().cloned().collect();
                let mut self_unlocked = false;
                for peer in &peers {
                    if !self_unlocked && peer < self.self_peer() {
                        legacy.lock.mark_unlocked();
                        self_unlocked = true;
                    }
                    let response = self.hub.request(peer, request.clone());
                    assert!(
                        response.is_ack(),
                        "peer {} disputed an unlock of a lock it granted",
                        peer
                    );
                }
                if !self_unlocked {
                    legacy.lock.mark_unlocked();
                }
            }
        }
    }

    fn consensus_write_lock(&self, consensus: &Consensus) -> SwarmResult<()> {
        let mut write_state = consensus.write_state.lock();
        if write_state.locked {
            write_state.depth += 1;
            return Ok(());
        }
        loop {
            let index = self.consensus_submit(
                consensus,
                LogPayload::LockAcquire {
                    peer: self.self_peer().clone(),
                },
            )?;
            consensus
                .node
                .wait_applied(index, Duration::from_millis(LEASE_APPLY_WAIT_MS));
            if consensus.node.is_lock_holder(self.self_peer()) {
                write_state.locked = true;
                write_state.lock_index = consensus.node.lock_index();
                return Ok(());
            }
            // Someone else holds the lease; try again with a fresh
            // request once it clears.
            thread::sleep(Duration::from_millis(LEASE_RETRY_BACKOFF_MS));
        }
    }

    fn consensus_unlock(&self, consensus: &Consensus) -> SwarmResult<()> {
        let mut write_state = consensus.write_state.lock();
        if !write_state.locked {
            return Ok(());
        }
        if write_state.depth > 0 {
            write_state.depth -= 1;
            return Ok(());
        }
        let prior_index = write_state.lock_index;
        self.consensus_submit(
            consensus,
            LogPayload::LockRelease {
                peer: self.self_peer().clone(),
                prior_index,
            },
        )?;
        write_state.locked = false;
        write_state.lock_index = 0;
        Ok(())
    }

    /// Submits a payload to the chunk's raft log, redirecting to the
    /// leader when this replica is not it.
    fn consensus_submit(&self, consensus: &Consensus, payload: LogPayload) -> SwarmResult<u64> {
        for _ in 0..SUBMIT_RETRIES {
            let serial = consensus.node.next_serial();
            match consensus.node.submit_and_wait(payload.clone(), serial) {
                Ok(index) => return Ok(index),
                Err(SwarmError::NotLeader { leader: Some(leader) })
                    if &leader != self.self_peer() =>
                {
                    match self.forward_to_leader(&leader, &payload)? {
                        Some(index) => {
                            // Wait for our own replica to catch up so
                            // subsequent local reads observe the write.
                            consensus
                                .node
                                .wait_applied(index, Duration::from_millis(LEASE_APPLY_WAIT_MS));
                            return Ok(index);
                        }
                        None => thread::sleep(Duration::from_millis(LEASE_RETRY_BACKOFF_MS)),
                    }
                }
                Err(SwarmError::NotLeader { .. }) => {
                    // Leadership unsettled; wait for an election.
                    thread::sleep(Duration::from_millis(LEASE_RETRY_BACKOFF_MS));
                }
                Err(e) => return Err(e),
            }
        }
        Err(SwarmError::Transport {
            peer: self.self_peer().clone(),
            reason: "no stable leader for chunk submission".to_string(),
        })
    }

    fn forward_to_leader(
        &self,
        leader: &PeerId,
        payload: &LogPayload,
    ) -> SwarmResult<Option<u64>> {
        let message = match payload {
            LogPayload::Insert(revision) => Message::impose(
                INSERT,
                self.self_peer().clone(),
                &PatchRequest {
                    metadata: self.metadata(),
                    serialized_revision: revision.serialize().to_vec(),
                },
            ),
            LogPayload::Update(revision) | LogPayload::Remove(revision) => Message::impose(
                UPDATE,
                self.self_peer().clone(),
                &PatchRequest {
                    metadata: self.metadata(),
                    serialized_revision: revision.serialize().to_vec(),
                },
            ),
            LogPayload::LockAcquire { .. } => Message::impose(
                LOCK,
                self.self_peer().clone(),
                &LockRequest {
                    metadata: self.metadata(),
                    serial: 0,
                },
            ),
            LogPayload::LockRelease { prior_index, .. } => Message::impose(
                UNLOCK,
                self.self_peer().clone(),
                &UnlockRequest {
                    metadata: self.metadata(),
                    serial: 0,
                    prior_index: *prior_index,
                },
            ),
            LogPayload::RemovePeer(_) => Message::impose(
                LEAVE,
                self.self_peer().clone(),
                &self.metadata(),
            ),
            LogPayload::AddPeer(_) | LogPayload::Sentinel => {
                return Err(SwarmError::internal(
                    "membership additions are leader-initiated".to_string(),
                ))
            }
        };
        let response = self.hub.try_request(leader, message)?;
        if response.is_decline() {
            return Ok(None);
        }
        let lease: LeaseResponse = response.extract()?;
        if lease.index == 0 {
            return Ok(None);
        }
        Ok(Some(lease.index))
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Opens a transaction reading at the current time.
    #[must_use]
    pub fn new_transaction(&self) -> ChunkTransaction {
        ChunkTransaction::new(self.clock.sample(), Arc::clone(&self.container))
    }

    /// Opens a transaction reading at `time`, which must be in the
    /// past.
    #[must_use]
    pub fn new_transaction_at(&self, time: LogicalTime) -> ChunkTransaction {
        assert!(time <= self.clock.peek(), "begin time {} is in the future", time);
        ChunkTransaction::new(time, Arc::clone(&self.container))
    }

    /// Validates a transaction against the current chunk heads. Caller
    /// must hold the write primitive.
    pub fn check(&self, transaction: &ChunkTransaction) -> SwarmResult<()> {
        match &self.mode {
            ModeState::Legacy(legacy) => assert!(
                legacy.lock.is_writer(self.self_peer()),
                "transaction check without the write lock"
            ),
            ModeState::Consensus(consensus) => assert!(
                consensus.node.is_lock_holder(self.self_peer()),
                "transaction check without the write lease"
            ),
        }

        let now = self.clock.sample();
        let present = self.container.dump(now);
        for id in transaction.insertions().keys() {
            if present.contains_key(id) {
                warn!(table = self.descriptor.name(), %id, "insert collides with existing record");
                return Err(SwarmError::Duplicate { id: *id });
            }
        }
        for id in transaction.updates().keys() {
            let head_time = present
                .get(id)
                .map(|revision| revision.update_time())
                .unwrap_or(LogicalTime::ZERO);
            if head_time >= transaction.begin_time() {
                return Err(SwarmError::StaleUpdate {
                    id: *id,
                    head_time,
                    begin_time: transaction.begin_time(),
                });
            }
        }
        for condition in transaction.conflict_conditions() {
            // Evaluated at the current sample, not the commit time;
            // see the chunk transaction docs for the implied race.
            if self.container.count_by_field(
                Some(condition.field_index),
                &condition.value,
                self.clock.sample(),
            ) > 0
            {
                return Err(SwarmError::ConflictCondition {
                    field_index: condition.field_index,
                });
            }
        }
        Ok(())
    }

    /// Applies a checked transaction at `commit_time`. Caller holds the
    /// write primitive and has run [`Self::check`].
    ///
    /// # Panics
    ///
    /// Panics when a staged write fails to apply or replicate: once the
    /// check has passed under the write primitive, every staged write
    /// must land, and a failure halfway leaves earlier records already
    /// visible on the replicas.
    pub fn checked_commit(&self, transaction: &ChunkTransaction, commit_time: LogicalTime) {
        match &self.mode {
            ModeState::Legacy(legacy) => {
                let mut insertions: Vec<Revision> =
                    transaction.insertions().values().cloned().collect();
                for revision in &mut insertions {
                    revision.set_chunk_id(self.id);
                }
                let published = self
                    .container
                    .bulk_insert(commit_time, insertions)
                    .unwrap_or_else(|e| {
                        panic!(
                            "protocol violation: checked insert into chunk {} failed: {}",
                            self.id, e
                        )
                    });
                {
                    let peers = legacy.peers.read();
                    for revision in &published {
                        self.broadcast_patch(&peers, INSERT, revision);
                    }
                }
                for staged in transaction.updates().values() {
                    let mut revision = staged.clone();
                    revision.set_chunk_id(self.id);
                    let published = self
                        .container
                        .update(commit_time, revision)
                        .unwrap_or_else(|e| {
                            panic!(
                                "protocol violation: checked update of chunk {} failed: {}",
                                self.id, e
                            )
                        });
                    self.broadcast_patch(&legacy.peers.read(), UPDATE, &published);
                }
            }
            ModeState::Consensus(consensus) => {
                for staged in transaction.insertions().values() {
                    let mut revision = staged.clone();
                    revision.set_chunk_id(self.id);
                    revision.set_insert_time(commit_time);
                    revision.set_update_time(commit_time);
                    if let Err(e) =
                        self.consensus_submit(consensus, LogPayload::Insert(Arc::new(revision)))
                    {
                        panic!(
                            "protocol violation: checked insert into chunk {} failed \
                             mid-application: {}",
                            self.id, e
                        );
                    }
                }
                for staged in transaction.updates().values() {
                    let mut revision = staged.clone();
                    revision.set_chunk_id(self.id);
                    let head = self
                        .container
                        .get_by_id(revision.id(), commit_time)
                        .unwrap_or_else(|| panic!("update of unknown record {}", revision.id()));
                    revision.set_insert_time(head.insert_time());
                    revision.set_update_time(commit_time);
                    if let Err(e) =
                        self.consensus_submit(consensus, LogPayload::Update(Arc::new(revision)))
                    {
                        panic!(
                            "protocol violation: checked update of chunk {} failed \
                             mid-application: {}",
                            self.id, e
                        );
                    }
                }
            }
        }
    }

    /// Locks, checks, commits, and unlocks in one step.
    pub fn commit(&self, transaction: &ChunkTransaction) -> SwarmResult<()> {
        self.lock()?;
        if let Err(e) = self.check(transaction) {
            self.unlock()?;
            return Err(e);
        }
        let commit_time = self.clock.sample();
        self.checked_commit(transaction, commit_time);
        self.unlock()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// Offers participation in this chunk to every discovered hub peer
    /// not yet in the replica set. Returns how many joined.
    pub fn request_participation(self: &Arc<Self>) -> SwarmResult<usize> {
        let candidates: Vec<PeerId> = self
            .hub
            .peers()
            .into_iter()
            .filter(|peer| peer != self.self_peer() && !self.replica_peers().contains(peer))
            .collect();
        if candidates.is_empty() {
            return Ok(0);
        }

        let mut admitted = 0;
        match &self.mode {
            ModeState::Legacy(legacy) => {
                self.legacy_write_lock(legacy);
                for peer in candidates {
                    match self.legacy_add_peer(legacy, &peer) {
                        Ok(()) => admitted += 1,
                        Err(e) => warn!(%peer, error = %e, "peer did not join"),
                    }
                }
                self.legacy_unlock(legacy);
            }
            ModeState::Consensus(consensus) => {
                for peer in candidates {
                    match self.consensus_add_peer(consensus, &peer) {
                        Ok(()) => admitted += 1,
                        Err(e) => warn!(%peer, error = %e, "peer did not join"),
                    }
                }
            }
        }
        Ok(admitted)
    }

    fn init_request(&self) -> InitRequest {
        let mut peers: Vec<PeerId> = self.replica_peers().into_iter().collect();
        peers.push(self.self_peer().clone());
        InitRequest {
            metadata: self.metadata(),
            peers,
            revisions: self
                .container
                .all_revisions()
                .iter()
                .map(|revision| revision.serialize().to_vec())
                .collect(),
        }
    }

    /// Admits `peer` to a legacy chunk. Caller holds the write lock.
    fn legacy_add_peer(&self, legacy: &Legacy, peer: &PeerId) -> SwarmResult<()> {
        let _admission = legacy.add_peer_mutex.lock();
        assert!(
            legacy.lock.is_writer(self.self_peer()),
            "peer admission without the write lock"
        );
        if legacy.peers.read().contains(peer) {
            info!(%peer, "peer already in swarm");
            return Ok(());
        }

        let init = self.init_request();
        let response = self.hub.try_request(
            peer,
            Message::impose(INIT, self.self_peer().clone(), &init),
        )?;
        if !response.is_ack() {
            return Err(SwarmError::internal(format!(
                "peer {} refused the init snapshot",
                peer
            )));
        }

        // One last message to the old swarm announces the new
        // configuration before the newcomer starts handling requests.
        let announcement = NewPeerRequest {
            metadata: self.metadata(),
            new_peer: peer.clone(),
        };
        self.undisputable_or_fatal(
            &legacy.peers.read().clone(),
            &Message::impose(NEW_PEER, self.self_peer().clone(), &announcement),
            NEW_PEER,
        );

        legacy.peers.write().insert(peer.clone());
        Ok(())
    }

    fn consensus_add_peer(&self, consensus: &Consensus, peer: &PeerId) -> SwarmResult<()> {
        if !consensus.node.is_leader() {
            return Err(SwarmError::NotLeader {
                leader: consensus.node.leader(),
            });
        }
        let init = self.init_request();
        let response = self.hub.try_request(
            peer,
            Message::impose(INIT, self.self_peer().clone(), &init),
        )?;
        if !response.is_ack() {
            return Err(SwarmError::internal(format!(
                "peer {} refused the init snapshot",
                peer
            )));
        }
        self.consensus_submit(consensus, LogPayload::AddPeer(peer.clone()))
            .map(|_| ())
    }

    /// Leaves the chunk. Data is not moved: this replica relinquishes
    /// and the remaining replicas carry on.
    pub fn leave(&self) -> SwarmResult<()> {
        match &self.mode {
            ModeState::Legacy(legacy) => {
                self.legacy_write_lock(legacy);
                // Leaving must be atomic with respect to the request
                // handlers; take the leave lock after the write lock so
                // two concurrently leaving peers cannot deadlock.
                {
                    let _leaving = legacy.leave_lock.write();
                    let request = Message::impose(
                        LEAVE,
                        self.self_peer().clone(),
                        &self.metadata(),
                    );
                    self.undisputable_or_fatal(
                        &legacy.peers.read().clone(),
                        &request,
                        LEAVE,
                    );
                    legacy.lock.relinquish();
                }
                self.legacy_unlock(legacy);
                Ok(())
            }
            ModeState::Consensus(consensus) => {
                self.consensus_write_lock(consensus)?;
                self.consensus_submit(
                    consensus,
                    LogPayload::RemovePeer(self.self_peer().clone()),
                )?;
                self.consensus_unlock(consensus)?;
                consensus.node.stop();
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound handlers (dispatched by the table registry)
    // ------------------------------------------------------------------

    /// Handles `chunk.connect`: a peer wants to join.
    pub fn handle_connect(self: &Arc<Self>, sender: &PeerId) -> Message {
        match &self.mode {
            ModeState::Legacy(legacy) => {
                let _guard = legacy.leave_lock.read();
                if legacy.lock.is_relinquished() {
                    return Message::decline(self.self_peer().clone());
                }
                // Admission needs the write lock, which must never be
                // taken on a transport worker: hand off and ack.
                let chunk = Arc::clone(self);
                let peer = sender.clone();
                thread::spawn(move || {
                    let ModeState::Legacy(legacy) = &chunk.mode else {
                        unreachable!("legacy connect handler");
                    };
                    chunk.legacy_write_lock(legacy);
                    if let Err(e) = chunk.legacy_add_peer(legacy, &peer) {
                        warn!(%peer, error = %e, "connect admission failed");
                    }
                    chunk.legacy_unlock(legacy);
                });
                Message::ack(self.self_peer().clone())
            }
            ModeState::Consensus(consensus) => {
                if !consensus.node.is_leader() {
                    return Message::impose(
                        swarm_net::message::DECLINE,
                        self.self_peer().clone(),
                        &LeaseResponse {
                            index: 0,
                            leader_hint: consensus.node.leader(),
                        },
                    );
                }
                let init = self.init_request();
                let chunk = Arc::clone(self);
                let peer = sender.clone();
                thread::spawn(move || {
                    let ModeState::Consensus(consensus) = &chunk.mode else {
                        unreachable!("consensus connect handler");
                    };
                    if let Err(e) =
                        chunk.consensus_submit(consensus, LogPayload::AddPeer(peer.clone()))
                    {
                        warn!(%peer, error = %e, "membership entry failed");
                    }
                });
                Message::impose(swarm_net::message::ACK, self.self_peer().clone(), &init)
            }
        }
    }

    /// Handles `chunk.insert`.
    pub fn handle_insert(&self, request: &PatchRequest, _sender: &PeerId) -> Message {
        let revision = match Revision::parse(&request.serialized_revision, &self.descriptor) {
            Ok(revision) => revision,
            Err(e) => {
                warn!(error = %e, "bad insert payload");
                return Message::decline(self.self_peer().clone());
            }
        };
        match &self.mode {
            ModeState::Legacy(legacy) => {
                let _guard = legacy.leave_lock.read();
                if legacy.lock.is_relinquished() {
                    return Message::decline(self.self_peer().clone());
                }
                // An insert broadcast can only arrive while its sender
                // holds at least a read lock elsewhere; if we believe
                // we are the writer, the swarm state has diverged.
                assert!(
                    !legacy.lock.is_writer(self.self_peer()),
                    "insert broadcast received while holding the write lock"
                );
                let revision = Arc::new(revision);
                if let Err(e) = self.container.patch(Arc::clone(&revision)) {
                    warn!(error = %e, "patch failed");
                    return Message::decline(self.self_peer().clone());
                }
                self.triggers.record(&self.container, &revision);
                Message::ack(self.self_peer().clone())
            }
            ModeState::Consensus(consensus) => {
                self.consensus_ingest(consensus, LogPayload::Insert(Arc::new(revision)))
            }
        }
    }

    /// Handles `chunk.update`.
    pub fn handle_update(&self, request: &PatchRequest, sender: &PeerId) -> Message {
        let revision = match Revision::parse(&request.serialized_revision, &self.descriptor) {
            Ok(revision) => revision,
            Err(e) => {
                warn!(error = %e, "bad update payload");
                return Message::decline(self.self_peer().clone());
            }
        };
        match &self.mode {
            ModeState::Legacy(legacy) => {
                let _guard = legacy.leave_lock.read();
                assert!(
                    legacy.lock.is_writer(sender),
                    "update broadcast from {} which does not hold the write lock",
                    sender
                );
                let revision = Arc::new(revision);
                if let Err(e) = self.container.patch(Arc::clone(&revision)) {
                    warn!(error = %e, "patch failed");
                    return Message::decline(self.self_peer().clone());
                }
                self.triggers.record(&self.container, &revision);
                Message::ack(self.self_peer().clone())
            }
            ModeState::Consensus(consensus) => {
                let payload = if revision.is_removed() {
                    LogPayload::Remove(Arc::new(revision))
                } else {
                    LogPayload::Update(Arc::new(revision))
                };
                self.consensus_ingest(consensus, payload)
            }
        }
    }

    /// Leader-side ingestion of a forwarded consensus write.
    fn consensus_ingest(&self, consensus: &Consensus, payload: LogPayload) -> Message {
        let serial = consensus.node.next_serial();
        match consensus.node.submit_and_wait(payload, serial) {
            Ok(index) => Message::impose(
                swarm_net::message::ACK,
                self.self_peer().clone(),
                &LeaseResponse {
                    index,
                    leader_hint: None,
                },
            ),
            Err(SwarmError::NotLeader { leader }) => Message::impose(
                swarm_net::message::ACK,
                self.self_peer().clone(),
                &LeaseResponse {
                    index: 0,
                    leader_hint: leader,
                },
            ),
            Err(e) => {
                warn!(error = %e, "forwarded write failed");
                Message::decline(self.self_peer().clone())
            }
        }
    }

    /// Handles `chunk.lock`.
    pub fn handle_lock(&self, _request: &LockRequest, sender: &PeerId) -> Message {
        match &self.mode {
            ModeState::Legacy(legacy) => {
                let _guard = legacy.leave_lock.read();
                // Earlier spans' triggers must finish before the next
                // writer gets in.
                self.triggers.drain();
                let lowest = legacy.peers.read().iter().next().cloned();
                match legacy
                    .lock
                    .handle_lock_request(sender, self.self_peer(), lowest.as_ref())
                {
                    LockReply::Ack => Message::ack(self.self_peer().clone()),
                    LockReply::Decline => Message::decline(self.self_peer().clone()),
                }
            }
            ModeState::Consensus(consensus) => self.consensus_ingest(
                consensus,
                LogPayload::LockAcquire {
                    peer: sender.clone(),
                },
            ),
        }
    }

    /// Handles `chunk.unlock`.
    pub fn handle_unlock(&self, request: &UnlockRequest, sender: &PeerId) -> Message {
        match &self.mode {
            ModeState::Legacy(legacy) => {
                let _guard = legacy.leave_lock.read();
                assert!(
                    !legacy.lock.is_relinquished(),
                    "unlock sent to a relinquished replica"
                );
                legacy.lock.handle_unlock_request(sender);
                // The remote commit span just ended.
                self.triggers.fire();
                Message::ack(self.self_peer().clone())
            }
            ModeState::Consensus(consensus) => self.consensus_ingest(
                consensus,
                LogPayload::LockRelease {
                    peer: sender.clone(),
                    prior_index: request.prior_index,
                },
            ),
        }
    }

    /// Handles `chunk.new_peer`.
    pub fn handle_new_peer(&self, request: &NewPeerRequest, sender: &PeerId) -> Message {
        match &self.mode {
            ModeState::Legacy(legacy) => {
                let _guard = legacy.leave_lock.read();
                assert!(
                    legacy.lock.is_writer(sender),
                    "new-peer announcement from {} which does not hold the write lock",
                    sender
                );
                legacy.peers.write().insert(request.new_peer.clone());
                Message::ack(self.self_peer().clone())
            }
            ModeState::Consensus(_) => {
                // Consensus membership travels through the log.
                Message::ack(self.self_peer().clone())
            }
        }
    }

    /// Handles `chunk.leave`.
    pub fn handle_leave(&self, sender: &PeerId) -> Message {
        match &self.mode {
            ModeState::Legacy(legacy) => {
                let _guard = legacy.leave_lock.read();
                assert!(
                    legacy.lock.is_writer(sender),
                    "leave from {} which does not hold the write lock",
                    sender
                );
                legacy.peers.write().remove(sender);
                Message::ack(self.self_peer().clone())
            }
            ModeState::Consensus(consensus) => self.consensus_ingest(
                consensus,
                LogPayload::RemovePeer(sender.clone()),
            ),
        }
    }

    /// Stops background machinery (consensus node threads).
    pub fn shutdown(&self) {
        if let ModeState::Consensus(consensus) = &self.mode {
            consensus.node.stop();
        }
    }
}
