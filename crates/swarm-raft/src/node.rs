//! The per-chunk raft node.
//!
//! Thread model, per node:
//!
//! - one *state-manager* thread that watches the election timer as
//!   follower and runs the commit loop as leader;
//! - one *follower-tracker* thread per peer while leader, replicating
//!   at most one entry per AppendEntries message and heartbeating when
//!   idle;
//! - inbound `raft.append_entries` / `raft.vote_request` handlers,
//!   invoked from the hub's connection workers.
//!
//! Lock order, where held together: node state, then log, then commit
//! state, then peer set, then the chunk lock lease. The state mutex is
//! never held across an RPC.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use rand::Rng;
use tracing::{debug, info, warn};

use swarm_common::constants::{
    ELECTION_TIMEOUT_MAX_MS, ELECTION_TIMEOUT_MIN_MS, HEARTBEAT_PERIOD_MS,
    LOST_ELECTION_TIMEOUT_FACTOR,
};
use swarm_common::{ChunkId, LogicalClock, PeerId, SwarmError, SwarmResult};
use swarm_net::{Hub, Message};
use swarm_record::{Revision, TableDescriptor};

use crate::lock::ChunkLockState;
use crate::log::{ChunkLogEntry, IncomingEntry, LogPayload, RaftLog};
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, AppendResponseStatus, VoteRequest,
    VoteResponse, WireEntry, WirePayload, APPEND_ENTRIES, VOTE_REQUEST,
};
use crate::{LogIndex, Term};

/// How long a client waits for its entry to commit before giving up on
/// the current leadership.
const COMMIT_WAIT_MS: u64 = 4 * ELECTION_TIMEOUT_MAX_MS;

/// The state machine a committed revision payload is applied to.
///
/// The chunk's data container implements this; applying is an
/// idempotent patch, so log replay after a snapshot restore is safe.
pub trait ChunkStateMachine: Send + Sync {
    /// Applies one committed revision (insert, update, or remove).
    fn apply_revision(&self, revision: &Arc<Revision>);

    /// Returns the revisions a joining peer needs, newest heads and
    /// history alike.
    fn snapshot_revisions(&self) -> Vec<Arc<Revision>>;

    /// Called after a committed release frees the chunk write lock,
    /// closing one commit span.
    fn on_lock_released(&self) {}
}

/// The role of a raft node. Exactly one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Following a leader.
    Follower,
    /// Running for leader.
    Candidate,
    /// The chunk leader.
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "Follower"),
            Role::Candidate => write!(f, "Candidate"),
            Role::Leader => write!(f, "Leader"),
        }
    }
}

/// Configuration for one raft node.
#[derive(Debug, Clone)]
pub struct RaftNodeConfig {
    /// Owning table name; part of every RPC's routing metadata.
    pub table: String,
    /// The chunk this node replicates.
    pub chunk_id: ChunkId,
    /// This process's peer id.
    pub self_peer: PeerId,
    /// Heartbeat period `H`; election timeouts are drawn from
    /// `[2H, 6H]`.
    pub heartbeat_period_ms: u64,
}

impl RaftNodeConfig {
    /// Creates a config with the default heartbeat period.
    #[must_use]
    pub fn new(table: impl Into<String>, chunk_id: ChunkId, self_peer: PeerId) -> Self {
        Self {
            table: table.into(),
            chunk_id,
            self_peer,
            heartbeat_period_ms: HEARTBEAT_PERIOD_MS,
        }
    }

    /// Overrides the heartbeat period (tests shrink it).
    #[must_use]
    pub fn with_heartbeat_period_ms(mut self, period: u64) -> Self {
        self.heartbeat_period_ms = period;
        self
    }
}

#[derive(Debug)]
struct NodeState {
    role: Role,
    current_term: Term,
    leader_id: Option<PeerId>,
    /// Greatest term this node has voted in or seen requested.
    voted_term: Term,
}

#[derive(Debug)]
struct CommitState {
    commit_index: LogIndex,
}

/// A per-chunk replicated log node.
pub struct RaftNode {
    config: RaftNodeConfig,
    hub: Arc<Hub>,
    clock: Arc<LogicalClock>,
    descriptor: Arc<TableDescriptor>,
    state_machine: Arc<dyn ChunkStateMachine>,

    state: Mutex<NodeState>,
    log: RaftLog,
    commit: Mutex<CommitState>,
    commit_signal: Condvar,
    chunk_lock: Mutex<ChunkLockState>,
    peers: RwLock<BTreeSet<PeerId>>,
    last_heartbeat: Mutex<Instant>,
    election_timeout_ms: AtomicU64,

    trackers_run: AtomicBool,
    exiting: AtomicBool,
    running: AtomicBool,
    relinquished: AtomicBool,
    serial_counter: AtomicU64,

    signal_lock: Mutex<()>,
    new_entries_signal: Condvar,
    entry_replicated_signal: Condvar,

    manager_handle: Mutex<Option<JoinHandle<()>>>,
    tracker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl RaftNode {
    /// Creates a stopped node. Call [`Self::start`] (or
    /// [`Self::start_as_leader`] for a fresh single-replica chunk)
    /// afterwards.
    #[must_use]
    pub fn new(
        config: RaftNodeConfig,
        hub: Arc<Hub>,
        clock: Arc<LogicalClock>,
        descriptor: Arc<TableDescriptor>,
        state_machine: Arc<dyn ChunkStateMachine>,
    ) -> Arc<Self> {
        let node = Arc::new(Self {
            config,
            hub,
            clock,
            descriptor,
            state_machine,
            state: Mutex::new(NodeState {
                role: Role::Follower,
                current_term: 0,
                leader_id: None,
                voted_term: 0,
            }),
            log: RaftLog::new(),
            commit: Mutex::new(CommitState { commit_index: 0 }),
            commit_signal: Condvar::new(),
            chunk_lock: Mutex::new(ChunkLockState::new()),
            peers: RwLock::new(BTreeSet::new()),
            last_heartbeat: Mutex::new(Instant::now()),
            election_timeout_ms: AtomicU64::new(0),
            trackers_run: AtomicBool::new(false),
            exiting: AtomicBool::new(false),
            running: AtomicBool::new(false),
            relinquished: AtomicBool::new(false),
            serial_counter: AtomicU64::new(0),
            signal_lock: Mutex::new(()),
            new_entries_signal: Condvar::new(),
            entry_replicated_signal: Condvar::new(),
            manager_handle: Mutex::new(None),
            tracker_handles: Mutex::new(Vec::new()),
        });
        node.election_timeout_ms
            .store(node.random_election_timeout(), Ordering::SeqCst);
        node
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Returns this node's peer id.
    #[must_use]
    pub fn self_peer(&self) -> &PeerId {
        &self.config.self_peer
    }

    /// Returns the chunk this node replicates.
    #[must_use]
    pub fn chunk_id(&self) -> ChunkId {
        self.config.chunk_id
    }

    /// Returns the current role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.state.lock().role
    }

    /// Returns true if this node is the chunk leader.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    /// Returns the current term.
    #[must_use]
    pub fn term(&self) -> Term {
        self.state.lock().current_term
    }

    /// Returns the known leader, if any.
    #[must_use]
    pub fn leader(&self) -> Option<PeerId> {
        self.state.lock().leader_id.clone()
    }

    /// Returns the commit index.
    #[must_use]
    pub fn commit_index(&self) -> LogIndex {
        self.commit.lock().commit_index
    }

    /// Returns the log.
    #[must_use]
    pub fn log(&self) -> &RaftLog {
        &self.log
    }

    /// Returns the replica set, self excluded.
    #[must_use]
    pub fn peers(&self) -> BTreeSet<PeerId> {
        self.peers.read().clone()
    }

    /// Returns the replica-set size, self included.
    #[must_use]
    pub fn num_peers(&self) -> usize {
        self.peers.read().len() + 1
    }

    /// Returns true if the node's threads are running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.exiting.load(Ordering::SeqCst)
    }

    /// Returns true if this node has relinquished the chunk.
    #[must_use]
    pub fn is_relinquished(&self) -> bool {
        self.relinquished.load(Ordering::SeqCst)
    }

    /// Returns true if `peer` holds the replicated chunk write lock.
    #[must_use]
    pub fn is_lock_holder(&self, peer: &PeerId) -> bool {
        self.chunk_lock.lock().is_lock_holder(peer)
    }

    /// Returns the committed acquisition index of the current lock
    /// holder, or 0.
    #[must_use]
    pub fn lock_index(&self) -> LogIndex {
        self.chunk_lock.lock().lock_index()
    }

    /// Draws a fresh client-request serial.
    #[must_use]
    pub fn next_serial(&self) -> u64 {
        self.serial_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.config.heartbeat_period_ms)
    }

    fn random_election_timeout(&self) -> u64 {
        let scale = self.config.heartbeat_period_ms as f64 / HEARTBEAT_PERIOD_MS as f64;
        let min = (ELECTION_TIMEOUT_MIN_MS as f64 * scale) as u64;
        let max = (ELECTION_TIMEOUT_MAX_MS as f64 * scale) as u64;
        rand::thread_rng().gen_range(min..=max.max(min + 1))
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Starts the state-manager thread as a follower.
    pub fn start(self: &Arc<Self>) {
        let node = Arc::clone(self);
        let handle = thread::spawn(move || node.state_manager());
        *self.manager_handle.lock() = Some(handle);
        self.running.store(true, Ordering::SeqCst);
    }

    /// Starts as the leader of a fresh chunk with no other replicas.
    pub fn start_as_leader(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            state.role = Role::Leader;
            state.current_term = 1;
            state.leader_id = Some(self.config.self_peer.clone());
        }
        self.start();
    }

    /// Seeds peers and data from a `chunk.init` snapshot before
    /// [`Self::start`]. The leader re-replicates its log afterwards;
    /// applying revisions is idempotent, so the overlap is harmless.
    pub fn initialize_from_snapshot(&self, peers: Vec<PeerId>, revisions: Vec<Revision>) {
        {
            let mut set = self.peers.write();
            for peer in peers {
                if peer != self.config.self_peer {
                    set.insert(peer);
                }
            }
        }
        for revision in revisions {
            let revision = Arc::new(revision);
            self.clock.merge(revision.update_time());
            self.state_machine.apply_revision(&revision);
        }
    }

    /// Stops the node and joins its threads.
    pub fn stop(&self) {
        self.exiting.store(true, Ordering::SeqCst);
        self.trackers_run.store(false, Ordering::SeqCst);
        self.new_entries_signal.notify_all();
        self.entry_replicated_signal.notify_all();
        self.commit_signal.notify_all();
        if let Some(handle) = self.manager_handle.lock().take() {
            handle.join().ok();
        }
        self.running.store(false, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------
    // State-manager thread
    // ------------------------------------------------------------------

    fn state_manager(self: Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        let mut election_due = false;

        while !self.exiting.load(Ordering::SeqCst) {
            if election_due {
                election_due = false;
                self.conduct_election();
            }

            match self.role() {
                Role::Follower | Role::Candidate => {
                    let age = self.last_heartbeat.lock().elapsed();
                    let timeout =
                        Duration::from_millis(self.election_timeout_ms.load(Ordering::SeqCst));
                    if age >= timeout && !self.is_relinquished() {
                        debug!(
                            peer = %self.config.self_peer,
                            chunk = %self.config.chunk_id,
                            "heartbeat timed out"
                        );
                        election_due = true;
                    } else {
                        thread::sleep(Duration::from_millis(
                            (timeout.saturating_sub(age).as_millis() as u64).min(20),
                        ));
                    }
                }
                Role::Leader => self.run_leader_session(),
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    fn run_leader_session(self: &Arc<Self>) {
        self.trackers_run.store(true, Ordering::SeqCst);
        let term = self.term();
        for peer in self.peers.read().iter().cloned().collect::<Vec<_>>() {
            self.spawn_tracker(peer, term);
        }

        loop {
            self.leader_commit_replicated_entries();
            if !self.trackers_run.load(Ordering::SeqCst) {
                break;
            }
            let mut guard = self.signal_lock.lock();
            self.entry_replicated_signal
                .wait_for(&mut guard, self.heartbeat_period());
        }

        info!(
            peer = %self.config.self_peer,
            chunk = %self.config.chunk_id,
            "leadership session over, joining trackers"
        );
        let handles: Vec<_> = self.tracker_handles.lock().drain(..).collect();
        for handle in handles {
            handle.join().ok();
        }
    }

    fn conduct_election(self: &Arc<Self>) {
        let term = {
            let mut state = self.state.lock();
            state.role = Role::Candidate;
            state.current_term = state.current_term.max(state.voted_term) + 1;
            state.leader_id = None;
            state.current_term
        };
        let (last_log_index, last_log_term) = self.log.last_info();
        let commit_index = self.commit_index();
        let peers: Vec<PeerId> = self.peers.read().iter().cloned().collect();

        info!(
            peer = %self.config.self_peer,
            chunk = %self.config.chunk_id,
            term,
            "election candidate"
        );

        let votes: Vec<JoinHandle<bool>> = peers
            .iter()
            .cloned()
            .map(|peer| {
                let node = Arc::clone(self);
                thread::spawn(move || {
                    node.send_vote_request(&peer, term, last_log_index, last_log_term, commit_index)
                })
            })
            .collect();
        let grants = votes
            .into_iter()
            .map(|handle| handle.join())
            .filter(|result| matches!(result, Ok(true)))
            .count();

        let cluster_size = peers.len() + 1;
        {
            let mut state = self.state.lock();
            if state.role == Role::Candidate && 2 * (grants + 1) > cluster_size {
                state.role = Role::Leader;
                state.leader_id = Some(self.config.self_peer.clone());
                self.election_timeout_ms
                    .store(self.random_election_timeout(), Ordering::SeqCst);
                info!(
                    peer = %self.config.self_peer,
                    chunk = %self.config.chunk_id,
                    term = state.current_term,
                    votes = grants + 1,
                    "elected leader"
                );
            } else if state.role == Role::Candidate {
                state.role = Role::Follower;
                state.leader_id = None;
                // Lost the election, likely to a fresher log. Back off
                // so the winners are not starved by repeat candidacies.
                self.election_timeout_ms.store(
                    LOST_ELECTION_TIMEOUT_FACTOR * self.random_election_timeout(),
                    Ordering::SeqCst,
                );
            }
        }
        *self.last_heartbeat.lock() = Instant::now();
    }

    fn send_vote_request(
        &self,
        peer: &PeerId,
        term: Term,
        last_log_index: LogIndex,
        last_log_term: Term,
        commit_index: LogIndex,
    ) -> bool {
        let request = VoteRequest {
            table: self.config.table.clone(),
            chunk_id: self.config.chunk_id,
            term,
            last_log_index,
            last_log_term,
            commit_index,
        };
        let message = Message::impose(VOTE_REQUEST, self.config.self_peer.clone(), &request);
        match self.hub.try_request(peer, message) {
            Ok(response) => response
                .extract::<VoteResponse>()
                .map(|vote| vote.vote)
                .unwrap_or(false),
            Err(e) => {
                debug!(%peer, error = %e, "vote request failed");
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Follower trackers (leader side)
    // ------------------------------------------------------------------

    fn spawn_tracker(self: &Arc<Self>, peer: PeerId, term: Term) {
        let node = Arc::clone(self);
        let handle = thread::spawn(move || node.follower_tracker(&peer, term));
        self.tracker_handles.lock().push(handle);
    }

    fn follower_tracker(self: &Arc<Self>, peer: &PeerId, term: Term) {
        let mut next_index = self.commit_index() + 1;

        while self.trackers_run.load(Ordering::SeqCst) {
            let mut append_success = false;
            while !append_success && self.trackers_run.load(Ordering::SeqCst) {
                let commit_index = self.commit_index();
                let (last_log_index, last_log_term) = self.log.last_info();
                let slot = self.log.entry_for_follower(next_index);
                let sending_heartbeat = slot.is_none();

                let request = match slot {
                    None => AppendEntriesRequest {
                        table: self.config.table.clone(),
                        chunk_id: self.config.chunk_id,
                        term,
                        prev_log_index: None,
                        prev_log_term: None,
                        new_entry: None,
                        commit_index,
                        last_log_index,
                        last_log_term,
                    },
                    Some(((prev_index, prev_term), entry)) => AppendEntriesRequest {
                        table: self.config.table.clone(),
                        chunk_id: self.config.chunk_id,
                        term,
                        prev_log_index: Some(prev_index),
                        prev_log_term: Some(prev_term),
                        new_entry: Some(self.entry_to_wire(&entry)),
                        commit_index,
                        last_log_index,
                        last_log_term,
                    },
                };

                let message =
                    Message::impose(APPEND_ENTRIES, self.config.self_peer.clone(), &request);
                let response = match self
                    .hub
                    .try_request(peer, message)
                    .and_then(|m| m.extract::<AppendEntriesResponse>())
                {
                    Ok(response) => response,
                    Err(e) => {
                        debug!(%peer, error = %e, "append entries failed");
                        thread::sleep(self.heartbeat_period());
                        continue;
                    }
                };

                match response.response {
                    AppendResponseStatus::Success | AppendResponseStatus::AlreadyPresent => {
                        if !sending_heartbeat {
                            self.log.mark_replicated(next_index, peer.clone());
                            next_index += 1;
                            self.entry_replicated_signal.notify_all();
                        }
                        append_success = true;
                    }
                    AppendResponseStatus::Rejected | AppendResponseStatus::Failed => {
                        // Conflict: retry one entry earlier.
                        if next_index > 1 {
                            next_index -= 1;
                        }
                        assert!(
                            response.commit_index < next_index
                                || response.response == AppendResponseStatus::Rejected,
                            "protocol violation: conflicting entry already committed on {} \
                             (peer commit {}, peer last log {}/{}, leader next index {})",
                            peer,
                            response.commit_index,
                            response.last_log_index,
                            response.last_log_term,
                            next_index,
                        );
                        if response.response == AppendResponseStatus::Rejected {
                            // The peer follows someone else; our own
                            // step-down arrives via their leader.
                            thread::sleep(self.heartbeat_period());
                        }
                    }
                }
            }

            if self.trackers_run.load(Ordering::SeqCst) {
                let mut guard = self.signal_lock.lock();
                if self.log.last_index() < next_index {
                    self.new_entries_signal
                        .wait_for(&mut guard, self.heartbeat_period());
                }
            }
        }
    }

    fn leader_commit_replicated_entries(self: &Arc<Self>) {
        loop {
            let next = self.commit_index() + 1;
            let Some(entry) = self.log.get(next) else {
                return;
            };
            let peer_count = self.peers.read().len();
            let replicated = entry.replicated_peers.len();
            assert!(
                replicated <= peer_count,
                "protocol violation: replication count {} above peer count {} at {} index {}",
                replicated,
                peer_count,
                self.config.self_peer,
                next
            );
            if peer_count == 0 || 2 * replicated > peer_count {
                self.advance_commit_to(next);
            } else {
                return;
            }
        }
    }

    // ------------------------------------------------------------------
    // Commit & apply
    // ------------------------------------------------------------------

    fn advance_commit_to(self: &Arc<Self>, target: LogIndex) {
        let target = target.min(self.log.last_index());
        let mut advanced = false;
        {
            let mut commit = self.commit.lock();
            while commit.commit_index < target {
                let next = commit.commit_index + 1;
                let Some(entry) = self.log.get(next) else {
                    break;
                };
                commit.commit_index = next;
                self.apply_payload(&entry);
                advanced = true;
            }
        }
        if advanced {
            self.commit_signal.notify_all();
        }
    }

    fn apply_payload(self: &Arc<Self>, entry: &ChunkLogEntry) {
        match &entry.payload {
            LogPayload::Sentinel => {}
            LogPayload::Insert(revision)
            | LogPayload::Update(revision)
            | LogPayload::Remove(revision) => {
                self.clock.merge(revision.update_time());
                self.state_machine.apply_revision(revision);
            }
            LogPayload::LockAcquire { peer } => {
                self.chunk_lock
                    .lock()
                    .apply_acquire(entry.index, peer.clone(), entry.serial);
            }
            LogPayload::LockRelease { peer, prior_index } => {
                let released = self.chunk_lock.lock().apply_release(peer, *prior_index);
                if released {
                    self.state_machine.on_lock_released();
                }
            }
            LogPayload::AddPeer(peer) => {
                if peer != &self.config.self_peer {
                    let inserted = self.peers.write().insert(peer.clone());
                    if inserted && self.trackers_run.load(Ordering::SeqCst) {
                        let term = entry.term;
                        self.spawn_tracker(peer.clone(), term);
                    }
                }
            }
            LogPayload::RemovePeer(peer) => {
                if peer == &self.config.self_peer {
                    info!(
                        peer = %self.config.self_peer,
                        chunk = %self.config.chunk_id,
                        "relinquishing chunk"
                    );
                    self.relinquished.store(true, Ordering::SeqCst);
                } else {
                    self.peers.write().remove(peer);
                }
            }
        }
    }

    /// Blocks until the local commit index reaches `index`.
    pub fn wait_applied(&self, index: LogIndex, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut commit = self.commit.lock();
        while commit.commit_index < index {
            if self
                .commit_signal
                .wait_until(&mut commit, deadline)
                .timed_out()
            {
                return false;
            }
        }
        true
    }

    /// Returns true if the entry at `index` is committed and still the
    /// request identified by `serial` from this peer.
    #[must_use]
    pub fn is_entry_committed(&self, index: LogIndex, serial: u64, sender: &PeerId) -> bool {
        if self.commit_index() < index {
            return false;
        }
        self.log
            .get(index)
            .is_some_and(|entry| entry.sender == *sender && entry.serial == serial)
    }

    // ------------------------------------------------------------------
    // Client surface
    // ------------------------------------------------------------------

    /// Appends a payload as leader and waits for it to commit.
    ///
    /// Returns the committed index. `NotLeader` carries the last known
    /// leader for redirection. A leadership change mid-wait also comes
    /// back as `NotLeader`; the caller retries with a fresh serial.
    pub fn submit_and_wait(
        self: &Arc<Self>,
        payload: LogPayload,
        serial: u64,
    ) -> SwarmResult<LogIndex> {
        let term = {
            let state = self.state.lock();
            if state.role != Role::Leader {
                return Err(SwarmError::NotLeader {
                    leader: state.leader_id.clone(),
                });
            }
            state.current_term
        };

        let index = self
            .log
            .append_leader(term, self.config.self_peer.clone(), serial, payload);
        self.new_entries_signal.notify_all();
        self.entry_replicated_signal.notify_all();

        if self.wait_applied(index, Duration::from_millis(COMMIT_WAIT_MS))
            && self.is_entry_committed(index, serial, &self.config.self_peer)
        {
            Ok(index)
        } else {
            warn!(
                peer = %self.config.self_peer,
                chunk = %self.config.chunk_id,
                index,
                "entry did not commit under this leadership"
            );
            Err(SwarmError::NotLeader {
                leader: self.leader(),
            })
        }
    }

    // ------------------------------------------------------------------
    // Inbound handlers
    // ------------------------------------------------------------------

    /// Handles a `raft.vote_request`.
    pub fn handle_vote_request(&self, request: &VoteRequest, sender: &PeerId) -> VoteResponse {
        let (last_log_index, last_log_term) = self.log.last_info();
        let candidate_log_newer = request.last_log_term > last_log_term
            || (request.last_log_term == last_log_term
                && request.last_log_index >= last_log_index);

        let granted = {
            let mut state = self.state.lock();
            state.voted_term = state.voted_term.max(request.term);
            // Strict rule: only a strictly newer term with an
            // up-to-date log earns a vote.
            let grant = request.term > state.current_term
                && candidate_log_newer
                && !self.is_relinquished();
            if grant {
                state.current_term = request.term;
                state.leader_id = None;
                if state.role == Role::Leader {
                    self.trackers_run.store(false, Ordering::SeqCst);
                    self.entry_replicated_signal.notify_all();
                }
                state.role = Role::Follower;
                info!(
                    peer = %self.config.self_peer,
                    chunk = %self.config.chunk_id,
                    candidate = %sender,
                    term = request.term,
                    "voting"
                );
            } else {
                debug!(
                    peer = %self.config.self_peer,
                    candidate = %sender,
                    term = request.term,
                    candidate_log_newer,
                    "declining vote"
                );
            }
            grant
        };

        *self.last_heartbeat.lock() = Instant::now();
        self.election_timeout_ms
            .store(self.random_election_timeout(), Ordering::SeqCst);

        if granted {
            VoteResponse::grant(last_log_index, last_log_term)
        } else {
            VoteResponse::deny(last_log_index, last_log_term)
        }
    }

    /// Handles a `raft.append_entries` (replication or heartbeat).
    ///
    /// # Panics
    ///
    /// Panics when a second leader of the current term is discovered;
    /// that is a protocol violation.
    pub fn handle_append_entries(
        self: &Arc<Self>,
        request: &AppendEntriesRequest,
        sender: &PeerId,
    ) -> AppendEntriesResponse {
        if self.is_relinquished() {
            let (last_log_index, last_log_term) = self.log.last_info();
            return AppendEntriesResponse {
                term: self.term(),
                response: AppendResponseStatus::Rejected,
                last_log_index,
                last_log_term,
                commit_index: self.commit_index(),
            };
        }
        let mut state = self.state.lock();
        let (tail_index, tail_term) = self.log.last_info();
        let sender_log_newer = request.last_log_term > tail_term
            || (request.last_log_term == tail_term && request.last_log_index >= tail_index);
        let sender_changed = state.leader_id.as_ref() != Some(sender)
            || request.term != state.current_term;

        if sender_changed {
            let adopt = request.term > state.current_term
                || (request.term == state.current_term && state.leader_id.is_none())
                || (request.term < state.current_term
                    && state.leader_id.is_none()
                    && sender_log_newer);
            if adopt {
                state.current_term = request.term;
                state.leader_id = Some(sender.clone());
                if state.role == Role::Leader || state.role == Role::Candidate {
                    state.role = Role::Follower;
                    self.trackers_run.store(false, Ordering::SeqCst);
                    self.entry_replicated_signal.notify_all();
                }
                *self.last_heartbeat.lock() = Instant::now();
            } else if state.role == Role::Follower
                && request.term == state.current_term
                && state.current_term > 0
                && state.leader_id.is_some()
            {
                panic!(
                    "protocol violation: {} found two leaders in term {}: {:?} and {}",
                    self.config.self_peer, state.current_term, state.leader_id, sender
                );
            } else {
                let commit_index = self.commit_index();
                return AppendEntriesResponse {
                    term: state.current_term,
                    response: AppendResponseStatus::Rejected,
                    last_log_index: tail_index,
                    last_log_term: tail_term,
                    commit_index,
                };
            }
        } else {
            *self.last_heartbeat.lock() = Instant::now();
        }
        let current_term = state.current_term;

        let incoming = match &request.new_entry {
            None => None,
            Some(wire) => match self.wire_to_incoming(wire) {
                Ok(incoming) => Some(incoming),
                Err(e) => {
                    warn!(error = %e, "undecodable entry payload");
                    let commit_index = self.commit_index();
                    return AppendEntriesResponse {
                        term: current_term,
                        response: AppendResponseStatus::Failed,
                        last_log_index: tail_index,
                        last_log_term: tail_term,
                        commit_index,
                    };
                }
            },
        };

        let status = self.log.follower_append(
            request.prev_log_index,
            request.prev_log_term,
            incoming,
            self.commit_index(),
        );

        if status == AppendResponseStatus::Success {
            self.advance_commit_to(request.commit_index);
        }
        drop(state);

        let (last_log_index, last_log_term) = self.log.last_info();
        AppendEntriesResponse {
            term: current_term,
            response: status,
            last_log_index,
            last_log_term,
            commit_index: self.commit_index(),
        }
    }

    // ------------------------------------------------------------------
    // Wire conversion
    // ------------------------------------------------------------------

    fn entry_to_wire(&self, entry: &ChunkLogEntry) -> WireEntry {
        let payload = match &entry.payload {
            LogPayload::Sentinel => {
                unreachable!("the sentinel entry is never replicated")
            }
            LogPayload::Insert(revision) => WirePayload::Insert(revision.serialize().to_vec()),
            LogPayload::Update(revision) => WirePayload::Update(revision.serialize().to_vec()),
            LogPayload::Remove(revision) => WirePayload::Remove(revision.serialize().to_vec()),
            LogPayload::LockAcquire { peer } => WirePayload::LockAcquire { peer: peer.clone() },
            LogPayload::LockRelease { peer, prior_index } => WirePayload::LockRelease {
                peer: peer.clone(),
                prior_index: *prior_index,
            },
            LogPayload::AddPeer(peer) => WirePayload::AddPeer(peer.clone()),
            LogPayload::RemovePeer(peer) => WirePayload::RemovePeer(peer.clone()),
        };
        WireEntry {
            term: entry.term,
            sender: entry.sender.clone(),
            serial: entry.serial,
            payload,
        }
    }

    fn wire_to_incoming(&self, wire: &WireEntry) -> SwarmResult<IncomingEntry> {
        let payload = match &wire.payload {
            WirePayload::Insert(bytes) => {
                LogPayload::Insert(Arc::new(Revision::parse(bytes, &self.descriptor)?))
            }
            WirePayload::Update(bytes) => {
                LogPayload::Update(Arc::new(Revision::parse(bytes, &self.descriptor)?))
            }
            WirePayload::Remove(bytes) => {
                LogPayload::Remove(Arc::new(Revision::parse(bytes, &self.descriptor)?))
            }
            WirePayload::LockAcquire { peer } => LogPayload::LockAcquire { peer: peer.clone() },
            WirePayload::LockRelease { peer, prior_index } => LogPayload::LockRelease {
                peer: peer.clone(),
                prior_index: *prior_index,
            },
            WirePayload::AddPeer(peer) => LogPayload::AddPeer(peer.clone()),
            WirePayload::RemovePeer(peer) => LogPayload::RemovePeer(peer.clone()),
        };
        Ok(IncomingEntry {
            term: wire.term,
            sender: wire.sender.clone(),
            serial: wire.serial,
            payload,
        })
    }
}

impl Drop for RaftNode {
    fn drop(&mut self) {
        self.exiting.store(true, Ordering::SeqCst);
        self.trackers_run.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use swarm_net::HubNetwork;
    use swarm_record::{FieldType, Value};

    #[derive(Default)]
    struct RecordingMachine {
        applied: PlMutex<Vec<Arc<Revision>>>,
    }

    impl ChunkStateMachine for RecordingMachine {
        fn apply_revision(&self, revision: &Arc<Revision>) {
            self.applied.lock().push(Arc::clone(revision));
        }

        fn snapshot_revisions(&self) -> Vec<Arc<Revision>> {
            self.applied.lock().clone()
        }
    }

    fn descriptor() -> Arc<TableDescriptor> {
        TableDescriptor::new("raft_test")
            .with_field("n", FieldType::Int32)
            .build()
    }

    fn make_node(
        network: &Arc<HubNetwork>,
        address: &str,
    ) -> (Arc<RaftNode>, Arc<RecordingMachine>) {
        let peer = PeerId::new(address);
        let hub = Hub::create(network, peer.clone());
        let machine = Arc::new(RecordingMachine::default());
        let config = RaftNodeConfig::new("raft_test", ChunkId::from_u64(1), peer)
            .with_heartbeat_period_ms(10);
        let node = RaftNode::new(
            config,
            hub,
            Arc::new(LogicalClock::new()),
            descriptor(),
            Arc::clone(&machine) as Arc<dyn ChunkStateMachine>,
        );
        (node, machine)
    }

    fn revision(n: i32) -> Arc<Revision> {
        let mut revision = descriptor().template();
        revision.set_id(swarm_common::RecordId::from_u64(n as u64));
        revision.set_chunk_id(ChunkId::from_u64(1));
        revision.set_insert_time(swarm_common::LogicalTime::new(1));
        revision.set_update_time(swarm_common::LogicalTime::new(1));
        revision.set(0, Value::Int32(n)).unwrap();
        Arc::new(revision)
    }

    #[test]
    fn test_single_node_becomes_leader_by_election() {
        let network = HubNetwork::new();
        let (node, _) = make_node(&network, "127.0.0.1:7001");
        node.start();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !node.is_leader() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(node.is_leader());
        assert_eq!(node.leader(), Some(PeerId::new("127.0.0.1:7001")));
        node.stop();
    }

    #[test]
    fn test_submit_on_follower_fails() {
        let network = HubNetwork::new();
        let (node, _) = make_node(&network, "127.0.0.1:7002");
        let serial = node.next_serial();
        let result = node.submit_and_wait(LogPayload::Insert(revision(1)), serial);
        assert!(matches!(result, Err(SwarmError::NotLeader { .. })));
    }

    #[test]
    fn test_single_node_commit_applies_to_state_machine() {
        let network = HubNetwork::new();
        let (node, machine) = make_node(&network, "127.0.0.1:7003");
        node.start_as_leader();

        let serial = node.next_serial();
        let index = node
            .submit_and_wait(LogPayload::Insert(revision(5)), serial)
            .unwrap();
        assert_eq!(index, 1);
        assert!(node.commit_index() >= 1);
        assert_eq!(machine.applied.lock().len(), 1);
        node.stop();
    }

    #[test]
    fn test_lock_lease_roundtrip() {
        let network = HubNetwork::new();
        let (node, _) = make_node(&network, "127.0.0.1:7004");
        node.start_as_leader();
        let me = node.self_peer().clone();

        let serial = node.next_serial();
        let acquire_index = node
            .submit_and_wait(LogPayload::LockAcquire { peer: me.clone() }, serial)
            .unwrap();
        assert!(node.is_lock_holder(&me));
        assert_eq!(node.lock_index(), acquire_index);

        let serial = node.next_serial();
        node.submit_and_wait(
            LogPayload::LockRelease {
                peer: me.clone(),
                prior_index: acquire_index,
            },
            serial,
        )
        .unwrap();
        assert!(!node.is_lock_holder(&me));
        node.stop();
    }

    #[test]
    fn test_heartbeat_from_unknown_leader_is_adopted() {
        let network = HubNetwork::new();
        let (node, _) = make_node(&network, "127.0.0.1:7005");
        let boss = PeerId::new("127.0.0.1:7006");

        let request = AppendEntriesRequest {
            table: "raft_test".into(),
            chunk_id: ChunkId::from_u64(1),
            term: 3,
            prev_log_index: None,
            prev_log_term: None,
            new_entry: None,
            commit_index: 0,
            last_log_index: 0,
            last_log_term: 0,
        };
        let response = node.handle_append_entries(&request, &boss);
        assert_eq!(response.response, AppendResponseStatus::Success);
        assert_eq!(node.term(), 3);
        assert_eq!(node.leader(), Some(boss));
    }

    #[test]
    fn test_stale_sender_rejected() {
        let network = HubNetwork::new();
        let (node, _) = make_node(&network, "127.0.0.1:7007");
        let current = PeerId::new("127.0.0.1:7008");
        let stale = PeerId::new("127.0.0.1:7009");

        let heartbeat = |term| AppendEntriesRequest {
            table: "raft_test".into(),
            chunk_id: ChunkId::from_u64(1),
            term,
            prev_log_index: None,
            prev_log_term: None,
            new_entry: None,
            commit_index: 0,
            last_log_index: 0,
            last_log_term: 0,
        };

        node.handle_append_entries(&heartbeat(5), &current);
        let response = node.handle_append_entries(&heartbeat(3), &stale);
        assert_eq!(response.response, AppendResponseStatus::Rejected);
        assert_eq!(response.term, 5);
    }

    #[test]
    fn test_vote_granted_only_for_strictly_newer_term() {
        let network = HubNetwork::new();
        let (node, _) = make_node(&network, "127.0.0.1:7010");
        let candidate = PeerId::new("127.0.0.1:7011");

        let request = |term| VoteRequest {
            table: "raft_test".into(),
            chunk_id: ChunkId::from_u64(1),
            term,
            last_log_index: 0,
            last_log_term: 0,
            commit_index: 0,
        };

        assert!(node.handle_vote_request(&request(1), &candidate).vote);
        assert_eq!(node.term(), 1);
        // Same term again: no second vote.
        assert!(!node.handle_vote_request(&request(1), &candidate).vote);
        assert!(node.handle_vote_request(&request(2), &candidate).vote);
    }

    #[test]
    fn test_vote_denied_for_stale_log() {
        let network = HubNetwork::new();
        let (node, _) = make_node(&network, "127.0.0.1:7012");
        node.log()
            .append_leader(2, node.self_peer().clone(), 1, LogPayload::AddPeer(
                PeerId::new("127.0.0.1:9999"),
            ));

        let request = VoteRequest {
            table: "raft_test".into(),
            chunk_id: ChunkId::from_u64(1),
            term: 5,
            last_log_index: 0,
            last_log_term: 1,
            commit_index: 0,
        };
        let response = node.handle_vote_request(&request, &PeerId::new("127.0.0.1:7013"));
        assert!(!response.vote);
        assert_eq!(response.previous_log_index, 1);
    }

    #[test]
    fn test_commit_via_heartbeat() {
        let network = HubNetwork::new();
        let (node, machine) = make_node(&network, "127.0.0.1:7014");
        let boss = PeerId::new("127.0.0.1:7015");

        let entry = AppendEntriesRequest {
            table: "raft_test".into(),
            chunk_id: ChunkId::from_u64(1),
            term: 1,
            prev_log_index: Some(0),
            prev_log_term: Some(0),
            new_entry: Some(WireEntry {
                term: 1,
                sender: boss.clone(),
                serial: 1,
                payload: WirePayload::Insert(revision(9).serialize().to_vec()),
            }),
            commit_index: 0,
            last_log_index: 0,
            last_log_term: 0,
        };
        let response = node.handle_append_entries(&entry, &boss);
        assert_eq!(response.response, AppendResponseStatus::Success);
        assert_eq!(node.commit_index(), 0);
        assert!(machine.applied.lock().is_empty());

        // The next heartbeat exposes the leader's commit index.
        let heartbeat = AppendEntriesRequest {
            table: "raft_test".into(),
            chunk_id: ChunkId::from_u64(1),
            term: 1,
            prev_log_index: None,
            prev_log_term: None,
            new_entry: None,
            commit_index: 1,
            last_log_index: 1,
            last_log_term: 1,
        };
        node.handle_append_entries(&heartbeat, &boss);
        assert_eq!(node.commit_index(), 1);
        assert_eq!(machine.applied.lock().len(), 1);
    }
}
