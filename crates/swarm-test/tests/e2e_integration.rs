//! End-to-end scenarios across peers, chunks, and both replication
//! modes, driven over the in-process hub network.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use swarm_common::{LogicalTime, PeerId, RecordId, SwarmError};
use swarm_net::HubNetwork;
use swarm_raft::{RaftNode, RaftNodeConfig, Role};
use swarm_record::{Revision, Value};
use swarm_store::{Chunk, ChunkMode};
use swarm_test::{spawn_peer, test_descriptor, TestPeer, TEST_HEARTBEAT_MS};

fn record(peer: &TestPeer, id: u64, field0: i32) -> Revision {
    let mut revision = peer.table.descriptor().template();
    revision.set_id(RecordId::from_u64(id));
    revision.set(0, Value::Int32(field0)).unwrap();
    revision
}

fn wait_until(what: &str, timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("timed out waiting for {}", what);
}

// ----------------------------------------------------------------------
// Scenario 1: single-peer insert and time-travel read.
// ----------------------------------------------------------------------

#[test]
fn single_peer_insert_and_read_at_times() {
    let network = HubNetwork::new();
    let a = spawn_peer(&network, "127.0.0.1:8101", ChunkMode::Legacy);
    let chunk = a.table.create_chunk();

    chunk.insert(record(&a, 0x01, 42)).unwrap();
    let insert_time = chunk.history(RecordId::from_u64(0x01))[0].update_time();

    let at_insert = chunk.dump(insert_time);
    assert_eq!(at_insert.len(), 1);
    assert_eq!(
        at_insert[&RecordId::from_u64(0x01)].get(0).unwrap().as_i32(),
        Some(42)
    );

    let before = LogicalTime::new(insert_time.as_u64() - 1);
    assert!(chunk.dump(before).is_empty());
    assert_eq!(chunk.num_items(before), 0);
    assert_eq!(chunk.num_items(insert_time), 1);
}

// ----------------------------------------------------------------------
// Scenario 2: leader election with three peers.
// ----------------------------------------------------------------------

#[test]
fn leader_election_with_three_peers() {
    let network = HubNetwork::new();
    let addresses = ["127.0.0.1:8201", "127.0.0.1:8202", "127.0.0.1:8203"];
    let peers: Vec<TestPeer> = addresses
        .iter()
        .map(|address| spawn_peer(&network, address, ChunkMode::Consensus))
        .collect();

    // Three raft nodes over one chunk, all starting as followers with
    // an empty log. Node A gets a short heartbeat period so its
    // election timer fires first; B and C would wait seconds.
    let chunk_id = swarm_common::ChunkId::from_u64(0x20);
    let nodes: Vec<Arc<RaftNode>> = peers
        .iter()
        .enumerate()
        .map(|(i, test_peer)| {
            let machine = Arc::new(NullMachine);
            let heartbeat = if i == 0 { TEST_HEARTBEAT_MS } else { 5_000 };
            let node = RaftNode::new(
                RaftNodeConfig::new("records", chunk_id, test_peer.peer.clone())
                    .with_heartbeat_period_ms(heartbeat),
                Arc::clone(&test_peer.hub),
                Arc::clone(&test_peer.clock),
                test_descriptor(),
                machine,
            );
            let others: Vec<PeerId> = peers
                .iter()
                .filter(|other| other.peer != test_peer.peer)
                .map(|other| other.peer.clone())
                .collect();
            node.initialize_from_snapshot(others, Vec::new());
            node
        })
        .collect();

    // Route the raft messages directly to the nodes.
    for (test_peer, node) in peers.iter().zip(&nodes) {
        register_raft_handlers(test_peer, node);
    }
    for node in &nodes {
        node.start();
    }

    wait_until("a leader to emerge", Duration::from_secs(5), || {
        nodes[0].role() == Role::Leader
    });
    let leader = peers[0].peer.clone();
    wait_until("everyone to adopt the leader", Duration::from_secs(5), || {
        nodes
            .iter()
            .all(|node| node.leader() == Some(leader.clone()) && node.term() == 1)
    });

    for node in &nodes {
        node.stop();
    }
}

struct NullMachine;

impl swarm_raft::ChunkStateMachine for NullMachine {
    fn apply_revision(&self, _revision: &Arc<Revision>) {}

    fn snapshot_revisions(&self) -> Vec<Arc<Revision>> {
        Vec::new()
    }
}

fn register_raft_handlers(test_peer: &TestPeer, node: &Arc<RaftNode>) {
    use swarm_net::Message;
    use swarm_raft::rpc::{
        AppendEntriesRequest, VoteRequest, APPEND_ENTRIES, APPEND_ENTRIES_RESPONSE,
        VOTE_REQUEST, VOTE_RESPONSE,
    };

    let append_node = Arc::clone(node);
    let append_self = test_peer.peer.clone();
    test_peer.hub.register_handler(APPEND_ENTRIES, move |message| {
        let request: AppendEntriesRequest = match message.extract() {
            Ok(request) => request,
            Err(_) => return Message::decline(append_self.clone()),
        };
        let response = append_node.handle_append_entries(&request, message.sender());
        Message::impose(APPEND_ENTRIES_RESPONSE, append_self.clone(), &response)
    });

    let vote_node = Arc::clone(node);
    let vote_self = test_peer.peer.clone();
    test_peer.hub.register_handler(VOTE_REQUEST, move |message| {
        let request: VoteRequest = match message.extract() {
            Ok(request) => request,
            Err(_) => return Message::decline(vote_self.clone()),
        };
        let response = vote_node.handle_vote_request(&request, message.sender());
        Message::impose(VOTE_RESPONSE, vote_self.clone(), &response)
    });
}

// ----------------------------------------------------------------------
// Scenario 3: replicated commit over the full consensus stack.
// ----------------------------------------------------------------------

#[test]
fn replicated_commit_reaches_all_replicas() {
    let network = HubNetwork::new();
    let a = spawn_peer(&network, "127.0.0.1:8301", ChunkMode::Consensus);
    let b = spawn_peer(&network, "127.0.0.1:8302", ChunkMode::Consensus);
    let c = spawn_peer(&network, "127.0.0.1:8303", ChunkMode::Consensus);

    let chunk_a = a.table.create_chunk();
    let chunk_b = b.table.join_chunk(chunk_a.id(), &a.peer).unwrap();
    let chunk_c = c.table.join_chunk(chunk_a.id(), &a.peer).unwrap();
    wait_until("membership to settle", Duration::from_secs(5), || {
        chunk_a.num_peers() == 3
    });

    chunk_a.insert(record(&a, 0x02, 7)).unwrap();

    let node_a = Arc::clone(chunk_a.raft_node().unwrap());
    let entry_index = node_a.log().last_index();
    let replicas = [&chunk_b, &chunk_c];
    wait_until("the entry to commit everywhere", Duration::from_secs(5), || {
        replicas.iter().all(|chunk| {
            chunk.raft_node().unwrap().commit_index() >= entry_index
        })
    });

    let late = LogicalTime::new(u64::MAX);
    for chunk in [&chunk_a, &chunk_b, &chunk_c] {
        let found = chunk
            .container()
            .get_by_id(RecordId::from_u64(0x02), late)
            .unwrap();
        assert_eq!(found.get(0).unwrap().as_i32(), Some(7));
    }

    for chunk in [&chunk_a, &chunk_b, &chunk_c] {
        chunk.shutdown();
    }
}

// ----------------------------------------------------------------------
// Scenario 4: conflicting concurrent updates, exactly one commits.
// ----------------------------------------------------------------------

#[test]
fn conflicting_concurrent_updates_one_wins() {
    let network = HubNetwork::new();
    let a = spawn_peer(&network, "127.0.0.1:8401", ChunkMode::Legacy);
    let chunk = a.table.create_chunk();
    chunk.insert(record(&a, 0x03, 1)).unwrap();

    let mut first = a.table.new_transaction();
    let mut second = a.table.new_transaction();

    let mut staged = record(&a, 0x03, 10);
    staged.set_chunk_id(chunk.id());
    first.update(staged).unwrap();

    let mut staged = record(&a, 0x03, 20);
    staged.set_chunk_id(chunk.id());
    second.update(staged).unwrap();

    let results = [first.commit(), second.commit()];
    let successes = results.iter().filter(|result| result.is_ok()).count();
    assert_eq!(successes, 1);
    let failure = results
        .iter()
        .find(|result| result.is_err())
        .unwrap()
        .as_ref()
        .unwrap_err();
    assert!(matches!(failure, SwarmError::ConflictRetry { .. }));

    // The winner's value is the head.
    let head = chunk
        .container()
        .get_by_id(RecordId::from_u64(0x03), LogicalTime::new(u64::MAX))
        .unwrap();
    assert_eq!(head.get(0).unwrap().as_i32(), Some(10));
}

// ----------------------------------------------------------------------
// Scenario 5: simultaneous write locks resolve without deadlock.
// ----------------------------------------------------------------------

#[test]
fn simultaneous_write_locks_resolve_by_address_order() {
    let network = HubNetwork::new();
    let a = spawn_peer(&network, "127.0.0.1:8501", ChunkMode::Legacy);
    let b = spawn_peer(&network, "127.0.0.1:8502", ChunkMode::Legacy);

    let chunk_a = a.table.create_chunk();
    let chunk_b = b.table.join_chunk(chunk_a.id(), &a.peer).unwrap();
    wait_until("the join handshake to finish", Duration::from_secs(5), || {
        chunk_a.num_peers() == 2 && chunk_b.num_peers() == 2
    });

    let contend = |chunk: Arc<Chunk>| {
        thread::spawn(move || {
            for _ in 0..5 {
                chunk.lock().unwrap();
                thread::sleep(Duration::from_millis(2));
                chunk.unlock().unwrap();
            }
        })
    };
    let handle_a = contend(Arc::clone(&chunk_a));
    let handle_b = contend(Arc::clone(&chunk_b));

    // Both contenders must finish; a deadlock would hang the test.
    handle_a.join().unwrap();
    handle_b.join().unwrap();

    // And the lock is usable afterwards.
    chunk_a.lock().unwrap();
    chunk_a.unlock().unwrap();
}

// ----------------------------------------------------------------------
// Scenario 6: replayed entry answered AlreadyPresent, state unchanged.
// ----------------------------------------------------------------------

#[test]
fn replayed_entry_is_already_present_and_idempotent() {
    use swarm_raft::rpc::{
        AppendEntriesRequest, AppendResponseStatus, WireEntry, WirePayload,
    };

    let network = HubNetwork::new();
    let a = spawn_peer(&network, "127.0.0.1:8601", ChunkMode::Consensus);
    let boss = PeerId::new("127.0.0.1:8699");

    // A follower chunk with no started machinery: drive it by hand.
    let chunk = {
        use swarm_store::chunk::{ChunkRequestMetadata, InitRequest};
        let init = InitRequest {
            metadata: ChunkRequestMetadata {
                table: "records".to_string(),
                chunk_id: swarm_common::ChunkId::from_u64(0x60),
            },
            peers: vec![boss.clone()],
            revisions: Vec::new(),
        };
        a.table.new_chunk_from_init(&init, &boss).unwrap()
    };
    let node = Arc::clone(chunk.raft_node().unwrap());

    let mut revision = record(&a, 0x04, 9);
    revision.set_chunk_id(chunk.id());
    revision.set_insert_time(LogicalTime::new(5));
    revision.set_update_time(LogicalTime::new(5));

    let entry = |commit_index| AppendEntriesRequest {
        table: "records".to_string(),
        chunk_id: chunk.id(),
        term: 1,
        prev_log_index: Some(0),
        prev_log_term: Some(0),
        new_entry: Some(WireEntry {
            term: 1,
            sender: boss.clone(),
            serial: 11,
            payload: WirePayload::Insert(revision.serialize().to_vec()),
        }),
        commit_index,
        last_log_index: 1,
        last_log_term: 1,
    };

    // First delivery appends; the leader's next message commits it.
    let response = node.handle_append_entries(&entry(0), &boss);
    assert_eq!(response.response, AppendResponseStatus::Success);
    let response = node.handle_append_entries(&entry(1), &boss);
    assert_eq!(response.response, AppendResponseStatus::AlreadyPresent);
    assert_eq!(node.commit_index(), 1);

    let history_len = chunk.history(RecordId::from_u64(0x04)).len();
    assert_eq!(history_len, 1);

    // A stale replay after commit: still AlreadyPresent, container
    // untouched.
    let response = node.handle_append_entries(&entry(1), &boss);
    assert_eq!(response.response, AppendResponseStatus::AlreadyPresent);
    assert_eq!(chunk.history(RecordId::from_u64(0x04)).len(), history_len);

    chunk.shutdown();
}

// ----------------------------------------------------------------------
// Legacy replication: patch broadcasts reach every replica.
// ----------------------------------------------------------------------

#[test]
fn legacy_broadcast_replication_and_triggers() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let network = HubNetwork::new();
    let a = spawn_peer(&network, "127.0.0.1:8701", ChunkMode::Legacy);
    let b = spawn_peer(&network, "127.0.0.1:8702", ChunkMode::Legacy);

    let chunk_a = a.table.create_chunk();
    let chunk_b = b.table.join_chunk(chunk_a.id(), &a.peer).unwrap();
    wait_until("the join handshake to finish", Duration::from_secs(5), || {
        chunk_a.num_peers() == 2 && chunk_b.num_peers() == 2
    });

    let trigger_hits = Arc::new(AtomicUsize::new(0));
    let hits = Arc::clone(&trigger_hits);
    chunk_b.attach_trigger(move |inserted, _updated| {
        hits.fetch_add(inserted.len(), Ordering::SeqCst);
    });

    let mut txn = a.table.new_transaction();
    txn.insert(&chunk_a, record(&a, 0x05, 50)).unwrap();
    txn.insert(&chunk_a, record(&a, 0x06, 60)).unwrap();
    txn.commit().unwrap();

    let late = LogicalTime::new(u64::MAX);
    wait_until("replication to land on b", Duration::from_secs(5), || {
        chunk_b.container().num_available_ids(late) == 2
    });
    let found = b
        .table
        .get_by_id(RecordId::from_u64(0x05), late)
        .unwrap();
    assert_eq!(found.get(0).unwrap().as_i32(), Some(50));

    // The unlock that ended the commit span fires b's trigger once.
    wait_until("the trigger to fire", Duration::from_secs(5), || {
        trigger_hits.load(Ordering::SeqCst) == 2
    });
}

// ----------------------------------------------------------------------
// Consensus lock lease survives across the log.
// ----------------------------------------------------------------------

#[test]
fn consensus_lock_lease_blocks_second_writer() {
    let network = HubNetwork::new();
    let a = spawn_peer(&network, "127.0.0.1:8801", ChunkMode::Consensus);
    let b = spawn_peer(&network, "127.0.0.1:8802", ChunkMode::Consensus);

    let chunk_a = a.table.create_chunk();
    let chunk_b = b.table.join_chunk(chunk_a.id(), &a.peer).unwrap();
    wait_until("membership to settle", Duration::from_secs(5), || {
        chunk_a.num_peers() == 2 && chunk_b.num_peers() == 2
    });

    chunk_a.lock().unwrap();
    let node_a = Arc::clone(chunk_a.raft_node().unwrap());
    assert!(node_a.is_lock_holder(&a.peer));

    // B's acquisition must not succeed while A holds the lease.
    let contender = Arc::clone(&chunk_b);
    let b_peer = b.peer.clone();
    let handle = thread::spawn(move || {
        contender.lock().unwrap();
        let held = contender.raft_node().unwrap().is_lock_holder(&b_peer);
        contender.unlock().unwrap();
        held
    });

    thread::sleep(Duration::from_millis(20 * TEST_HEARTBEAT_MS));
    assert!(!handle.is_finished(), "b acquired a held lease");

    chunk_a.unlock().unwrap();
    assert!(handle.join().unwrap());

    chunk_a.shutdown();
    chunk_b.shutdown();
}

// ----------------------------------------------------------------------
// Law: logical time is monotone per process.
// ----------------------------------------------------------------------

#[test]
fn logical_time_monotonicity_across_operations() {
    let network = HubNetwork::new();
    let a = spawn_peer(&network, "127.0.0.1:8901", ChunkMode::Legacy);
    let chunk = a.table.create_chunk();

    let mut previous = a.clock.sample();
    for i in 0..20 {
        chunk.insert(record(&a, 100 + i, i as i32)).unwrap();
        let now = a.clock.sample();
        assert!(now > previous);
        previous = now;
    }

    // Every revision carries a distinct, increasing commit time.
    let times = chunk.commit_times(LogicalTime::new(u64::MAX));
    assert_eq!(times.len(), 20);
}
