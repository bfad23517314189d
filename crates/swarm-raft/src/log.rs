//! Raft log storage.
//!
//! The chunk log is an in-memory append-only sequence of entries that
//! records every mutation of the chunk: data revisions, membership
//! changes, and write-lock leases.
//!
//! # Log Invariants
//!
//! 1. Indices are dense and start at 1; slot 0 holds a sentinel entry
//!    of term 0, so `entries[i].index == i` always holds.
//! 2. Terms are non-decreasing along the log.
//! 3. The committed prefix is stable: a follower may truncate a
//!    conflicting suffix, but never a committed entry.
//!
//! Access is through an upgradable reader/writer lock: readers inspect
//! indices, the writer path upgrades to append or truncate.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::lock_api::RwLockUpgradableReadGuard;
use parking_lot::RwLock;

use swarm_common::PeerId;
use swarm_record::Revision;

use crate::rpc::AppendResponseStatus;
use crate::{LogIndex, Term};

/// A committed-state change carried by one log entry.
#[derive(Debug, Clone)]
pub enum LogPayload {
    /// The sentinel at index 0 carries no state change.
    Sentinel,
    /// Insert a revision into the container.
    Insert(Arc<Revision>),
    /// Update a record to a new head revision.
    Update(Arc<Revision>),
    /// Remove a record (tombstone revision).
    Remove(Arc<Revision>),
    /// Acquire the chunk write lock.
    LockAcquire {
        /// Requesting peer.
        peer: PeerId,
    },
    /// Release the chunk write lock.
    LockRelease {
        /// Releasing peer.
        peer: PeerId,
        /// Committed index of the matching acquisition.
        prior_index: LogIndex,
    },
    /// Admit a peer to the replica set.
    AddPeer(PeerId),
    /// Evict a peer from the replica set.
    RemovePeer(PeerId),
}

/// One entry of the chunk log.
#[derive(Debug, Clone)]
pub struct ChunkLogEntry {
    /// Position in the log.
    pub index: LogIndex,
    /// Term the entry was created in.
    pub term: Term,
    /// Peer that originated the request.
    pub sender: PeerId,
    /// Sender-assigned request serial.
    pub serial: u64,
    /// The state change.
    pub payload: LogPayload,
    /// Peers known to have replicated this entry (leader-side state).
    pub replicated_peers: BTreeSet<PeerId>,
}

impl ChunkLogEntry {
    /// Returns true if `other` identifies the same request: identity is
    /// `(term, sender, serial)`, never payload bytes.
    #[must_use]
    pub fn same_request(&self, term: Term, sender: &PeerId, serial: u64) -> bool {
        self.term == term && &self.sender == sender && self.serial == serial
    }
}

/// An entry arriving from the leader, already decoded.
#[derive(Debug, Clone)]
pub struct IncomingEntry {
    /// Term the entry was created in.
    pub term: Term,
    /// Peer that originated the request.
    pub sender: PeerId,
    /// Sender-assigned request serial.
    pub serial: u64,
    /// The state change.
    pub payload: LogPayload,
}

/// The in-memory chunk log.
#[derive(Debug)]
pub struct RaftLog {
    entries: RwLock<Vec<ChunkLogEntry>>,
}

impl Default for RaftLog {
    fn default() -> Self {
        Self::new()
    }
}

impl RaftLog {
    /// Creates a log holding only the sentinel entry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(vec![ChunkLogEntry {
                index: 0,
                term: 0,
                sender: PeerId::invalid(),
                serial: 0,
                payload: LogPayload::Sentinel,
                replicated_peers: BTreeSet::new(),
            }]),
        }
    }

    /// Returns the index of the last entry (0 when only the sentinel is
    /// present).
    #[must_use]
    pub fn last_index(&self) -> LogIndex {
        self.entries.read().last().expect("sentinel").index
    }

    /// Returns the term of the last entry.
    #[must_use]
    pub fn last_term(&self) -> Term {
        self.entries.read().last().expect("sentinel").term
    }

    /// Returns `(last_index, last_term)` under one lock acquisition.
    #[must_use]
    pub fn last_info(&self) -> (LogIndex, Term) {
        let entries = self.entries.read();
        let last = entries.last().expect("sentinel");
        (last.index, last.term)
    }

    /// Returns a copy of the entry at `index`.
    #[must_use]
    pub fn get(&self, index: LogIndex) -> Option<ChunkLogEntry> {
        self.entries.read().get(index as usize).cloned()
    }

    /// Returns the number of entries, sentinel excluded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len() - 1
    }

    /// Returns true if only the sentinel is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a fresh leader-side entry, assigning the next index.
    pub fn append_leader(
        &self,
        term: Term,
        sender: PeerId,
        serial: u64,
        payload: LogPayload,
    ) -> LogIndex {
        let mut entries = self.entries.write();
        let index = entries.last().expect("sentinel").index + 1;
        entries.push(ChunkLogEntry {
            index,
            term,
            sender,
            serial,
            payload,
            replicated_peers: BTreeSet::new(),
        });
        index
    }

    /// Records that `peer` replicated the entry at `index`; returns the
    /// resulting replica count.
    pub fn mark_replicated(&self, index: LogIndex, peer: PeerId) -> usize {
        let mut entries = self.entries.write();
        match entries.get_mut(index as usize) {
            Some(entry) => {
                entry.replicated_peers.insert(peer);
                entry.replicated_peers.len()
            }
            None => 0,
        }
    }

    /// Returns how many peers replicated the entry at `index`.
    #[must_use]
    pub fn replication_count(&self, index: LogIndex) -> usize {
        self.entries
            .read()
            .get(index as usize)
            .map_or(0, |e| e.replicated_peers.len())
    }

    /// Returns the entry to send to a follower whose next expected
    /// index is `next_index`, with its predecessor's `(index, term)`.
    #[must_use]
    pub fn entry_for_follower(
        &self,
        next_index: LogIndex,
    ) -> Option<((LogIndex, Term), ChunkLogEntry)> {
        let entries = self.entries.read();
        let entry = entries.get(next_index as usize)?;
        let prev = entries.get(next_index as usize - 1)?;
        Some(((prev.index, prev.term), entry.clone()))
    }

    /// Follower-side append, given the leader's `(prev_index,
    /// prev_term)` and at most one new entry.
    ///
    /// Rules:
    /// 1. no entry: accept (heartbeat);
    /// 2. prev matches the local tail: append;
    /// 3. prev matches an older local entry: answer `AlreadyPresent`
    ///    when the successor is the same request, else truncate the
    ///    conflicting suffix and append;
    /// 4. otherwise `Failed`; the leader will retry one entry earlier.
    ///
    /// # Panics
    ///
    /// Panics if resolving a conflict would truncate a committed entry;
    /// that is a protocol violation.
    pub fn follower_append(
        &self,
        prev_index: Option<LogIndex>,
        prev_term: Option<Term>,
        incoming: Option<IncomingEntry>,
        commit_index: LogIndex,
    ) -> AppendResponseStatus {
        let (Some(prev_index), Some(prev_term), Some(incoming)) =
            (prev_index, prev_term, incoming)
        else {
            return AppendResponseStatus::Success;
        };

        let entries = self.entries.upgradable_read();
        let tail = entries.last().expect("sentinel");

        if prev_index == tail.index && prev_term == tail.term {
            let index = tail.index + 1;
            let mut entries = RwLockUpgradableReadGuard::upgrade(entries);
            entries.push(ChunkLogEntry {
                index,
                term: incoming.term,
                sender: incoming.sender,
                serial: incoming.serial,
                payload: incoming.payload,
                replicated_peers: BTreeSet::new(),
            });
            return AppendResponseStatus::Success;
        }

        if prev_index < tail.index {
            let at_prev = &entries[prev_index as usize];
            if at_prev.term != prev_term {
                return AppendResponseStatus::Failed;
            }
            let successor = &entries[prev_index as usize + 1];
            if successor.same_request(incoming.term, &incoming.sender, incoming.serial) {
                return AppendResponseStatus::AlreadyPresent;
            }
            assert!(
                commit_index < successor.index,
                "protocol violation: conflicting entry {} is already committed \
                 (commit index {}, stored term {}, incoming term {})",
                successor.index,
                commit_index,
                successor.term,
                incoming.term
            );
            let index = prev_index + 1;
            let mut entries = RwLockUpgradableReadGuard::upgrade(entries);
            entries.truncate(index as usize);
            entries.push(ChunkLogEntry {
                index,
                term: incoming.term,
                sender: incoming.sender,
                serial: incoming.serial,
                payload: incoming.payload,
                replicated_peers: BTreeSet::new(),
            });
            return AppendResponseStatus::Success;
        }

        AppendResponseStatus::Failed
    }

    /// Returns true if a candidate log described by `(last_index,
    /// last_term)` is at least as up-to-date as this one, by
    /// `(term, index)` lexicographic comparison.
    #[must_use]
    pub fn is_up_to_date(&self, candidate_last_index: LogIndex, candidate_last_term: Term) -> bool {
        let (last_index, last_term) = self.last_info();
        candidate_last_term > last_term
            || (candidate_last_term == last_term && candidate_last_index >= last_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u16) -> PeerId {
        PeerId::new(format!("10.0.0.{}:1", n))
    }

    fn incoming(term: Term, serial: u64) -> IncomingEntry {
        IncomingEntry {
            term,
            sender: peer(1),
            serial,
            payload: LogPayload::AddPeer(peer(9)),
        }
    }

    #[test]
    fn test_new_log_has_sentinel() {
        let log = RaftLog::new();
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert!(log.is_empty());
        assert!(matches!(log.get(0).unwrap().payload, LogPayload::Sentinel));
    }

    #[test]
    fn test_append_leader_assigns_dense_indices() {
        let log = RaftLog::new();
        assert_eq!(log.append_leader(1, peer(1), 1, LogPayload::AddPeer(peer(2))), 1);
        assert_eq!(log.append_leader(1, peer(1), 2, LogPayload::AddPeer(peer(3))), 2);
        assert_eq!(log.last_info(), (2, 1));
        assert_eq!(log.get(1).unwrap().index, 1);
    }

    #[test]
    fn test_heartbeat_is_success() {
        let log = RaftLog::new();
        assert_eq!(
            log.follower_append(None, None, None, 0),
            AppendResponseStatus::Success
        );
        assert!(log.is_empty());
    }

    #[test]
    fn test_follower_append_at_tail() {
        let log = RaftLog::new();
        let status = log.follower_append(Some(0), Some(0), Some(incoming(1, 1)), 0);
        assert_eq!(status, AppendResponseStatus::Success);
        assert_eq!(log.last_info(), (1, 1));
    }

    #[test]
    fn test_follower_append_gap_fails() {
        let log = RaftLog::new();
        let status = log.follower_append(Some(3), Some(1), Some(incoming(1, 1)), 0);
        assert_eq!(status, AppendResponseStatus::Failed);
    }

    #[test]
    fn test_replay_answers_already_present() {
        let log = RaftLog::new();
        log.follower_append(Some(0), Some(0), Some(incoming(1, 7)), 0);
        log.follower_append(Some(1), Some(1), Some(incoming(1, 8)), 0);

        // Leader re-sends entry 1 with a stale prev.
        let status = log.follower_append(Some(0), Some(0), Some(incoming(1, 7)), 0);
        assert_eq!(status, AppendResponseStatus::AlreadyPresent);
        assert_eq!(log.last_index(), 2);
    }

    #[test]
    fn test_conflict_truncates_uncommitted_suffix() {
        let log = RaftLog::new();
        log.follower_append(Some(0), Some(0), Some(incoming(1, 1)), 0);
        log.follower_append(Some(1), Some(1), Some(incoming(1, 2)), 0);
        log.follower_append(Some(2), Some(1), Some(incoming(1, 3)), 0);

        // New leader replaces everything after index 1.
        let status = log.follower_append(Some(1), Some(1), Some(incoming(2, 9)), 1);
        assert_eq!(status, AppendResponseStatus::Success);
        assert_eq!(log.last_info(), (2, 2));
        assert_eq!(log.get(2).unwrap().serial, 9);
    }

    #[test]
    #[should_panic(expected = "protocol violation")]
    fn test_truncating_committed_entry_is_fatal() {
        let log = RaftLog::new();
        log.follower_append(Some(0), Some(0), Some(incoming(1, 1)), 0);
        log.follower_append(Some(1), Some(1), Some(incoming(1, 2)), 0);
        // Entry 2 is committed; replacing it must crash.
        log.follower_append(Some(1), Some(1), Some(incoming(2, 9)), 2);
    }

    #[test]
    fn test_prev_term_mismatch_fails() {
        let log = RaftLog::new();
        log.follower_append(Some(0), Some(0), Some(incoming(1, 1)), 0);
        log.follower_append(Some(1), Some(1), Some(incoming(1, 2)), 0);
        let status = log.follower_append(Some(1), Some(5), Some(incoming(5, 9)), 0);
        assert_eq!(status, AppendResponseStatus::Failed);
    }

    #[test]
    fn test_mark_replicated_counts_peers() {
        let log = RaftLog::new();
        log.append_leader(1, peer(1), 1, LogPayload::AddPeer(peer(2)));
        assert_eq!(log.mark_replicated(1, peer(2)), 1);
        assert_eq!(log.mark_replicated(1, peer(3)), 2);
        assert_eq!(log.mark_replicated(1, peer(3)), 2); // idempotent
        assert_eq!(log.replication_count(1), 2);
    }

    #[test]
    fn test_is_up_to_date() {
        let log = RaftLog::new();
        assert!(log.is_up_to_date(0, 0));
        log.append_leader(2, peer(1), 1, LogPayload::AddPeer(peer(2)));
        log.append_leader(2, peer(1), 2, LogPayload::AddPeer(peer(3)));

        assert!(!log.is_up_to_date(1, 1)); // older term
        assert!(!log.is_up_to_date(1, 2)); // same term, shorter log
        assert!(log.is_up_to_date(2, 2)); // identical
        assert!(log.is_up_to_date(3, 2)); // longer log
        assert!(log.is_up_to_date(1, 3)); // newer term wins
    }

    #[test]
    fn test_entry_for_follower() {
        let log = RaftLog::new();
        log.append_leader(1, peer(1), 1, LogPayload::AddPeer(peer(2)));
        log.append_leader(1, peer(1), 2, LogPayload::AddPeer(peer(3)));

        let ((prev_index, prev_term), entry) = log.entry_for_follower(2).unwrap();
        assert_eq!((prev_index, prev_term), (1, 1));
        assert_eq!(entry.index, 2);
        assert!(log.entry_for_follower(3).is_none());
    }
}
