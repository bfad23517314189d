//! Raft RPC message types.
//!
//! Four messages cross the wire per chunk:
//!
//! ```text
//! Leader Election:
//!   Candidate ──raft.vote_request──▶ Peer
//!   Candidate ◀──raft.vote_response── Peer
//!
//! Log Replication:
//!   Leader ──raft.append_entries──▶ Follower
//!   Leader ◀──raft.append_entries_response── Follower
//! ```
//!
//! An AppendEntries message carries at most one new entry; without one
//! it is a heartbeat. Every request names its table and chunk so the
//! receiving process can route it to the right raft node.

use serde::{Deserialize, Serialize};

use swarm_common::{ChunkId, PeerId};

use crate::{LogIndex, Term};

/// Wire token of the AppendEntries request.
pub const APPEND_ENTRIES: &str = "raft.append_entries";
/// Wire token of the AppendEntries response.
pub const APPEND_ENTRIES_RESPONSE: &str = "raft.append_entries_response";
/// Wire token of the vote request.
pub const VOTE_REQUEST: &str = "raft.vote_request";
/// Wire token of the vote response.
pub const VOTE_RESPONSE: &str = "raft.vote_response";

/// A log payload in its wire form. Revisions travel as their own wire
/// encoding, identical to snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WirePayload {
    /// Insert a revision.
    Insert(Vec<u8>),
    /// Update a record to a new head revision.
    Update(Vec<u8>),
    /// Remove a record (tombstone revision).
    Remove(Vec<u8>),
    /// Acquire the chunk write lock. The request serial rides on the
    /// enclosing [`WireEntry`].
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

/// One log entry in its wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEntry {
    /// Term the entry was created in.
    pub term: Term,
    /// Peer that originated the request.
    pub sender: PeerId,
    /// Sender-assigned request serial; identifies the entry together
    /// with `(term, sender)`.
    pub serial: u64,
    /// The payload.
    pub payload: WirePayload,
}

/// AppendEntries request. Without `new_entry` it is a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Owning table, for routing.
    pub table: String,
    /// Owning chunk, for routing.
    pub chunk_id: ChunkId,
    /// Leader's term.
    pub term: Term,
    /// Index of the entry preceding `new_entry`; present iff
    /// `new_entry` is.
    pub prev_log_index: Option<LogIndex>,
    /// Term of the entry preceding `new_entry`.
    pub prev_log_term: Option<Term>,
    /// The one new entry, absent in heartbeats.
    pub new_entry: Option<WireEntry>,
    /// Leader's commit index.
    pub commit_index: LogIndex,
    /// Leader's last log index.
    pub last_log_index: LogIndex,
    /// Leader's last log term.
    pub last_log_term: Term,
}

impl AppendEntriesRequest {
    /// Returns true if this is a heartbeat.
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.new_entry.is_none()
    }
}

/// Follower verdict on an AppendEntries request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppendResponseStatus {
    /// Entry appended (or heartbeat accepted).
    Success,
    /// The entry is already in the log at that position.
    AlreadyPresent,
    /// The responder follows a different current leader.
    Rejected,
    /// Log mismatch at the given position; leader should retry with an
    /// older entry.
    Failed,
}

/// AppendEntries response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Responder's term.
    pub term: Term,
    /// The verdict.
    pub response: AppendResponseStatus,
    /// Responder's last log index.
    pub last_log_index: LogIndex,
    /// Responder's last log term.
    pub last_log_term: Term,
    /// Responder's commit index.
    pub commit_index: LogIndex,
}

/// Vote request sent by a candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    /// Owning table, for routing.
    pub table: String,
    /// Owning chunk, for routing.
    pub chunk_id: ChunkId,
    /// Candidate's term.
    pub term: Term,
    /// Index of the candidate's last log entry.
    pub last_log_index: LogIndex,
    /// Term of the candidate's last log entry.
    pub last_log_term: Term,
    /// Candidate's commit index.
    pub commit_index: LogIndex,
}

/// Vote response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    /// True iff the vote was granted.
    pub vote: bool,
    /// Responder's last log index, for diagnostics.
    pub previous_log_index: LogIndex,
    /// Responder's last log term, for diagnostics.
    pub previous_log_term: Term,
}

impl VoteResponse {
    /// Creates a granting response.
    #[must_use]
    pub fn grant(last_log_index: LogIndex, last_log_term: Term) -> Self {
        Self {
            vote: true,
            previous_log_index: last_log_index,
            previous_log_term: last_log_term,
        }
    }

    /// Creates a denying response.
    #[must_use]
    pub fn deny(last_log_index: LogIndex, last_log_term: Term) -> Self {
        Self {
            vote: false,
            previous_log_index: last_log_index,
            previous_log_term: last_log_term,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_detection() {
        let request = AppendEntriesRequest {
            table: "t".into(),
            chunk_id: ChunkId::from_u64(1),
            term: 3,
            prev_log_index: None,
            prev_log_term: None,
            new_entry: None,
            commit_index: 5,
            last_log_index: 7,
            last_log_term: 3,
        };
        assert!(request.is_heartbeat());
    }

    #[test]
    fn test_vote_response_constructors() {
        assert!(VoteResponse::grant(3, 1).vote);
        assert!(!VoteResponse::deny(3, 1).vote);
    }

    #[test]
    fn test_payload_bincode_roundtrip() {
        let payload = WirePayload::LockRelease {
            peer: PeerId::new("10.0.0.1:1"),
            prior_index: 4,
        };
        let bytes = bincode::serialize(&payload).unwrap();
        let decoded: WirePayload = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, payload);
    }
}
