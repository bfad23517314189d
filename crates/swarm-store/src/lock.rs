//! The per-chunk distributed read/write lock.
//!
//! This is the write primitive of legacy chunks and of the peer-join
//! handshake. The lock itself is a state machine over
//! `Unlocked / ReadLocked / Attempting / WriteLocked`; the RPC fan-out
//! that makes it distributed lives in the chunk, which drives the
//! transitions through the step methods here.
//!
//! Deadlock avoidance rests on peer order: lock requests go out in
//! ascending address order, releases in descending order, and the peer
//! with the lowest address breaks ties between simultaneous attempts.
//! The local peer flips to `Unlocked` exactly when every
//! strictly-greater-address peer has been released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

use swarm_common::PeerId;

/// The lock state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    /// Nobody holds the lock.
    Unlocked,
    /// Held by local readers.
    ReadLocked {
        /// Number of active readers.
        n_readers: usize,
    },
    /// The local peer is collecting remote acks for a write lock.
    Attempting,
    /// Write-locked.
    WriteLocked {
        /// The writing peer.
        holder: PeerId,
        /// The writing thread, when the holder is local.
        thread: Option<ThreadId>,
        /// Write recursion depth.
        depth: usize,
    },
}

/// Decision on a remote peer's lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockReply {
    /// Grant the lock.
    Ack,
    /// Refuse; the requester backs off and retries.
    Decline,
}

/// What the caller of `begin_unlock` must do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockAction {
    /// Fully handled locally.
    Done,
    /// The write lock is fully released locally; issue remote releases
    /// in reverse address order, flipping the local state via
    /// `mark_unlocked` before the first strictly-smaller-address peer.
    ReleaseRemote,
}

/// The distributed read/write lock state machine.
pub struct DistributedRwLock {
    state: Mutex<LockState>,
    cv: Condvar,
    relinquished: AtomicBool,
}

impl Default for DistributedRwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl DistributedRwLock {
    /// Creates an unlocked lock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState::Unlocked),
            cv: Condvar::new(),
            relinquished: AtomicBool::new(false),
        }
    }

    /// Returns a copy of the current state.
    #[must_use]
    pub fn state(&self) -> LockState {
        self.state.lock().clone()
    }

    /// Returns true if `peer` currently holds the write lock.
    #[must_use]
    pub fn is_writer(&self, peer: &PeerId) -> bool {
        matches!(&*self.state.lock(), LockState::WriteLocked { holder, .. } if holder == peer)
    }

    /// Marks this replica as having left the chunk; all further remote
    /// requests are declined.
    pub fn relinquish(&self) {
        self.relinquished.store(true, Ordering::SeqCst);
    }

    /// Returns true if this replica has left the chunk.
    #[must_use]
    pub fn is_relinquished(&self) -> bool {
        self.relinquished.load(Ordering::SeqCst)
    }

    /// Adopts a remote writer, for chunks received via `chunk.init`:
    /// the snapshot arrives with the lock held by its sender.
    pub fn adopt_remote_writer(&self, holder: PeerId) {
        let mut state = self.state.lock();
        *state = LockState::WriteLocked {
            holder,
            thread: None,
            depth: 1,
        };
    }

    // ------------------------------------------------------------------
    // Local side
    // ------------------------------------------------------------------

    /// Takes a read lock.
    ///
    /// A thread that already write-holds the lock recurses into its
    /// write lock instead. Otherwise waits while the lock is
    /// write-locked or under attempt.
    pub fn read_lock(&self, self_peer: &PeerId) {
        let mut state = self.state.lock();
        if let LockState::WriteLocked {
            holder,
            thread,
            depth,
        } = &mut *state
        {
            if holder == self_peer && *thread == Some(thread::current().id()) {
                *depth += 1;
                return;
            }
        }
        loop {
            match &*state {
                LockState::Unlocked | LockState::ReadLocked { .. } => break,
                _ => self.cv.wait(&mut state),
            }
        }
        assert!(!self.is_relinquished(), "read lock on a relinquished chunk");
        match &mut *state {
            LockState::Unlocked => *state = LockState::ReadLocked { n_readers: 1 },
            LockState::ReadLocked { n_readers } => *n_readers += 1,
            _ => unreachable!("waited for a readable state"),
        }
    }

    /// Recursion fast path for the write lock: returns true (with the
    /// depth bumped) if the calling thread already holds it.
    pub fn write_lock_recursive(&self, self_peer: &PeerId) -> bool {
        let mut state = self.state.lock();
        if let LockState::WriteLocked {
            holder,
            thread,
            depth,
        } = &mut *state
        {
            if holder == self_peer && *thread == Some(thread::current().id()) {
                *depth += 1;
                return true;
            }
        }
        false
    }

    /// Waits until the lock is free and transitions to `Attempting`.
    /// The caller then collects acks from every other replica.
    pub fn begin_attempt(&self, self_peer: &PeerId) {
        let mut state = self.state.lock();
        loop {
            match &*state {
                LockState::WriteLocked { holder, thread, .. }
                    if holder == self_peer && *thread != Some(thread::current().id()) =>
                {
                    // Our own write lock on another thread; wait it out.
                    self.cv.wait(&mut state);
                }
                LockState::Unlocked => break,
                _ => self.cv.wait(&mut state),
            }
        }
        assert!(
            !self.is_relinquished(),
            "write lock on a relinquished chunk"
        );
        *state = LockState::Attempting;
    }

    /// Rolls a declined attempt back to `Unlocked`.
    ///
    /// The tie-break handler may have adopted the winning requester as
    /// holder while our decline was in flight; that adoption stands and
    /// the retry waits it out.
    pub fn abort_attempt(&self) {
        let mut state = self.state.lock();
        if *state == LockState::Attempting {
            *state = LockState::Unlocked;
            drop(state);
            self.cv.notify_all();
        }
    }

    /// Completes a fully-acked attempt: the calling thread now holds
    /// the write lock at depth 1.
    pub fn win_attempt(&self, self_peer: &PeerId) {
        let mut state = self.state.lock();
        assert_eq!(*state, LockState::Attempting, "no attempt in flight");
        *state = LockState::WriteLocked {
            holder: self_peer.clone(),
            thread: Some(thread::current().id()),
            depth: 1,
        };
    }

    /// Releases one level of the lock held by the calling thread.
    ///
    /// # Panics
    ///
    /// Panics on unlocking an unlocked lock, on aborting an attempt,
    /// and on releasing another holder's write lock; each is a protocol
    /// violation.
    pub fn begin_unlock(&self, self_peer: &PeerId) -> UnlockAction {
        let mut state = self.state.lock();
        match &mut *state {
            LockState::Unlocked => {
                panic!("protocol violation: unlock of an unlocked lock")
            }
            LockState::Attempting => {
                panic!("protocol violation: a lock attempt cannot be aborted by unlock")
            }
            LockState::ReadLocked { n_readers } => {
                *n_readers -= 1;
                if *n_readers == 0 {
                    *state = LockState::Unlocked;
                    drop(state);
                    self.cv.notify_all();
                }
                UnlockAction::Done
            }
            LockState::WriteLocked {
                holder,
                thread,
                depth,
            } => {
                assert_eq!(holder, self_peer, "unlock of another peer's write lock");
                assert_eq!(
                    *thread,
                    Some(thread::current().id()),
                    "unlock from a thread that does not hold the lock"
                );
                *depth -= 1;
                if *depth > 0 {
                    UnlockAction::Done
                } else {
                    // Stay write-locked until the remote release
                    // fan-out reaches the flip point.
                    *depth = 1;
                    UnlockAction::ReleaseRemote
                }
            }
        }
    }

    /// Flips the local state to `Unlocked`. Called at the release
    /// fan-out's flip point (after all strictly-greater-address peers
    /// are released), or directly when there are no other replicas.
    pub fn mark_unlocked(&self) {
        let mut state = self.state.lock();
        *state = LockState::Unlocked;
        drop(state);
        self.cv.notify_all();
    }

    // ------------------------------------------------------------------
    // Remote side
    // ------------------------------------------------------------------

    /// Decides a remote peer's lock request.
    ///
    /// Waits out local readers first. The tie-break between two
    /// simultaneous attempts is by peer address: only the peer with the
    /// lowest address of the replica set may decline a higher-address
    /// requester while itself attempting.
    pub fn handle_lock_request(
        &self,
        requester: &PeerId,
        self_peer: &PeerId,
        lowest_other_peer: Option<&PeerId>,
    ) -> LockReply {
        if self.is_relinquished() {
            return LockReply::Decline;
        }
        let mut state = self.state.lock();
        while matches!(&*state, LockState::ReadLocked { .. }) {
            self.cv.wait(&mut state);
        }
        match &*state {
            LockState::Unlocked => {
                *state = LockState::WriteLocked {
                    holder: requester.clone(),
                    thread: None,
                    depth: 1,
                };
                LockReply::Ack
            }
            LockState::Attempting => {
                let self_is_lowest = lowest_other_peer.map_or(true, |lowest| self_peer < lowest);
                if self_is_lowest {
                    assert!(
                        self_peer < requester,
                        "the lowest-address peer received a lock request from a lower address"
                    );
                    LockReply::Decline
                } else {
                    // The requester already won every lower-address
                    // peer, so our own attempt has lost; adopt it.
                    *state = LockState::WriteLocked {
                        holder: requester.clone(),
                        thread: None,
                        depth: 1,
                    };
                    LockReply::Ack
                }
            }
            LockState::WriteLocked { .. } => LockReply::Decline,
            LockState::ReadLocked { .. } => unreachable!("readers were waited out"),
        }
    }

    /// Applies a remote peer's unlock.
    ///
    /// # Panics
    ///
    /// Panics when the requester does not hold the lock; an unlock
    /// without a matching lock is a protocol violation.
    pub fn handle_unlock_request(&self, requester: &PeerId) {
        let mut state = self.state.lock();
        match &*state {
            LockState::WriteLocked { holder, .. } if holder == requester => {
                *state = LockState::Unlocked;
                drop(state);
                self.cv.notify_all();
            }
            other => panic!(
                "protocol violation: unlock from {} but lock state is {:?}",
                requester, other
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn peer(n: u16) -> PeerId {
        PeerId::new(format!("10.0.0.{}:1", n))
    }

    #[test]
    fn test_read_lock_counts_readers() {
        let lock = DistributedRwLock::new();
        let me = peer(1);
        lock.read_lock(&me);
        lock.read_lock(&me);
        assert_eq!(lock.state(), LockState::ReadLocked { n_readers: 2 });

        assert_eq!(lock.begin_unlock(&me), UnlockAction::Done);
        assert_eq!(lock.begin_unlock(&me), UnlockAction::Done);
        assert_eq!(lock.state(), LockState::Unlocked);
    }

    #[test]
    fn test_write_attempt_and_win() {
        let lock = DistributedRwLock::new();
        let me = peer(1);
        assert!(!lock.write_lock_recursive(&me));
        lock.begin_attempt(&me);
        assert_eq!(lock.state(), LockState::Attempting);
        lock.win_attempt(&me);
        assert!(lock.is_writer(&me));
    }

    #[test]
    fn test_write_recursion_is_symmetric() {
        let lock = DistributedRwLock::new();
        let me = peer(1);
        lock.begin_attempt(&me);
        lock.win_attempt(&me);

        // Two recursive acquisitions (one via the read path).
        assert!(lock.write_lock_recursive(&me));
        lock.read_lock(&me);

        assert_eq!(lock.begin_unlock(&me), UnlockAction::Done);
        assert_eq!(lock.begin_unlock(&me), UnlockAction::Done);
        assert_eq!(lock.begin_unlock(&me), UnlockAction::ReleaseRemote);
        lock.mark_unlocked();
        assert_eq!(lock.state(), LockState::Unlocked);
    }

    #[test]
    fn test_declined_attempt_rolls_back() {
        let lock = DistributedRwLock::new();
        lock.begin_attempt(&peer(1));
        lock.abort_attempt();
        assert_eq!(lock.state(), LockState::Unlocked);
    }

    #[test]
    fn test_remote_lock_on_unlocked_acks() {
        let lock = DistributedRwLock::new();
        let reply = lock.handle_lock_request(&peer(2), &peer(1), Some(&peer(2)));
        assert_eq!(reply, LockReply::Ack);
        assert!(lock.is_writer(&peer(2)));
    }

    #[test]
    fn test_remote_lock_on_write_locked_declines() {
        let lock = DistributedRwLock::new();
        lock.adopt_remote_writer(peer(3));
        let reply = lock.handle_lock_request(&peer(2), &peer(1), Some(&peer(2)));
        assert_eq!(reply, LockReply::Decline);
    }

    #[test]
    fn test_tiebreak_lowest_peer_declines_while_attempting() {
        // Self (1) is the lowest of the swarm {1, 2, 3} and attempting;
        // requester 3 must be declined.
        let lock = DistributedRwLock::new();
        lock.begin_attempt(&peer(1));
        let reply = lock.handle_lock_request(&peer(3), &peer(1), Some(&peer(2)));
        assert_eq!(reply, LockReply::Decline);
        assert_eq!(lock.state(), LockState::Attempting);
    }

    #[test]
    fn test_tiebreak_higher_peer_adopts_requester() {
        // Self (2) is attempting but not the lowest ({1, 2, 3}); the
        // requester has already won peer 1, so self must yield.
        let lock = DistributedRwLock::new();
        lock.begin_attempt(&peer(2));
        let reply = lock.handle_lock_request(&peer(3), &peer(2), Some(&peer(1)));
        assert_eq!(reply, LockReply::Ack);
        assert!(lock.is_writer(&peer(3)));
    }

    #[test]
    fn test_remote_lock_waits_for_readers() {
        let lock = Arc::new(DistributedRwLock::new());
        lock.read_lock(&peer(1));

        let remote = Arc::clone(&lock);
        let handle = std::thread::spawn(move || {
            remote.handle_lock_request(&peer(2), &peer(1), Some(&peer(2)))
        });

        // The handler must be parked until the reader leaves.
        std::thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());

        assert_eq!(lock.begin_unlock(&peer(1)), UnlockAction::Done);
        assert_eq!(handle.join().unwrap(), LockReply::Ack);
        assert!(lock.is_writer(&peer(2)));
    }

    #[test]
    fn test_remote_unlock_releases() {
        let lock = DistributedRwLock::new();
        lock.adopt_remote_writer(peer(2));
        lock.handle_unlock_request(&peer(2));
        assert_eq!(lock.state(), LockState::Unlocked);
    }

    #[test]
    #[should_panic(expected = "protocol violation")]
    fn test_remote_unlock_by_non_holder_is_fatal() {
        let lock = DistributedRwLock::new();
        lock.adopt_remote_writer(peer(2));
        lock.handle_unlock_request(&peer(3));
    }

    #[test]
    #[should_panic(expected = "protocol violation")]
    fn test_unlock_of_unlocked_is_fatal() {
        let lock = DistributedRwLock::new();
        lock.begin_unlock(&peer(1));
    }

    #[test]
    fn test_relinquished_declines_everything() {
        let lock = DistributedRwLock::new();
        lock.relinquish();
        let reply = lock.handle_lock_request(&peer(2), &peer(1), None);
        assert_eq!(reply, LockReply::Decline);
    }

    #[test]
    fn test_reader_waits_for_writer() {
        let lock = Arc::new(DistributedRwLock::new());
        lock.adopt_remote_writer(peer(2));

        let reader = Arc::clone(&lock);
        let handle = std::thread::spawn(move || {
            reader.read_lock(&peer(1));
        });
        std::thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());

        lock.handle_unlock_request(&peer(2));
        handle.join().unwrap();
        assert_eq!(lock.state(), LockState::ReadLocked { n_readers: 1 });
    }
}
