//! The chunk write-lock lease.
//!
//! Under consensus, acquiring the chunk write lock is itself a log
//! entry. A `LockAcquire` takes effect on commit only while no other
//! lock is held; a `LockRelease` takes effect only when it quotes the
//! committed index of the matching acquisition. Tying the lease to log
//! order makes the lock survive leader changes: every replica derives
//! the same holder from the same committed prefix.

use swarm_common::PeerId;

use crate::LogIndex;

/// The replicated chunk write-lock state.
#[derive(Debug, Default)]
pub struct ChunkLockState {
    holder: Option<PeerId>,
    serial: u64,
    lock_index: LogIndex,
}

impl ChunkLockState {
    /// Creates an unlocked state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current holder, if any.
    #[must_use]
    pub fn holder(&self) -> Option<&PeerId> {
        self.holder.as_ref()
    }

    /// Returns true if `peer` holds the lock.
    #[must_use]
    pub fn is_lock_holder(&self, peer: &PeerId) -> bool {
        self.holder.as_ref() == Some(peer)
    }

    /// Returns the committed index of the holder's acquisition.
    #[must_use]
    pub fn lock_index(&self) -> LogIndex {
        self.lock_index
    }

    /// Applies a committed `LockAcquire`. The acquisition takes effect
    /// only when the lock is free; a losing acquire commits as a no-op
    /// and the requester retries with a fresh serial.
    ///
    /// Returns true if `peer` now holds the lock.
    pub fn apply_acquire(&mut self, index: LogIndex, peer: PeerId, serial: u64) -> bool {
        if self.holder.is_none() {
            self.holder = Some(peer);
            self.serial = serial;
            self.lock_index = index;
            true
        } else {
            false
        }
    }

    /// Applies a committed `LockRelease`. The release takes effect only
    /// when `peer` is the holder and `prior_index` quotes the holder's
    /// acquisition index.
    ///
    /// Returns true if the lock is now free.
    ///
    /// # Panics
    ///
    /// Panics when no lock is held: a release without a prior acquire
    /// is a protocol violation.
    pub fn apply_release(&mut self, peer: &PeerId, prior_index: LogIndex) -> bool {
        assert!(
            self.holder.is_some(),
            "protocol violation: lock release by {} without prior acquire",
            peer
        );
        if self.holder.as_ref() == Some(peer) && self.lock_index == prior_index {
            self.holder = None;
            self.serial = 0;
            self.lock_index = 0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u16) -> PeerId {
        PeerId::new(format!("10.0.0.{}:1", n))
    }

    #[test]
    fn test_acquire_free_lock() {
        let mut lock = ChunkLockState::new();
        assert!(lock.apply_acquire(4, peer(1), 7));
        assert!(lock.is_lock_holder(&peer(1)));
        assert_eq!(lock.lock_index(), 4);
    }

    #[test]
    fn test_acquire_held_lock_is_noop() {
        let mut lock = ChunkLockState::new();
        lock.apply_acquire(4, peer(1), 7);
        assert!(!lock.apply_acquire(5, peer(2), 8));
        assert!(lock.is_lock_holder(&peer(1)));
        assert_eq!(lock.lock_index(), 4);
    }

    #[test]
    fn test_release_with_matching_prior_index() {
        let mut lock = ChunkLockState::new();
        lock.apply_acquire(4, peer(1), 7);
        assert!(lock.apply_release(&peer(1), 4));
        assert!(lock.holder().is_none());
    }

    #[test]
    fn test_release_with_stale_prior_index_is_noop() {
        let mut lock = ChunkLockState::new();
        lock.apply_acquire(4, peer(1), 7);
        assert!(!lock.apply_release(&peer(1), 3));
        assert!(lock.is_lock_holder(&peer(1)));
    }

    #[test]
    fn test_release_by_non_holder_is_noop() {
        let mut lock = ChunkLockState::new();
        lock.apply_acquire(4, peer(1), 7);
        assert!(!lock.apply_release(&peer(2), 4));
        assert!(lock.is_lock_holder(&peer(1)));
    }

    #[test]
    #[should_panic(expected = "protocol violation")]
    fn test_release_without_acquire_is_fatal() {
        let mut lock = ChunkLockState::new();
        lock.apply_release(&peer(1), 1);
    }

    #[test]
    fn test_lock_survives_reacquire_after_release() {
        let mut lock = ChunkLockState::new();
        lock.apply_acquire(4, peer(1), 7);
        lock.apply_release(&peer(1), 4);
        assert!(lock.apply_acquire(9, peer(2), 8));
        assert!(lock.is_lock_holder(&peer(2)));
        assert_eq!(lock.lock_index(), 9);
    }
}
