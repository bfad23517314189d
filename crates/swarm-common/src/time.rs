//! The logical version clock.
//!
//! All revisions in the store are stamped from a single process-wide
//! 64-bit counter. The counter only moves forward:
//!
//! - `sample()` advances the counter and returns the new value, so two
//!   samples on one process are always strictly ordered.
//! - `merge(t)` absorbs a remote time, advancing the counter past `t` if
//!   needed. Every observed remote revision must be merged on receive,
//!   which preserves cause→effect ordering across processes.
//!
//! The clock is an explicitly passed handle with a process-wide
//! lifecycle; components hold an `Arc<LogicalClock>` rather than
//! reaching for a global.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// A point on the logical clock.
///
/// `ZERO` is the invalid sentinel; every sampled time is non-zero.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogicalTime(u64);

impl LogicalTime {
    /// The zero time, before any sample. Never a valid revision time.
    pub const ZERO: Self = Self(0);

    /// Creates a logical time from its raw counter value.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw counter value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Checks if this is a sampled (non-zero) time.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Debug for LogicalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

impl fmt::Display for LogicalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The process-wide monotone counter behind `LogicalTime`.
#[derive(Debug, Default)]
pub struct LogicalClock {
    counter: AtomicU64,
}

impl LogicalClock {
    /// Creates a clock starting at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a clock resuming from a persisted value.
    #[must_use]
    pub fn starting_at(time: LogicalTime) -> Self {
        Self {
            counter: AtomicU64::new(time.as_u64()),
        }
    }

    /// Advances the clock and returns the new value.
    ///
    /// Each call returns a strictly greater time than any previous call
    /// on this process.
    pub fn sample(&self) -> LogicalTime {
        LogicalTime(self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Absorbs a remote time: after this call, `sample()` returns a time
    /// strictly greater than `time`.
    pub fn merge(&self, time: LogicalTime) {
        self.counter.fetch_max(time.as_u64(), Ordering::SeqCst);
    }

    /// Reads the current value without advancing.
    pub fn peek(&self) -> LogicalTime {
        LogicalTime(self.counter.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_sample_strictly_increases() {
        let clock = LogicalClock::new();
        let mut prev = clock.sample();
        for _ in 0..1000 {
            let next = clock.sample();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_first_sample_is_valid() {
        let clock = LogicalClock::new();
        let t = clock.sample();
        assert!(t.is_valid());
        assert!(t > LogicalTime::ZERO);
    }

    #[test]
    fn test_merge_absorbs_remote_time() {
        let clock = LogicalClock::new();
        clock.sample();
        clock.merge(LogicalTime::new(1000));
        assert!(clock.sample() > LogicalTime::new(1000));
    }

    #[test]
    fn test_merge_with_older_time_is_noop() {
        let clock = LogicalClock::starting_at(LogicalTime::new(500));
        clock.merge(LogicalTime::new(10));
        assert_eq!(clock.peek(), LogicalTime::new(500));
    }

    #[test]
    fn test_concurrent_samples_are_unique() {
        let clock = Arc::new(LogicalClock::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let clock = Arc::clone(&clock);
                thread::spawn(move || (0..500).map(|_| clock.sample()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<LogicalTime> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total);
    }
}
