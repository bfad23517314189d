//! Protocol timing constants.

/// Leader heartbeat period `H`, in milliseconds.
pub const HEARTBEAT_PERIOD_MS: u64 = 50;

/// Lower bound of the randomized election timeout (`2H`).
pub const ELECTION_TIMEOUT_MIN_MS: u64 = 2 * HEARTBEAT_PERIOD_MS;

/// Upper bound of the randomized election timeout (`6H`).
pub const ELECTION_TIMEOUT_MAX_MS: u64 = 6 * HEARTBEAT_PERIOD_MS;

/// A peer that loses an election stretches its next timeout by this
/// factor, so less up-to-date logs stop starving the rest of the swarm.
pub const LOST_ELECTION_TIMEOUT_FACTOR: u64 = 4;

/// Back-off after a declined distributed-lock attempt, in milliseconds.
pub const LOCK_RETRY_BACKOFF_MS: u64 = 1;

/// Back-off between retries of a chunk lock lease request under
/// consensus, in milliseconds.
pub const LEASE_RETRY_BACKOFF_MS: u64 = 20;

/// Transport-level timeout for `try_request`, in milliseconds.
pub const RPC_TIMEOUT_MS: u64 = 1000;
