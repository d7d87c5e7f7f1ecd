//! Clock service interface consumed by the write pipeline.
//!
//! The MVCC core never reads wall time itself: write drivers obtain
//! timestamps from a [`Clock`] and hand them to the coordinator. This crate
//! defines that boundary and ships [`LogicalClock`], the deterministic
//! Lamport-style implementation the core's own tests run against.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tephra_error::{Result, TephraError};
use tephra_types::Timestamp;

/// Source of operation timestamps.
///
/// Implementations must hand out monotonically non-decreasing values across
/// concurrent callers.
pub trait Clock: Send + Sync {
    /// The current timestamp. Consecutive calls never go backwards.
    fn now(&self) -> Timestamp;

    /// A timestamp guaranteed to be in the future of any concurrent
    /// [`Clock::now`] reader, for commit-wait operations.
    fn now_latest(&self) -> Timestamp;

    /// Advance the clock to at least `ts`.
    fn update(&self, ts: Timestamp) -> Result<()>;

    /// Block until `ts` is guaranteed to be in the past of every reader, or
    /// until `deadline`. Only meaningful for physical clocks.
    fn wait_until_after(&self, ts: Timestamp, deadline: Instant) -> Result<()>;

    /// Whether `ts` is strictly in the past of this clock.
    fn is_after(&self, ts: Timestamp) -> bool;
}

/// A plain Lamport clock.
///
/// On a single node this generates a deterministic timestamp sequence with
/// the same consistency properties as a hybrid physical clock, which makes it
/// the clock of choice for tests. [`Clock::update`] keeps replicas moving
/// forward when leadership changes hands.
///
/// Commit-wait is unavailable: [`Clock::wait_until_after`] returns
/// [`TephraError::Unsupported`].
#[derive(Debug)]
pub struct LogicalClock {
    now: AtomicU64,
}

impl LogicalClock {
    /// Create a logical clock whose first [`Clock::now`] reading is `origin`.
    #[must_use]
    pub fn new(origin: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(origin.value().saturating_sub(1)),
        }
    }

    /// The current counter value, without incrementing it.
    ///
    /// Observation only (tests, metrics): the returned value is the most
    /// recent timestamp handed out, not a fresh one.
    #[must_use]
    pub fn peek(&self) -> Timestamp {
        Timestamp::new(self.now.load(Ordering::Acquire))
    }
}

impl Default for LogicalClock {
    fn default() -> Self {
        Self::new(Timestamp::INITIAL)
    }
}

impl Clock for LogicalClock {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.now.fetch_add(1, Ordering::AcqRel) + 1)
    }

    fn now_latest(&self) -> Timestamp {
        self.now()
    }

    fn update(&self, ts: Timestamp) -> Result<()> {
        if ts > Timestamp::MAX {
            return Err(TephraError::invalid_argument(format!(
                "cannot update logical clock past the maximum timestamp: {ts}"
            )));
        }
        self.now.fetch_max(ts.value(), Ordering::AcqRel);
        Ok(())
    }

    fn wait_until_after(&self, _ts: Timestamp, _deadline: Instant) -> Result<()> {
        Err(TephraError::unsupported(
            "logical clock cannot wait for commit-wait completion",
        ))
    }

    fn is_after(&self, ts: Timestamp) -> bool {
        ts < self.peek()
    }
}
