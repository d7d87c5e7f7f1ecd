//! The MVCC coordinator and its scoped op handle.
//!
//! Threads wishing to make updates use the [`MvccManager`] to register a
//! clock-assigned timestamp, usually through the [`ScopedOp`] handle. There
//! are two valid paths for an op:
//!
//! 1. `start_op` -> `start_applying_op` -> `commit_op`
//! 2. `start_op` -> `abort_op`
//!
//! Once an op is ready to modify in-memory data it transitions to APPLYING by
//! calling [`MvccManager::start_applying_op`]. From that point it must commit
//! in a bounded amount of time (it must not wait on external input): there is
//! no rollback of in-memory edits, so an APPLYING op can never abort.
//!
//! Any transition not on the graph above is a caller bug that compromises the
//! coordinator's invariants, and panics.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use tephra_error::{Result, TephraError};
use tephra_types::Timestamp;

use crate::snapshot::MvccSnapshot;

/// Log only every Nth attempt to move the new-op lower bound backwards; the
/// pattern is benign and can be very frequent under commit-wait load.
const BACKWARD_ADJUST_LOG_EVERY: u64 = 10;

// ---------------------------------------------------------------------------
// Op state machine
// ---------------------------------------------------------------------------

/// State of one in-flight op. Terminal states are not represented: reaching
/// one removes the entry from the in-flight map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpState {
    /// The timestamp is reserved; the apply phase has not begun.
    Reserved,
    /// The op is applying its changes to in-memory stores and must commit.
    Applying,
}

impl fmt::Display for OpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OpState::Reserved => "RESERVED",
            OpState::Applying => "APPLYING",
        })
    }
}

// ---------------------------------------------------------------------------
// Waiter facility
// ---------------------------------------------------------------------------

/// The two conditions a caller can park on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitFor {
    /// Every op with a timestamp at or below the waiter's is committed.
    AllCommitted,
    /// No in-flight op with a timestamp at or below the waiter's remains.
    NoneApplying,
}

/// One-shot latch a waiter blocks on until a wake or its deadline.
#[derive(Debug)]
struct WaitLatch {
    done: Mutex<bool>,
    cv: Condvar,
}

impl WaitLatch {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn count_down(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cv.notify_all();
    }

    fn is_counted_down(&self) -> bool {
        *self.done.lock()
    }

    /// Block until counted down, or until `deadline` if one is given.
    /// Returns whether the latch was counted down; spurious wakeups are
    /// re-checked against the flag.
    fn wait(&self, deadline: Option<Instant>) -> bool {
        let mut done = self.done.lock();
        while !*done {
            match deadline {
                Some(deadline) => {
                    if self.cv.wait_until(&mut done, deadline).timed_out() {
                        return *done;
                    }
                }
                None => self.cv.wait(&mut done),
            }
        }
        true
    }
}

struct WaitingState {
    timestamp: Timestamp,
    wait_for: WaitFor,
    latch: WaitLatch,
}

// ---------------------------------------------------------------------------
// MvccManager
// ---------------------------------------------------------------------------

/// Authoritative coordinator state. All multi-field updates happen with the
/// manager's mutex held so the watermark invariants change atomically.
struct Inner {
    /// The live snapshot readers copy.
    cur_snap: MvccSnapshot,

    /// Timestamps of currently in-flight ops.
    timestamps_in_flight: HashMap<u64, OpState>,

    /// Exclusive lower bound for new op timestamps.
    ///
    /// Ops must apply in timestamp order, so once an op at a given timestamp
    /// begins applying, no new op may register at or below that timestamp.
    new_op_exc_lower_bound: Timestamp,

    /// The minimum key in `timestamps_in_flight`, or [`Timestamp::MAX`] if
    /// the map is empty. Cached so commits do not rescan the map.
    earliest_in_flight: Timestamp,

    /// Parked callers, woken whenever the clean time recomputation satisfies
    /// their condition.
    waiters: Vec<Arc<WaitingState>>,

    /// How many times a caller tried to move `new_op_exc_lower_bound`
    /// backwards, for log rate limiting.
    backward_adjusts: u64,
}

impl Inner {
    /// Register `timestamp` as RESERVED. Fails (returning false) if the
    /// timestamp is at or below the lower bound or already in flight.
    fn init_op(&mut self, timestamp: Timestamp) -> bool {
        if timestamp <= self.new_op_exc_lower_bound {
            return false;
        }
        if timestamp < self.earliest_in_flight {
            self.earliest_in_flight = timestamp;
        }
        match self.timestamps_in_flight.entry(timestamp.value()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(OpState::Reserved);
                true
            }
        }
    }

    /// Remove `timestamp` from the in-flight map, returning its state.
    ///
    /// # Panics
    ///
    /// Panics if the timestamp is not in flight.
    fn remove_in_flight(&mut self, timestamp: Timestamp) -> OpState {
        match self.timestamps_in_flight.remove(&timestamp.value()) {
            Some(state) => state,
            None => panic!("timestamp {timestamp} is not in the in-flight map"),
        }
    }

    /// Recompute `earliest_in_flight` after the previous earliest op left the
    /// map.
    fn advance_earliest_in_flight(&mut self) {
        self.earliest_in_flight = self
            .timestamps_in_flight
            .keys()
            .min()
            .map_or(Timestamp::MAX, |&raw| Timestamp::new(raw));
    }

    /// Remove `timestamp` and record it as committed, returning whether it
    /// was the earliest in-flight op.
    fn commit_op(&mut self, timestamp: Timestamp) -> bool {
        let was_earliest = self.earliest_in_flight == timestamp;

        let old_state = self.remove_in_flight(timestamp);
        assert!(
            old_state == OpState::Applying,
            "cannot commit op at timestamp {timestamp}: never entered APPLYING state \
             (current state: {old_state})"
        );

        self.cur_snap.add_committed(timestamp);

        if was_earliest {
            self.advance_earliest_in_flight();
        }
        was_earliest
    }

    /// Recompute the clean time: the greatest watermark such that no op below
    /// it is still in flight and no new op can ever start below it.
    ///
    /// Two cases:
    ///
    /// 1. An in-flight op sits below `new_op_exc_lower_bound`: the watermark
    ///    is that op's timestamp.
    /// 2. No in-flight op sits below the lower bound: the watermark is the
    ///    lower bound itself. In-flight ops may still exist above it
    ///    (commit-wait ops started in the future).
    fn adjust_clean_time(&mut self) {
        if self.earliest_in_flight < self.new_op_exc_lower_bound {
            self.cur_snap.all_committed_before = self.earliest_in_flight;
        } else {
            self.cur_snap.all_committed_before = self.new_op_exc_lower_bound;
        }

        debug!(
            target: "tephra::mvcc",
            clean_time = %self.cur_snap.all_committed_before,
            "adjusted clean time"
        );

        // Committed timestamps now covered by the watermark are redundant.
        let watermark = self.cur_snap.all_committed_before.value();
        self.cur_snap.committed_timestamps.retain(|ts| *ts >= watermark);

        // With no explicit commits left, the upper watermark must ride along,
        // or it would fall below the lower one.
        if self.cur_snap.committed_timestamps.is_empty() {
            self.cur_snap.none_committed_at_or_after = self.cur_snap.all_committed_before;
        }

        // The move may have unblocked waiters.
        let mut i = 0;
        while i < self.waiters.len() {
            if self.is_done_waiting(&self.waiters[i]) {
                let waiter = self.waiters.swap_remove(i);
                waiter.latch.count_down();
            } else {
                i += 1;
            }
        }
    }

    fn is_done_waiting(&self, waiter: &WaitingState) -> bool {
        match waiter.wait_for {
            WaitFor::AllCommitted => self.are_all_committed(waiter.timestamp),
            WaitFor::NoneApplying => !self.any_in_flight_at_or_before(waiter.timestamp),
        }
    }

    /// Whether every op at or below `timestamp` is committed.
    fn are_all_committed(&self, timestamp: Timestamp) -> bool {
        // Either the clean time has moved past 'timestamp', or it has not
        // moved yet but 'timestamp' provably precedes every in-flight op.
        timestamp < self.cur_snap.all_committed_before || timestamp < self.earliest_in_flight
    }

    /// Whether any in-flight op has a timestamp at or below `timestamp`.
    ///
    /// Deliberately checks every in-flight entry, not just APPLYING ones; the
    /// barrier built on this is an over-approximation.
    fn any_in_flight_at_or_before(&self, timestamp: Timestamp) -> bool {
        self.timestamps_in_flight
            .keys()
            .any(|&raw| raw <= timestamp.value())
    }
}

/// Coordinator of MVCC ops for one tablet.
///
/// Thread-safe; created per tablet and explicitly [closed](MvccManager::close)
/// at tablet shutdown. Write drivers move ops through the state machine on
/// one side; readers take snapshots and park on visibility conditions on the
/// other.
pub struct MvccManager {
    inner: Mutex<Inner>,
    /// Checked without the lock on entry to wait paths.
    open: AtomicBool,
}

impl MvccManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                cur_snap: MvccSnapshot::new(),
                timestamps_in_flight: HashMap::new(),
                new_op_exc_lower_bound: Timestamp::MIN,
                earliest_in_flight: Timestamp::MAX,
                waiters: Vec::new(),
                backward_adjusts: 0,
            }),
            open: AtomicBool::new(true),
        }
    }

    /// Begin a new op at the provided timestamp.
    ///
    /// # Panics
    ///
    /// Panics if `timestamp` is already considered committed by the live
    /// snapshot, is already in flight, or is at or below the exclusive lower
    /// bound for new ops.
    pub fn start_op(&self, timestamp: Timestamp) {
        let mut inner = self.inner.lock();
        assert!(
            !inner.cur_snap.is_committed(timestamp),
            "cannot start op at an already-committed timestamp: {timestamp}, \
             current MVCC snapshot: {}",
            inner.cur_snap
        );
        assert!(
            inner.init_op(timestamp),
            "op with timestamp {timestamp} is already in flight, or at or below the \
             exclusive lower bound for new op timestamps; current lower bound: {}, \
             current MVCC snapshot: {}",
            inner.new_op_exc_lower_bound,
            inner.cur_snap
        );
    }

    /// Mark the op at `timestamp` as starting to apply its writes to
    /// in-memory stores. Must precede [`MvccManager::commit_op`]; once
    /// called, [`MvccManager::abort_op`] is no longer legal for this op.
    ///
    /// # Panics
    ///
    /// Panics if the timestamp is not in flight or is not RESERVED.
    pub fn start_applying_op(&self, timestamp: Timestamp) {
        let mut inner = self.inner.lock();
        let Some(state) = inner.timestamps_in_flight.get_mut(&timestamp.value()) else {
            panic!("cannot mark timestamp {timestamp} as APPLYING: not in the in-flight map");
        };
        assert!(
            *state == OpState::Reserved,
            "cannot mark timestamp {timestamp} as APPLYING: wrong state: {}",
            *state
        );
        *state = OpState::Applying;
    }

    /// Commit the op at `timestamp`, making it visible to new snapshots.
    ///
    /// If this was the earliest in-flight op and the lower bound has already
    /// been advanced to cover it, the clean time is recomputed. The guard
    /// keeps a commit-wait op committing ahead of the declared lower bound
    /// from dragging the clean time forward; callers of such ops advance the
    /// lower bound explicitly.
    ///
    /// # Panics
    ///
    /// Panics if the timestamp is not in flight or never entered APPLYING.
    pub fn commit_op(&self, timestamp: Timestamp) {
        let mut inner = self.inner.lock();
        let was_earliest = inner.commit_op(timestamp);
        if was_earliest && inner.new_op_exc_lower_bound >= timestamp {
            inner.adjust_clean_time();
        }
    }

    /// Abort the op at `timestamp`, removing it from the in-flight set.
    ///
    /// # Panics
    ///
    /// Panics if the timestamp is not in flight, or if the op already entered
    /// APPLYING, except while the manager is closed: during shutdown scoped
    /// handles are dropped in whatever state they are in, so removal succeeds
    /// with a warning regardless of state.
    pub fn abort_op(&self, timestamp: Timestamp) {
        let mut inner = self.inner.lock();
        let old_state = inner.remove_in_flight(timestamp);

        if !self.open.load(Ordering::Acquire) {
            warn!(
                target: "tephra::mvcc",
                %timestamp,
                state = %old_state,
                "aborting op while MVCC is closed"
            );
            return;
        }

        assert!(
            old_state == OpState::Reserved,
            "op with timestamp {timestamp} cannot be aborted in state {old_state}"
        );

        if inner.earliest_in_flight == timestamp {
            inner.advance_earliest_in_flight();
        }
    }

    /// Raise the exclusive lower bound on new op timestamps, provided
    /// `timestamp` is higher than the current bound, and recompute the clean
    /// time.
    ///
    /// Only call this once it is guaranteed that no new op will start at or
    /// below `timestamp` (e.g. the op is consensus-committed and about to
    /// apply). Attempts to move the bound backwards are a no-op with a
    /// rate-limited warning.
    pub fn adjust_new_op_lower_bound(&self, timestamp: Timestamp) {
        let mut inner = self.inner.lock();
        if inner.new_op_exc_lower_bound <= timestamp {
            debug!(target: "tephra::mvcc", %timestamp, "adjusting new op lower bound");
            inner.new_op_exc_lower_bound = timestamp;
        } else {
            // An op is being applied out of order. This is only safe because
            // concurrent ops are guaranteed disjoint by locks taken above
            // this layer (row locks, schema locks) before the op starts.
            inner.backward_adjusts += 1;
            if inner.backward_adjusts % BACKWARD_ADJUST_LOG_EVERY == 1 {
                warn!(
                    target: "tephra::mvcc",
                    current = %inner.new_op_exc_lower_bound,
                    requested = %timestamp,
                    occurrences = inner.backward_adjusts,
                    "tried to move back the new op lower bound"
                );
            }
            return;
        }

        inner.adjust_clean_time();
    }

    /// Copy the live snapshot: which ops are committed as of this call.
    #[must_use]
    pub fn take_snapshot(&self) -> MvccSnapshot {
        self.inner.lock().cur_snap.clone()
    }

    /// Wait until every op with a timestamp at or below `timestamp` is
    /// committed, then return the snapshot at `timestamp`.
    ///
    /// If `timestamp` was declared safe before this call (by advancing the
    /// new-op lower bound past it), the returned snapshot is repeatable.
    ///
    /// # Errors
    ///
    /// [`TephraError::TimedOut`] if `deadline` elapses first;
    /// [`TephraError::Aborted`] if the manager closes.
    pub fn wait_for_snapshot_with_all_committed(
        &self,
        timestamp: Timestamp,
        deadline: Instant,
    ) -> Result<MvccSnapshot> {
        self.wait_until(WaitFor::AllCommitted, timestamp, Some(deadline))?;
        Ok(MvccSnapshot::at_timestamp(timestamp))
    }

    /// Wait for every op currently APPLYING to commit.
    ///
    /// This is a best-effort barrier: it does not guarantee no op is APPLYING
    /// on return, only that those APPLYING at call time have finished.
    ///
    /// # Errors
    ///
    /// [`TephraError::Aborted`] if the manager is closed or closes mid-wait.
    pub fn wait_for_applying_ops_to_commit(&self) -> Result<()> {
        self.check_open()?;

        // Highest timestamp of an op currently APPLYING.
        let wait_for = {
            let inner = self.inner.lock();
            inner
                .timestamps_in_flight
                .iter()
                .filter(|&(_, state)| *state == OpState::Applying)
                .map(|(&raw, _)| raw)
                .max()
        };

        match wait_for {
            // Nothing was APPLYING.
            None => Ok(()),
            // Wait until nothing at or below that timestamp remains in
            // flight. More ops may enter APPLYING meanwhile; the ones we
            // snapshotted will have finished when this returns.
            Some(raw) => self.wait_until(WaitFor::NoneApplying, Timestamp::new(raw), None),
        }
    }

    /// The earliest possible timestamp for an uncommitted op. Everything
    /// strictly below it is guaranteed committed.
    #[must_use]
    pub fn clean_timestamp(&self) -> Timestamp {
        self.inner.lock().cur_snap.all_committed_before
    }

    /// Error out until the clean time has been adjusted past its initial
    /// state; before that the manager cannot safely serve information about
    /// already-applied ops.
    ///
    /// # Errors
    ///
    /// [`TephraError::CleanTimeNotInitialized`] while still at the initial
    /// state.
    pub fn check_clean_time_initialized(&self) -> Result<()> {
        if self.clean_timestamp() == Timestamp::INITIAL {
            return Err(TephraError::CleanTimeNotInitialized);
        }
        Ok(())
    }

    /// Timestamps of every op currently APPLYING. Such ops are guaranteed to
    /// eventually commit; ops that merely reserved their timestamp are not
    /// listed.
    #[must_use]
    pub fn applying_op_timestamps(&self) -> Vec<Timestamp> {
        let inner = self.inner.lock();
        inner
            .timestamps_in_flight
            .iter()
            .filter(|&(_, state)| *state == OpState::Applying)
            .map(|(&raw, _)| Timestamp::new(raw))
            .collect()
    }

    /// Close the manager. Idempotent. New ops will not start, in-flight ops
    /// exit early on a best-effort basis, and every waiter (current and
    /// future) returns [`TephraError::Aborted`].
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
        let mut inner = self.inner.lock();
        for waiter in inner.waiters.drain(..) {
            waiter.latch.count_down();
        }
    }

    /// Whether every op at or below `timestamp` is committed. Diagnostic
    /// counterpart of the condition the all-committed waiters park on.
    #[must_use]
    pub fn are_all_committed(&self, timestamp: Timestamp) -> bool {
        self.inner.lock().are_all_committed(timestamp)
    }

    /// Number of currently parked waiters. Cross-thread tests use this to
    /// sequence against waiter registration.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    fn check_open(&self) -> Result<()> {
        if self.open.load(Ordering::Acquire) {
            return Ok(());
        }
        Err(TephraError::aborted("MVCC is closed"))
    }

    fn wait_until(
        &self,
        wait_for: WaitFor,
        timestamp: Timestamp,
        deadline: Option<Instant>,
    ) -> Result<()> {
        // If the manager is closed there is no point in waiting.
        self.check_open()?;

        let waiter = Arc::new(WaitingState {
            timestamp,
            wait_for,
            latch: WaitLatch::new(),
        });
        {
            let mut inner = self.inner.lock();
            if inner.is_done_waiting(&waiter) {
                return Ok(());
            }
            inner.waiters.push(Arc::clone(&waiter));
        }

        if waiter.latch.wait(deadline) {
            // Woken. A wake during shutdown surfaces as an abort.
            return self.check_open();
        }

        // Deadline expired. A racing wake may have counted the latch down
        // while we reacquire the lock, in which case there is no entry left
        // to clean up.
        let mut inner = self.inner.lock();
        if waiter.latch.is_counted_down() {
            return self.check_open();
        }
        inner.waiters.retain(|w| !Arc::ptr_eq(w, &waiter));
        Err(TephraError::timed_out(format!(
            "all ops with timestamp at or below {timestamp} to {}",
            match wait_for {
                WaitFor::AllCommitted => "commit",
                WaitFor::NoneApplying => "finish applying",
            }
        )))
    }
}

impl Default for MvccManager {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// ScopedOp
// ---------------------------------------------------------------------------

/// A scoped handle to a running op.
///
/// Construction registers the op; dropping the handle without calling
/// [`ScopedOp::commit`] or [`ScopedOp::abort`] aborts it. The handle is
/// movable but deliberately not cloneable: exactly one resolution per op.
pub struct ScopedOp<'a> {
    manager: &'a MvccManager,
    timestamp: Timestamp,
    done: bool,
}

impl<'a> ScopedOp<'a> {
    /// Start a new op at `timestamp` on the given manager.
    ///
    /// # Panics
    ///
    /// Panics under the same conditions as [`MvccManager::start_op`].
    pub fn new(manager: &'a MvccManager, timestamp: Timestamp) -> Self {
        manager.start_op(timestamp);
        Self {
            manager,
            timestamp,
            done: false,
        }
    }

    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Mark that this op is about to begin applying its modifications to
    /// in-memory stores. Must precede [`ScopedOp::commit`];
    /// [`ScopedOp::abort`] may not be called afterwards.
    pub fn start_applying(&self) {
        self.manager.start_applying_op(self.timestamp);
    }

    /// Commit the in-flight op. Requires [`ScopedOp::start_applying`] to have
    /// been called.
    pub fn commit(&mut self) {
        self.manager.commit_op(self.timestamp);
        self.done = true;
    }

    /// Abort the in-flight op. Requires [`ScopedOp::start_applying`] to NOT
    /// have been called.
    pub fn abort(&mut self) {
        self.manager.abort_op(self.timestamp);
        self.done = true;
    }
}

impl Drop for ScopedOp<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.manager.abort_op(self.timestamp);
        }
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

#[cfg(test)]
impl MvccManager {
    /// Assert every cross-field invariant of the coordinator state.
    fn check_invariants(&self) {
        let inner = self.inner.lock();
        let snap = &inner.cur_snap;

        assert!(
            snap.all_committed_before <= snap.none_committed_at_or_after,
            "watermarks crossed: {snap}"
        );
        for &raw in &snap.committed_timestamps {
            assert!(
                snap.all_committed_before.value() <= raw
                    && raw < snap.none_committed_at_or_after.value(),
                "explicit commit {raw} outside watermark window: {snap}"
            );
            assert!(
                !inner.timestamps_in_flight.contains_key(&raw),
                "timestamp {raw} both committed and in flight"
            );
        }

        let min_in_flight = inner
            .timestamps_in_flight
            .keys()
            .min()
            .map_or(Timestamp::MAX, |&raw| Timestamp::new(raw));
        assert_eq!(
            inner.earliest_in_flight, min_in_flight,
            "stale earliest_in_flight cache"
        );

        // The clean time never passes the earliest in-flight op, nor the
        // lower bound once that bound is meaningful (below INITIAL it never
        // constrains anything: the clean time starts at INITIAL).
        let effective_bound = inner.new_op_exc_lower_bound.max(Timestamp::INITIAL);
        assert!(
            snap.all_committed_before <= inner.earliest_in_flight.min(effective_bound),
            "clean time {} passed min(earliest_in_flight {}, lower bound {})",
            snap.all_committed_before,
            inner.earliest_in_flight,
            inner.new_op_exc_lower_bound
        );
    }

    fn new_op_lower_bound(&self) -> Timestamp {
        self.inner.lock().new_op_exc_lower_bound
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;

    use tephra_clock::{Clock, LogicalClock};

    use super::*;

    fn ts(raw: u64) -> Timestamp {
        Timestamp::new(raw)
    }

    #[test]
    fn test_mvcc_basic() {
        let mgr = MvccManager::new();

        // Initial state should not have any committed ops.
        let snap = mgr.take_snapshot();
        assert_eq!(snap.to_string(), "MvccSnapshot[committed={T|T < 1}]");
        assert!(!snap.is_committed(ts(1)));
        assert!(!snap.is_committed(ts(2)));

        let clock = LogicalClock::default();
        let t = clock.now();
        assert_eq!(t, ts(1));
        let mut op = ScopedOp::new(&mgr, t);

        // Still no committed ops: 1 is in flight.
        let snap = mgr.take_snapshot();
        assert_eq!(snap.to_string(), "MvccSnapshot[committed={T|T < 1}]");
        assert!(!snap.is_committed(ts(1)));

        op.start_applying();

        // Applying does not change the committed set.
        assert!(!mgr.take_snapshot().is_committed(ts(1)));

        op.commit();

        let snap = mgr.take_snapshot();
        assert_eq!(
            snap.to_string(),
            "MvccSnapshot[committed={T|T < 1 or (T in {1})}]"
        );
        assert!(snap.is_committed(ts(1)));
        assert!(!snap.is_committed(ts(2)));
    }

    #[test]
    fn test_mvcc_multiple_in_flight() {
        let mgr = MvccManager::new();
        let clock = LogicalClock::default();

        let t1 = clock.now();
        let mut op1 = ScopedOp::new(&mgr, t1);
        let t2 = clock.now();
        let mut op2 = ScopedOp::new(&mgr, t2);

        // Both in flight: nothing committed.
        let snap = mgr.take_snapshot();
        assert_eq!(snap.to_string(), "MvccSnapshot[committed={T|T < 1}]");

        op2.start_applying();
        op2.commit();

        // 2 committed, 1 still in flight.
        let snap = mgr.take_snapshot();
        assert_eq!(
            snap.to_string(),
            "MvccSnapshot[committed={T|T < 1 or (T in {2})}]"
        );
        assert!(!snap.is_committed(t1));
        assert!(snap.is_committed(t2));

        let t3 = clock.now();
        let mut op3 = ScopedOp::new(&mgr, t3);

        // Starting 3 changes nothing about visibility.
        let snap = mgr.take_snapshot();
        assert_eq!(
            snap.to_string(),
            "MvccSnapshot[committed={T|T < 1 or (T in {2})}]"
        );

        op3.start_applying();
        op3.commit();

        let snap = mgr.take_snapshot();
        assert_eq!(
            snap.to_string(),
            "MvccSnapshot[committed={T|T < 1 or (T in {2,3})}]"
        );

        op1.start_applying();
        op1.commit();

        // Everything committed; advance the new op lower bound.
        mgr.adjust_new_op_lower_bound(t3);

        let snap = mgr.take_snapshot();
        assert_eq!(
            snap.to_string(),
            "MvccSnapshot[committed={T|T < 3 or (T in {3})}]"
        );
        assert!(snap.is_committed(t1));
        assert!(snap.is_committed(t2));
        assert!(snap.is_committed(t3));
    }

    #[test]
    fn test_out_of_order_ops() {
        // A commit-wait op is assigned a timestamp in the future of every
        // concurrent clock reader, so it stays in flight while ops with
        // lower timestamps start and commit around it.
        let mgr = MvccManager::new();
        let clock = LogicalClock::default();

        let first_ts = clock.now();
        let mut first_op = ScopedOp::new(&mgr, first_ts);

        let snap_with_nothing_committed = mgr.take_snapshot();

        // An op as if it were using commit-wait (started in the future).
        let cw_ts = ts(first_ts.value() + 1000);
        let mut cw_op = ScopedOp::new(&mgr, cw_ts);

        first_op.start_applying();
        first_op.commit();

        let second_ts = clock.now();
        let mut second_op = ScopedOp::new(&mgr, second_ts);

        // The old snapshot has neither op.
        assert!(!snap_with_nothing_committed.is_committed(first_ts));
        assert!(!snap_with_nothing_committed.is_committed(second_ts));

        // A fresh snapshot has only the first.
        let snap_with_first_committed = mgr.take_snapshot();
        assert!(snap_with_first_committed.is_committed(first_ts));
        assert!(!snap_with_first_committed.is_committed(second_ts));

        cw_op.start_applying();
        cw_op.commit();

        // The second op is still uncommitted.
        assert!(!mgr.take_snapshot().is_committed(second_ts));

        second_op.start_applying();
        second_op.commit();
    }

    #[test]
    fn test_safe_time_with_out_of_order_ops() {
        let mgr = MvccManager::new();
        let clock = LogicalClock::default();

        // Clock in the "future"; op in the "past".
        clock.update(ts(100)).unwrap();
        let ts_in_the_past = ts(50);
        let mut op_in_the_past = ScopedOp::new(&mgr, ts_in_the_past);
        op_in_the_past.start_applying();

        assert_eq!(mgr.clean_timestamp(), Timestamp::INITIAL);
        assert!(mgr.check_clean_time_initialized().is_err());

        // Committing must not advance the lower bound or the clean time.
        op_in_the_past.commit();

        // Nothing moved, so an op at 40 is still considered uncommitted even
        // though the only in-flight op committed at 50.
        let snap_with_first_op = mgr.take_snapshot();
        assert!(!snap_with_first_op.is_committed(ts(40)));

        // Advance both watermarks to the committed op.
        mgr.adjust_new_op_lower_bound(ts(50));

        assert_eq!(mgr.clean_timestamp(), ts_in_the_past);
        assert!(mgr.check_clean_time_initialized().is_ok());

        let snap_with_adjusted_clean_time = mgr.take_snapshot();
        assert!(snap_with_adjusted_clean_time.is_committed(ts(40)));
    }

    #[test]
    fn test_scoped_op_auto_abort() {
        let mgr = MvccManager::new();
        let clock = LogicalClock::default();

        {
            let mut op1 = ScopedOp::new(&mgr, clock.now());
            let op2 = ScopedOp::new(&mgr, clock.now());

            assert_eq!(op1.timestamp(), ts(1));
            assert_eq!(op2.timestamp(), ts(2));

            op1.start_applying();
            op1.commit();

            let snap = mgr.take_snapshot();
            assert!(snap.is_committed(ts(1)));
            assert!(!snap.is_committed(ts(2)));
        }

        // op2 went out of scope without committing: aborted.
        let snap = mgr.take_snapshot();
        assert!(snap.is_committed(ts(1)));
        assert!(!snap.is_committed(ts(2)));
        assert!(!mgr.are_all_committed(ts(2)));
        mgr.check_invariants();
    }

    #[test]
    fn test_scoped_op_drop_while_applying_after_close() {
        // An applying scoped op must not crash the process if it goes out of
        // scope after the manager has closed.
        let mgr = MvccManager::new();
        let clock = LogicalClock::default();
        mgr.close();
        {
            let op = ScopedOp::new(&mgr, clock.now());
            op.start_applying();
        }
    }

    #[test]
    fn test_are_all_committed() {
        let mgr = MvccManager::new();
        let clock = LogicalClock::default();

        let mut op1 = ScopedOp::new(&mgr, clock.now());
        let mut op2 = ScopedOp::new(&mgr, clock.now());
        let mut op3 = ScopedOp::new(&mgr, clock.now());
        mgr.adjust_new_op_lower_bound(clock.now());

        assert!(!mgr.are_all_committed(ts(1)));
        assert!(!mgr.are_all_committed(ts(2)));
        assert!(!mgr.are_all_committed(ts(3)));

        op3.start_applying();
        op3.commit();
        assert!(!mgr.are_all_committed(ts(1)));
        assert!(!mgr.are_all_committed(ts(2)));
        assert!(!mgr.are_all_committed(ts(3)));

        // Committing the earliest op clears everything at or below it.
        op1.start_applying();
        op1.commit();
        assert!(mgr.are_all_committed(ts(1)));
        assert!(!mgr.are_all_committed(ts(2)));
        assert!(!mgr.are_all_committed(ts(3)));

        op2.start_applying();
        op2.commit();
        assert!(mgr.are_all_committed(ts(1)));
        assert!(mgr.are_all_committed(ts(2)));
        assert!(mgr.are_all_committed(ts(3)));
    }

    #[test]
    fn test_op_abort_does_not_move_watermarks() {
        let mgr = MvccManager::new();
        let clock = LogicalClock::default();

        let t1 = clock.now();
        let mut op1 = ScopedOp::new(&mgr, t1);
        let t2 = clock.now();
        let mut op2 = ScopedOp::new(&mgr, t2);
        let t3 = clock.now();
        let mut op3 = ScopedOp::new(&mgr, t3);
        mgr.adjust_new_op_lower_bound(t3);

        // Aborting op1 moves neither the clean time nor the committed set.
        op1.abort();
        assert_eq!(mgr.clean_timestamp(), Timestamp::INITIAL);
        assert!(!mgr.take_snapshot().is_committed(t1));

        // op3 is not the earliest in-flight: no clean time movement, but the
        // lower bound stays at 3.
        op3.start_applying();
        op3.commit();
        assert!(mgr.take_snapshot().is_committed(t3));
        assert_eq!(mgr.new_op_lower_bound(), t3);

        // Committing op2 (now the earliest) advances the clean time to 3.
        op2.start_applying();
        op2.commit();
        assert!(mgr.take_snapshot().is_committed(t2));
        assert_eq!(mgr.clean_timestamp(), t3);
        mgr.check_invariants();
    }

    #[test]
    fn test_automatic_clean_time_move_on_commit() {
        // A clean snapshot must coalesce to the latest covered timestamp
        // when commits arrive out of timestamp order.
        let mgr = MvccManager::new();

        let mut op1 = ScopedOp::new(&mgr, ts(10));
        let mut op2 = ScopedOp::new(&mgr, ts(15));
        mgr.adjust_new_op_lower_bound(ts(15));

        op2.start_applying();
        op2.commit();

        op1.start_applying();
        op1.commit();

        assert_eq!(
            mgr.take_snapshot().to_string(),
            "MvccSnapshot[committed={T|T < 15 or (T in {15})}]"
        );
    }

    #[test]
    fn test_correct_init_with_no_ops() {
        // Advancing the lower bound with nothing in flight must advance both
        // watermarks together; a trailing upper watermark would make readers
        // cull history they still need.
        let mgr = MvccManager::new();
        let clock = LogicalClock::default();

        let snap = mgr.take_snapshot();
        assert_eq!(snap.all_committed_before(), Timestamp::INITIAL);
        assert_eq!(snap.none_committed_at_or_after(), Timestamp::INITIAL);
        assert!(snap.is_clean());

        for _ in 0..10 {
            clock.now();
        }

        let new_lower_bound = clock.now();
        mgr.adjust_new_op_lower_bound(new_lower_bound);

        let snap = mgr.take_snapshot();
        let before_lb = ts(new_lower_bound.value() - 1);
        let after_lb = ts(new_lower_bound.value() + 1);
        assert!(snap.may_have_committed_ops_at_or_after(before_lb));
        assert!(!snap.may_have_committed_ops_at_or_after(after_lb));

        assert_eq!(snap.all_committed_before(), new_lower_bound);
        assert_eq!(snap.none_committed_at_or_after(), new_lower_bound);
        assert!(snap.is_clean());
        mgr.check_invariants();
    }

    #[test]
    fn test_snapshot_is_independent_of_later_mutation() {
        let mgr = MvccManager::new();
        let clock = LogicalClock::default();

        let t1 = clock.now();
        let mut op1 = ScopedOp::new(&mgr, t1);
        let before = mgr.take_snapshot();
        let rendered = before.to_string();

        op1.start_applying();
        op1.commit();
        mgr.adjust_new_op_lower_bound(t1);

        assert!(!before.is_committed(t1));
        assert_eq!(before.to_string(), rendered);
        assert!(mgr.take_snapshot().is_committed(t1));
    }

    #[test]
    fn test_wait_until_clean_deadline() {
        let mgr = MvccManager::new();
        let clock = LogicalClock::default();

        let t1 = clock.now();
        let _op1 = ScopedOp::new(&mgr, t1);

        // The op never commits, so this must time out.
        let deadline = Instant::now() + Duration::from_millis(10);
        let err = mgr
            .wait_for_snapshot_with_all_committed(t1, deadline)
            .unwrap_err();
        assert!(err.is_timed_out(), "{err}");
        assert!(err.to_string().contains('1'), "{err}");
        assert_eq!(mgr.waiter_count(), 0);
    }

    #[test]
    fn test_backward_lower_bound_adjust_is_a_no_op() {
        let mgr = MvccManager::new();
        mgr.adjust_new_op_lower_bound(ts(10));
        for _ in 0..25 {
            mgr.adjust_new_op_lower_bound(ts(5));
        }
        assert_eq!(mgr.new_op_lower_bound(), ts(10));
        assert_eq!(mgr.clean_timestamp(), ts(10));
        mgr.check_invariants();
    }

    // -- death tests: every transition off the legal graph must panic --

    #[test]
    #[should_panic(expected = "not in the in-flight map")]
    fn test_start_applying_unknown_timestamp_panics() {
        let mgr = MvccManager::new();
        mgr.start_applying_op(ts(1));
    }

    #[test]
    #[should_panic(expected = "is not in the in-flight map")]
    fn test_commit_unknown_timestamp_panics() {
        let mgr = MvccManager::new();
        mgr.commit_op(ts(1));
    }

    #[test]
    #[should_panic(expected = "never entered APPLYING state")]
    fn test_commit_reserved_op_panics() {
        let mgr = MvccManager::new();
        mgr.start_op(ts(1));
        mgr.commit_op(ts(1));
    }

    #[test]
    #[should_panic(expected = "is not in the in-flight map")]
    fn test_abort_twice_panics() {
        let mgr = MvccManager::new();
        mgr.start_op(ts(1));
        mgr.abort_op(ts(1));
        mgr.abort_op(ts(1));
    }

    #[test]
    #[should_panic(expected = "wrong state")]
    fn test_start_applying_twice_panics() {
        let mgr = MvccManager::new();
        mgr.start_op(ts(1));
        mgr.start_applying_op(ts(1));
        mgr.start_applying_op(ts(1));
    }

    #[test]
    #[should_panic(expected = "cannot be aborted in state")]
    fn test_abort_applying_op_panics() {
        let mgr = MvccManager::new();
        mgr.start_op(ts(1));
        mgr.start_applying_op(ts(1));
        mgr.abort_op(ts(1));
    }

    #[test]
    #[should_panic(expected = "exclusive lower bound")]
    fn test_start_at_or_below_lower_bound_panics() {
        let mgr = MvccManager::new();
        mgr.adjust_new_op_lower_bound(ts(5));
        mgr.start_op(ts(5));
    }

    #[test]
    #[should_panic(expected = "already-committed timestamp")]
    fn test_start_at_committed_timestamp_panics() {
        let mgr = MvccManager::new();
        mgr.start_op(ts(3));
        mgr.adjust_new_op_lower_bound(ts(3));
        mgr.start_applying_op(ts(3));
        mgr.commit_op(ts(3));
        mgr.start_op(ts(3));
    }

    #[test]
    #[should_panic(expected = "already in flight")]
    fn test_start_duplicate_timestamp_panics() {
        let mgr = MvccManager::new();
        mgr.start_op(ts(7));
        mgr.start_op(ts(7));
    }

    // -- property tests --

    /// Drive the manager through an arbitrary legal interleaving of
    /// lifecycle calls and re-check every coordinator invariant after each
    /// step.
    fn run_legal_sequence(actions: &[(u8, u8)]) {
        let mgr = MvccManager::new();
        let mut next_ts: u64 = 1;
        let mut reserved: Vec<u64> = Vec::new();
        let mut applying: Vec<u64> = Vec::new();
        let mut committed: Vec<u64> = Vec::new();
        let mut last_clean = mgr.clean_timestamp();

        for &(action, pick) in actions {
            let pick = pick as usize;
            match action % 5 {
                0 => {
                    mgr.start_op(ts(next_ts));
                    reserved.push(next_ts);
                    next_ts += 1;
                }
                1 if !reserved.is_empty() => {
                    let t = reserved.swap_remove(pick % reserved.len());
                    mgr.start_applying_op(ts(t));
                    applying.push(t);
                }
                2 if !applying.is_empty() => {
                    let t = applying.swap_remove(pick % applying.len());
                    mgr.commit_op(ts(t));
                    committed.push(t);
                }
                3 if !reserved.is_empty() => {
                    let t = reserved.swap_remove(pick % reserved.len());
                    mgr.abort_op(ts(t));
                }
                4 => {
                    // Any bound below the next timestamp we will hand out is
                    // legal: the driver only ever starts ops at next_ts.
                    mgr.adjust_new_op_lower_bound(ts(pick as u64 % next_ts));
                }
                _ => {}
            }

            mgr.check_invariants();

            // Clean time is monotone.
            let clean = mgr.clean_timestamp();
            assert!(clean >= last_clean, "clean time went backwards");
            last_clean = clean;

            // A snapshot taken after commit_op returned sees the commit, and
            // is_committed never reverts to false.
            let snap = mgr.take_snapshot();
            for &t in &committed {
                assert!(snap.is_committed(ts(t)), "lost commit {t}");
            }
        }
    }

    proptest! {
        #[test]
        fn prop_invariants_hold_under_legal_sequences(
            actions in prop::collection::vec((0u8..5, any::<u8>()), 1..100)
        ) {
            run_legal_sequence(&actions);
        }
    }
}
