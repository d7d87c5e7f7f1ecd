//! Point-in-time visibility state.

use std::fmt;
use std::str::FromStr;

use smallvec::SmallVec;

use tephra_error::TephraError;
use tephra_types::Timestamp;

/// A snapshot of the MVCC state, which can determine whether an op timestamp
/// should be considered visible.
///
/// Summary rule: an op at timestamp `T` is committed if and only if
/// `T < all_committed_before`, or `committed_timestamps` contains `T`.
///
/// ```text
///   CCCCCCCCCCCCCCCCCUUUUUCUUUCU
///                    |    \___\___ committed_timestamps
///                    |
///                    \- all_committed_before
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MvccSnapshot {
    /// Watermark below which every op is committed: for any `X`, if
    /// `X < all_committed_before`, then `X` is committed.
    pub(crate) all_committed_before: Timestamp,

    /// Watermark at or beyond which no op is committed: for any `X`, if
    /// `X >= none_committed_at_or_after`, then `X` is uncommitted. Equal to
    /// `max(committed_timestamps) + 1`, cached because the set is unsorted.
    pub(crate) none_committed_at_or_after: Timestamp,

    /// Committed timestamps at or above `all_committed_before`.
    ///
    /// A hash set would seem the natural fit, but this list stays small (it
    /// is bounded by the concurrent in-flight set) and is only consulted when
    /// neither watermark can answer, so a compact inline vector that fits in
    /// a cache line or two wins in practice.
    pub(crate) committed_timestamps: SmallVec<[u64; 8]>,
}

impl MvccSnapshot {
    /// A snapshot with no committed ops, positioned at the beginning of the
    /// tablet's timeline.
    #[must_use]
    pub fn new() -> Self {
        Self::at_timestamp(Timestamp::INITIAL)
    }

    /// A snapshot at `timestamp`: every op strictly below it is committed,
    /// the timestamp itself and everything above is not.
    #[must_use]
    pub fn at_timestamp(timestamp: Timestamp) -> Self {
        Self {
            all_committed_before: timestamp,
            none_committed_at_or_after: timestamp,
            committed_timestamps: SmallVec::new(),
        }
    }

    /// A snapshot which considers every op committed. Mostly useful in test
    /// contexts.
    #[must_use]
    pub fn including_all_ops() -> Self {
        Self::at_timestamp(Timestamp::MAX)
    }

    /// A snapshot which considers no op committed.
    #[must_use]
    pub fn including_no_ops() -> Self {
        Self::at_timestamp(Timestamp::MIN)
    }

    /// Whether the op at `timestamp` is committed in this snapshot.
    #[inline]
    #[must_use]
    pub fn is_committed(&self, timestamp: Timestamp) -> bool {
        // The watermarks answer on the hot path; the explicit set is the
        // rarely-taken fallback.
        if timestamp < self.all_committed_before {
            return true;
        }
        if timestamp >= self.none_committed_at_or_after {
            return false;
        }
        self.is_committed_fallback(timestamp)
    }

    /// Whether this snapshot may contain committed ops with a timestamp at or
    /// above `timestamp`.
    ///
    /// Lets readers skip scanning redo history: a `false` answer proves there
    /// is nothing at or above `timestamp` to apply.
    #[must_use]
    pub fn may_have_committed_ops_at_or_after(&self, timestamp: Timestamp) -> bool {
        timestamp < self.none_committed_at_or_after
    }

    /// Whether this snapshot may contain uncommitted ops with a timestamp at
    /// or below `timestamp`.
    ///
    /// Lets readers skip scanning undo history: a `false` answer proves every
    /// op at or below `timestamp` is committed in this snapshot.
    #[must_use]
    pub fn may_have_uncommitted_ops_at_or_before(&self, timestamp: Timestamp) -> bool {
        // Either the watermark sits below 'timestamp', or it sits exactly at
        // a timestamp that is not itself in the committed set. The latter
        // covers a snapshot whose watermark could not advance past its only
        // committed op.
        timestamp > self.all_committed_before
            || (timestamp == self.all_committed_before && !self.is_committed_fallback(timestamp))
    }

    /// Whether this snapshot is determined by its watermark alone: all ops
    /// below some timestamp committed, everything else uncommitted.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.committed_timestamps.is_empty()
    }

    /// Consider each of `timestamps` committed in this snapshot, even if they
    /// were not when it was constructed.
    ///
    /// Used on the flush path, where the set of commits going into a flushed
    /// file may not be an MVCC-consistent snapshot, yet the scanner built
    /// over that file must represent the set accurately.
    pub fn add_committed_timestamps(&mut self, timestamps: &[Timestamp]) {
        for &ts in timestamps {
            self.add_committed(ts);
        }
    }

    pub(crate) fn add_committed(&mut self, timestamp: Timestamp) {
        if self.is_committed(timestamp) {
            return;
        }
        self.committed_timestamps.push(timestamp.value());
        if self.none_committed_at_or_after <= timestamp {
            self.none_committed_at_or_after = timestamp.next();
        }
    }

    fn is_committed_fallback(&self, timestamp: Timestamp) -> bool {
        self.committed_timestamps.contains(&timestamp.value())
    }

    /// The watermark below which every op is committed.
    #[must_use]
    pub fn all_committed_before(&self) -> Timestamp {
        self.all_committed_before
    }

    /// The watermark at or beyond which no op is committed.
    #[must_use]
    pub fn none_committed_at_or_after(&self) -> Timestamp {
        self.none_committed_at_or_after
    }
}

impl Default for MvccSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MvccSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MvccSnapshot[committed={{T|T < {}", self.all_committed_before)?;
        if self.committed_timestamps.is_empty() {
            return write!(f, "}}]");
        }
        write!(f, " or (T in {{")?;
        for (i, ts) in self.committed_timestamps.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{ts}")?;
        }
        write!(f, "}})}}]")
    }
}

impl FromStr for MvccSnapshot {
    type Err = TephraError;

    /// Parses the exact grammar produced by [`fmt::Display`]. The upper
    /// watermark is reconstructed from the explicit set (its cached value is
    /// always `max + 1` when the set is non-empty).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const PREFIX: &str = "MvccSnapshot[committed={T|T < ";
        const SET_SEP: &str = " or (T in {";

        let invalid = || TephraError::invalid_argument(format!("not an MvccSnapshot string: {s:?}"));
        let body = s.strip_prefix(PREFIX).ok_or_else(invalid)?;

        let parse_ts = |raw: &str| {
            raw.parse::<u64>()
                .map(Timestamp::new)
                .map_err(|_| invalid())
        };

        if let Some((acb_str, set_str)) = body.split_once(SET_SEP) {
            let set_str = set_str.strip_suffix("})}]").ok_or_else(invalid)?;
            let all_committed_before = parse_ts(acb_str)?;
            let mut snap = Self::at_timestamp(all_committed_before);
            for part in set_str.split(',') {
                let ts = parse_ts(part)?;
                snap.committed_timestamps.push(ts.value());
                if snap.none_committed_at_or_after <= ts {
                    snap.none_committed_at_or_after = ts.next();
                }
            }
            Ok(snap)
        } else {
            let acb_str = body.strip_suffix("}]").ok_or_else(invalid)?;
            Ok(Self::at_timestamp(parse_ts(acb_str)?))
        }
    }
}
