//! Cross-cutting value types for the tephra tablet engine.
//!
//! This crate is intentionally tiny: it holds the types every other tephra
//! crate agrees on, starting with [`Timestamp`].

use std::fmt;

/// A logical instant in the tablet's multi-version timeline.
///
/// Timestamps are opaque, totally ordered 64-bit values handed out by the
/// clock service. The only arithmetic the engine ever performs on them is
/// comparison and [`Timestamp::next`]; anything richer would leak clock
/// internals into the storage layer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The lowest representable timestamp. No real operation is ever
    /// assigned this value.
    pub const MIN: Self = Self(0);

    /// The timestamp a freshly created tablet considers "the beginning of
    /// time". Watermarks start here; the first clock reading is at or above
    /// it.
    pub const INITIAL: Self = Self(1);

    /// The highest assignable timestamp. The all-ones encoding above it is
    /// reserved and never represents a real instant.
    pub const MAX: Self = Self(u64::MAX - 1);

    /// Construct a timestamp from its raw representation.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw 64-bit representation.
    #[inline]
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The immediate successor.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
