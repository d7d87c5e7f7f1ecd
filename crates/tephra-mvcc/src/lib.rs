//! Multi-version concurrency control for a single tablet.
//!
//! The write pipeline defers updates until commit time; readers operate on
//! snapshots that contain only committed operations. This crate provides the
//! synchronization point between the two:
//!
//! - [`MvccManager`]: assigns every write a place in the logical timeline,
//!   tracks which operations are in flight vs. durably committed, and parks
//!   waiters until a visibility condition holds.
//! - [`MvccSnapshot`]: an immutable copy of the visibility state, answering
//!   "was this operation visible at time T?" in O(1) on the hot path.
//! - [`ScopedOp`]: a lifetime-bound handle guaranteeing exactly-once
//!   resolution (commit or abort) of one write.

pub mod manager;
pub mod snapshot;

pub use manager::{MvccManager, ScopedOp};
pub use snapshot::MvccSnapshot;
