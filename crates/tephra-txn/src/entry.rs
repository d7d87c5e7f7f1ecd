//! In-memory representations of registry entries.
//!
//! Entries are shared: the status manager's map holds an `Arc` per
//! transaction, and callers may hold another while working on the entry after
//! the map lookup. Each entry's record data is guarded by its own
//! [`CowCell`], so an entry can never be torn down while a caller still holds
//! a lock on it, and state changes publish atomically.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cow_cell::CowCell;
use crate::store::{TxnParticipantEntry, TxnState, TxnStatusEntry};

/// One tablet participating in a transaction.
#[derive(Debug)]
pub struct ParticipantEntry {
    tablet_id: String,
    metadata: CowCell<TxnParticipantEntry>,
}

impl ParticipantEntry {
    fn new(txn_id: i64, tablet_id: String) -> Self {
        let metadata = CowCell::new(TxnParticipantEntry {
            txn_id,
            tablet_id: tablet_id.clone(),
            state: TxnState::Unknown,
        });
        Self {
            tablet_id,
            metadata,
        }
    }

    #[must_use]
    pub fn tablet_id(&self) -> &str {
        &self.tablet_id
    }

    /// The participant's record data, under its copy-on-write lock.
    #[must_use]
    pub fn metadata(&self) -> &CowCell<TxnParticipantEntry> {
        &self.metadata
    }
}

/// One logical transaction and its participants.
pub struct TransactionEntry {
    txn_id: i64,

    /// Redundant with the record data, but cached here so callers can check
    /// ownership without taking the entry lock.
    user: String,

    /// Guards `participants` only; take the entry read lock as well (with the
    /// transaction OPEN) before adding one.
    participants: Mutex<HashMap<String, Arc<ParticipantEntry>>>,

    /// The transaction's record data, under its copy-on-write lock.
    metadata: CowCell<TxnStatusEntry>,
}

impl TransactionEntry {
    #[must_use]
    pub fn new(txn_id: i64, user: &str) -> Self {
        let metadata = CowCell::new(TxnStatusEntry {
            txn_id,
            user: user.to_owned(),
            state: TxnState::Unknown,
        });
        Self {
            txn_id,
            user: user.to_owned(),
            participants: Mutex::new(HashMap::new()),
            metadata,
        }
    }

    #[must_use]
    pub fn txn_id(&self) -> i64 {
        self.txn_id
    }

    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// The transaction's record data, under its copy-on-write lock.
    #[must_use]
    pub fn metadata(&self) -> &CowCell<TxnStatusEntry> {
        &self.metadata
    }

    /// The participant with the given tablet ID, created if absent.
    #[must_use]
    pub fn get_or_create_participant(&self, tablet_id: &str) -> Arc<ParticipantEntry> {
        let mut participants = self.participants.lock();
        Arc::clone(
            participants
                .entry(tablet_id.to_owned())
                .or_insert_with(|| Arc::new(ParticipantEntry::new(self.txn_id, tablet_id.to_owned()))),
        )
    }

    /// Tablet IDs of every registered participant, unsorted.
    #[must_use]
    pub fn participant_ids(&self) -> Vec<String> {
        self.participants.lock().keys().cloned().collect()
    }
}

impl std::fmt::Debug for TransactionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionEntry")
            .field("txn_id", &self.txn_id)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}
