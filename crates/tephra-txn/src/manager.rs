//! The transaction status manager.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use tephra_error::{Result, TephraError};

use crate::entry::TransactionEntry;
use crate::store::{StatusRecord, TxnParticipantEntry, TxnState, TxnStatusEntry, TxnStatusStore};

/// In-memory registry state: the highest transaction ID ever attempted and
/// the live entries.
struct Registry {
    /// Requests to create a new transaction must provide an ID higher than
    /// this, which advances even when the subsequent persist fails; at most
    /// one begin can ever succeed per ID.
    highest_txn_id: i64,
    txns_by_id: HashMap<i64, Arc<TransactionEntry>>,
}

/// Manages ongoing multi-statement transactions and the participants
/// therein, backed by a durable record store.
///
/// Every state transition persists the intended new state through the store
/// before committing the in-memory copy-on-write lock; if persistence fails
/// the in-memory change is abandoned and the caller sees the store's error.
pub struct TxnStatusManager<S> {
    registry: Mutex<Registry>,
    store: S,
}

impl<S: TxnStatusStore> TxnStatusManager<S> {
    pub fn new(store: S) -> Self {
        Self {
            registry: Mutex::new(Registry {
                highest_txn_id: -1,
                txns_by_id: HashMap::new(),
            }),
            store,
        }
    }

    /// Rebuild the in-memory state from the store's records.
    ///
    /// Records may arrive in any order; the fold keeps the last write per
    /// `txn_id` / `(txn_id, tablet_id)` key. A participant record whose
    /// transaction record never shows up yields a placeholder transaction
    /// with no owner, and a warning: the store does not enforce that
    /// relationship, so a reader cannot either.
    ///
    /// # Errors
    ///
    /// Propagates store read and decode failures.
    pub fn load(&self) -> Result<()> {
        let mut txn_records: HashMap<i64, TxnStatusEntry> = HashMap::new();
        let mut prt_records: HashMap<(i64, String), TxnParticipantEntry> = HashMap::new();
        self.store.visit(&mut |record| match record {
            StatusRecord::Transaction(entry) => {
                txn_records.insert(entry.txn_id, entry);
            }
            StatusRecord::Participant(entry) => {
                prt_records.insert((entry.txn_id, entry.tablet_id.clone()), entry);
            }
        })?;

        let mut highest_txn_id = -1;
        let mut txns_by_id: HashMap<i64, Arc<TransactionEntry>> = HashMap::new();
        for (txn_id, record) in txn_records {
            highest_txn_id = highest_txn_id.max(txn_id);
            let txn = Arc::new(TransactionEntry::new(txn_id, &record.user));
            {
                let mut lock = txn.metadata().write();
                *lock.mutable_data() = record;
                lock.commit();
            }
            txns_by_id.insert(txn_id, txn);
        }
        for ((txn_id, tablet_id), record) in prt_records {
            highest_txn_id = highest_txn_id.max(txn_id);
            let txn = txns_by_id.entry(txn_id).or_insert_with(|| {
                warn!(
                    target: "tephra::txn",
                    txn_id,
                    %tablet_id,
                    "participant record without a transaction record"
                );
                Arc::new(TransactionEntry::new(txn_id, ""))
            });
            let participant = txn.get_or_create_participant(&tablet_id);
            let mut lock = participant.metadata().write();
            *lock.mutable_data() = record;
            lock.commit();
        }

        let mut registry = self.registry.lock();
        registry.highest_txn_id = registry.highest_txn_id.max(highest_txn_id);
        registry.txns_by_id = txns_by_id;
        Ok(())
    }

    /// Persist and create a new transaction owned by `user`.
    ///
    /// # Errors
    ///
    /// [`TephraError::TxnIdNotHigher`] if `txn_id` does not exceed every ID
    /// seen so far (including failed attempts); store errors if persistence
    /// fails, in which case the ID is still consumed.
    pub fn begin_transaction(&self, txn_id: i64, user: &str) -> Result<()> {
        {
            // Reserve the ID first. Serializing the ID check means at most
            // one call for a given transaction ID can get this far.
            let mut registry = self.registry.lock();
            if txn_id <= registry.highest_txn_id {
                return Err(TephraError::TxnIdNotHigher {
                    txn_id,
                    highest_txn_id: registry.highest_txn_id,
                });
            }
            registry.highest_txn_id = txn_id;
        }

        // Underlying store writes may race one another; the ID reservation
        // above already decided the winner.
        self.store.add_transaction(txn_id, user)?;

        // Persisted; initialize the in-memory state and make it visible.
        let txn = Arc::new(TransactionEntry::new(txn_id, user));
        {
            let mut lock = txn.metadata().write();
            lock.mutable_data().state = TxnState::Open;
            lock.commit();
        }
        let mut registry = self.registry.lock();
        let prev = registry.txns_by_id.insert(txn_id, txn);
        debug_assert!(prev.is_none(), "transaction {txn_id} registered twice");
        Ok(())
    }

    /// Begin committing the given transaction: `OPEN -> COMMIT_IN_PROGRESS`.
    /// Idempotent if commit is already in progress.
    ///
    /// # Errors
    ///
    /// Unknown transaction, wrong owner, or a state outside
    /// `{OPEN, COMMIT_IN_PROGRESS}`.
    pub fn begin_commit_transaction(&self, txn_id: i64, user: &str) -> Result<()> {
        let txn = self.get_transaction(txn_id, Some(user))?;

        let mut lock = txn.metadata().write();
        match lock.data().state {
            TxnState::CommitInProgress => return Ok(()),
            TxnState::Open => {}
            state => {
                return Err(TephraError::IllegalTxnState {
                    txn_id,
                    detail: format!("is not open: {state}"),
                });
            }
        }
        let staged = lock.mutable_data();
        staged.state = TxnState::CommitInProgress;
        self.store.update_transaction(staged)?;
        lock.commit();
        Ok(())
    }

    /// Finalize the commit: `COMMIT_IN_PROGRESS -> COMMITTED`. Idempotent if
    /// already committed. Not user-initiated, so takes no user.
    ///
    /// # Errors
    ///
    /// Unknown transaction, or a state outside
    /// `{COMMIT_IN_PROGRESS, COMMITTED}`.
    pub fn finalize_commit_transaction(&self, txn_id: i64) -> Result<()> {
        let txn = self.get_transaction(txn_id, None)?;

        let mut lock = txn.metadata().write();
        match lock.data().state {
            TxnState::Committed => return Ok(()),
            TxnState::CommitInProgress => {}
            state => {
                return Err(TephraError::IllegalTxnState {
                    txn_id,
                    detail: format!("is not committing: {state}"),
                });
            }
        }
        let staged = lock.mutable_data();
        staged.state = TxnState::Committed;
        self.store.update_transaction(staged)?;
        lock.commit();
        Ok(())
    }

    /// Abort the transaction: `{OPEN, COMMIT_IN_PROGRESS} -> ABORTED`.
    /// Idempotent if already aborted.
    ///
    /// # Errors
    ///
    /// Unknown transaction, wrong owner, or a terminal committed state.
    pub fn abort_transaction(&self, txn_id: i64, user: &str) -> Result<()> {
        let txn = self.get_transaction(txn_id, Some(user))?;

        let mut lock = txn.metadata().write();
        match lock.data().state {
            TxnState::Aborted => return Ok(()),
            TxnState::Open | TxnState::CommitInProgress => {}
            state => {
                return Err(TephraError::IllegalTxnState {
                    txn_id,
                    detail: format!("cannot be aborted: {state}"),
                });
            }
        }
        let staged = lock.mutable_data();
        staged.state = TxnState::Aborted;
        self.store.update_transaction(staged)?;
        lock.commit();
        Ok(())
    }

    /// Persist and attach a participant tablet to an open transaction.
    /// Idempotent if the participant is already open.
    ///
    /// The transaction is held in read mode across the registration, so it
    /// stays open for the duration of this call.
    ///
    /// # Errors
    ///
    /// Unknown transaction, wrong owner, transaction not open, or a
    /// participant already past registration.
    pub fn register_participant(&self, txn_id: i64, tablet_id: &str, user: &str) -> Result<()> {
        let txn = self.get_transaction(txn_id, Some(user))?;

        let txn_lock = txn.metadata().read();
        if txn_lock.state != TxnState::Open {
            return Err(TephraError::IllegalTxnState {
                txn_id,
                detail: format!("is not open: {}", txn_lock.state),
            });
        }

        let participant = txn.get_or_create_participant(tablet_id);
        let mut prt_lock = participant.metadata().write();
        match prt_lock.data().state {
            // Already registered; nothing more to do.
            TxnState::Open => return Ok(()),
            TxnState::Unknown => {}
            state => {
                return Err(TephraError::IllegalTxnState {
                    txn_id,
                    detail: format!("participant {tablet_id} entry already exists: {state}"),
                });
            }
        }
        prt_lock.mutable_data().state = TxnState::Open;

        self.store.add_participant(txn_id, tablet_id)?;

        // Persisted; publish the open participant.
        prt_lock.commit();
        Ok(())
    }

    /// The state of the given transaction.
    ///
    /// # Errors
    ///
    /// [`TephraError::TxnNotFound`] for unknown IDs.
    pub fn txn_state(&self, txn_id: i64) -> Result<TxnState> {
        let txn = self.get_transaction(txn_id, None)?;
        let state = txn.metadata().read().state;
        Ok(state)
    }

    /// The highest transaction ID ever attempted.
    #[must_use]
    pub fn highest_txn_id(&self) -> i64 {
        self.registry.lock().highest_txn_id
    }

    /// Map from transaction ID to the sorted tablet IDs of its participants.
    #[must_use]
    pub fn participants_by_txn_id(&self) -> BTreeMap<i64, Vec<String>> {
        let registry = self.registry.lock();
        registry
            .txns_by_id
            .iter()
            .map(|(&txn_id, txn)| {
                let mut ids = txn.participant_ids();
                ids.sort();
                (txn_id, ids)
            })
            .collect()
    }

    fn get_transaction(
        &self,
        txn_id: i64,
        user: Option<&str>,
    ) -> Result<Arc<TransactionEntry>> {
        let registry = self.registry.lock();
        let txn = registry.txns_by_id.get(&txn_id).cloned().ok_or_else(|| {
            TephraError::TxnNotFound {
                txn_id,
                highest_txn_id: registry.highest_txn_id,
            }
        })?;
        if let Some(user) = user {
            if txn.user() != user {
                return Err(TephraError::TxnNotOwned {
                    txn_id,
                    user: user.to_owned(),
                });
            }
        }
        Ok(txn)
    }
}
