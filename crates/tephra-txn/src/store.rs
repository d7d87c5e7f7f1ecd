//! The durable transaction status registry.
//!
//! The registry is a flat record log:
//!
//! ```text
//!   TRANSACTION  (txn_id)            -> user, state
//!   PARTICIPANT  (txn_id, tablet_id) -> state
//! ```
//!
//! There is a 1:N relationship between transaction records and participant
//! records. Readers rebuild the in-memory map by visiting all records once,
//! in any order, keeping the last write per key.
//!
//! The store itself enforces no consistency: it will happily record a
//! participant for a transaction it has never heard of. Callers serialize
//! their writes to avoid that.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use tephra_error::{Result, TephraError};

/// State of a transaction, or of one participant therein.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxnState {
    /// Never initialized; the state a participant is in before registration
    /// completes.
    Unknown,
    /// Accepting new statements and participants.
    Open,
    /// Commit has been requested; participants are being finalized.
    CommitInProgress,
    /// Terminal: committed.
    Committed,
    /// Terminal: aborted.
    Aborted,
}

impl std::fmt::Display for TxnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TxnState::Unknown => "UNKNOWN",
            TxnState::Open => "OPEN",
            TxnState::CommitInProgress => "COMMIT_IN_PROGRESS",
            TxnState::Committed => "COMMITTED",
            TxnState::Aborted => "ABORTED",
        })
    }
}

/// Persisted record for a transaction.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TxnStatusEntry {
    pub txn_id: i64,
    pub user: String,
    pub state: TxnState,
}

/// Persisted record for one participant tablet of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TxnParticipantEntry {
    pub txn_id: i64,
    pub tablet_id: String,
    pub state: TxnState,
}

/// One record in the registry log.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "entry_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusRecord {
    Transaction(TxnStatusEntry),
    Participant(TxnParticipantEntry),
}

/// The registry boundary consumed by the status manager.
///
/// Every mutation must be durable before it returns: the manager persists the
/// intended new state through this trait before committing the corresponding
/// in-memory transition, and abandons the transition if the write fails.
pub trait TxnStatusStore: Send + Sync {
    /// Visit every record once. Order is unspecified; readers fold with
    /// last-write-wins per `txn_id` / `(txn_id, tablet_id)` key.
    fn visit(&self, visitor: &mut dyn FnMut(StatusRecord)) -> Result<()>;

    /// Record the existence of a new transaction, initially OPEN.
    fn add_transaction(&self, txn_id: i64, user: &str) -> Result<()>;

    /// Record a transaction state change.
    fn update_transaction(&self, entry: &TxnStatusEntry) -> Result<()>;

    /// Record a new participant of a transaction, initially OPEN.
    fn add_participant(&self, txn_id: i64, tablet_id: &str) -> Result<()>;

    /// Record a participant state change.
    fn update_participant(&self, entry: &TxnParticipantEntry) -> Result<()>;
}

impl<S: TxnStatusStore + ?Sized> TxnStatusStore for std::sync::Arc<S> {
    fn visit(&self, visitor: &mut dyn FnMut(StatusRecord)) -> Result<()> {
        (**self).visit(visitor)
    }

    fn add_transaction(&self, txn_id: i64, user: &str) -> Result<()> {
        (**self).add_transaction(txn_id, user)
    }

    fn update_transaction(&self, entry: &TxnStatusEntry) -> Result<()> {
        (**self).update_transaction(entry)
    }

    fn add_participant(&self, txn_id: i64, tablet_id: &str) -> Result<()> {
        (**self).add_participant(txn_id, tablet_id)
    }

    fn update_participant(&self, entry: &TxnParticipantEntry) -> Result<()> {
        (**self).update_participant(entry)
    }
}

// ---------------------------------------------------------------------------
// MemStatusStore
// ---------------------------------------------------------------------------

/// In-memory record log. Used by tests and tooling; it keeps the exact
/// append order, so replay behaves like the durable store's.
#[derive(Debug, Default)]
pub struct MemStatusStore {
    records: Mutex<Vec<StatusRecord>>,
}

impl MemStatusStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-seeded with `records`, in the given order.
    #[must_use]
    pub fn with_records(records: Vec<StatusRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }

    fn append(&self, record: StatusRecord) {
        self.records.lock().push(record);
    }
}

impl TxnStatusStore for MemStatusStore {
    fn visit(&self, visitor: &mut dyn FnMut(StatusRecord)) -> Result<()> {
        for record in self.records.lock().iter() {
            visitor(record.clone());
        }
        Ok(())
    }

    fn add_transaction(&self, txn_id: i64, user: &str) -> Result<()> {
        self.append(StatusRecord::Transaction(TxnStatusEntry {
            txn_id,
            user: user.to_owned(),
            state: TxnState::Open,
        }));
        Ok(())
    }

    fn update_transaction(&self, entry: &TxnStatusEntry) -> Result<()> {
        self.append(StatusRecord::Transaction(entry.clone()));
        Ok(())
    }

    fn add_participant(&self, txn_id: i64, tablet_id: &str) -> Result<()> {
        self.append(StatusRecord::Participant(TxnParticipantEntry {
            txn_id,
            tablet_id: tablet_id.to_owned(),
            state: TxnState::Open,
        }));
        Ok(())
    }

    fn update_participant(&self, entry: &TxnParticipantEntry) -> Result<()> {
        self.append(StatusRecord::Participant(entry.clone()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// LogStatusStore
// ---------------------------------------------------------------------------

/// Durable registry: one JSON record per line, fsynced on every append.
///
/// The sync happens before the append returns, which is what lets the status
/// manager treat "store write returned Ok" as "safe to commit the in-memory
/// transition".
#[derive(Debug)]
pub struct LogStatusStore {
    file: Mutex<File>,
    path: PathBuf,
}

impl LogStatusStore {
    /// Open (creating if needed) the record log at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            file: Mutex::new(file),
            path,
        })
    }

    /// The path of the backing log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, record: &StatusRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)
            .map_err(|e| TephraError::corrupt(format!("cannot encode status record: {e}")))?;
        line.push('\n');
        let mut file = self.file.lock();
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }
}

impl TxnStatusStore for LogStatusStore {
    fn visit(&self, visitor: &mut dyn FnMut(StatusRecord)) -> Result<()> {
        // Hold the append lock so a visit never observes a torn tail.
        let _file = self.file.lock();
        let contents = std::fs::read_to_string(&self.path)?;
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            let record: StatusRecord = serde_json::from_str(line).map_err(|e| {
                TephraError::corrupt(format!("bad status record {line:?}: {e}"))
            })?;
            visitor(record);
        }
        Ok(())
    }

    fn add_transaction(&self, txn_id: i64, user: &str) -> Result<()> {
        self.append(&StatusRecord::Transaction(TxnStatusEntry {
            txn_id,
            user: user.to_owned(),
            state: TxnState::Open,
        }))
    }

    fn update_transaction(&self, entry: &TxnStatusEntry) -> Result<()> {
        self.append(&StatusRecord::Transaction(entry.clone()))
    }

    fn add_participant(&self, txn_id: i64, tablet_id: &str) -> Result<()> {
        self.append(&StatusRecord::Participant(TxnParticipantEntry {
            txn_id,
            tablet_id: tablet_id.to_owned(),
            state: TxnState::Open,
        }))
    }

    fn update_participant(&self, entry: &TxnParticipantEntry) -> Result<()> {
        self.append(&StatusRecord::Participant(entry.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_encoding_is_tagged() {
        let record = StatusRecord::Transaction(TxnStatusEntry {
            txn_id: 7,
            user: "gru".to_owned(),
            state: TxnState::CommitInProgress,
        });
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"entry_type\":\"TRANSACTION\""), "{json}");
        assert!(json.contains("\"state\":\"COMMIT_IN_PROGRESS\""), "{json}");

        let back: StatusRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_mem_store_replays_in_append_order() {
        let store = MemStatusStore::new();
        store.add_transaction(1, "gru").unwrap();
        store
            .update_transaction(&TxnStatusEntry {
                txn_id: 1,
                user: "gru".to_owned(),
                state: TxnState::Aborted,
            })
            .unwrap();
        store.add_participant(1, "tablet-a").unwrap();

        let mut seen = Vec::new();
        store.visit(&mut |record| seen.push(record)).unwrap();
        assert_eq!(seen.len(), 3);
        assert!(matches!(
            &seen[1],
            StatusRecord::Transaction(TxnStatusEntry {
                state: TxnState::Aborted,
                ..
            })
        ));
    }

    #[test]
    fn test_txn_state_display_matches_wire_names() {
        for (state, name) in [
            (TxnState::Unknown, "UNKNOWN"),
            (TxnState::Open, "OPEN"),
            (TxnState::CommitInProgress, "COMMIT_IN_PROGRESS"),
            (TxnState::Committed, "COMMITTED"),
            (TxnState::Aborted, "ABORTED"),
        ] {
            assert_eq!(state.to_string(), name);
            let wire = serde_json::to_string(&state).unwrap();
            assert_eq!(wire, format!("\"{name}\""));
        }
    }
}
