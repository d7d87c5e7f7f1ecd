use thiserror::Error;

/// Primary error type for tephra operations.
///
/// Structured variants for the failures callers are expected to handle.
/// Contract violations in the MVCC state machine are deliberately *not*
/// represented here: those are caller bugs and panic instead.
#[derive(Error, Debug)]
pub enum TephraError {
    // === Waiter outcomes ===
    /// A blocking wait reached its deadline before its condition held.
    #[error("timed out waiting for {condition}")]
    TimedOut { condition: String },

    /// A blocking wait (or a wait attempted after shutdown) was cut short.
    /// The reason names what shut down, e.g. "MVCC is closed".
    #[error("aborted: {reason}")]
    Aborted { reason: String },

    /// The MVCC clean time is still at its initial state, so the manager
    /// cannot yet answer visibility questions about applied operations.
    #[error("clean time has not yet been initialized")]
    CleanTimeNotInitialized,

    // === Transaction status machine ===
    /// The transaction is not registered with this status manager.
    #[error("transaction ID {txn_id} not found, current highest txn ID: {highest_txn_id}")]
    TxnNotFound { txn_id: i64, highest_txn_id: i64 },

    /// A user-initiated call named a transaction owned by someone else.
    #[error("transaction ID {txn_id} not owned by {user}")]
    TxnNotOwned { txn_id: i64, user: String },

    /// Transaction IDs must be claimed in strictly increasing order.
    #[error("transaction ID {txn_id} is not higher than the highest ID so far: {highest_txn_id}")]
    TxnIdNotHigher { txn_id: i64, highest_txn_id: i64 },

    /// The requested transition is not legal from the entry's current state.
    #[error("transaction ID {txn_id}: {detail}")]
    IllegalTxnState { txn_id: i64, detail: String },

    // === Clock ===
    /// The clock implementation cannot provide the requested guarantee.
    #[error("not supported: {detail}")]
    Unsupported { detail: String },

    /// A caller-supplied value is outside the accepted domain.
    #[error("invalid argument: {detail}")]
    InvalidArgument { detail: String },

    // === Storage ===
    /// Underlying I/O failure while reading or writing a registry.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted registry record could not be decoded.
    #[error("status registry is corrupt: {detail}")]
    Corrupt { detail: String },
}

impl TephraError {
    /// Build a [`TephraError::TimedOut`] from a wait-condition description.
    pub fn timed_out(condition: impl Into<String>) -> Self {
        Self::TimedOut {
            condition: condition.into(),
        }
    }

    /// Build a [`TephraError::Aborted`] from a shutdown reason.
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted {
            reason: reason.into(),
        }
    }

    /// Build a [`TephraError::Unsupported`].
    pub fn unsupported(detail: impl Into<String>) -> Self {
        Self::Unsupported {
            detail: detail.into(),
        }
    }

    /// Build a [`TephraError::InvalidArgument`].
    pub fn invalid_argument(detail: impl Into<String>) -> Self {
        Self::InvalidArgument {
            detail: detail.into(),
        }
    }

    /// Build a [`TephraError::Corrupt`].
    pub fn corrupt(detail: impl Into<String>) -> Self {
        Self::Corrupt {
            detail: detail.into(),
        }
    }

    /// True for deadline expiry on a waiter path.
    #[must_use]
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    /// True when a wait was cut short by shutdown.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    /// True when the named transaction does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::TxnNotFound { .. })
    }

    /// True for transitions rejected by the transaction state machine.
    #[must_use]
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, Self::IllegalTxnState { .. })
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T, E = TephraError> = std::result::Result<T, E>;
