//! The engine-wide error type.
//!
//! Two classes of failure flow through [`MarrowError`]:
//!
//! - **User errors** (missing entities, type mismatches, constraint
//!   violations) are raised synchronously at the offending operation and
//!   never mutate state.
//! - **Transaction aborts** originate inside lock acquisition; the caller
//!   is expected to catch them, roll the transaction back through the
//!   transaction manager, and propagate the failure.
//!
//! `Internal` marks invariant violations, i.e. bugs.

use std::fmt;

use thiserror::Error;

use crate::types::ids::TxnId;

/// Why a transaction was forced to abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortReason {
    /// A lock was requested after the transaction started releasing locks.
    LockOnShrinking,
    /// A conflicting lock was held by another transaction; the requester
    /// is aborted instead of waiting.
    DeadlockPrevention,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::LockOnShrinking => write!(f, "lock requested in shrinking phase"),
            AbortReason::DeadlockPrevention => write!(f, "deadlock prevention"),
        }
    }
}

/// The main error type for MarrowDB.
#[derive(Debug, Error)]
pub enum MarrowError {
    /// Database directory already exists.
    #[error("database '{name}' already exists")]
    DatabaseExists {
        /// The database name.
        name: String,
    },

    /// Database directory does not exist.
    #[error("database '{name}' not found")]
    DatabaseNotFound {
        /// The database name.
        name: String,
    },

    /// Table already exists in the catalog.
    #[error("table '{table}' already exists")]
    TableExists {
        /// The table name.
        table: String,
    },

    /// Table not present in the catalog.
    #[error("table '{table}' not found")]
    TableNotFound {
        /// The table name.
        table: String,
    },

    /// Column not present in a table.
    #[error("column '{column}' not found")]
    ColumnNotFound {
        /// The `table.column` path.
        column: String,
    },

    /// Index not present on a table.
    #[error("index {table}({columns}) not found")]
    IndexNotFound {
        /// The table name.
        table: String,
        /// Comma-joined index column names.
        columns: String,
    },

    /// Index already present on a table.
    #[error("index {table}({columns}) already exists")]
    IndexExists {
        /// The table name.
        table: String,
        /// Comma-joined index column names.
        columns: String,
    },

    /// A value's type does not match the column's declared type.
    #[error("incompatible type: expected {expected}, got {actual}")]
    IncompatibleType {
        /// Declared column type.
        expected: String,
        /// Supplied value type.
        actual: String,
    },

    /// An INSERT supplied the wrong number of values.
    #[error("invalid value count: expected {expected}, got {actual}")]
    InvalidValueCount {
        /// Number of columns in the table.
        expected: usize,
        /// Number of values supplied.
        actual: usize,
    },

    /// A string value exceeds its column width.
    #[error("string of length {len} exceeds column width {max}")]
    StringOverflow {
        /// Actual string length.
        len: usize,
        /// Declared column width.
        max: usize,
    },

    /// A record slot is empty or the Rid is stale.
    #[error("record not found at page {page_no}, slot {slot_no}")]
    RecordNotFound {
        /// The heap page.
        page_no: i32,
        /// The slot within the page.
        slot_no: i32,
    },

    /// A page number lies outside the file.
    #[error("page {page_no} does not exist in file {fd}")]
    PageNotExist {
        /// The file descriptor.
        fd: i32,
        /// The out-of-range page number.
        page_no: i32,
    },

    /// A key expected in an index was not there.
    #[error("index entry not found")]
    IndexEntryNotFound,

    /// The transaction must abort; the caller rolls it back and
    /// propagates the failure.
    #[error("transaction {txn_id} aborted: {reason}")]
    TransactionAborted {
        /// The aborted transaction.
        txn_id: TxnId,
        /// Why it was aborted.
        reason: AbortReason,
    },

    /// Internal invariant violation - this indicates a bug.
    #[error("internal error: {message}")]
    Internal {
        /// What went wrong.
        message: String,
    },

    /// I/O error from the underlying system.
    #[error("I/O error: {source}")]
    Io {
        /// The underlying error.
        #[from]
        source: std::io::Error,
    },
}

impl MarrowError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True if this error carries a forced transaction abort.
    #[must_use]
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::TransactionAborted { .. })
    }

    /// True for user errors that leave engine state untouched.
    #[must_use]
    pub fn is_user_error(&self) -> bool {
        !matches!(
            self,
            Self::TransactionAborted { .. } | Self::Internal { .. } | Self::Io { .. }
        )
    }
}

/// Result alias used across the engine.
pub type MarrowResult<T> = Result<T, MarrowError>;
