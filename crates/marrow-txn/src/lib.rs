//! # marrow-txn
//!
//! Concurrency control for MarrowDB:
//!
//! - [`lock`]: a multi-granularity (table / record) two-phase-locking
//!   lock manager that never waits. A request either succeeds, upgrades
//!   an existing lock, or aborts the requesting transaction on conflict,
//!   so deadlocks are prevented rather than detected.
//! - [`manager`]: transaction lifecycle. Each transaction carries an
//!   undo log of write records and the set of locks it holds; commit
//!   discards the undo log and releases locks, abort replays the undo
//!   log in reverse through an [`manager::UndoTarget`] before releasing.
//!
//! Because no lock request ever blocks, two conflicting transactions
//! never overlap on the same data and every committed schedule is
//! conflict-serializable.

#![warn(clippy::all)]

pub mod lock;
pub mod manager;

pub use lock::{Context, LockDataId, LockManager, LockMode, LockStats};
pub use manager::{
    Transaction, TransactionManager, TransactionState, UndoTarget, WriteRecord, WriteType,
};
