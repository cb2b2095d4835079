//! # marrow-exec
//!
//! The top layer of MarrowDB: the schema catalog and its on-disk
//! persistence, the system manager that owns every heap file and index
//! handle and drives DDL, predicate evaluation over raw tuples, and the
//! pull-based executor pipeline (sequential scan, index scan,
//! projection, nested-loop join, and the insert / update / delete
//! sinks).
//!
//! Mutating executors keep heap and indexes consistent: every heap
//! change is synchronously mirrored into every affected B+-tree and
//! logged in the transaction's undo set, which the transaction manager
//! replays through [`SystemManager`]'s
//! [`UndoTarget`](marrow_txn::UndoTarget) implementation on abort.

#![warn(clippy::all)]

pub mod catalog;
pub mod executor;
pub mod predicate;
pub mod system;

pub use catalog::{ColDef, ColMeta, DbMeta, IndexMeta, TabMeta};
pub use predicate::{cond_check, CompOp, CondRhs, Condition, TabCol};
pub use system::SystemManager;
