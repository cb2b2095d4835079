//! # marrow-common
//!
//! Shared foundation for MarrowDB: typed identifiers, column values and
//! their on-disk comparison rules, the engine-wide error type, and the
//! page-layout constants every storage component agrees on.
//!
//! Everything here is deliberately dependency-light so that the storage,
//! transaction, and executor crates can all sit on top of it without
//! cycles.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod constants;
pub mod error;
pub mod types;

pub use error::{AbortReason, MarrowError, MarrowResult};
pub use types::ids::{Iid, PageId, Rid, TxnId};
pub use types::values::{compare_keys, ix_compare, ColType, Value};
