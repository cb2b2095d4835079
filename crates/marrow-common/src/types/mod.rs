//! Core value and identifier types.

pub mod ids;
pub mod values;

pub use ids::{Iid, PageId, Rid, TxnId};
pub use values::{compare_keys, ix_compare, ColType, Value};
