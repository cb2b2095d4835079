//! Pull-based physical operators.
//!
//! Read operators ([`SeqScan`], [`IndexScan`], [`Projection`],
//! [`NestedLoopJoin`]) implement the [`Executor`] iterator contract and
//! compose through boxed children. The mutating sinks
//! ([`InsertExecutor`], [`UpdateExecutor`], [`DeleteExecutor`]) run to
//! completion in one `execute` call; each one locks, mutates the heap,
//! mirrors the change into every index, and appends to the
//! transaction's undo log.

mod delete;
mod index_scan;
mod insert;
mod nested_loop_join;
mod projection;
mod seq_scan;
mod update;

use bytes::Bytes;

use marrow_common::{MarrowResult, Rid};

use crate::catalog::ColMeta;

pub use delete::DeleteExecutor;
pub use index_scan::IndexScan;
pub use insert::InsertExecutor;
pub use nested_loop_join::NestedLoopJoin;
pub use projection::Projection;
pub use seq_scan::SeqScan;
pub use update::{SetClause, UpdateExecutor};

/// The iterator contract shared by every read operator.
pub trait Executor {
    /// Positions the operator on its first output tuple.
    fn begin_tuple(&mut self) -> MarrowResult<()>;

    /// Advances to the next output tuple.
    fn next_tuple(&mut self) -> MarrowResult<()>;

    /// Whether the operator is exhausted.
    fn is_end(&self) -> bool;

    /// The current output tuple's image.
    fn current(&self) -> MarrowResult<Bytes>;

    /// The heap address of the current tuple, when one exists.
    fn rid(&self) -> Rid;

    /// Width of one output tuple.
    fn tuple_len(&self) -> usize;

    /// Column layout of the output tuples.
    fn cols(&self) -> &[ColMeta];
}

/// Drains an operator, collecting the `Rid` of every output tuple.
/// DML callers use this to pin down the target rows before mutating.
pub fn collect_rids(exec: &mut dyn Executor) -> MarrowResult<Vec<Rid>> {
    let mut rids = Vec::new();
    exec.begin_tuple()?;
    while !exec.is_end() {
        rids.push(exec.rid());
        exec.next_tuple()?;
    }
    Ok(rids)
}

/// Drains an operator, collecting every output tuple image.
pub fn collect_records(exec: &mut dyn Executor) -> MarrowResult<Vec<Bytes>> {
    let mut records = Vec::new();
    exec.begin_tuple()?;
    while !exec.is_end() {
        records.push(exec.current()?);
        exec.next_tuple()?;
    }
    Ok(records)
}
