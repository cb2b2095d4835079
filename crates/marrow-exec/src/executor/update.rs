//! Update sink.

use marrow_common::types::values::Value;
use marrow_common::{MarrowError, MarrowResult, Rid};
use marrow_storage::HeapFile;
use marrow_txn::{Context, WriteRecord, WriteType};

use crate::catalog::TabMeta;
use crate::predicate::TabCol;
use crate::system::SystemManager;

/// One `SET column = value` assignment.
#[derive(Debug, Clone)]
pub struct SetClause {
    /// Target column.
    pub lhs: TabCol,
    /// New value.
    pub rhs: Value,
}

/// Updates the tuples at a pre-collected list of `Rid`s in place.
///
/// Per tuple: X record lock, drop the old key from every index, the
/// in-place heap overwrite, insert the new key into every index, and an
/// undo-log entry carrying the pre-update image. The index keys are
/// cycled whether or not they actually changed.
pub struct UpdateExecutor<'a> {
    sm: &'a SystemManager,
    tab: TabMeta,
    heap: &'a HeapFile,
    set_clauses: Vec<SetClause>,
    rids: Vec<Rid>,
    ctx: &'a Context<'a>,
}

impl<'a> UpdateExecutor<'a> {
    /// Creates an update of `rids` in `tab_name`.
    pub fn new(
        sm: &'a SystemManager,
        tab_name: &str,
        set_clauses: Vec<SetClause>,
        rids: Vec<Rid>,
        ctx: &'a Context<'a>,
    ) -> MarrowResult<Self> {
        let tab = sm.db().get_table(tab_name)?.clone();
        let heap = sm.heap(tab_name)?;
        Ok(Self {
            sm,
            tab,
            heap,
            set_clauses,
            rids,
            ctx,
        })
    }

    /// Runs the update, returning how many tuples were rewritten.
    pub fn execute(&mut self) -> MarrowResult<usize> {
        self.ctx
            .lock_mgr
            .lock_ix_on_table(self.ctx.txn, self.heap.fd())?;

        for &rid in &self.rids {
            self.ctx
                .lock_mgr
                .lock_exclusive_on_record(self.ctx.txn, rid, self.heap.fd())?;

            let old = self.heap.get_record(rid)?;
            let mut new_record = old.to_vec();
            for clause in &self.set_clauses {
                let col = self.tab.col(&clause.lhs.col_name)?;
                if clause.rhs.col_type() != col.col_type {
                    return Err(MarrowError::IncompatibleType {
                        expected: col.col_type.to_string(),
                        actual: clause.rhs.col_type().to_string(),
                    });
                }
                let raw = clause.rhs.to_bytes(col.len)?;
                new_record[col.offset..col.offset + col.len].copy_from_slice(&raw);
            }

            self.sm.for_each_index(&self.tab.name, |meta, handle| {
                handle.delete_entry(&meta.build_key(&old))?;
                Ok(())
            })?;
            self.heap.update_record(rid, &new_record)?;
            self.sm.for_each_index(&self.tab.name, |meta, handle| {
                handle.insert_entry(&meta.build_key(&new_record), rid)?;
                Ok(())
            })?;

            self.ctx.txn.append_write_record(WriteRecord::new(
                WriteType::Update,
                self.tab.name.as_str(),
                rid,
                old,
            ));
        }
        Ok(self.rids.len())
    }
}
