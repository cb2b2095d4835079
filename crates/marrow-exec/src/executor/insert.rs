//! Insert sink.

use bytes::Bytes;

use marrow_common::types::values::Value;
use marrow_common::{MarrowError, MarrowResult, Rid};
use marrow_storage::HeapFile;
use marrow_txn::{Context, WriteRecord, WriteType};

use crate::catalog::TabMeta;
use crate::system::SystemManager;

/// Inserts one tuple: IX on the table, heap insert, X on the new
/// record, a key into every index, and an undo-log entry.
pub struct InsertExecutor<'a> {
    sm: &'a SystemManager,
    tab: TabMeta,
    heap: &'a HeapFile,
    values: Vec<Value>,
    ctx: &'a Context<'a>,
}

impl<'a> std::fmt::Debug for InsertExecutor<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InsertExecutor").finish()
    }
}

impl<'a> InsertExecutor<'a> {
    /// Creates an insert of `values` into `tab_name`.
    pub fn new(
        sm: &'a SystemManager,
        tab_name: &str,
        values: Vec<Value>,
        ctx: &'a Context<'a>,
    ) -> MarrowResult<Self> {
        let tab = sm.db().get_table(tab_name)?.clone();
        if values.len() != tab.cols.len() {
            return Err(MarrowError::InvalidValueCount {
                expected: tab.cols.len(),
                actual: values.len(),
            });
        }
        let heap = sm.heap(tab_name)?;
        Ok(Self {
            sm,
            tab,
            heap,
            values,
            ctx,
        })
    }

    /// Runs the insert, returning the new tuple's address.
    pub fn execute(&mut self) -> MarrowResult<Rid> {
        let mut record = vec![0u8; self.tab.tuple_len()];
        for (col, value) in self.tab.cols.iter().zip(self.values.iter()) {
            if value.col_type() != col.col_type {
                return Err(MarrowError::IncompatibleType {
                    expected: col.col_type.to_string(),
                    actual: value.col_type().to_string(),
                });
            }
            let raw = value.to_bytes(col.len)?;
            record[col.offset..col.offset + col.len].copy_from_slice(&raw);
        }

        self.ctx
            .lock_mgr
            .lock_ix_on_table(self.ctx.txn, self.heap.fd())?;
        let rid = self.heap.insert_record(&record)?;
        // Log before mirroring so an abort between the two still
        // reverses the heap insert.
        self.ctx.txn.append_write_record(WriteRecord::new(
            WriteType::Insert,
            self.tab.name.as_str(),
            rid,
            Bytes::copy_from_slice(&record),
        ));
        self.ctx
            .lock_mgr
            .lock_exclusive_on_record(self.ctx.txn, rid, self.heap.fd())?;

        self.sm.for_each_index(&self.tab.name, |meta, handle| {
            handle.insert_entry(&meta.build_key(&record), rid)?;
            Ok(())
        })?;
        Ok(rid)
    }
}
