//! Delete sink.

use marrow_common::{MarrowResult, Rid};
use marrow_storage::HeapFile;
use marrow_txn::{Context, WriteRecord, WriteType};

use crate::catalog::TabMeta;
use crate::system::SystemManager;

/// Deletes the tuples at a pre-collected list of `Rid`s: IX on the
/// table, then per tuple an X record lock, removal of every index key,
/// the heap delete, and an undo-log entry carrying the deleted image.
pub struct DeleteExecutor<'a> {
    sm: &'a SystemManager,
    tab: TabMeta,
    heap: &'a HeapFile,
    rids: Vec<Rid>,
    ctx: &'a Context<'a>,
}

impl<'a> DeleteExecutor<'a> {
    /// Creates a delete of `rids` from `tab_name`.
    pub fn new(
        sm: &'a SystemManager,
        tab_name: &str,
        rids: Vec<Rid>,
        ctx: &'a Context<'a>,
    ) -> MarrowResult<Self> {
        let tab = sm.db().get_table(tab_name)?.clone();
        let heap = sm.heap(tab_name)?;
        Ok(Self {
            sm,
            tab,
            heap,
            rids,
            ctx,
        })
    }

    /// Runs the delete, returning how many tuples were removed.
    pub fn execute(&mut self) -> MarrowResult<usize> {
        self.ctx
            .lock_mgr
            .lock_ix_on_table(self.ctx.txn, self.heap.fd())?;

        for &rid in &self.rids {
            self.ctx
                .lock_mgr
                .lock_exclusive_on_record(self.ctx.txn, rid, self.heap.fd())?;
            let record = self.heap.get_record(rid)?;

            self.sm.for_each_index(&self.tab.name, |meta, handle| {
                handle.delete_entry(&meta.build_key(&record))?;
                Ok(())
            })?;
            self.heap.delete_record(rid)?;
            self.ctx.txn.append_write_record(WriteRecord::new(
                WriteType::Delete,
                self.tab.name.as_str(),
                rid,
                record,
            ));
        }
        Ok(self.rids.len())
    }
}
