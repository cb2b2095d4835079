//! Sequential table scan.

use bytes::Bytes;

use marrow_common::{MarrowError, MarrowResult, Rid};
use marrow_storage::{HeapFile, HeapScan};
use marrow_txn::Context;

use crate::catalog::ColMeta;
use crate::predicate::{cond_check, Condition};
use crate::system::SystemManager;

use super::Executor;

/// Walks a table's heap in physical order, emitting tuples that satisfy
/// a conjunction of conditions. Takes the table's S lock.
pub struct SeqScan<'a> {
    heap: &'a HeapFile,
    conds: Vec<Condition>,
    cols: Vec<ColMeta>,
    len: usize,
    scan: Option<HeapScan<'a>>,
    rid: Rid,
}

impl<'a> std::fmt::Debug for SeqScan<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeqScan").finish()
    }
}

impl<'a> SeqScan<'a> {
    /// Creates a scan over `tab_name` filtered by `conds`.
    pub fn new(
        sm: &'a SystemManager,
        tab_name: &str,
        conds: Vec<Condition>,
        ctx: &Context<'_>,
    ) -> MarrowResult<Self> {
        let tab = sm.db().get_table(tab_name)?;
        let heap = sm.heap(tab_name)?;
        ctx.lock_mgr.lock_shared_on_table(ctx.txn, heap.fd())?;
        Ok(Self {
            heap,
            conds,
            cols: tab.cols.clone(),
            len: tab.tuple_len(),
            scan: None,
            rid: Rid::new(-1, -1),
        })
    }

    /// Advances the underlying scan until it sits on a matching tuple
    /// or runs out.
    fn seek_match(&mut self) -> MarrowResult<()> {
        let scan = self
            .scan
            .as_mut()
            .ok_or_else(|| MarrowError::internal("scan used before begin_tuple"))?;
        while !scan.is_end() {
            let rid = scan.rid();
            let record = self.heap.get_record(rid)?;
            if cond_check(&record, &self.conds, &self.cols)? {
                self.rid = rid;
                return Ok(());
            }
            scan.next()?;
        }
        Ok(())
    }
}

impl Executor for SeqScan<'_> {
    fn begin_tuple(&mut self) -> MarrowResult<()> {
        self.scan = Some(HeapScan::new(self.heap)?);
        self.seek_match()
    }

    fn next_tuple(&mut self) -> MarrowResult<()> {
        if let Some(scan) = self.scan.as_mut() {
            if !scan.is_end() {
                scan.next()?;
                self.seek_match()?;
            }
        }
        Ok(())
    }

    fn is_end(&self) -> bool {
        self.scan.as_ref().map_or(true, |s| s.is_end())
    }

    fn current(&self) -> MarrowResult<Bytes> {
        self.heap.get_record(self.rid)
    }

    fn rid(&self) -> Rid {
        self.rid
    }

    fn tuple_len(&self) -> usize {
        self.len
    }

    fn cols(&self) -> &[ColMeta] {
        &self.cols
    }
}
