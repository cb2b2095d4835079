//! Index scan: a range over a B+-tree, rechecked against the residual
//! conditions.

use bytes::Bytes;

use marrow_common::types::values::ColType;
use marrow_common::{Iid, MarrowError, MarrowResult, Rid};
use marrow_storage::{BTreeIndex, HeapFile, IxScan};
use marrow_txn::Context;

use crate::catalog::{ColMeta, IndexMeta};
use crate::predicate::{cond_check, CompOp, CondRhs, Condition};
use crate::system::SystemManager;

use super::Executor;

/// Scans one index range derived from the conditions, fetching each
/// candidate tuple from the heap and rechecking the full conjunction.
/// Takes the table's S lock.
pub struct IndexScan<'a> {
    heap: &'a HeapFile,
    index: &'a BTreeIndex,
    index_meta: IndexMeta,
    conds: Vec<Condition>,
    cols: Vec<ColMeta>,
    len: usize,
    tab_name: String,
    scan: Option<IxScan<'a>>,
    rid: Rid,
}

impl<'a> IndexScan<'a> {
    /// Creates an index scan over `tab_name` using the index identified
    /// by `index_col_names`.
    ///
    /// Conditions whose left side belongs to another table (as fed from
    /// a join) are flipped so the indexed column sits on the left.
    pub fn new(
        sm: &'a SystemManager,
        tab_name: &str,
        mut conds: Vec<Condition>,
        index_col_names: &[String],
        ctx: &Context<'_>,
    ) -> MarrowResult<Self> {
        let tab = sm.db().get_table(tab_name)?;
        let index_meta = tab.index_meta(index_col_names)?.clone();
        let heap = sm.heap(tab_name)?;
        let index = sm.index(tab_name, index_col_names)?;
        ctx.lock_mgr.lock_shared_on_table(ctx.txn, heap.fd())?;

        for cond in &mut conds {
            if !cond.lhs_col.tab_name.is_empty() && cond.lhs_col.tab_name != tab_name {
                if let CondRhs::Col(rhs_col) = &cond.rhs {
                    let rhs_col = rhs_col.clone();
                    let lhs = std::mem::replace(&mut cond.lhs_col, rhs_col);
                    cond.rhs = CondRhs::Col(lhs);
                    cond.op = cond.op.swap();
                }
            }
        }

        Ok(Self {
            heap,
            index,
            index_meta,
            conds,
            cols: tab.cols.clone(),
            len: tab.tuple_len(),
            tab_name: tab_name.to_string(),
            scan: None,
            rid: Rid::new(-1, -1),
        })
    }

    /// Derives the `[lower, upper)` bounds from the first condition that
    /// binds the index's leading column to a literal. `<>` never bounds
    /// the scan; every condition is rechecked per tuple anyway.
    fn derive_bounds(&self) -> MarrowResult<(Iid, Iid)> {
        let mut lower = self.index.leaf_begin()?;
        let mut upper = self.index.leaf_end()?;

        let first_col = &self.index_meta.cols[0];
        for cond in &self.conds {
            let CondRhs::Value(value) = &cond.rhs else {
                continue;
            };
            if cond.op == CompOp::Ne
                || cond.lhs_col.col_name != first_col.name
                || (!cond.lhs_col.tab_name.is_empty() && cond.lhs_col.tab_name != self.tab_name)
            {
                continue;
            }
            if value.col_type() != first_col.col_type {
                return Err(MarrowError::IncompatibleType {
                    expected: first_col.col_type.to_string(),
                    actual: value.col_type().to_string(),
                });
            }

            let raw = value.to_bytes(first_col.len)?;
            let key_lo = self.padded_key(&raw, false);
            let key_hi = self.padded_key(&raw, true);
            match cond.op {
                CompOp::Eq => {
                    lower = self.index.lower_bound(&key_lo)?;
                    upper = self.index.upper_bound(&key_hi)?;
                }
                CompOp::Lt => upper = self.index.lower_bound(&key_lo)?,
                CompOp::Le => upper = self.index.upper_bound(&key_hi)?,
                CompOp::Gt => lower = self.index.upper_bound(&key_hi)?,
                CompOp::Ge => lower = self.index.lower_bound(&key_lo)?,
                CompOp::Ne => unreachable!("<> filtered above"),
            }
            // Only the leading column bounds the range.
            break;
        }
        Ok((lower, upper))
    }

    /// Completes a leading-column prefix into a full composite key,
    /// padding the remaining columns with their smallest or largest
    /// possible bytes.
    fn padded_key(&self, prefix: &[u8], high: bool) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.index_meta.col_tot_len);
        key.extend_from_slice(prefix);
        for col in &self.index_meta.cols[1..] {
            match (col.col_type, high) {
                (ColType::Int, false) => key.extend_from_slice(&i32::MIN.to_le_bytes()),
                (ColType::Int, true) => key.extend_from_slice(&i32::MAX.to_le_bytes()),
                (ColType::Float, false) => key.extend_from_slice(&f64::NEG_INFINITY.to_le_bytes()),
                (ColType::Float, true) => key.extend_from_slice(&f64::INFINITY.to_le_bytes()),
                (ColType::String, false) => key.extend(std::iter::repeat(0x00).take(col.len)),
                (ColType::String, true) => key.extend(std::iter::repeat(0xFF).take(col.len)),
            }
        }
        key
    }

    fn seek_match(&mut self) -> MarrowResult<()> {
        let scan = self
            .scan
            .as_mut()
            .ok_or_else(|| MarrowError::internal("scan used before begin_tuple"))?;
        while !scan.is_end() {
            let rid = scan.rid()?;
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

impl Executor for IndexScan<'_> {
    fn begin_tuple(&mut self) -> MarrowResult<()> {
        let (lower, upper) = self.derive_bounds()?;
        self.scan = Some(IxScan::new(self.index, lower, upper));
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
