//! Projection: narrow and reorder columns into a tighter tuple layout.

use bytes::Bytes;

use marrow_common::{MarrowError, MarrowResult, Rid};

use crate::catalog::ColMeta;
use crate::predicate::TabCol;

use super::Executor;

/// Re-packs selected columns of the child's tuples contiguously, in
/// selector order.
pub struct Projection<'a> {
    child: Box<dyn Executor + 'a>,
    cols: Vec<ColMeta>,
    sel_idxs: Vec<usize>,
    len: usize,
}

impl<'a> Projection<'a> {
    /// Creates a projection of `sel_cols` over `child`.
    pub fn new(child: Box<dyn Executor + 'a>, sel_cols: &[TabCol]) -> MarrowResult<Self> {
        let child_cols = child.cols();
        let mut cols = Vec::with_capacity(sel_cols.len());
        let mut sel_idxs = Vec::with_capacity(sel_cols.len());
        let mut offset = 0;
        for sel in sel_cols {
            let idx = child_cols
                .iter()
                .position(|c| {
                    c.name == sel.col_name
                        && (sel.tab_name.is_empty() || c.tab_name == sel.tab_name)
                })
                .ok_or_else(|| MarrowError::ColumnNotFound {
                    column: format!("{}.{}", sel.tab_name, sel.col_name),
                })?;
            sel_idxs.push(idx);
            let mut col = child_cols[idx].clone();
            col.offset = offset;
            offset += col.len;
            cols.push(col);
        }
        Ok(Self {
            child,
            cols,
            sel_idxs,
            len: offset,
        })
    }
}

impl Executor for Projection<'_> {
    fn begin_tuple(&mut self) -> MarrowResult<()> {
        self.child.begin_tuple()
    }

    fn next_tuple(&mut self) -> MarrowResult<()> {
        self.child.next_tuple()
    }

    fn is_end(&self) -> bool {
        self.child.is_end()
    }

    fn current(&self) -> MarrowResult<Bytes> {
        let src = self.child.current()?;
        let child_cols = self.child.cols();
        let mut out = vec![0u8; self.len];
        for (sel, col) in self.sel_idxs.iter().zip(self.cols.iter()) {
            let src_col = &child_cols[*sel];
            out[col.offset..col.offset + col.len]
                .copy_from_slice(&src[src_col.offset..src_col.offset + src_col.len]);
        }
        Ok(Bytes::from(out))
    }

    fn rid(&self) -> Rid {
        self.child.rid()
    }

    fn tuple_len(&self) -> usize {
        self.len
    }

    fn cols(&self) -> &[ColMeta] {
        &self.cols
    }
}
