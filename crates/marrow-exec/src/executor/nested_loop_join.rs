//! Nested-loop inner join.

use bytes::Bytes;

use marrow_common::{MarrowResult, Rid};

use crate::catalog::ColMeta;
use crate::predicate::{cond_check, Condition};

use super::Executor;

/// Left-deep nested-loop join with restart-right semantics: for each
/// left tuple the right side is drained fully, then the left advances
/// and the right restarts. Combined tuples that pass the join predicate
/// are emitted.
pub struct NestedLoopJoin<'a> {
    left: Box<dyn Executor + 'a>,
    right: Box<dyn Executor + 'a>,
    conds: Vec<Condition>,
    cols: Vec<ColMeta>,
    len: usize,
}

impl<'a> NestedLoopJoin<'a> {
    /// Creates an inner join of `left` and `right` on `conds`.
    pub fn new(
        left: Box<dyn Executor + 'a>,
        right: Box<dyn Executor + 'a>,
        conds: Vec<Condition>,
    ) -> Self {
        let mut cols = left.cols().to_vec();
        let left_len = left.tuple_len();
        for col in right.cols() {
            let mut col = col.clone();
            col.offset += left_len;
            cols.push(col);
        }
        let len = left_len + right.tuple_len();
        Self {
            left,
            right,
            conds,
            cols,
            len,
        }
    }

    fn combined(&self) -> MarrowResult<Bytes> {
        let l = self.left.current()?;
        let r = self.right.current()?;
        let mut out = Vec::with_capacity(self.len);
        out.extend_from_slice(&l);
        out.extend_from_slice(&r);
        Ok(Bytes::from(out))
    }

    /// Walks the cross product forward until the current combination
    /// passes the predicate or the left side runs out.
    fn seek_match(&mut self) -> MarrowResult<()> {
        loop {
            if self.left.is_end() {
                return Ok(());
            }
            if self.right.is_end() {
                self.left.next_tuple()?;
                if self.left.is_end() {
                    return Ok(());
                }
                self.right.begin_tuple()?;
                continue;
            }
            let record = self.combined()?;
            if cond_check(&record, &self.conds, &self.cols)? {
                return Ok(());
            }
            self.right.next_tuple()?;
        }
    }
}

impl Executor for NestedLoopJoin<'_> {
    fn begin_tuple(&mut self) -> MarrowResult<()> {
        self.left.begin_tuple()?;
        if self.left.is_end() {
            return Ok(());
        }
        self.right.begin_tuple()?;
        self.seek_match()
    }

    fn next_tuple(&mut self) -> MarrowResult<()> {
        if self.left.is_end() {
            return Ok(());
        }
        self.right.next_tuple()?;
        self.seek_match()
    }

    fn is_end(&self) -> bool {
        self.left.is_end()
    }

    fn current(&self) -> MarrowResult<Bytes> {
        self.combined()
    }

    fn rid(&self) -> Rid {
        // A joined tuple has no single heap address.
        Rid::new(-1, -1)
    }

    fn tuple_len(&self) -> usize {
        self.len
    }

    fn cols(&self) -> &[ColMeta] {
        &self.cols
    }
}
