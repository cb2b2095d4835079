//! Ordered range scan over a B+-tree.

use marrow_common::{Iid, MarrowResult, Rid};

use super::tree::BTreeIndex;

/// Walks index entries from an inclusive lower [`Iid`] to an exclusive
/// upper [`Iid`], following the leaf chain.
pub struct IxScan<'a> {
    index: &'a BTreeIndex,
    iid: Iid,
    end: Iid,
}

impl<'a> IxScan<'a> {
    /// Creates a scan over `[lower, upper)`.
    pub fn new(index: &'a BTreeIndex, lower: Iid, upper: Iid) -> Self {
        Self {
            index,
            iid: lower,
            end: upper,
        }
    }

    /// Whether the scan is exhausted.
    pub fn is_end(&self) -> bool {
        self.iid == self.end
    }

    /// The current position.
    pub fn iid(&self) -> Iid {
        self.iid
    }

    /// The heap address stored at the current position.
    pub fn rid(&self) -> MarrowResult<Rid> {
        self.index.get_rid(self.iid)
    }

    /// Advances to the next entry.
    pub fn next(&mut self) -> MarrowResult<()> {
        if !self.is_end() {
            self.iid = self.index.next_iid(self.iid)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use marrow_common::constants::BUFFER_POOL_SIZE;
    use marrow_common::types::values::ColType;

    use crate::buffer::BufferPool;
    use crate::disk::DiskManager;

    use super::*;

    fn open_index() -> (TempDir, BTreeIndex) {
        let dir = TempDir::new().unwrap();
        let disk = Arc::new(DiskManager::new());
        let path = dir.path().join("t_a_.idx");
        BTreeIndex::create(&disk, &path, &[ColType::Int], &[4]).unwrap();
        let pool = Arc::new(BufferPool::new(disk, BUFFER_POOL_SIZE));
        let index = BTreeIndex::open(pool, &path).unwrap();
        (dir, index)
    }

    fn int_key(v: i32) -> Vec<u8> {
        v.to_le_bytes().to_vec()
    }

    #[test]
    fn scan_a_range() {
        let (_dir, index) = open_index();
        for v in 0..1000 {
            index.insert_entry(&int_key(v), Rid::new(1, v)).unwrap();
        }

        let lower = index.lower_bound(&int_key(100)).unwrap();
        let upper = index.upper_bound(&int_key(199)).unwrap();
        let mut scan = IxScan::new(&index, lower, upper);
        let mut seen = Vec::new();
        while !scan.is_end() {
            seen.push(scan.rid().unwrap().slot_no);
            scan.next().unwrap();
        }
        assert_eq!(seen, (100..200).collect::<Vec<i32>>());
    }

    #[test]
    fn lower_equals_upper_yields_nothing() {
        let (_dir, index) = open_index();
        for v in 0..10 {
            index.insert_entry(&int_key(v), Rid::new(1, v)).unwrap();
        }
        let at = index.lower_bound(&int_key(5)).unwrap();
        let scan = IxScan::new(&index, at, at);
        assert!(scan.is_end());
    }

    #[test]
    fn scan_over_empty_tree() {
        let (_dir, index) = open_index();
        let lower = index.leaf_begin().unwrap();
        let upper = index.leaf_end().unwrap();
        let scan = IxScan::new(&index, lower, upper);
        assert!(scan.is_end());
    }
}
