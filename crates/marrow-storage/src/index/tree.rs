//! The B+-tree handle: lookups, ordered bounds, insert with splits, and
//! delete with coalescing / redistribution.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use marrow_common::constants::{
    IX_FILE_HDR_PAGE, IX_INIT_NUM_PAGES, IX_LEAF_HEADER_PAGE, IX_NO_PAGE, PAGE_SIZE,
};
use marrow_common::types::values::ColType;
use marrow_common::{Iid, MarrowError, MarrowResult, PageId, Rid};

use crate::buffer::BufferPool;
use crate::disk::DiskManager;

use super::node::{IxNode, KeySchema};

/// Mutable tree-shape state, persisted in the file header.
///
/// The mutex around it doubles as the coarse root latch: every public
/// tree operation runs holding it.
struct TreeState {
    root_page: i32,
    first_leaf: i32,
    last_leaf: i32,
    num_pages: i32,
}

impl TreeState {
    const FIXED_SIZE: usize = 28;

    fn serialize(&self, schema: &KeySchema, buf: &mut [u8]) {
        let mut w = |off: usize, v: i32| buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
        w(0, self.root_page);
        w(4, self.first_leaf);
        w(8, self.last_leaf);
        w(12, self.num_pages);
        w(16, schema.col_tot_len as i32);
        w(20, schema.order as i32);
        w(24, schema.col_types.len() as i32);
        let mut off = Self::FIXED_SIZE;
        for (&ty, &len) in schema.col_types.iter().zip(schema.col_lens.iter()) {
            buf[off] = match ty {
                ColType::Int => 0,
                ColType::Float => 1,
                ColType::String => 2,
            };
            buf[off + 1..off + 5].copy_from_slice(&(len as i32).to_le_bytes());
            off += 5;
        }
    }

    fn deserialize(buf: &[u8]) -> MarrowResult<(Self, KeySchema)> {
        let r = |off: usize| i32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);
        let state = Self {
            root_page: r(0),
            first_leaf: r(4),
            last_leaf: r(8),
            num_pages: r(12),
        };
        let col_num = r(24) as usize;
        let mut col_types = Vec::with_capacity(col_num);
        let mut col_lens = Vec::with_capacity(col_num);
        let mut off = Self::FIXED_SIZE;
        for _ in 0..col_num {
            let ty = match buf[off] {
                0 => ColType::Int,
                1 => ColType::Float,
                2 => ColType::String,
                other => {
                    return Err(MarrowError::internal(format!(
                        "bad column type tag {other} in index header"
                    )))
                }
            };
            col_types.push(ty);
            col_lens.push(r(off + 1) as usize);
            off += 5;
        }
        Ok((state, KeySchema::new(col_types, col_lens)))
    }
}

/// A persistent ordered map from composite key to [`Rid`].
///
/// Keys are unique; inserting an existing key is a no-op. All operations
/// serialize on one internal latch.
pub struct BTreeIndex {
    fd: i32,
    pool: Arc<BufferPool>,
    schema: Arc<KeySchema>,
    state: Mutex<TreeState>,
}

impl BTreeIndex {
    /// Creates an empty index file keyed by the given columns.
    pub fn create(
        disk: &DiskManager,
        path: impl AsRef<Path>,
        col_types: &[ColType],
        col_lens: &[usize],
    ) -> MarrowResult<()> {
        let schema = KeySchema::new(col_types.to_vec(), col_lens.to_vec());
        if schema.order < 4 {
            return Err(MarrowError::internal(format!(
                "key of {} bytes is too wide for an index page",
                schema.col_tot_len
            )));
        }

        disk.create_file(&path)?;
        let fd = disk.open_file(&path)?;

        let state = TreeState {
            root_page: IX_NO_PAGE,
            first_leaf: IX_LEAF_HEADER_PAGE,
            last_leaf: IX_LEAF_HEADER_PAGE,
            num_pages: IX_INIT_NUM_PAGES,
        };
        let mut page = vec![0u8; PAGE_SIZE];
        state.serialize(&schema, &mut page);
        disk.write_page(fd, IX_FILE_HDR_PAGE, &page)?;

        // The leaf-chain sentinel links to itself while the tree is empty.
        let mut page = vec![0u8; PAGE_SIZE];
        page[0..4].copy_from_slice(&1i32.to_le_bytes()); // is_leaf
        page[8..12].copy_from_slice(&IX_NO_PAGE.to_le_bytes()); // parent
        page[12..16].copy_from_slice(&IX_LEAF_HEADER_PAGE.to_le_bytes()); // prev_leaf
        page[16..20].copy_from_slice(&IX_LEAF_HEADER_PAGE.to_le_bytes()); // next_leaf
        page[20..24].copy_from_slice(&IX_NO_PAGE.to_le_bytes()); // next_free
        disk.write_page(fd, IX_LEAF_HEADER_PAGE, &page)?;

        disk.close_file(fd)?;
        Ok(())
    }

    /// Opens an existing index file.
    pub fn open(pool: Arc<BufferPool>, path: impl AsRef<Path>) -> MarrowResult<Self> {
        let disk = Arc::clone(pool.disk());
        let fd = disk.open_file(&path)?;
        let mut page = vec![0u8; PAGE_SIZE];
        disk.read_page(fd, IX_FILE_HDR_PAGE, &mut page)?;
        let (state, schema) = TreeState::deserialize(&page)?;
        Ok(Self {
            fd,
            pool,
            schema: Arc::new(schema),
            state: Mutex::new(state),
        })
    }

    /// Removes an index file from disk.
    pub fn destroy(disk: &DiskManager, path: impl AsRef<Path>) -> MarrowResult<()> {
        disk.destroy_file(path)
    }

    /// The file descriptor of the index file.
    pub fn fd(&self) -> i32 {
        self.fd
    }

    /// Total key width in bytes.
    pub fn key_len(&self) -> usize {
        self.schema.col_tot_len
    }

    /// Writes the header and all dirty pages back to disk.
    pub fn flush(&self) -> MarrowResult<()> {
        let state = self.state.lock();
        let mut page = vec![0u8; PAGE_SIZE];
        state.serialize(&self.schema, &mut page);
        self.pool
            .disk()
            .write_page(self.fd, IX_FILE_HDR_PAGE, &page)?;
        self.pool.flush_file(self.fd)?;
        Ok(())
    }

    /// Flushes and closes the index file.
    pub fn close(self) -> MarrowResult<()> {
        self.flush()?;
        self.pool.discard_file(self.fd);
        self.pool.disk().close_file(self.fd)?;
        Ok(())
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// Point lookup: zero or one `Rid` for `key`.
    pub fn get_value(&self, key: &[u8]) -> MarrowResult<Vec<Rid>> {
        let state = self.state.lock();
        if state.root_page == IX_NO_PAGE {
            return Ok(Vec::new());
        }
        let leaf = self.find_leaf(&state, key)?;
        let found = leaf.leaf_lookup(key);
        self.unpin(&leaf, false);
        Ok(found.into_iter().collect())
    }

    /// Position of the first entry with key `>= key`.
    pub fn lower_bound(&self, key: &[u8]) -> MarrowResult<Iid> {
        let state = self.state.lock();
        self.bound(&state, key, false)
    }

    /// Position of the first entry with key `> key`.
    pub fn upper_bound(&self, key: &[u8]) -> MarrowResult<Iid> {
        let state = self.state.lock();
        self.bound(&state, key, true)
    }

    /// Position of the first entry in key order.
    pub fn leaf_begin(&self) -> MarrowResult<Iid> {
        let state = self.state.lock();
        Ok(Iid::new(state.first_leaf, 0))
    }

    /// Position one past the last entry; the end of every scan.
    pub fn leaf_end(&self) -> MarrowResult<Iid> {
        let state = self.state.lock();
        self.leaf_end_locked(&state)
    }

    /// The `Rid` stored at an index position.
    pub fn get_rid(&self, iid: Iid) -> MarrowResult<Rid> {
        let _state = self.state.lock();
        if iid.page_no == IX_LEAF_HEADER_PAGE {
            return Err(MarrowError::IndexEntryNotFound);
        }
        let node = self.fetch_node(iid.page_no)?;
        let result = if (iid.slot_no as usize) < node.size() {
            Ok(node.rid(iid.slot_no as usize))
        } else {
            Err(MarrowError::IndexEntryNotFound)
        };
        self.unpin(&node, false);
        result
    }

    /// The position following `iid` in key order, jumping leaves as
    /// needed. Used by [`IxScan`](super::IxScan).
    pub fn next_iid(&self, iid: Iid) -> MarrowResult<Iid> {
        let _state = self.state.lock();
        if iid.page_no == IX_LEAF_HEADER_PAGE {
            return Ok(iid);
        }
        let node = self.fetch_node(iid.page_no)?;
        let slot = iid.slot_no + 1;
        let result = if (slot as usize) < node.size() {
            Iid::new(iid.page_no, slot)
        } else if node.next_leaf() != IX_LEAF_HEADER_PAGE {
            Iid::new(node.next_leaf(), 0)
        } else {
            // Last leaf: stop one past its final entry.
            Iid::new(iid.page_no, node.size() as i32)
        };
        self.unpin(&node, false);
        Ok(result)
    }

    // =========================================================================
    // Insert
    // =========================================================================

    /// Inserts `key -> rid`. A duplicate key is a no-op. Returns the
    /// page number of the leaf holding the key.
    pub fn insert_entry(&self, key: &[u8], rid: Rid) -> MarrowResult<i32> {
        self.check_key(key)?;
        let mut state = self.state.lock();

        if state.root_page == IX_NO_PAGE {
            let leaf = self.start_new_tree(&mut state)?;
            leaf.insert(key, rid);
            let page_no = leaf.page_no;
            self.unpin(&leaf, true);
            return Ok(page_no);
        }

        let node = self.find_leaf(&state, key)?;
        node.insert(key, rid);
        if node.size() == self.schema.order {
            let new_node = self.split(&mut state, &node)?;
            if state.last_leaf == node.page_no {
                state.last_leaf = new_node.page_no;
            }
            let sep = new_node.key(0);
            self.insert_into_parent(&mut state, &node, &sep, &new_node)?;
            self.unpin(&new_node, true);
        }
        let page_no = node.page_no;
        self.unpin(&node, true);
        Ok(page_no)
    }

    /// Builds a fresh single-leaf root for an empty tree. The returned
    /// node is pinned.
    fn start_new_tree(&self, state: &mut TreeState) -> MarrowResult<IxNode> {
        let leaf = self.create_node(state)?;
        leaf.init(true, IX_NO_PAGE, IX_LEAF_HEADER_PAGE, IX_LEAF_HEADER_PAGE);

        let sentinel = self.fetch_node(IX_LEAF_HEADER_PAGE)?;
        sentinel.set_next_leaf(leaf.page_no);
        sentinel.set_prev_leaf(leaf.page_no);
        self.unpin(&sentinel, true);

        state.root_page = leaf.page_no;
        state.first_leaf = leaf.page_no;
        state.last_leaf = leaf.page_no;
        Ok(leaf)
    }

    /// Splits a full node, moving its upper half into a new right
    /// sibling. The returned sibling is pinned.
    fn split(&self, state: &mut TreeState, node: &IxNode) -> MarrowResult<IxNode> {
        let new_node = self.create_node(state)?;
        let mid = node.size() / 2;
        new_node.init(node.is_leaf(), node.parent(), IX_NO_PAGE, IX_NO_PAGE);

        let (keys, rids) = node.pairs_from(mid);
        new_node.insert_pairs(0, &keys, &rids);
        node.set_size(mid);

        if new_node.is_leaf() {
            new_node.set_prev_leaf(node.page_no);
            new_node.set_next_leaf(node.next_leaf());
            let next = self.fetch_node(node.next_leaf())?;
            next.set_prev_leaf(new_node.page_no);
            self.unpin(&next, true);
            node.set_next_leaf(new_node.page_no);
        } else {
            for i in 0..new_node.size() {
                self.maintain_child(&new_node, i)?;
            }
        }
        Ok(new_node)
    }

    /// Inserts the separator for a fresh split sibling into the parent,
    /// creating a new root or recursing on parent overflow.
    fn insert_into_parent(
        &self,
        state: &mut TreeState,
        old_node: &IxNode,
        key: &[u8],
        new_node: &IxNode,
    ) -> MarrowResult<()> {
        let parent = if old_node.page_no == state.root_page {
            let root = self.create_node(state)?;
            root.init(false, IX_NO_PAGE, IX_NO_PAGE, IX_NO_PAGE);
            root.insert(&old_node.key(0), Rid::new(old_node.page_no, -1));
            old_node.set_parent(root.page_no);
            state.root_page = root.page_no;
            root
        } else {
            self.fetch_node(old_node.parent())?
        };

        parent.insert(key, Rid::new(new_node.page_no, -1));
        new_node.set_parent(parent.page_no);

        if parent.size() == self.schema.order {
            let split_node = self.split(state, &parent)?;
            let sep = split_node.key(0);
            self.insert_into_parent(state, &parent, &sep, &split_node)?;
            self.unpin(&split_node, true);
        }
        self.unpin(&parent, true);
        Ok(())
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Deletes `key`. Returns whether an entry was removed.
    pub fn delete_entry(&self, key: &[u8]) -> MarrowResult<bool> {
        self.check_key(key)?;
        let mut state = self.state.lock();
        if state.root_page == IX_NO_PAGE {
            return Ok(false);
        }
        let leaf = self.find_leaf(&state, key)?;
        let before = leaf.size();
        let removed = leaf.remove(key) < before;
        if removed {
            self.coalesce_or_redistribute(&mut state, &leaf)?;
        }
        self.unpin(&leaf, removed);
        Ok(removed)
    }

    /// Rebalances a node after a removal: nothing to do, redistribute
    /// one entry from a sibling, or merge with a sibling.
    fn coalesce_or_redistribute(&self, state: &mut TreeState, node: &IxNode) -> MarrowResult<bool> {
        if node.page_no == state.root_page {
            return self.adjust_root(state, node);
        }
        if node.size() >= self.schema.min_size {
            self.maintain_parent(node)?;
            return Ok(false);
        }

        let parent = self.fetch_node(node.parent())?;
        let index = parent.find_child(node.page_no).ok_or_else(|| {
            MarrowError::internal(format!("node {} missing from its parent", node.page_no))
        })?;
        // Prefer the left sibling when there is one.
        let neighbor = if index > 0 {
            self.fetch_node(parent.child(index - 1))?
        } else {
            self.fetch_node(parent.child(index + 1))?
        };

        let merged = if node.size() + neighbor.size() >= 2 * self.schema.min_size {
            self.redistribute(&neighbor, node, index)?;
            false
        } else {
            self.coalesce(state, &neighbor, node, &parent, index)?;
            true
        };
        self.unpin(&parent, true);
        self.unpin(&neighbor, true);
        Ok(merged)
    }

    /// Handles underflow at the root: an empty leaf root empties the
    /// tree, an internal root with one child is replaced by that child.
    fn adjust_root(&self, state: &mut TreeState, old_root: &IxNode) -> MarrowResult<bool> {
        if old_root.is_leaf() && old_root.size() == 0 {
            self.erase_leaf(old_root)?;
            self.release_node(state);
            state.root_page = IX_NO_PAGE;
            state.first_leaf = IX_LEAF_HEADER_PAGE;
            state.last_leaf = IX_LEAF_HEADER_PAGE;
            return Ok(true);
        }
        if !old_root.is_leaf() && old_root.size() == 1 {
            let child_page = old_root.child(0);
            let child = self.fetch_node(child_page)?;
            child.set_parent(IX_NO_PAGE);
            self.unpin(&child, true);
            self.release_node(state);
            state.root_page = child_page;
            return Ok(true);
        }
        Ok(false)
    }

    /// Moves one entry from `neighbor` into `node` and fixes the parent
    /// routers. `index` is `node`'s position in the parent.
    fn redistribute(&self, neighbor: &IxNode, node: &IxNode, index: usize) -> MarrowResult<()> {
        if index == 0 {
            // Neighbor is the right sibling: take its head onto our tail.
            node.insert_pairs(node.size(), &neighbor.key(0), &[neighbor.rid(0)]);
            neighbor.erase_pair(0);
            self.maintain_child(node, node.size() - 1)?;
            self.maintain_parent(neighbor)?;
        } else {
            // Neighbor is the left sibling: take its tail onto our head.
            let last = neighbor.size() - 1;
            node.insert_pairs(0, &neighbor.key(last), &[neighbor.rid(last)]);
            neighbor.erase_pair(last);
            self.maintain_child(node, 0)?;
        }
        // Our own first key may have changed as well.
        self.maintain_parent(node)
    }

    /// Merges the right-hand of `node`/`neighbor` into the left-hand one
    /// and removes the dead child from the parent, recursing upward.
    fn coalesce(
        &self,
        state: &mut TreeState,
        neighbor: &IxNode,
        node: &IxNode,
        parent: &IxNode,
        index: usize,
    ) -> MarrowResult<()> {
        // Keep the left-hand node; the right-hand one dies.
        let (left, right) = if index == 0 {
            (node, neighbor)
        } else {
            (neighbor, node)
        };

        if state.last_leaf == right.page_no {
            state.last_leaf = left.page_no;
        }

        let pos = left.size();
        let (keys, rids) = right.pairs_from(0);
        left.insert_pairs(pos, &keys, &rids);
        for i in pos..left.size() {
            self.maintain_child(left, i)?;
        }

        if right.is_leaf() {
            self.erase_leaf(right)?;
        }
        self.release_node(state);

        let dead = parent.find_child(right.page_no).ok_or_else(|| {
            MarrowError::internal(format!("node {} missing from its parent", right.page_no))
        })?;
        parent.erase_pair(dead);
        self.maintain_parent(left)?;

        self.coalesce_or_redistribute(state, parent)?;
        Ok(())
    }

    // =========================================================================
    // Node plumbing
    // =========================================================================

    fn fetch_node(&self, page_no: i32) -> MarrowResult<IxNode> {
        let frame = self.pool.fetch_page(PageId::new(self.fd, page_no))?;
        Ok(IxNode::new(page_no, frame, Arc::clone(&self.schema)))
    }

    fn create_node(&self, state: &mut TreeState) -> MarrowResult<IxNode> {
        let (page_id, frame) = self.pool.new_page(self.fd)?;
        state.num_pages += 1;
        Ok(IxNode::new(
            page_id.page_no,
            frame,
            Arc::clone(&self.schema),
        ))
    }

    /// Accounts for a node deleted from the tree.
    fn release_node(&self, state: &mut TreeState) {
        state.num_pages -= 1;
    }

    fn unpin(&self, node: &IxNode, dirty: bool) {
        self.pool.unpin_page(PageId::new(self.fd, node.page_no), dirty);
    }

    /// Descends from the root to the leaf that owns `key`. The returned
    /// leaf is pinned.
    fn find_leaf(&self, state: &TreeState, key: &[u8]) -> MarrowResult<IxNode> {
        let mut node = self.fetch_node(state.root_page)?;
        while !node.is_leaf() {
            let child = node.internal_lookup(key);
            self.unpin(&node, false);
            node = self.fetch_node(child)?;
        }
        Ok(node)
    }

    fn bound(&self, state: &TreeState, key: &[u8], upper: bool) -> MarrowResult<Iid> {
        self.check_key(key)?;
        if state.root_page == IX_NO_PAGE {
            return self.leaf_end_locked(state);
        }
        let leaf = self.find_leaf(state, key)?;
        let idx = if upper {
            leaf.upper_bound(key)
        } else {
            leaf.lower_bound(key)
        };
        let iid = if idx == leaf.size() {
            if leaf.next_leaf() != IX_LEAF_HEADER_PAGE {
                // The true bound is the head of the next leaf.
                Iid::new(leaf.next_leaf(), 0)
            } else {
                Iid::new(leaf.page_no, idx as i32)
            }
        } else {
            Iid::new(leaf.page_no, idx as i32)
        };
        self.unpin(&leaf, false);
        Ok(iid)
    }

    fn leaf_end_locked(&self, state: &TreeState) -> MarrowResult<Iid> {
        if state.root_page == IX_NO_PAGE {
            return Ok(Iid::new(IX_LEAF_HEADER_PAGE, 0));
        }
        let last = self.fetch_node(state.last_leaf)?;
        let iid = Iid::new(state.last_leaf, last.size() as i32);
        self.unpin(&last, false);
        Ok(iid)
    }

    /// Propagates a changed first key up to the first ancestor whose
    /// router already agrees.
    fn maintain_parent(&self, node: &IxNode) -> MarrowResult<()> {
        let mut curr = node.clone();
        let mut fetched = false;
        loop {
            let parent_no = curr.parent();
            if parent_no == IX_NO_PAGE {
                break;
            }
            let parent = self.fetch_node(parent_no)?;
            let rank = parent.find_child(curr.page_no).ok_or_else(|| {
                MarrowError::internal(format!("node {} missing from its parent", curr.page_no))
            })?;
            let child_key = curr.key(0);
            if fetched {
                self.unpin(&curr, true);
            }
            if parent.key(rank) == child_key {
                self.unpin(&parent, false);
                return Ok(());
            }
            parent.set_key(rank, &child_key);
            curr = parent;
            fetched = true;
        }
        if fetched {
            self.unpin(&curr, true);
        }
        Ok(())
    }

    /// Re-homes the child behind entry `idx` of an internal node.
    fn maintain_child(&self, node: &IxNode, idx: usize) -> MarrowResult<()> {
        if node.is_leaf() {
            return Ok(());
        }
        let child = self.fetch_node(node.child(idx))?;
        child.set_parent(node.page_no);
        self.unpin(&child, true);
        Ok(())
    }

    /// Unlinks a leaf from the chain. The sentinel absorbs end cases.
    fn erase_leaf(&self, leaf: &IxNode) -> MarrowResult<()> {
        let prev = self.fetch_node(leaf.prev_leaf())?;
        prev.set_next_leaf(leaf.next_leaf());
        self.unpin(&prev, true);

        let next = self.fetch_node(leaf.next_leaf())?;
        next.set_prev_leaf(leaf.prev_leaf());
        self.unpin(&next, true);
        Ok(())
    }

    fn check_key(&self, key: &[u8]) -> MarrowResult<()> {
        if key.len() != self.schema.col_tot_len {
            return Err(MarrowError::internal(format!(
                "key of {} bytes in index keyed on {} bytes",
                key.len(),
                self.schema.col_tot_len
            )));
        }
        Ok(())
    }
}
