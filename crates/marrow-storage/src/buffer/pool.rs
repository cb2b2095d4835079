//! The buffer pool manager.
//!
//! A fixed array of frames caches disk pages. Callers fetch a page (which
//! pins its frame), use the bytes, then unpin with a dirty flag; a frame
//! whose pin count drops to zero becomes eligible for LRU eviction. Dirty
//! frames are written back on eviction and on explicit flushes.
//!
//! Failure to unpin permanently consumes a frame, so every fetch in the
//! heap and index code is paired with an unpin on every exit path.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use marrow_common::constants::PAGE_SIZE;
use marrow_common::{MarrowError, MarrowResult, PageId};

use crate::disk::DiskManager;

use super::frame::Frame;

/// Caches disk pages in a fixed set of frames.
pub struct BufferPool {
    disk: Arc<DiskManager>,
    frames: Vec<Arc<Frame>>,
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    /// Maps a cached page to its frame index.
    page_table: HashMap<PageId, usize>,
    /// Frames that have never held a page.
    free_list: Vec<usize>,
    /// Unpinned frames in eviction order (front = least recently used).
    lru: Vec<usize>,
}

impl BufferPool {
    /// Creates a pool with `num_frames` frames over the given disk manager.
    pub fn new(disk: Arc<DiskManager>, num_frames: usize) -> Self {
        assert!(num_frames > 0, "buffer pool needs at least one frame");
        let frames = (0..num_frames).map(|_| Arc::new(Frame::new())).collect();
        Self {
            disk,
            frames,
            inner: Mutex::new(PoolInner {
                page_table: HashMap::with_capacity(num_frames),
                free_list: (0..num_frames).rev().collect(),
                lru: Vec::new(),
            }),
        }
    }

    /// The disk manager backing this pool.
    pub fn disk(&self) -> &Arc<DiskManager> {
        &self.disk
    }

    /// Fetches a page, pinning its frame.
    ///
    /// The returned frame stays valid until the matching
    /// [`unpin_page`](Self::unpin_page).
    pub fn fetch_page(&self, page_id: PageId) -> MarrowResult<Arc<Frame>> {
        let mut inner = self.inner.lock();

        if let Some(&idx) = inner.page_table.get(&page_id) {
            let frame = Arc::clone(&self.frames[idx]);
            frame.pin();
            inner.lru.retain(|&i| i != idx);
            return Ok(frame);
        }

        let idx = self.take_victim(&mut inner)?;
        let frame = Arc::clone(&self.frames[idx]);
        {
            let mut data = frame.write();
            self.disk.read_page(page_id.fd, page_id.page_no, &mut data)?;
        }
        frame.set_page_id(Some(page_id));
        frame.set_dirty(false);
        frame.pin();
        inner.page_table.insert(page_id, idx);
        Ok(frame)
    }

    /// Allocates a fresh page in `fd` and returns it pinned and zeroed.
    pub fn new_page(&self, fd: i32) -> MarrowResult<(PageId, Arc<Frame>)> {
        let page_no = self.disk.allocate_page(fd)?;
        let page_id = PageId::new(fd, page_no);

        let mut inner = self.inner.lock();
        let idx = self.take_victim(&mut inner)?;
        let frame = Arc::clone(&self.frames[idx]);
        frame.write().fill(0);
        frame.set_page_id(Some(page_id));
        frame.set_dirty(true);
        frame.pin();
        inner.page_table.insert(page_id, idx);
        Ok((page_id, frame))
    }

    /// Unpins a page, recording whether the caller modified it.
    ///
    /// Returns `false` if the page is not resident or not pinned.
    pub fn unpin_page(&self, page_id: PageId, dirty: bool) -> bool {
        let mut inner = self.inner.lock();
        let Some(&idx) = inner.page_table.get(&page_id) else {
            return false;
        };
        let frame = &self.frames[idx];
        if frame.pin_count() == 0 {
            return false;
        }
        if dirty {
            frame.set_dirty(true);
        }
        if frame.unpin() == 0 {
            inner.lru.push(idx);
        }
        true
    }

    /// Writes a page back to disk if it is resident and dirty.
    pub fn flush_page(&self, page_id: PageId) -> MarrowResult<()> {
        let inner = self.inner.lock();
        if let Some(&idx) = inner.page_table.get(&page_id) {
            self.flush_frame(idx)?;
        }
        Ok(())
    }

    /// Writes back every dirty resident page of one file.
    pub fn flush_file(&self, fd: i32) -> MarrowResult<()> {
        let inner = self.inner.lock();
        let targets: Vec<usize> = inner
            .page_table
            .iter()
            .filter(|(id, _)| id.fd == fd)
            .map(|(_, &idx)| idx)
            .collect();
        for idx in targets {
            self.flush_frame(idx)?;
        }
        Ok(())
    }

    /// Drops every resident page of one file without writing back.
    ///
    /// Used when the file is being destroyed.
    pub fn discard_file(&self, fd: i32) {
        let mut inner = self.inner.lock();
        let victims: Vec<(PageId, usize)> = inner
            .page_table
            .iter()
            .filter(|(id, _)| id.fd == fd)
            .map(|(&id, &idx)| (id, idx))
            .collect();
        for (id, idx) in victims {
            inner.page_table.remove(&id);
            inner.lru.retain(|&i| i != idx);
            let frame = &self.frames[idx];
            frame.set_page_id(None);
            frame.set_dirty(false);
            inner.free_list.push(idx);
        }
    }

    /// Picks a frame for a new resident page, evicting if needed.
    ///
    /// Caller holds the pool lock.
    fn take_victim(&self, inner: &mut PoolInner) -> MarrowResult<usize> {
        if let Some(idx) = inner.free_list.pop() {
            return Ok(idx);
        }
        // Evict the least recently unpinned frame.
        if inner.lru.is_empty() {
            return Err(MarrowError::internal("buffer pool exhausted: all frames pinned"));
        }
        let idx = inner.lru.remove(0);
        let frame = &self.frames[idx];
        debug_assert_eq!(frame.pin_count(), 0);
        if let Some(old_id) = frame.page_id() {
            if frame.is_dirty() {
                let data = frame.read();
                self.disk.write_page(old_id.fd, old_id.page_no, &data)?;
            }
            inner.page_table.remove(&old_id);
        }
        frame.set_page_id(None);
        frame.set_dirty(false);
        Ok(idx)
    }

    fn flush_frame(&self, idx: usize) -> MarrowResult<()> {
        let frame = &self.frames[idx];
        if let Some(id) = frame.page_id() {
            if frame.is_dirty() {
                let data = frame.read();
                self.disk.write_page(id.fd, id.page_no, &data)?;
                frame.set_dirty(false);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup(num_frames: usize) -> (TempDir, Arc<DiskManager>, BufferPool, i32) {
        let dir = TempDir::new().unwrap();
        let disk = Arc::new(DiskManager::new());
        let path = dir.path().join("pool.dat");
        disk.create_file(&path).unwrap();
        let fd = disk.open_file(&path).unwrap();
        let pool = BufferPool::new(Arc::clone(&disk), num_frames);
        (dir, disk, pool, fd)
    }

    #[test]
    fn new_page_then_fetch() {
        let (_dir, _disk, pool, fd) = setup(4);

        let (page_id, frame) = pool.new_page(fd).unwrap();
        frame.write()[0] = 42;
        assert!(pool.unpin_page(page_id, true));

        let frame = pool.fetch_page(page_id).unwrap();
        assert_eq!(frame.read()[0], 42);
        assert!(pool.unpin_page(page_id, false));
    }

    #[test]
    fn eviction_writes_back() {
        let (_dir, disk, pool, fd) = setup(2);

        let (id0, f0) = pool.new_page(fd).unwrap();
        f0.write()[0] = 11;
        pool.unpin_page(id0, true);

        // Fill the pool past capacity so id0 gets evicted.
        for _ in 0..4 {
            let (id, _f) = pool.new_page(fd).unwrap();
            pool.unpin_page(id, true);
        }

        // Read the evicted page straight from disk.
        let mut buf = vec![0u8; PAGE_SIZE];
        disk.read_page(fd, id0.page_no, &mut buf).unwrap();
        assert_eq!(buf[0], 11);

        // And through the pool again.
        let frame = pool.fetch_page(id0).unwrap();
        assert_eq!(frame.read()[0], 11);
        pool.unpin_page(id0, false);
    }

    #[test]
    fn pinned_frames_are_not_evicted() {
        let (_dir, _disk, pool, fd) = setup(2);

        let (id0, _f0) = pool.new_page(fd).unwrap();
        let (id1, _f1) = pool.new_page(fd).unwrap();
        // Both frames pinned: no victim available.
        assert!(pool.new_page(fd).is_err());

        pool.unpin_page(id0, false);
        pool.unpin_page(id1, false);
        assert!(pool.new_page(fd).is_ok());
    }

    #[test]
    fn unpin_unknown_page() {
        let (_dir, _disk, pool, _fd) = setup(2);
        assert!(!pool.unpin_page(PageId::new(99, 0), false));
    }

    #[test]
    fn flush_file_persists() {
        let (_dir, disk, pool, fd) = setup(4);
        let (id, f) = pool.new_page(fd).unwrap();
        f.write()[7] = 0x77;
        pool.unpin_page(id, true);
        pool.flush_file(fd).unwrap();

        let mut buf = vec![0u8; PAGE_SIZE];
        disk.read_page(fd, id.page_no, &mut buf).unwrap();
        assert_eq!(buf[7], 0x77);
    }
}
