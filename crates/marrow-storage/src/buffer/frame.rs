//! A single buffer frame.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use marrow_common::constants::PAGE_SIZE;
use marrow_common::PageId;

/// One page-sized frame in the buffer pool.
///
/// The frame's identity (which disk page it currently caches) is managed
/// by the pool; callers only read and write the page bytes while the
/// frame is pinned.
pub struct Frame {
    /// Which disk page this frame currently holds.
    page_id: Mutex<Option<PageId>>,
    /// Page contents.
    data: RwLock<Box<[u8]>>,
    /// Number of users currently holding the frame.
    pin_count: AtomicU32,
    /// Whether the contents differ from disk.
    dirty: AtomicBool,
}

impl Frame {
    pub(crate) fn new() -> Self {
        Self {
            page_id: Mutex::new(None),
            data: RwLock::new(vec![0u8; PAGE_SIZE].into_boxed_slice()),
            pin_count: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
        }
    }

    /// The disk page currently cached, if any.
    pub fn page_id(&self) -> Option<PageId> {
        *self.page_id.lock()
    }

    pub(crate) fn set_page_id(&self, id: Option<PageId>) {
        *self.page_id.lock() = id;
    }

    /// Read access to the page bytes.
    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read()
    }

    /// Write access to the page bytes.
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.data.write()
    }

    /// Current pin count.
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    pub(crate) fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the pin count; returns the new value.
    pub(crate) fn unpin(&self) -> u32 {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin of unpinned frame");
        prev - 1
    }

    /// Whether the frame holds modified contents.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_unpin() {
        let frame = Frame::new();
        assert_eq!(frame.pin_count(), 0);
        frame.pin();
        frame.pin();
        assert_eq!(frame.pin_count(), 2);
        assert_eq!(frame.unpin(), 1);
        assert_eq!(frame.unpin(), 0);
    }

    #[test]
    fn dirty_flag() {
        let frame = Frame::new();
        assert!(!frame.is_dirty());
        frame.set_dirty(true);
        assert!(frame.is_dirty());
    }
}
