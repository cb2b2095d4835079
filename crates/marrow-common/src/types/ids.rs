//! Identifier types for records, index slots, pages, and transactions.
//!
//! These are small `Copy` types; wrapping them keeps a heap address from
//! being confused with an index-slot address even though both are a
//! `(page_no, slot_no)` pair.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Record identifier: the physical address of one tuple in a heap file.
///
/// Stable for the life of the tuple in its page; a delete invalidates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rid {
    /// Heap page holding the tuple.
    pub page_no: i32,
    /// Slot within the page's bitmap/slot array.
    pub slot_no: i32,
}

impl Rid {
    /// Size of a `Rid` when written into an index page.
    pub const DISK_SIZE: usize = 8;

    /// Creates a record identifier.
    #[inline]
    #[must_use]
    pub const fn new(page_no: i32, slot_no: i32) -> Self {
        Self { page_no, slot_no }
    }

    /// Serializes into the fixed on-disk form (two little-endian `i32`s).
    #[inline]
    pub fn to_bytes(self) -> [u8; Self::DISK_SIZE] {
        let mut buf = [0u8; Self::DISK_SIZE];
        buf[0..4].copy_from_slice(&self.page_no.to_le_bytes());
        buf[4..8].copy_from_slice(&self.slot_no.to_le_bytes());
        buf
    }

    /// Deserializes from the fixed on-disk form.
    #[inline]
    pub fn from_bytes(buf: &[u8]) -> Self {
        debug_assert!(buf.len() >= Self::DISK_SIZE);
        Self {
            page_no: i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            slot_no: i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.page_no, self.slot_no)
    }
}

/// Index-slot identifier: a position inside a B+-tree's leaf sequence.
///
/// Unlike a [`Rid`], an `Iid` addresses a key slot of a leaf node, not a
/// heap tuple. Range scans run from an inclusive lower `Iid` to an
/// exclusive upper `Iid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Iid {
    /// Leaf page.
    pub page_no: i32,
    /// Key slot within the leaf.
    pub slot_no: i32,
}

impl Iid {
    /// Creates an index-slot identifier.
    #[inline]
    #[must_use]
    pub const fn new(page_no: i32, slot_no: i32) -> Self {
        Self { page_no, slot_no }
    }
}

impl fmt::Display for Iid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.page_no, self.slot_no)
    }
}

/// Buffer-pool page identifier: an open file plus a page number in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId {
    /// File descriptor handed out by the disk manager.
    pub fd: i32,
    /// Page number within the file.
    pub page_no: i32,
}

impl PageId {
    /// Creates a page identifier.
    #[inline]
    #[must_use]
    pub const fn new(fd: i32, page_no: i32) -> Self {
        Self { fd, page_no }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.fd, self.page_no)
    }
}

/// Transaction identifier, monotonically allocated by the manager.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct TxnId(u64);

impl TxnId {
    /// Sentinel for "no transaction".
    pub const INVALID: Self = Self(u64::MAX);

    /// Creates a transaction identifier from its raw value.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Whether this is a real transaction id.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

impl fmt::Debug for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "TxnId(INVALID)")
        } else {
            write!(f, "TxnId({})", self.0)
        }
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
