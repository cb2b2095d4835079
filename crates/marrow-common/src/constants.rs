//! Engine-wide layout constants.
//!
//! These values are baked into the on-disk file formats; changing any of
//! them invalidates existing database directories.

/// Size of every page, in heap files and index files alike.
pub const PAGE_SIZE: usize = 4096;

/// Default number of frames held by the buffer pool.
pub const BUFFER_POOL_SIZE: usize = 256;

/// Sentinel page number meaning "no page" in heap free lists.
pub const RM_NO_PAGE: i32 = -1;

/// Page number of the heap file header page.
pub const RM_FILE_HDR_PAGE: i32 = 0;

/// First heap page that holds records.
pub const RM_FIRST_RECORD_PAGE: i32 = 1;

/// Sentinel page number meaning "no page" inside a B+-tree file.
pub const IX_NO_PAGE: i32 = -1;

/// Page number of the index file header page.
pub const IX_FILE_HDR_PAGE: i32 = 0;

/// Page number of the sentinel node that anchors the leaf chain.
///
/// The sentinel's `next_leaf` is the first leaf and its `prev_leaf` is the
/// last leaf, so unlinking a leaf never has to special-case the ends of
/// the chain.
pub const IX_LEAF_HEADER_PAGE: i32 = 1;

/// Number of pages an index file starts with (header + leaf sentinel).
pub const IX_INIT_NUM_PAGES: i32 = 2;

/// File name of the catalog inside a database directory.
pub const DB_META_NAME: &str = "db.meta";

/// File name of the (reserved) write-ahead log inside a database directory.
pub const LOG_FILE_NAME: &str = "log.log";
