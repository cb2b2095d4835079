//! The system manager: database lifecycle, DDL, and the registries of
//! open heap files and index handles.
//!
//! One database lives in a directory named after it, holding the
//! `db.meta` catalog, one heap file per table, one `.idx` file per
//! index, and a reserved `log.log`. The system manager also implements
//! [`UndoTarget`], so transaction abort can reverse heap and index
//! mutations through the same handles the executors use.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use marrow_common::constants::{DB_META_NAME, LOG_FILE_NAME};
use marrow_common::types::values::ColType;
use marrow_common::{MarrowError, MarrowResult, Rid};
use marrow_storage::{BTreeIndex, BufferPool, DiskManager, HeapFile, HeapScan};
use marrow_txn::{Context, UndoTarget};

use crate::catalog::{index_file_name, ColDef, ColMeta, DbMeta, IndexMeta, TabMeta};

/// Owns the catalog and every open storage handle of one database.
pub struct SystemManager {
    disk: Arc<DiskManager>,
    pool: Arc<BufferPool>,
    /// Directory that contains database directories.
    root: PathBuf,
    /// Directory of the open database, if any.
    db_dir: Option<PathBuf>,
    db: DbMeta,
    /// Heap file handles by table name.
    heaps: HashMap<String, HeapFile>,
    /// Index handles by index file name.
    indexes: HashMap<String, BTreeIndex>,
}

impl SystemManager {
    /// Creates a system manager rooted at `root`.
    pub fn new(disk: Arc<DiskManager>, pool: Arc<BufferPool>, root: impl Into<PathBuf>) -> Self {
        Self {
            disk,
            pool,
            root: root.into(),
            db_dir: None,
            db: DbMeta::default(),
            heaps: HashMap::new(),
            indexes: HashMap::new(),
        }
    }

    // =========================================================================
    // Database lifecycle
    // =========================================================================

    /// Creates a database directory with an empty catalog and the
    /// reserved log file.
    pub fn create_db(&self, name: &str) -> MarrowResult<()> {
        let dir = self.root.join(name);
        if dir.is_dir() {
            return Err(MarrowError::DatabaseExists {
                name: name.to_string(),
            });
        }
        std::fs::create_dir_all(&dir)?;
        DbMeta::new(name).save(dir.join(DB_META_NAME))?;
        self.disk.create_file(dir.join(LOG_FILE_NAME))?;
        tracing::info!(db = name, "created database");
        Ok(())
    }

    /// Removes a database directory and everything in it.
    pub fn drop_db(&self, name: &str) -> MarrowResult<()> {
        let dir = self.root.join(name);
        if !dir.is_dir() {
            return Err(MarrowError::DatabaseNotFound {
                name: name.to_string(),
            });
        }
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }

    /// Opens a database: loads the catalog, then opens every table's
    /// heap file and every index.
    pub fn open_db(&mut self, name: &str) -> MarrowResult<()> {
        let dir = self.root.join(name);
        if !dir.is_dir() {
            return Err(MarrowError::DatabaseNotFound {
                name: name.to_string(),
            });
        }
        self.db = DbMeta::load(dir.join(DB_META_NAME))?;

        for (tab_name, tab) in &self.db.tables {
            let heap = HeapFile::open(Arc::clone(&self.pool), dir.join(tab_name))?;
            self.heaps.insert(tab_name.clone(), heap);

            for index in &tab.indexes {
                let file = index_file_name(tab_name, &index.col_names());
                let handle = BTreeIndex::open(Arc::clone(&self.pool), dir.join(&file))?;
                self.indexes.insert(file, handle);
            }
        }
        tracing::info!(db = name, tables = self.db.tables.len(), "opened database");
        self.db_dir = Some(dir);
        Ok(())
    }

    /// Flushes the catalog and closes every open handle.
    pub fn close_db(&mut self) -> MarrowResult<()> {
        if self.db_dir.is_none() {
            return Ok(());
        }
        self.flush_meta()?;
        for (_, heap) in self.heaps.drain() {
            heap.close()?;
        }
        for (_, index) in self.indexes.drain() {
            index.close()?;
        }
        tracing::info!(db = %self.db.name, "closed database");
        self.db = DbMeta::default();
        self.db_dir = None;
        Ok(())
    }

    /// The open database's catalog.
    pub fn db(&self) -> &DbMeta {
        &self.db
    }

    /// Rewrites `db.meta` from the in-memory catalog.
    pub fn flush_meta(&self) -> MarrowResult<()> {
        let dir = self.require_open()?;
        self.db.save(dir.join(DB_META_NAME))
    }

    // =========================================================================
    // DDL
    // =========================================================================

    /// Creates a table and its heap file.
    pub fn create_table(&mut self, name: &str, col_defs: &[ColDef]) -> MarrowResult<()> {
        let dir = self.require_open()?.to_path_buf();
        if self.db.is_table(name) {
            return Err(MarrowError::TableExists {
                table: name.to_string(),
            });
        }

        let mut cols = Vec::with_capacity(col_defs.len());
        let mut offset = 0;
        for def in col_defs {
            if let Some(fixed) = def.col_type.fixed_len() {
                if def.len != fixed {
                    return Err(MarrowError::internal(format!(
                        "column {} declared {} bytes for a {} column",
                        def.name, def.len, def.col_type
                    )));
                }
            }
            cols.push(ColMeta {
                tab_name: name.to_string(),
                name: def.name.clone(),
                col_type: def.col_type,
                len: def.len,
                offset,
                has_index: false,
            });
            offset += def.len;
        }

        HeapFile::create(&self.disk, dir.join(name), offset)?;
        let heap = HeapFile::open(Arc::clone(&self.pool), dir.join(name))?;
        self.heaps.insert(name.to_string(), heap);
        self.db.tables.insert(
            name.to_string(),
            TabMeta {
                name: name.to_string(),
                cols,
                indexes: Vec::new(),
            },
        );
        self.flush_meta()?;
        tracing::info!(table = name, "created table");
        Ok(())
    }

    /// Drops a table, its heap file, and all of its indexes. Takes the
    /// table's X lock through `ctx`.
    pub fn drop_table(&mut self, name: &str, ctx: &Context<'_>) -> MarrowResult<()> {
        let dir = self.require_open()?.to_path_buf();
        let tab = self.db.get_table(name)?.clone();

        let heap = self.heap(name)?;
        ctx.lock_mgr.lock_exclusive_on_table(ctx.txn, heap.fd())?;

        for index in &tab.indexes {
            let file = index_file_name(name, &index.col_names());
            if let Some(handle) = self.indexes.remove(&file) {
                handle.close()?;
            }
            BTreeIndex::destroy(&self.disk, dir.join(&file))?;
        }

        if let Some(heap) = self.heaps.remove(name) {
            heap.close()?;
        }
        HeapFile::destroy(&self.disk, dir.join(name))?;

        self.db.tables.remove(name);
        self.flush_meta()?;
        tracing::info!(table = name, "dropped table");
        Ok(())
    }

    /// Creates an index over `col_names` (order significant) and
    /// back-fills it from the table's current contents. Takes the
    /// table's X lock through `ctx`.
    pub fn create_index(
        &mut self,
        tab_name: &str,
        col_names: &[String],
        ctx: &Context<'_>,
    ) -> MarrowResult<()> {
        let dir = self.require_open()?.to_path_buf();
        let tab = self.db.get_table(tab_name)?;
        if tab.has_index(col_names) {
            return Err(MarrowError::IndexExists {
                table: tab_name.to_string(),
                columns: col_names.join(", "),
            });
        }

        let mut cols = Vec::with_capacity(col_names.len());
        for col_name in col_names {
            cols.push(tab.col(col_name)?.clone());
        }
        let index_meta = IndexMeta {
            tab_name: tab_name.to_string(),
            col_num: cols.len(),
            col_tot_len: cols.iter().map(|c| c.len).sum(),
            cols,
        };

        let heap = self.heap(tab_name)?;
        ctx.lock_mgr.lock_exclusive_on_table(ctx.txn, heap.fd())?;

        let file = index_file_name(tab_name, col_names);
        let col_types: Vec<ColType> = index_meta.cols.iter().map(|c| c.col_type).collect();
        let col_lens: Vec<usize> = index_meta.cols.iter().map(|c| c.len).collect();
        BTreeIndex::create(&self.disk, dir.join(&file), &col_types, &col_lens)?;
        let handle = BTreeIndex::open(Arc::clone(&self.pool), dir.join(&file))?;

        // Back-fill an entry for every existing tuple.
        let mut scan = HeapScan::new(heap)?;
        while !scan.is_end() {
            let rid = scan.rid();
            let record = heap.get_record(rid)?;
            handle.insert_entry(&index_meta.build_key(&record), rid)?;
            scan.next()?;
        }

        self.indexes.insert(file, handle);
        let tab = self.db.get_table_mut(tab_name)?;
        for col in &mut tab.cols {
            if col_names.contains(&col.name) {
                col.has_index = true;
            }
        }
        tab.indexes.push(index_meta);
        self.flush_meta()?;
        tracing::info!(table = tab_name, columns = ?col_names, "created index");
        Ok(())
    }

    /// Drops an index and its file. Takes the table's X lock through
    /// `ctx`.
    pub fn drop_index(
        &mut self,
        tab_name: &str,
        col_names: &[String],
        ctx: &Context<'_>,
    ) -> MarrowResult<()> {
        let dir = self.require_open()?.to_path_buf();
        self.db.get_table(tab_name)?.index_meta(col_names)?;

        let heap = self.heap(tab_name)?;
        ctx.lock_mgr.lock_exclusive_on_table(ctx.txn, heap.fd())?;

        let file = index_file_name(tab_name, col_names);
        if let Some(handle) = self.indexes.remove(&file) {
            handle.close()?;
        }
        BTreeIndex::destroy(&self.disk, dir.join(&file))?;

        let tab = self.db.get_table_mut(tab_name)?;
        tab.indexes.retain(|ix| ix.col_names() != col_names);
        let still_indexed: Vec<String> = tab
            .indexes
            .iter()
            .flat_map(|ix| ix.col_names())
            .collect();
        for col in &mut tab.cols {
            if col_names.contains(&col.name) {
                col.has_index = still_indexed.contains(&col.name);
            }
        }
        self.flush_meta()?;
        Ok(())
    }

    // =========================================================================
    // Handle lookup
    // =========================================================================

    /// The heap file of a table.
    pub fn heap(&self, tab_name: &str) -> MarrowResult<&HeapFile> {
        self.heaps
            .get(tab_name)
            .ok_or_else(|| MarrowError::TableNotFound {
                table: tab_name.to_string(),
            })
    }

    /// The index handle over `col_names` of a table.
    pub fn index(&self, tab_name: &str, col_names: &[String]) -> MarrowResult<&BTreeIndex> {
        self.indexes
            .get(&index_file_name(tab_name, col_names))
            .ok_or_else(|| MarrowError::IndexNotFound {
                table: tab_name.to_string(),
                columns: col_names.join(", "),
            })
    }

    fn require_open(&self) -> MarrowResult<&Path> {
        self.db_dir
            .as_deref()
            .ok_or_else(|| MarrowError::internal("no database is open"))
    }

    /// Runs `f` once per index of a table with the index's metadata and
    /// open handle.
    pub(crate) fn for_each_index(
        &self,
        tab_name: &str,
        mut f: impl FnMut(&IndexMeta, &BTreeIndex) -> MarrowResult<()>,
    ) -> MarrowResult<()> {
        let tab = self.db.get_table(tab_name)?;
        for index in &tab.indexes {
            let handle = self.index(tab_name, &index.col_names())?;
            f(index, handle)?;
        }
        Ok(())
    }
}

impl UndoTarget for SystemManager {
    fn undo_insert(&self, tab_name: &str, rid: Rid, record: &[u8]) -> MarrowResult<()> {
        let heap = self.heap(tab_name)?;
        heap.delete_record(rid)?;
        self.for_each_index(tab_name, |meta, handle| {
            handle.delete_entry(&meta.build_key(record))?;
            Ok(())
        })
    }

    fn undo_delete(&self, tab_name: &str, rid: Rid, record: &[u8]) -> MarrowResult<()> {
        let heap = self.heap(tab_name)?;
        heap.insert_record_at(rid, record)?;
        self.for_each_index(tab_name, |meta, handle| {
            handle.insert_entry(&meta.build_key(record), rid)?;
            Ok(())
        })
    }

    fn undo_update(&self, tab_name: &str, rid: Rid, record: &[u8]) -> MarrowResult<()> {
        let heap = self.heap(tab_name)?;
        // The heap still holds the post-update image; capture it so the
        // indexes can drop the post-update keys.
        let post = heap.get_record(rid)?;
        heap.update_record(rid, record)?;
        self.for_each_index(tab_name, |meta, handle| {
            handle.delete_entry(&meta.build_key(&post))?;
            handle.insert_entry(&meta.build_key(record), rid)?;
            Ok(())
        })
    }
}
