//! Schema catalog: column, table, index, and database metadata.
//!
//! The catalog is a plain data structure serialized as JSON into the
//! `db.meta` file of a database directory; it is read once on open and
//! rewritten whole on every DDL.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use marrow_common::types::values::ColType;
use marrow_common::{MarrowError, MarrowResult};

/// A column definition handed to `create_table`.
#[derive(Debug, Clone)]
pub struct ColDef {
    /// Column name.
    pub name: String,
    /// Column type.
    pub col_type: ColType,
    /// Byte width; fixed per type for numerics.
    pub len: usize,
}

impl ColDef {
    /// An INT column.
    pub fn int(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            col_type: ColType::Int,
            len: 4,
        }
    }

    /// A FLOAT column.
    pub fn float(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            col_type: ColType::Float,
            len: 8,
        }
    }

    /// A CHAR(len) column.
    pub fn string(name: impl Into<String>, len: usize) -> Self {
        Self {
            name: name.into(),
            col_type: ColType::String,
            len,
        }
    }
}

/// Metadata of one column inside a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColMeta {
    /// Owning table.
    pub tab_name: String,
    /// Column name.
    pub name: String,
    /// Column type.
    pub col_type: ColType,
    /// Byte width within the tuple.
    pub len: usize,
    /// Byte offset within the tuple.
    pub offset: usize,
    /// Whether some index of the table covers this column.
    pub has_index: bool,
}

/// Metadata of one index. Index identity is the table plus the ordered
/// list of column names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    /// Owning table.
    pub tab_name: String,
    /// Number of key columns.
    pub col_num: usize,
    /// Total key width in bytes.
    pub col_tot_len: usize,
    /// The key columns, in index order.
    pub cols: Vec<ColMeta>,
}

impl IndexMeta {
    /// The ordered key column names.
    pub fn col_names(&self) -> Vec<String> {
        self.cols.iter().map(|c| c.name.clone()).collect()
    }

    /// Builds this index's composite key from a tuple image.
    pub fn build_key(&self, record: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.col_tot_len);
        for col in &self.cols {
            key.extend_from_slice(&record[col.offset..col.offset + col.len]);
        }
        key
    }
}

/// Metadata of one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabMeta {
    /// Table name.
    pub name: String,
    /// Columns in declaration order.
    pub cols: Vec<ColMeta>,
    /// Indexes on the table.
    pub indexes: Vec<IndexMeta>,
}

impl TabMeta {
    /// Width of one tuple.
    pub fn tuple_len(&self) -> usize {
        self.cols.last().map_or(0, |c| c.offset + c.len)
    }

    /// Whether the table has a column called `name`.
    pub fn has_col(&self, name: &str) -> bool {
        self.cols.iter().any(|c| c.name == name)
    }

    /// Looks a column up by name.
    pub fn col(&self, name: &str) -> MarrowResult<&ColMeta> {
        self.cols
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| MarrowError::ColumnNotFound {
                column: format!("{}.{}", self.name, name),
            })
    }

    /// Whether an index over exactly these columns (order significant)
    /// exists.
    pub fn has_index(&self, col_names: &[String]) -> bool {
        self.indexes.iter().any(|ix| ix.col_names() == col_names)
    }

    /// Looks an index up by its ordered column names.
    pub fn index_meta(&self, col_names: &[String]) -> MarrowResult<&IndexMeta> {
        self.indexes
            .iter()
            .find(|ix| ix.col_names() == col_names)
            .ok_or_else(|| MarrowError::IndexNotFound {
                table: self.name.clone(),
                columns: col_names.join(", "),
            })
    }
}

/// The whole database catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DbMeta {
    /// Database name.
    pub name: String,
    /// Tables by name.
    pub tables: BTreeMap<String, TabMeta>,
}

impl DbMeta {
    /// Creates an empty catalog.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: BTreeMap::new(),
        }
    }

    /// Whether `name` is a table.
    pub fn is_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Looks a table up by name.
    pub fn get_table(&self, name: &str) -> MarrowResult<&TabMeta> {
        self.tables
            .get(name)
            .ok_or_else(|| MarrowError::TableNotFound {
                table: name.to_string(),
            })
    }

    /// Mutable table lookup, for DDL.
    pub fn get_table_mut(&mut self, name: &str) -> MarrowResult<&mut TabMeta> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| MarrowError::TableNotFound {
                table: name.to_string(),
            })
    }

    /// Writes the catalog to `path`, truncating any previous content.
    pub fn save(&self, path: impl AsRef<Path>) -> MarrowResult<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| MarrowError::internal(format!("catalog serialization failed: {e}")))?;
        fs::write(path, text)?;
        Ok(())
    }

    /// Reads the catalog back from `path`.
    pub fn load(path: impl AsRef<Path>) -> MarrowResult<Self> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| MarrowError::internal(format!("catalog deserialization failed: {e}")))
    }
}

/// The on-disk file name of an index: underscore-joined column names
/// appended to the table name, plus the `.idx` suffix.
pub fn index_file_name(tab_name: &str, col_names: &[String]) -> String {
    let mut name = String::from(tab_name);
    for col in col_names {
        name.push('_');
        name.push_str(col);
    }
    name.push_str("_.idx");
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_table() -> TabMeta {
        let cols = vec![
            ColMeta {
                tab_name: "t".into(),
                name: "a".into(),
                col_type: ColType::Int,
                len: 4,
                offset: 0,
                has_index: true,
            },
            ColMeta {
                tab_name: "t".into(),
                name: "b".into(),
                col_type: ColType::String,
                len: 8,
                offset: 4,
                has_index: false,
            },
        ];
        let index = IndexMeta {
            tab_name: "t".into(),
            col_num: 1,
            col_tot_len: 4,
            cols: vec![cols[0].clone()],
        };
        TabMeta {
            name: "t".into(),
            cols,
            indexes: vec![index],
        }
    }

    #[test]
    fn tuple_len_and_lookups() {
        let tab = sample_table();
        assert_eq!(tab.tuple_len(), 12);
        assert_eq!(tab.col("b").unwrap().offset, 4);
        assert!(matches!(
            tab.col("zzz"),
            Err(MarrowError::ColumnNotFound { .. })
        ));
    }

    #[test]
    fn index_identity_is_ordered() {
        let tab = sample_table();
        assert!(tab.has_index(&["a".into()]));
        assert!(!tab.has_index(&["b".into()]));
        assert!(!tab.has_index(&["a".into(), "b".into()]));
    }

    #[test]
    fn index_key_projection() {
        let tab = sample_table();
        let ix = tab.index_meta(&["a".into()]).unwrap();
        let mut record = vec![0u8; 12];
        record[0..4].copy_from_slice(&7i32.to_le_bytes());
        assert_eq!(ix.build_key(&record), 7i32.to_le_bytes().to_vec());
    }

    #[test]
    fn index_file_names() {
        assert_eq!(index_file_name("t", &["a".into()]), "t_a_.idx");
        assert_eq!(
            index_file_name("orders", &["id".into(), "day".into()]),
            "orders_id_day_.idx"
        );
    }

    #[test]
    fn catalog_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.meta");

        let mut db = DbMeta::new("shop");
        db.tables.insert("t".into(), sample_table());
        db.save(&path).unwrap();

        let back = DbMeta::load(&path).unwrap();
        assert_eq!(back.name, "shop");
        assert_eq!(back.get_table("t").unwrap(), &sample_table());
        assert!(matches!(
            back.get_table("missing"),
            Err(MarrowError::TableNotFound { .. })
        ));
    }
}
