//! Table and index registry, persisted as `catalog.json` in the data
//! directory.
//!
//! JSON shape:
//!   {
//!     "tables":  { name: { "file": "name.tbl" } },
//!     "indexes": { name: { "table": ..., "column": ..., "file": ... } }
//!   }
//!
//! The schema itself lives in each table file's header page; the catalog
//! only maps names to files. In-memory changes become durable through
//! `save`, which the session calls from a commit hook so DDL follows
//! transaction boundaries.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::common::{MiniDbError, MiniDbResult};
use crate::config::CATALOG_FILE_NAME;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableEntry {
    pub file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexEntry {
    pub table: String,
    pub column: String,
    pub file: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogFile {
    tables: BTreeMap<String, TableEntry>,
    indexes: BTreeMap<String, IndexEntry>,
}

pub struct Catalog {
    data_dir: PathBuf,
    content: CatalogFile,
}

impl Catalog {
    pub fn open(data_dir: &Path) -> MiniDbResult<Self> {
        let mut catalog = Catalog {
            data_dir: data_dir.to_path_buf(),
            content: CatalogFile::default(),
        };
        catalog.reload()?;
        Ok(catalog)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn file_path(&self) -> PathBuf {
        self.data_dir.join(CATALOG_FILE_NAME)
    }

    /// Re-read the on-disk state, discarding in-memory changes. Used by
    /// rollback hooks to revert uncommitted DDL.
    pub fn reload(&mut self) -> MiniDbResult<()> {
        let path = self.file_path();
        if !path.exists() {
            self.content = CatalogFile::default();
            return Ok(());
        }
        let bytes = std::fs::read(&path)?;
        self.content = serde_json::from_slice(&bytes)
            .map_err(|e| MiniDbError::Catalog(format!("Invalid catalog file: {}", e)))?;
        Ok(())
    }

    /// Persist the current state. Written atomically via a temp file.
    pub fn save(&self) -> MiniDbResult<()> {
        let bytes = serde_json::to_vec_pretty(&self.content)
            .map_err(|e| MiniDbError::Catalog(format!("Catalog serialization failed: {}", e)))?;
        let tmp = self.file_path().with_extension("json.tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, self.file_path())?;
        debug!(path = %self.file_path().display(), "catalog saved");
        Ok(())
    }

    // ==================== Tables ====================

    fn canonical(name: &str) -> String {
        name.to_lowercase()
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.content.tables.contains_key(&Self::canonical(name))
    }

    pub fn table_names(&self) -> Vec<String> {
        self.content.tables.keys().cloned().collect()
    }

    /// Absolute file path of a registered table.
    pub fn table_path(&self, name: &str) -> MiniDbResult<PathBuf> {
        let entry = self
            .content
            .tables
            .get(&Self::canonical(name))
            .ok_or_else(|| MiniDbError::Catalog(format!("Table '{}' does not exist", name)))?;
        Ok(self.data_dir.join(&entry.file))
    }

    pub fn register_table(&mut self, name: &str) -> MiniDbResult<PathBuf> {
        let key = Self::canonical(name);
        if self.content.tables.contains_key(&key) {
            return Err(MiniDbError::Catalog(format!(
                "Table '{}' already exists",
                name
            )));
        }
        let file = format!("{}.tbl", key);
        self.content.tables.insert(key, TableEntry { file: file.clone() });
        Ok(self.data_dir.join(file))
    }

    /// Unregister a table and its indexes. Returns the file paths the
    /// caller should delete once the drop commits.
    pub fn unregister_table(&mut self, name: &str) -> MiniDbResult<Vec<PathBuf>> {
        let key = Self::canonical(name);
        let entry = self
            .content
            .tables
            .remove(&key)
            .ok_or_else(|| MiniDbError::Catalog(format!("Table '{}' does not exist", name)))?;
        let mut files = vec![self.data_dir.join(entry.file)];

        let dropped: Vec<String> = self
            .content
            .indexes
            .iter()
            .filter(|(_, ix)| ix.table == key)
            .map(|(n, _)| n.clone())
            .collect();
        for ix_name in dropped {
            if let Some(ix) = self.content.indexes.remove(&ix_name) {
                files.push(self.data_dir.join(ix.file));
            }
        }
        Ok(files)
    }

    // ==================== Indexes ====================

    pub fn has_index(&self, name: &str) -> bool {
        self.content.indexes.contains_key(&Self::canonical(name))
    }

    pub fn index(&self, name: &str) -> MiniDbResult<&IndexEntry> {
        self.content
            .indexes
            .get(&Self::canonical(name))
            .ok_or_else(|| MiniDbError::Catalog(format!("Index '{}' does not exist", name)))
    }

    pub fn index_path(&self, name: &str) -> MiniDbResult<PathBuf> {
        Ok(self.data_dir.join(&self.index(name)?.file))
    }

    pub fn indexes_for_table(&self, table: &str) -> Vec<(String, IndexEntry)> {
        let key = Self::canonical(table);
        self.content
            .indexes
            .iter()
            .filter(|(_, ix)| ix.table == key)
            .map(|(n, ix)| (n.clone(), ix.clone()))
            .collect()
    }

    pub fn index_names(&self) -> Vec<String> {
        self.content.indexes.keys().cloned().collect()
    }

    pub fn register_index(&mut self, name: &str, table: &str, column: &str) -> MiniDbResult<PathBuf> {
        let key = Self::canonical(name);
        if self.content.indexes.contains_key(&key) {
            return Err(MiniDbError::Catalog(format!(
                "Index '{}' already exists",
                name
            )));
        }
        let table_key = Self::canonical(table);
        if !self.content.tables.contains_key(&table_key) {
            return Err(MiniDbError::Catalog(format!(
                "Table '{}' does not exist",
                table
            )));
        }
        let file = format!("{}.idx", key);
        self.content.indexes.insert(
            key,
            IndexEntry {
                table: table_key,
                column: column.to_lowercase(),
                file: file.clone(),
            },
        );
        Ok(self.data_dir.join(file))
    }

    /// Unregister an index; returns the file to delete once committed.
    pub fn unregister_index(&mut self, name: &str) -> MiniDbResult<PathBuf> {
        let key = Self::canonical(name);
        let entry = self
            .content
            .indexes
            .remove(&key)
            .ok_or_else(|| MiniDbError::Catalog(format!("Index '{}' does not exist", name)))?;
        Ok(self.data_dir.join(entry.file))
    }
}
