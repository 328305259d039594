//! Table heap: one `.tbl` file of 4 KB pages behind the buffer pool.
//!
//! File layout:
//!   Page 0:    header page; tuple 0 is a JSON blob
//!              {magic, format_version, table_name, schema}
//!   Page 1..N: data pages
//!
//! Page allocation appends exactly one zero-initialised page to the file
//! with an fsync, so a crash can leave an empty trailing page but never a
//! torn one. Scans are deterministic: ascending page id, ascending live
//! slot id within each page.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde_json::json;
use tracing::debug;

use crate::catalog::Schema;
use crate::common::{MiniDbError, MiniDbResult, Value};

use super::page::{MAGIC_BYTES, PAGE_FORMAT_VERSION, PAGE_SIZE};
use super::tuple::{deserialize_row, serialize_row};
use super::{fetch_page, flush_pages_to_disk, write_evicted, BufferPool, Page, Rid};

pub struct TableHeap {
    file_path: PathBuf,
    table_name: String,
    schema: Schema,
    num_pages: u32,
    buffer: Arc<BufferPool>,
    crc_verify: bool,
}

impl TableHeap {
    /// Create a new table file with the given schema and write its header
    /// page durably.
    pub fn create(
        path: &Path,
        table_name: &str,
        schema: Schema,
        buffer: Arc<BufferPool>,
    ) -> MiniDbResult<Self> {
        let meta = json!({
            "magic": MAGIC_BYTES,
            "format_version": PAGE_FORMAT_VERSION,
            "table_name": table_name,
            "schema": schema.to_json(),
        });
        let meta_bytes = serde_json::to_vec(&meta)
            .map_err(|e| MiniDbError::Storage(format!("Header serialization failed: {}", e)))?;

        let mut header_page = Page::new(0);
        header_page.insert_tuple(&meta_bytes)?;

        let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(path)?;
        file.write_all(&header_page.to_bytes())?;
        file.sync_data()?;

        let evicted = buffer.put(path, 0, header_page, false)?;
        write_evicted(evicted)?;

        debug!(table = table_name, path = %path.display(), "created table file");
        Ok(TableHeap {
            file_path: path.to_path_buf(),
            table_name: table_name.to_string(),
            schema,
            num_pages: 1,
            buffer,
            crc_verify: true,
        })
    }

    /// Open an existing table file; the header page is CRC-verified.
    pub fn open(path: &Path, buffer: Arc<BufferPool>, crc_verify: bool) -> MiniDbResult<Self> {
        let meta_len = std::fs::metadata(path)
            .map_err(|_| MiniDbError::Storage(format!("Table file not found: {}", path.display())))?
            .len();
        let num_pages = (meta_len / PAGE_SIZE as u64) as u32;
        if num_pages == 0 {
            return Err(MiniDbError::Storage(format!(
                "Table file is empty: {}",
                path.display()
            )));
        }

        let header = fetch_page(&buffer, path, 0, true)?
            .ok_or_else(|| MiniDbError::Storage(format!("Cannot read header page of {}", path.display())))?;
        let header = header.read().unwrap();
        let meta_bytes = header
            .get_tuple(0)
            .ok_or_else(|| MiniDbError::PageCorruption("Header page has no metadata tuple".to_string()))?;
        let meta: serde_json::Value = serde_json::from_slice(meta_bytes)
            .map_err(|e| MiniDbError::PageCorruption(format!("Invalid header JSON: {}", e)))?;

        if meta.get("magic").and_then(|v| v.as_u64()) != Some(MAGIC_BYTES as u64) {
            return Err(MiniDbError::Storage(format!(
                "Not a minidb table file (bad magic): {}",
                path.display()
            )));
        }
        let table_name = meta
            .get("table_name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| MiniDbError::PageCorruption("Header missing table_name".to_string()))?
            .to_string();
        let schema = Schema::from_json(
            meta.get("schema")
                .ok_or_else(|| MiniDbError::PageCorruption("Header missing schema".to_string()))?,
        )?;
        drop(header);

        Ok(TableHeap {
            file_path: path.to_path_buf(),
            table_name,
            schema,
            num_pages,
            buffer,
            crc_verify,
        })
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Data pages only (the header page is excluded).
    pub fn num_data_pages(&self) -> u32 {
        self.num_pages.saturating_sub(1)
    }

    // ==================== Page access ====================

    fn page(&self, page_id: u32) -> MiniDbResult<Arc<RwLock<Page>>> {
        fetch_page(&self.buffer, &self.file_path, page_id, self.crc_verify)?.ok_or_else(|| {
            MiniDbError::Storage(format!(
                "Page {} not found in {}",
                page_id,
                self.file_path.display()
            ))
        })
    }

    /// Append one fresh page to the file (durable) and cache it.
    fn allocate_page(&mut self) -> MiniDbResult<u32> {
        let page_id = self.num_pages;
        let page = Page::new(page_id);

        let mut file = OpenOptions::new().append(true).open(&self.file_path)?;
        file.write_all(&page.to_bytes())?;
        file.sync_data()?;

        self.num_pages += 1;
        let evicted = self.buffer.put(&self.file_path, page_id, page, false)?;
        write_evicted(evicted)?;
        debug!(table = %self.table_name, page_id, "allocated data page");
        Ok(page_id)
    }

    /// First data page that can fit `needed` bytes, or a fresh one.
    fn find_page_with_space(&mut self, needed: usize) -> MiniDbResult<u32> {
        for pid in 1..self.num_pages {
            let page = self.page(pid)?;
            let fits = page.read().unwrap().can_fit(needed);
            if fits {
                return Ok(pid);
            }
        }
        self.allocate_page()
    }

    // ==================== Row CRUD ====================

    /// Insert a row; returns its RID, stable until deleted.
    pub fn insert_row(&mut self, row: &[Value]) -> MiniDbResult<Rid> {
        let errors = self.schema.validate_row(row);
        if !errors.is_empty() {
            return Err(MiniDbError::Schema(errors.join("; ")));
        }
        let tuple_data = serialize_row(row, &self.schema)?;

        let pid = self.find_page_with_space(tuple_data.len())?;
        let page = self.page(pid)?;
        let slot_id = page.write().unwrap().insert_tuple(&tuple_data)?;
        self.buffer.mark_dirty(&self.file_path, pid);
        Ok(Rid::new(pid, slot_id))
    }

    pub fn get_row(&self, rid: Rid) -> MiniDbResult<Option<Vec<Value>>> {
        match self.tuple_bytes(rid)? {
            Some(bytes) => Ok(Some(deserialize_row(&bytes, &self.schema)?)),
            None => Ok(None),
        }
    }

    /// Raw tuple bytes for a RID; used for WAL before-images.
    pub fn tuple_bytes(&self, rid: Rid) -> MiniDbResult<Option<Vec<u8>>> {
        if rid.page_id < 1 || rid.page_id >= self.num_pages {
            return Ok(None);
        }
        let page = self.page(rid.page_id)?;
        let page = page.read().unwrap();
        Ok(page.get_tuple(rid.slot_id).map(|t| t.to_vec()))
    }

    pub fn delete_row(&mut self, rid: Rid) -> MiniDbResult<bool> {
        if rid.page_id < 1 || rid.page_id >= self.num_pages {
            return Ok(false);
        }
        let page = self.page(rid.page_id)?;
        let deleted = page.write().unwrap().delete_tuple(rid.slot_id);
        if deleted {
            self.buffer.mark_dirty(&self.file_path, rid.page_id);
        }
        Ok(deleted)
    }

    /// Update a row in place; the RID is always preserved. Returns false
    /// when the new row cannot fit in the page even after compaction.
    pub fn update_row(&mut self, rid: Rid, row: &[Value]) -> MiniDbResult<bool> {
        let errors = self.schema.validate_row(row);
        if !errors.is_empty() {
            return Err(MiniDbError::Schema(errors.join("; ")));
        }
        if rid.page_id < 1 || rid.page_id >= self.num_pages {
            return Ok(false);
        }
        let new_data = serialize_row(row, &self.schema)?;
        let page = self.page(rid.page_id)?;
        let updated = page.write().unwrap().update_tuple(rid.slot_id, &new_data);
        if updated {
            self.buffer.mark_dirty(&self.file_path, rid.page_id);
        }
        Ok(updated)
    }

    /// Stamp the page LSN after a logged mutation and keep the page dirty.
    pub fn stamp_page_lsn(&self, page_id: u32, lsn: u64) -> MiniDbResult<()> {
        let page = self.page(page_id)?;
        page.write().unwrap().set_page_lsn(lsn);
        self.buffer.mark_dirty(&self.file_path, page_id);
        Ok(())
    }

    /// Deterministic full scan: pages ascending, live slots ascending.
    pub fn scan(&self) -> HeapScan {
        HeapScan {
            buffer: Arc::clone(&self.buffer),
            file_path: self.file_path.clone(),
            schema: self.schema.clone(),
            num_pages: self.num_pages,
            crc_verify: self.crc_verify,
            cur_page: 1,
            cur_slot: 0,
        }
    }

    /// Write this table's dirty pages to disk with fsync.
    pub fn flush(&self) -> MiniDbResult<()> {
        let dirty = self.buffer.flush_file(&self.file_path);
        flush_pages_to_disk(&self.file_path, &dirty)
    }
}

/// Owning scan cursor; safe to keep across page evictions since pages are
/// re-fetched through the buffer pool on demand.
pub struct HeapScan {
    buffer: Arc<BufferPool>,
    file_path: PathBuf,
    schema: Schema,
    num_pages: u32,
    crc_verify: bool,
    cur_page: u32,
    cur_slot: u16,
}

impl Iterator for HeapScan {
    type Item = MiniDbResult<(Rid, Vec<Value>)>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.cur_page < self.num_pages {
            let page = match fetch_page(&self.buffer, &self.file_path, self.cur_page, self.crc_verify)
            {
                Ok(Some(p)) => p,
                Ok(None) => return None,
                Err(e) => return Some(Err(e)),
            };
            let page = page.read().unwrap();
            while self.cur_slot < page.num_slots() {
                let slot = self.cur_slot;
                self.cur_slot += 1;
                if let Some(tuple) = page.get_tuple(slot) {
                    let rid = Rid::new(self.cur_page, slot);
                    return match deserialize_row(tuple, &self.schema) {
                        Ok(values) => Some(Ok((rid, values))),
                        Err(e) => Some(Err(e)),
                    };
                }
            }
            self.cur_page += 1;
            self.cur_slot = 0;
        }
        None
    }
}
