//! In-memory page cache with LRU eviction, pin/unpin and dirty tracking.
//!
//! Safety guarantees:
//!   - Single-frame invariant: the same (file, page_id) is never cached
//!     twice; `put` updates the existing entry in place.
//!   - Pinned pages are never evicted; when every frame is pinned, `put`
//!     fails with `BufferExhausted`.
//!   - The pool never performs I/O itself. Evicted dirty pages and the
//!     results of `flush_*`/`invalidate_file` are handed back to the
//!     caller, which owns the file writes.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use linked_hash_map::LinkedHashMap;
use tracing::trace;

use crate::common::{MiniDbError, MiniDbResult};

use super::page::Page;

pub type PageKey = (PathBuf, u32);

struct BufferEntry {
    page: Arc<RwLock<Page>>,
    dirty: bool,
    pin_count: u32,
}

struct BufferInner {
    // LinkedHashMap keeps access order: front = least recently used.
    cache: LinkedHashMap<PageKey, BufferEntry>,
    capacity: usize,
}

pub struct BufferPool {
    inner: Mutex<BufferInner>,
}

/// A dirty page handed back to the caller for writing.
pub type EvictedPage = (PathBuf, u32, Arc<RwLock<Page>>);

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        BufferPool {
            inner: Mutex::new(BufferInner {
                cache: LinkedHashMap::new(),
                capacity,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached page lookup; promotes the entry in LRU order.
    /// Does not pin: call `pin` separately if the page must stay resident.
    pub fn get(&self, file: &Path, page_id: u32) -> Option<Arc<RwLock<Page>>> {
        let mut inner = self.inner.lock().unwrap();
        let key = (file.to_path_buf(), page_id);
        inner.cache.get_refresh(&key).map(|e| Arc::clone(&e.page))
    }

    /// Admit a page (single-frame invariant enforced). If the key exists
    /// the entry is updated and the dirty flags are OR'd. At capacity the
    /// least-recently-used unpinned entry is evicted; a dirty eviction is
    /// returned and the caller must write it to disk.
    pub fn put(
        &self,
        file: &Path,
        page_id: u32,
        page: Page,
        dirty: bool,
    ) -> MiniDbResult<Option<EvictedPage>> {
        let mut inner = self.inner.lock().unwrap();
        let key = (file.to_path_buf(), page_id);

        if let Some(entry) = inner.cache.get_refresh(&key) {
            *entry.page.write().unwrap() = page;
            entry.dirty = entry.dirty || dirty;
            return Ok(None);
        }

        let mut evicted = None;
        if inner.cache.len() >= inner.capacity {
            evicted = Self::evict_one(&mut inner)?;
        }
        inner.cache.insert(
            key,
            BufferEntry {
                page: Arc::new(RwLock::new(page)),
                dirty,
                pin_count: 0,
            },
        );
        Ok(evicted)
    }

    fn evict_one(inner: &mut BufferInner) -> MiniDbResult<Option<EvictedPage>> {
        let victim = inner
            .cache
            .iter()
            .find(|(_, e)| e.pin_count == 0)
            .map(|(k, _)| k.clone());
        let Some(key) = victim else {
            return Err(MiniDbError::BufferExhausted);
        };
        let entry = inner.cache.remove(&key).unwrap();
        trace!(file = %key.0.display(), page_id = key.1, dirty = entry.dirty, "evicting page");
        if entry.dirty {
            return Ok(Some((key.0, key.1, entry.page)));
        }
        Ok(None)
    }

    pub fn pin(&self, file: &Path, page_id: u32) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let key = (file.to_path_buf(), page_id);
        match inner.cache.get_mut(&key) {
            Some(entry) => {
                entry.pin_count += 1;
                true
            }
            None => false,
        }
    }

    pub fn unpin(&self, file: &Path, page_id: u32) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let key = (file.to_path_buf(), page_id);
        match inner.cache.get_mut(&key) {
            Some(entry) => {
                if entry.pin_count > 0 {
                    entry.pin_count -= 1;
                }
                true
            }
            None => false,
        }
    }

    pub fn mark_dirty(&self, file: &Path, page_id: u32) {
        let mut inner = self.inner.lock().unwrap();
        let key = (file.to_path_buf(), page_id);
        if let Some(entry) = inner.cache.get_mut(&key) {
            entry.dirty = true;
        }
    }

    pub fn is_dirty(&self, file: &Path, page_id: u32) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let key = (file.to_path_buf(), page_id);
        inner.cache.get_mut(&key).map(|e| e.dirty).unwrap_or(false)
    }

    /// All dirty entries, dirty flags cleared. Caller performs the I/O.
    /// Order is the deterministic LRU order of the cache.
    pub fn flush_all(&self) -> Vec<EvictedPage> {
        let mut inner = self.inner.lock().unwrap();
        let mut dirty = Vec::new();
        for (key, entry) in inner.cache.iter_mut() {
            if entry.dirty {
                dirty.push((key.0.clone(), key.1, Arc::clone(&entry.page)));
                entry.dirty = false;
            }
        }
        dirty
    }

    /// Dirty entries of one file, flags cleared. Caller performs the I/O.
    pub fn flush_file(&self, file: &Path) -> Vec<(u32, Arc<RwLock<Page>>)> {
        let mut inner = self.inner.lock().unwrap();
        let mut dirty = Vec::new();
        for (key, entry) in inner.cache.iter_mut() {
            if key.0 == file && entry.dirty {
                dirty.push((key.1, Arc::clone(&entry.page)));
                entry.dirty = false;
            }
        }
        dirty
    }

    /// Purge every entry of a file; dirty pages are returned.
    pub fn invalidate_file(&self, file: &Path) -> Vec<(u32, Arc<RwLock<Page>>)> {
        let mut inner = self.inner.lock().unwrap();
        let keys: Vec<PageKey> = inner
            .cache
            .keys()
            .filter(|k| k.0 == file)
            .cloned()
            .collect();
        let mut dirty = Vec::new();
        for key in keys {
            if let Some(entry) = inner.cache.remove(&key) {
                if entry.dirty {
                    dirty.push((key.1, entry.page));
                }
            }
        }
        dirty
    }

    /// Shutdown path: return all dirty pages and drop the whole cache.
    pub fn flush_all_and_clear(&self) -> Vec<EvictedPage> {
        let dirty = self.flush_all();
        self.inner.lock().unwrap().cache.clear();
        dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn file(name: &str) -> PathBuf {
        PathBuf::from(format!("/tmp/buffer_test/{}", name))
    }

    #[test]
    fn test_get_put_single_frame() {
        let pool = BufferPool::new(4);
        let f = file("a.tbl");
        assert!(pool.get(&f, 1).is_none());

        pool.put(&f, 1, Page::new(1), false).unwrap();
        let first = pool.get(&f, 1).unwrap();

        // Re-putting the same key updates in place: still one frame, and
        // previously handed-out references see the new content.
        let mut newer = Page::new(1);
        newer.insert_tuple(b"x").unwrap();
        pool.put(&f, 1, newer, true).unwrap();
        assert_eq!(pool.len(), 1);
        assert_eq!(first.read().unwrap().live_tuple_count(), 1);
        assert!(pool.is_dirty(&f, 1));
    }

    #[test]
    fn test_lru_eviction_order() {
        let pool = BufferPool::new(2);
        let f = file("b.tbl");
        pool.put(&f, 1, Page::new(1), false).unwrap();
        pool.put(&f, 2, Page::new(2), false).unwrap();
        // Touch page 1 so page 2 becomes LRU.
        pool.get(&f, 1);
        pool.put(&f, 3, Page::new(3), false).unwrap();
        assert!(pool.get(&f, 2).is_none());
        assert!(pool.get(&f, 1).is_some());
    }

    #[test]
    fn test_dirty_eviction_returned() {
        let pool = BufferPool::new(1);
        let f = file("c.tbl");
        pool.put(&f, 1, Page::new(1), true).unwrap();
        let evicted = pool.put(&f, 2, Page::new(2), false).unwrap();
        let (path, pid, _page) = evicted.expect("dirty page must be handed back");
        assert_eq!((path, pid), (f, 1));
    }

    #[test]
    fn test_pinned_pages_survive_eviction() {
        let pool = BufferPool::new(2);
        let f = file("d.tbl");
        pool.put(&f, 1, Page::new(1), false).unwrap();
        pool.put(&f, 2, Page::new(2), false).unwrap();
        assert!(pool.pin(&f, 1));

        // Page 1 is LRU but pinned: page 2 gets evicted instead.
        pool.put(&f, 3, Page::new(3), false).unwrap();
        assert!(pool.get(&f, 1).is_some());
        assert!(pool.get(&f, 2).is_none());

        pool.unpin(&f, 1);
    }

    #[test]
    fn test_all_pinned_is_fatal() {
        let pool = BufferPool::new(1);
        let f = file("e.tbl");
        pool.put(&f, 1, Page::new(1), false).unwrap();
        pool.pin(&f, 1);
        match pool.put(&f, 2, Page::new(2), false) {
            Err(MiniDbError::BufferExhausted) => {}
            other => panic!("expected BufferExhausted, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_flush_clears_dirty_flags() {
        let pool = BufferPool::new(4);
        let f = file("f.tbl");
        pool.put(&f, 1, Page::new(1), true).unwrap();
        pool.put(&f, 2, Page::new(2), false).unwrap();
        pool.mark_dirty(&f, 2);

        let dirty = pool.flush_all();
        assert_eq!(dirty.len(), 2);
        assert!(pool.flush_all().is_empty());
        assert!(!pool.is_dirty(&f, 1));
    }

    #[test]
    fn test_invalidate_file() {
        let pool = BufferPool::new(4);
        let fa = file("g.tbl");
        let fb = file("h.tbl");
        pool.put(&fa, 1, Page::new(1), true).unwrap();
        pool.put(&fa, 2, Page::new(2), false).unwrap();
        pool.put(&fb, 1, Page::new(1), false).unwrap();

        let dirty = pool.invalidate_file(&fa);
        assert_eq!(dirty.len(), 1);
        assert_eq!(pool.len(), 1);
        assert!(pool.get(&fb, 1).is_some());
    }
}
