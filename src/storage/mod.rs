pub mod page;
pub use page::{Page, Rid, PAGE_SIZE};

pub mod tuple;

pub mod buffer;
pub use buffer::BufferPool;

pub mod heap;
pub use heap::TableHeap;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, RwLock};

use crate::common::{MiniDbError, MiniDbResult};

use buffer::EvictedPage;

/// Read one page image from disk. `verify` enables CRC + invariant checks.
pub fn read_page_from_disk(path: &Path, page_id: u32, verify: bool) -> MiniDbResult<Page> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(page_id as u64 * PAGE_SIZE as u64))?;
    let mut buf = vec![0u8; PAGE_SIZE];
    file.read_exact(&mut buf).map_err(|_| {
        MiniDbError::Storage(format!(
            "Incomplete page read: page {} of {}",
            page_id,
            path.display()
        ))
    })?;
    Page::from_bytes(&buf, verify)
}

/// Write one page image at its offset. The file is extended as needed.
pub fn write_page_to_disk(path: &Path, page_id: u32, page: &Page) -> MiniDbResult<()> {
    let mut file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
    file.seek(SeekFrom::Start(page_id as u64 * PAGE_SIZE as u64))?;
    file.write_all(&page.to_bytes())?;
    Ok(())
}

/// Write a dirty page that the buffer pool evicted. Durable: the page may
/// be the only remaining copy.
pub fn write_evicted(evicted: Option<EvictedPage>) -> MiniDbResult<()> {
    if let Some((path, page_id, page)) = evicted {
        let image = page.read().unwrap().to_bytes();
        let mut file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        file.seek(SeekFrom::Start(page_id as u64 * PAGE_SIZE as u64))?;
        file.write_all(&image)?;
        file.sync_data()?;
    }
    Ok(())
}

/// Fetch a page through the buffer pool, reading from disk on a miss.
/// Returns None when the file does not exist or the page is beyond EOF.
pub fn fetch_page(
    buffer: &BufferPool,
    path: &Path,
    page_id: u32,
    verify: bool,
) -> MiniDbResult<Option<Arc<RwLock<Page>>>> {
    if let Some(page) = buffer.get(path, page_id) {
        return Ok(Some(page));
    }
    let Ok(meta) = std::fs::metadata(path) else {
        return Ok(None);
    };
    if (page_id as u64 + 1) * PAGE_SIZE as u64 > meta.len() {
        return Ok(None);
    }
    let page = read_page_from_disk(path, page_id, verify)?;
    let evicted = buffer.put(path, page_id, page, false)?;
    write_evicted(evicted)?;
    Ok(buffer.get(path, page_id))
}

/// Write a batch of dirty pages of one file and fsync it once.
pub fn flush_pages_to_disk(path: &Path, pages: &[(u32, Arc<RwLock<Page>>)]) -> MiniDbResult<()> {
    if pages.is_empty() {
        return Ok(());
    }
    let mut file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
    for (page_id, page) in pages {
        let image = page.read().unwrap().to_bytes();
        file.seek(SeekFrom::Start(*page_id as u64 * PAGE_SIZE as u64))?;
        file.write_all(&image)?;
    }
    file.flush()?;
    file.sync_data()?;
    Ok(())
}
