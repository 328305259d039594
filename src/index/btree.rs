//! Disk-backed B+Tree over encoded keys.
//!
//! File layout:
//!   Page 0:    metadata blob (JSON) stored as tuple 0 of a slotted page
//!   Pages 1..: one node per page, serialized as tuple 0
//!
//! Node serialization (big-endian):
//!   [type: u8 (0 leaf, 1 internal)][key_count: u16]
//!   [right_sibling: u32, leaves only]
//!   [keys: key_count * (len u16 + bytes)]
//!   [leaves: key_count RIDs (6 B) | internals: key_count+1 child u32]
//!
//! Leaves are chained through right_sibling for range scans. Splits keep
//! equal-key runs on one side where possible; the leaf median is copied
//! up, an internal median is pushed up. No parent pointers are stored;
//! inserts carry an explicit path vector. Delete is not supported; stale
//! entries are filtered by the executor against the heap.
//!
//! Concurrency: single-writer assumed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::common::{DataType, MiniDbError, MiniDbResult, Value};
use crate::storage::{fetch_page, flush_pages_to_disk, write_evicted, BufferPool, Page, Rid};

use super::key_encoding::{decode_key, encode_key};

/// "MIDX" in ASCII.
pub const BTREE_MAGIC: u32 = 0x4D494458;
pub const BTREE_FORMAT_VERSION: u32 = 1;

/// Serialized node budget; a node growing past this is split. Leaves
/// headroom against the slotted page's single-tuple capacity.
const MAX_NODE_BYTES: usize = 3500;
/// Largest encoded key an index accepts; one key must always fit well
/// inside a node so splitting can make progress.
const MAX_KEY_BYTES: usize = 1024;

const NO_SIBLING: u32 = 0;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BTreeMeta {
    magic: u32,
    format_version: u32,
    table: String,
    column: String,
    key_type: DataType,
    root_page_id: u32,
    next_free_page: u32,
    entry_count: u64,
    height: u32,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Leaf {
        keys: Vec<Vec<u8>>,
        rids: Vec<Rid>,
        right_sibling: u32,
    },
    Internal {
        keys: Vec<Vec<u8>>,
        children: Vec<u32>,
    },
}

impl Node {
    fn serialized_size(&self) -> usize {
        match self {
            Node::Leaf { keys, rids, .. } => {
                1 + 2 + 4 + keys.iter().map(|k| 2 + k.len()).sum::<usize>() + rids.len() * 6
            }
            Node::Internal { keys, children } => {
                1 + 2 + keys.iter().map(|k| 2 + k.len()).sum::<usize>() + children.len() * 4
            }
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.serialized_size());
        match self {
            Node::Leaf {
                keys,
                rids,
                right_sibling,
            } => {
                buf.push(0);
                buf.extend_from_slice(&(keys.len() as u16).to_be_bytes());
                buf.extend_from_slice(&right_sibling.to_be_bytes());
                for k in keys {
                    buf.extend_from_slice(&(k.len() as u16).to_be_bytes());
                    buf.extend_from_slice(k);
                }
                for rid in rids {
                    buf.extend_from_slice(&rid.to_bytes());
                }
            }
            Node::Internal { keys, children } => {
                buf.push(1);
                buf.extend_from_slice(&(keys.len() as u16).to_be_bytes());
                for k in keys {
                    buf.extend_from_slice(&(k.len() as u16).to_be_bytes());
                    buf.extend_from_slice(k);
                }
                for child in children {
                    buf.extend_from_slice(&child.to_be_bytes());
                }
            }
        }
        buf
    }

    fn from_bytes(data: &[u8]) -> MiniDbResult<Node> {
        let corrupt = |msg: &str| MiniDbError::PageCorruption(format!("B+Tree node: {}", msg));
        if data.len() < 3 {
            return Err(corrupt("truncated header"));
        }
        let node_type = data[0];
        let key_count = u16::from_be_bytes(data[1..3].try_into().unwrap()) as usize;
        let mut pos = 3;

        let right_sibling = if node_type == 0 {
            if pos + 4 > data.len() {
                return Err(corrupt("truncated sibling pointer"));
            }
            let v = u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap());
            pos += 4;
            v
        } else {
            NO_SIBLING
        };

        let mut keys = Vec::with_capacity(key_count);
        for _ in 0..key_count {
            if pos + 2 > data.len() {
                return Err(corrupt("truncated key length"));
            }
            let len = u16::from_be_bytes(data[pos..pos + 2].try_into().unwrap()) as usize;
            pos += 2;
            if pos + len > data.len() {
                return Err(corrupt("truncated key bytes"));
            }
            keys.push(data[pos..pos + len].to_vec());
            pos += len;
        }

        match node_type {
            0 => {
                let mut rids = Vec::with_capacity(key_count);
                for _ in 0..key_count {
                    if pos + 6 > data.len() {
                        return Err(corrupt("truncated RID"));
                    }
                    rids.push(Rid::from_bytes(&data[pos..pos + 6])?);
                    pos += 6;
                }
                Ok(Node::Leaf {
                    keys,
                    rids,
                    right_sibling,
                })
            }
            1 => {
                let mut children = Vec::with_capacity(key_count + 1);
                for _ in 0..key_count + 1 {
                    if pos + 4 > data.len() {
                        return Err(corrupt("truncated child pointer"));
                    }
                    children.push(u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap()));
                    pos += 4;
                }
                Ok(Node::Internal { keys, children })
            }
            other => Err(corrupt(&format!("unknown node type {}", other))),
        }
    }
}

pub struct BTree {
    file_path: PathBuf,
    buffer: Arc<BufferPool>,
    meta: BTreeMeta,
    crc_verify: bool,
}

impl BTree {
    /// Create a new index file: metadata page plus an empty leaf root.
    pub fn create(
        path: &Path,
        table: &str,
        column: &str,
        key_type: DataType,
        buffer: Arc<BufferPool>,
    ) -> MiniDbResult<Self> {
        let meta = BTreeMeta {
            magic: BTREE_MAGIC,
            format_version: BTREE_FORMAT_VERSION,
            table: table.to_string(),
            column: column.to_string(),
            key_type,
            root_page_id: 1,
            next_free_page: 2,
            entry_count: 0,
            height: 1,
        };

        let tree = BTree {
            file_path: path.to_path_buf(),
            buffer,
            meta,
            crc_verify: true,
        };

        let mut meta_page = Page::new(0);
        meta_page.insert_tuple(&tree.meta_bytes()?)?;
        let root = Node::Leaf {
            keys: Vec::new(),
            rids: Vec::new(),
            right_sibling: NO_SIBLING,
        };
        let mut root_page = Page::new(1);
        root_page.insert_tuple(&root.to_bytes())?;

        // Both pages written durably up front so open() always finds a
        // well-formed file.
        flush_pages_to_disk(
            path,
            &[
                (0, Arc::new(std::sync::RwLock::new(meta_page))),
                (1, Arc::new(std::sync::RwLock::new(root_page))),
            ],
        )?;
        debug!(path = %path.display(), table, column, "created B+Tree index");
        Ok(tree)
    }

    pub fn open(path: &Path, buffer: Arc<BufferPool>, crc_verify: bool) -> MiniDbResult<Self> {
        let meta_page = fetch_page(&buffer, path, 0, crc_verify)?.ok_or_else(|| {
            MiniDbError::Storage(format!("Index file not found: {}", path.display()))
        })?;
        let meta: BTreeMeta = {
            let page = meta_page.read().unwrap();
            let bytes = page.get_tuple(0).ok_or_else(|| {
                MiniDbError::PageCorruption("Index meta page has no tuple".to_string())
            })?;
            serde_json::from_slice(bytes)
                .map_err(|e| MiniDbError::PageCorruption(format!("Invalid index meta: {}", e)))?
        };
        if meta.magic != BTREE_MAGIC {
            return Err(MiniDbError::Storage(format!(
                "Not a minidb index file (bad magic): {}",
                path.display()
            )));
        }
        Ok(BTree {
            file_path: path.to_path_buf(),
            buffer,
            meta,
            crc_verify,
        })
    }

    pub fn key_type(&self) -> DataType {
        self.meta.key_type
    }

    pub fn table(&self) -> &str {
        &self.meta.table
    }

    pub fn column(&self) -> &str {
        &self.meta.column
    }

    pub fn entry_count(&self) -> u64 {
        self.meta.entry_count
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    // ==================== Page plumbing ====================

    fn meta_bytes(&self) -> MiniDbResult<Vec<u8>> {
        serde_json::to_vec(&self.meta)
            .map_err(|e| MiniDbError::Storage(format!("Index meta serialization failed: {}", e)))
    }

    fn load_node(&self, page_id: u32) -> MiniDbResult<Node> {
        let page = fetch_page(&self.buffer, &self.file_path, page_id, self.crc_verify)?
            .ok_or_else(|| {
                MiniDbError::PageCorruption(format!(
                    "Index node page {} missing in {}",
                    page_id,
                    self.file_path.display()
                ))
            })?;
        let page = page.read().unwrap();
        let bytes = page.get_tuple(0).ok_or_else(|| {
            MiniDbError::PageCorruption(format!("Index node page {} has no tuple", page_id))
        })?;
        Node::from_bytes(bytes)
    }

    fn store_node(&self, page_id: u32, node: &Node) -> MiniDbResult<()> {
        let bytes = node.to_bytes();
        match fetch_page(&self.buffer, &self.file_path, page_id, self.crc_verify)? {
            Some(page) => {
                let ok = page.write().unwrap().update_tuple(0, &bytes);
                if !ok {
                    return Err(MiniDbError::Storage(format!(
                        "Index node {} exceeds page capacity",
                        page_id
                    )));
                }
            }
            None => {
                // Fresh page past EOF: materialize it in the buffer;
                // the flush (or a dirty eviction) extends the file.
                let mut page = Page::new(page_id);
                page.insert_tuple(&bytes)?;
                let evicted = self.buffer.put(&self.file_path, page_id, page, true)?;
                write_evicted(evicted)?;
            }
        }
        self.buffer.mark_dirty(&self.file_path, page_id);
        Ok(())
    }

    fn save_meta(&self) -> MiniDbResult<()> {
        let bytes = self.meta_bytes()?;
        let page = fetch_page(&self.buffer, &self.file_path, 0, self.crc_verify)?.ok_or_else(
            || MiniDbError::Storage("Index meta page disappeared".to_string()),
        )?;
        let ok = page.write().unwrap().update_tuple(0, &bytes);
        if !ok {
            return Err(MiniDbError::Storage("Index meta exceeds page capacity".to_string()));
        }
        self.buffer.mark_dirty(&self.file_path, 0);
        Ok(())
    }

    fn alloc_page(&mut self) -> u32 {
        let pid = self.meta.next_free_page;
        self.meta.next_free_page += 1;
        pid
    }

    /// Write this index's dirty pages with fsync.
    pub fn flush(&self) -> MiniDbResult<()> {
        let dirty = self.buffer.flush_file(&self.file_path);
        flush_pages_to_disk(&self.file_path, &dirty)
    }

    // ==================== Descent helpers ====================

    /// Insert descent: equal keys go right, so duplicates append at the
    /// end of their run.
    fn child_for_insert(keys: &[Vec<u8>], k: &[u8]) -> usize {
        keys.iter()
            .position(|ki| k < ki.as_slice())
            .unwrap_or(keys.len())
    }

    /// Search descent: equal keys go left, so the leftmost member of an
    /// equal-key group is always reached.
    fn child_for_search(keys: &[Vec<u8>], k: &[u8]) -> usize {
        keys.iter()
            .position(|ki| k <= ki.as_slice())
            .unwrap_or(keys.len())
    }

    fn descend_to_leaf(&self, k: Option<&[u8]>, for_insert: bool) -> MiniDbResult<(u32, Vec<u32>)> {
        let mut path = Vec::new();
        let mut pid = self.meta.root_page_id;
        loop {
            match self.load_node(pid)? {
                Node::Internal { keys, children } => {
                    path.push(pid);
                    let idx = match k {
                        None => 0, // leftmost leaf
                        Some(k) if for_insert => Self::child_for_insert(&keys, k),
                        Some(k) => Self::child_for_search(&keys, k),
                    };
                    pid = children[idx];
                }
                Node::Leaf { .. } => return Ok((pid, path)),
            }
        }
    }

    // ==================== Insert ====================

    pub fn insert(&mut self, key: &Value, rid: Rid) -> MiniDbResult<()> {
        let kbytes = encode_key(key, self.meta.key_type)?;
        if kbytes.len() > MAX_KEY_BYTES {
            return Err(MiniDbError::Execution(format!(
                "Index key too large: {} bytes (max {})",
                kbytes.len(),
                MAX_KEY_BYTES
            )));
        }

        let (leaf_pid, mut path) = self.descend_to_leaf(Some(&kbytes), true)?;
        let mut node = self.load_node(leaf_pid)?;
        {
            let Node::Leaf { keys, rids, .. } = &mut node else {
                return Err(MiniDbError::PageCorruption(
                    "Descent ended on an internal node".to_string(),
                ));
            };
            // Sorted position; ties broken by RID bytes for determinism.
            let rid_bytes = rid.to_bytes();
            let pos = keys
                .iter()
                .zip(rids.iter())
                .position(|(k, r)| {
                    (kbytes.as_slice(), rid_bytes.as_slice()) < (k.as_slice(), &r.to_bytes()[..])
                })
                .unwrap_or(keys.len());
            keys.insert(pos, kbytes);
            rids.insert(pos, rid);
        }
        self.store_node(leaf_pid, &node)?;

        // Split upward while the current node exceeds the budget.
        let mut cur_pid = leaf_pid;
        let mut cur = node;
        while cur.serialized_size() > MAX_NODE_BYTES {
            let right_pid = self.alloc_page();
            let (separator, right) = self.split_node(&mut cur, right_pid);
            self.store_node(cur_pid, &cur)?;
            self.store_node(right_pid, &right)?;

            match path.pop() {
                Some(parent_pid) => {
                    let mut parent = self.load_node(parent_pid)?;
                    let Node::Internal { keys, children } = &mut parent else {
                        return Err(MiniDbError::PageCorruption(
                            "Leaf found on the insert path".to_string(),
                        ));
                    };
                    let idx = children
                        .iter()
                        .position(|&c| c == cur_pid)
                        .ok_or_else(|| {
                            MiniDbError::PageCorruption("Split child missing from parent".to_string())
                        })?;
                    keys.insert(idx, separator);
                    children.insert(idx + 1, right_pid);
                    self.store_node(parent_pid, &parent)?;
                    cur_pid = parent_pid;
                    cur = parent;
                }
                None => {
                    // Root split: one level taller.
                    let new_root_pid = self.alloc_page();
                    let new_root = Node::Internal {
                        keys: vec![separator],
                        children: vec![cur_pid, right_pid],
                    };
                    self.store_node(new_root_pid, &new_root)?;
                    self.meta.root_page_id = new_root_pid;
                    self.meta.height += 1;
                    debug!(
                        root = new_root_pid,
                        height = self.meta.height,
                        "B+Tree root split"
                    );
                    break;
                }
            }
        }

        self.meta.entry_count += 1;
        self.save_meta()
    }

    /// Split `node` in half. Leaves copy the median key up and join the
    /// sibling chain; internals push the median up. The split point is
    /// nudged to an equal-key boundary when one exists, keeping duplicate
    /// runs on a single side.
    fn split_node(&self, node: &mut Node, right_pid: u32) -> (Vec<u8>, Node) {
        match node {
            Node::Leaf {
                keys,
                rids,
                right_sibling,
            } => {
                let split = Self::leaf_split_point(keys);
                let right_keys = keys.split_off(split);
                let right_rids = rids.split_off(split);
                let separator = right_keys[0].clone();
                let right = Node::Leaf {
                    keys: right_keys,
                    rids: right_rids,
                    right_sibling: *right_sibling,
                };
                *right_sibling = right_pid;
                (separator, right)
            }
            Node::Internal { keys, children } => {
                let mid = keys.len() / 2;
                let separator = keys[mid].clone();
                let right_keys = keys.split_off(mid + 1);
                keys.pop(); // the median moves up
                let right_children = children.split_off(mid + 1);
                let right = Node::Internal {
                    keys: right_keys,
                    children: right_children,
                };
                (separator, right)
            }
        }
    }

    /// Pick a leaf split point near the middle that does not cut through
    /// an equal-key run; a run with no boundary falls back to the middle.
    fn leaf_split_point(keys: &[Vec<u8>]) -> usize {
        let mid = keys.len() / 2;
        let boundary = |i: usize| i > 0 && i < keys.len() && keys[i - 1] != keys[i];
        if boundary(mid) {
            return mid;
        }
        for delta in 1..keys.len() {
            if mid >= delta && boundary(mid - delta) {
                return mid - delta;
            }
            if boundary(mid + delta) {
                return mid + delta;
            }
        }
        mid
    }

    // ==================== Lookups ====================

    /// All RIDs whose key equals `key`, in (key, rid) order. Follows the
    /// sibling chain for groups that span leaves.
    pub fn search(&self, key: &Value) -> MiniDbResult<Vec<Rid>> {
        let kbytes = encode_key(key, self.meta.key_type)?;
        let (leaf_pid, _) = self.descend_to_leaf(Some(&kbytes), false)?;

        let mut out = Vec::new();
        let mut pid = leaf_pid;
        loop {
            let Node::Leaf {
                keys,
                rids,
                right_sibling,
            } = self.load_node(pid)?
            else {
                return Err(MiniDbError::PageCorruption(
                    "Sibling chain reached an internal node".to_string(),
                ));
            };
            let mut past_group = false;
            for (k, rid) in keys.iter().zip(rids.iter()) {
                if k.as_slice() == kbytes.as_slice() {
                    out.push(*rid);
                } else if k.as_slice() > kbytes.as_slice() {
                    past_group = true;
                    break;
                }
            }
            if past_group || right_sibling == NO_SIBLING {
                break;
            }
            pid = right_sibling;
        }
        Ok(out)
    }

    /// Ordered (key, rid) pairs within [low, high]; either bound may be
    /// open, inclusivity is per-bound.
    pub fn range_scan(
        &self,
        low: Option<&Value>,
        high: Option<&Value>,
        low_inclusive: bool,
        high_inclusive: bool,
    ) -> MiniDbResult<Vec<(Value, Rid)>> {
        let low_bytes = match low {
            Some(v) => Some(encode_key(v, self.meta.key_type)?),
            None => None,
        };
        let high_bytes = match high {
            Some(v) => Some(encode_key(v, self.meta.key_type)?),
            None => None,
        };

        let (start_pid, _) = self.descend_to_leaf(low_bytes.as_deref(), false)?;
        let mut out = Vec::new();
        let mut pid = start_pid;
        loop {
            let Node::Leaf {
                keys,
                rids,
                right_sibling,
            } = self.load_node(pid)?
            else {
                return Err(MiniDbError::PageCorruption(
                    "Sibling chain reached an internal node".to_string(),
                ));
            };
            for (k, rid) in keys.iter().zip(rids.iter()) {
                if let Some(lo) = &low_bytes {
                    let below = if low_inclusive {
                        k.as_slice() < lo.as_slice()
                    } else {
                        k.as_slice() <= lo.as_slice()
                    };
                    if below {
                        continue;
                    }
                }
                if let Some(hi) = &high_bytes {
                    let beyond = if high_inclusive {
                        k.as_slice() > hi.as_slice()
                    } else {
                        k.as_slice() >= hi.as_slice()
                    };
                    if beyond {
                        return Ok(out);
                    }
                }
                out.push((decode_key(k, self.meta.key_type)?, *rid));
            }
            if right_sibling == NO_SIBLING {
                return Ok(out);
            }
            pid = right_sibling;
        }
    }

    // ==================== Structure verification (tests) ====================

    /// Walk the whole tree checking per-node ordering, that parent
    /// separators enclose their children, and that the leaf chain is
    /// acyclic, ordered and complete.
    pub fn verify_structure(&self) -> MiniDbResult<()> {
        let mut leaves_in_order = Vec::new();
        self.verify_node(self.meta.root_page_id, None, None, &mut leaves_in_order)?;

        // The sibling chain must enumerate exactly the DFS leaf order.
        let mut pid = leaves_in_order
            .first()
            .copied()
            .ok_or_else(|| MiniDbError::Storage("Tree has no leaves".to_string()))?;
        let mut seen = std::collections::HashSet::new();
        let mut chain = Vec::new();
        loop {
            if !seen.insert(pid) {
                return Err(MiniDbError::Storage(format!(
                    "Leaf chain cycle at page {}",
                    pid
                )));
            }
            chain.push(pid);
            match self.load_node(pid)? {
                Node::Leaf { right_sibling, .. } => {
                    if right_sibling == NO_SIBLING {
                        break;
                    }
                    pid = right_sibling;
                }
                _ => {
                    return Err(MiniDbError::Storage(
                        "Leaf chain reached an internal node".to_string(),
                    ));
                }
            }
        }
        if chain != leaves_in_order {
            return Err(MiniDbError::Storage(
                "Leaf chain does not match tree order".to_string(),
            ));
        }
        Ok(())
    }

    fn verify_node(
        &self,
        pid: u32,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
        leaves: &mut Vec<u32>,
    ) -> MiniDbResult<()> {
        let bad = |msg: String| Err(MiniDbError::Storage(format!("Page {}: {}", pid, msg)));
        match self.load_node(pid)? {
            Node::Leaf { keys, rids, .. } => {
                if keys.len() != rids.len() {
                    return bad(format!("{} keys vs {} rids", keys.len(), rids.len()));
                }
                for w in keys.windows(2) {
                    if w[0] > w[1] {
                        return bad("leaf keys out of order".to_string());
                    }
                }
                for k in &keys {
                    if let Some(lo) = low {
                        if k.as_slice() < lo {
                            return bad("leaf key below parent separator".to_string());
                        }
                    }
                    if let Some(hi) = high {
                        if k.as_slice() > hi {
                            return bad("leaf key above parent separator".to_string());
                        }
                    }
                }
                leaves.push(pid);
                Ok(())
            }
            Node::Internal { keys, children } => {
                if children.len() != keys.len() + 1 {
                    return bad(format!(
                        "{} children for {} keys",
                        children.len(),
                        keys.len()
                    ));
                }
                for w in keys.windows(2) {
                    if w[0] > w[1] {
                        return bad("internal keys out of order".to_string());
                    }
                }
                for (i, &child) in children.iter().enumerate() {
                    let child_low = if i == 0 { low } else { Some(keys[i - 1].as_slice()) };
                    let child_high = if i == keys.len() {
                        high
                    } else {
                        Some(keys[i].as_slice())
                    };
                    self.verify_node(child, child_low, child_high, leaves)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup(key_type: DataType) -> (TempDir, BTree) {
        let dir = TempDir::new().unwrap();
        let buffer = Arc::new(BufferPool::new(64));
        let tree = BTree::create(&dir.path().join("t_x.idx"), "t", "x", key_type, buffer).unwrap();
        (dir, tree)
    }

    #[test]
    fn test_empty_tree() {
        let (_dir, tree) = setup(DataType::Int);
        assert_eq!(tree.entry_count(), 0);
        assert_eq!(tree.height(), 1);
        assert!(tree.search(&Value::Int(5)).unwrap().is_empty());
        assert!(tree.range_scan(None, None, true, true).unwrap().is_empty());
        tree.verify_structure().unwrap();
    }

    #[test]
    fn test_insert_search_small() {
        let (_dir, mut tree) = setup(DataType::Int);
        for i in [5, 1, 9, 3, 7] {
            tree.insert(&Value::Int(i), Rid::new(1, i as u16)).unwrap();
        }
        assert_eq!(tree.entry_count(), 5);
        assert_eq!(tree.search(&Value::Int(3)).unwrap(), vec![Rid::new(1, 3)]);
        assert!(tree.search(&Value::Int(4)).unwrap().is_empty());

        let all = tree.range_scan(None, None, true, true).unwrap();
        let keys: Vec<i32> = all
            .iter()
            .map(|(v, _)| match v {
                Value::Int(i) => *i,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(keys, vec![1, 3, 5, 7, 9]);
        tree.verify_structure().unwrap();
    }

    #[test]
    fn test_splits_and_height_growth() {
        let (_dir, mut tree) = setup(DataType::Int);
        let n = 3000;
        // Interleaved order to exercise both split directions.
        for i in 0..n {
            let v = if i % 2 == 0 { i } else { n - i };
            tree.insert(&Value::Int(v), Rid::new((v / 100) as u32 + 1, (v % 100) as u16))
                .unwrap();
        }
        assert_eq!(tree.entry_count(), n as u64);
        assert!(tree.height() > 1, "tree should have split");
        tree.verify_structure().unwrap();

        let all = tree.range_scan(None, None, true, true).unwrap();
        assert_eq!(all.len(), n as usize);
        for w in all.windows(2) {
            assert!(w[0].0.compare(&w[1].0).unwrap() != std::cmp::Ordering::Greater);
        }
    }

    #[test]
    fn test_duplicate_keys_across_leaves() {
        let (_dir, mut tree) = setup(DataType::Int);
        // Many duplicates of one key plus surrounding values.
        for slot in 0..200u16 {
            tree.insert(&Value::Int(500), Rid::new(1, slot)).unwrap();
        }
        for i in 0..300 {
            tree.insert(&Value::Int(i), Rid::new(2, i as u16)).unwrap();
        }
        for i in 700..900 {
            tree.insert(&Value::Int(i), Rid::new(3, (i - 700) as u16)).unwrap();
        }
        tree.verify_structure().unwrap();

        let hits = tree.search(&Value::Int(500)).unwrap();
        assert_eq!(hits.len(), 200);
        // Ties are ordered by RID bytes.
        for w in hits.windows(2) {
            assert!(w[0].to_bytes() <= w[1].to_bytes());
        }
    }

    #[test]
    fn test_range_scan_bounds() {
        let (_dir, mut tree) = setup(DataType::Int);
        for i in 0..100 {
            tree.insert(&Value::Int(i), Rid::new(1, i as u16)).unwrap();
        }
        let collect = |lo: Option<i32>, hi: Option<i32>, li: bool, hi_inc: bool| -> Vec<i32> {
            let lo_v = lo.map(Value::Int);
            let hi_v = hi.map(Value::Int);
            tree.range_scan(lo_v.as_ref(), hi_v.as_ref(), li, hi_inc)
                .unwrap()
                .iter()
                .map(|(v, _)| match v {
                    Value::Int(i) => *i,
                    _ => unreachable!(),
                })
                .collect()
        };
        assert_eq!(collect(Some(10), Some(15), true, true), vec![10, 11, 12, 13, 14, 15]);
        assert_eq!(collect(Some(10), Some(15), false, false), vec![11, 12, 13, 14]);
        assert_eq!(collect(None, Some(2), true, true), vec![0, 1, 2]);
        assert_eq!(collect(Some(97), None, false, true), vec![98, 99]);
    }

    #[test]
    fn test_string_keys() {
        let (_dir, mut tree) = setup(DataType::String);
        for (i, s) in ["pear", "apple", "fig", "banana", "quince"].iter().enumerate() {
            tree.insert(&Value::Str(s.to_string()), Rid::new(1, i as u16)).unwrap();
        }
        let all = tree.range_scan(None, None, true, true).unwrap();
        let words: Vec<String> = all
            .iter()
            .map(|(v, _)| match v {
                Value::Str(s) => s.clone(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(words, vec!["apple", "banana", "fig", "pear", "quince"]);
        assert_eq!(
            tree.search(&Value::Str("fig".into())).unwrap(),
            vec![Rid::new(1, 2)]
        );
    }

    #[test]
    fn test_null_and_nan_rejected() {
        let (_dir, mut tree) = setup(DataType::Float);
        assert!(tree.insert(&Value::Null, Rid::new(1, 0)).is_err());
        assert!(tree.insert(&Value::Float(f64::NAN), Rid::new(1, 0)).is_err());
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t_x.idx");
        {
            let buffer = Arc::new(BufferPool::new(64));
            let mut tree =
                BTree::create(&path, "t", "x", DataType::Int, Arc::clone(&buffer)).unwrap();
            for i in 0..1000 {
                tree.insert(&Value::Int(i), Rid::new(1, (i % 100) as u16)).unwrap();
            }
            tree.flush().unwrap();
        }
        let buffer = Arc::new(BufferPool::new(64));
        let tree = BTree::open(&path, buffer, true).unwrap();
        assert_eq!(tree.entry_count(), 1000);
        assert_eq!(tree.table(), "t");
        assert_eq!(tree.column(), "x");
        assert_eq!(tree.key_type(), DataType::Int);
        assert_eq!(tree.search(&Value::Int(999)).unwrap().len(), 1);
        tree.verify_structure().unwrap();
    }
}
