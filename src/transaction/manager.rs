//! Transaction lifecycle: begin/commit/abort, WAL chaining and physical
//! undo with CLR logging.
//!
//! Strict ordering for every mutation: (1) WAL record appended, (2) page
//! mutated, (3) page_lsn stamped, (4) page marked dirty. Locks are
//! released only after the COMMIT/ABORT record is durable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, warn};

use crate::common::{MiniDbError, MiniDbResult};
use crate::concurrency::LockManager;
use crate::storage::{fetch_page, flush_pages_to_disk, BufferPool, Page, Rid};
use crate::wal::record::{
    pack_dml_payload, pack_update_payload, parse_clr_payload, parse_dml_payload,
    parse_update_payload,
};
use crate::wal::{LogManager, WalRecordType, NULL_LSN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

pub type TxnHook = Box<dyn FnOnce() + Send + 'static>;

struct TxnInfo {
    state: TxnState,
    last_lsn: u64,
    commit_hooks: Vec<TxnHook>,
    rollback_hooks: Vec<TxnHook>,
}

impl TxnInfo {
    fn new() -> Self {
        TxnInfo {
            state: TxnState::Active,
            last_lsn: NULL_LSN,
            commit_hooks: Vec::new(),
            rollback_hooks: Vec::new(),
        }
    }
}

struct TxnInner {
    next_txn_id: u32,
    txns: HashMap<u32, TxnInfo>,
}

pub struct TransactionManager {
    log: Arc<LogManager>,
    buffer: Arc<BufferPool>,
    locks: Arc<LockManager>,
    data_dir: PathBuf,
    inner: Mutex<TxnInner>,
}

impl TransactionManager {
    pub fn new(
        log: Arc<LogManager>,
        buffer: Arc<BufferPool>,
        locks: Arc<LockManager>,
        data_dir: &Path,
    ) -> Self {
        TransactionManager {
            log,
            buffer,
            locks,
            data_dir: data_dir.to_path_buf(),
            inner: Mutex::new(TxnInner {
                next_txn_id: 1,
                txns: HashMap::new(),
            }),
        }
    }

    // ==================== Lifecycle ====================

    pub fn begin(&self) -> MiniDbResult<u32> {
        let txn_id = {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.next_txn_id;
            inner.next_txn_id += 1;
            inner.txns.insert(id, TxnInfo::new());
            id
        };
        let lsn = self.log.append_begin(txn_id)?;
        self.set_last_lsn(txn_id, lsn);
        debug!(txn_id, lsn, "BEGIN");
        Ok(txn_id)
    }

    /// Commit: COMMIT record forced to disk, locks released after
    /// durability, dirty pages flushed opportunistically, hooks fired.
    pub fn commit(&self, txn_id: u32) -> MiniDbResult<()> {
        let last_lsn = self.active_last_lsn(txn_id)?;
        let lsn = self.log.append_commit(txn_id, last_lsn)?;

        let hooks = {
            let mut inner = self.inner.lock().unwrap();
            let info = inner.txns.get_mut(&txn_id).expect("txn checked active");
            info.last_lsn = lsn;
            info.state = TxnState::Committed;
            info.rollback_hooks.clear();
            std::mem::take(&mut info.commit_hooks)
        };

        self.locks.release_all(txn_id);
        self.flush_dirty_pages()?;
        for hook in hooks {
            hook();
        }
        debug!(txn_id, lsn, "COMMIT");
        Ok(())
    }

    /// Abort: undo all changes backward through the WAL chain (writing
    /// CLRs), then force an ABORT record and release locks.
    pub fn abort(&self, txn_id: u32) -> MiniDbResult<()> {
        let last_lsn = self.active_last_lsn(txn_id)?;
        self.undo_txn(txn_id, last_lsn)?;

        let chained = self.last_lsn(txn_id);
        let lsn = self.log.append_abort(txn_id, chained)?;

        let hooks = {
            let mut inner = self.inner.lock().unwrap();
            let info = inner.txns.get_mut(&txn_id).expect("txn checked active");
            info.last_lsn = lsn;
            info.state = TxnState::Aborted;
            info.commit_hooks.clear();
            std::mem::take(&mut info.rollback_hooks)
        };

        self.locks.release_all(txn_id);
        for hook in hooks {
            hook();
        }
        debug!(txn_id, lsn, "ABORT");
        Ok(())
    }

    // ==================== Queries ====================

    pub fn is_active(&self, txn_id: u32) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .txns
            .get(&txn_id)
            .map(|i| i.state == TxnState::Active)
            .unwrap_or(false)
    }

    pub fn state(&self, txn_id: u32) -> Option<TxnState> {
        self.inner.lock().unwrap().txns.get(&txn_id).map(|i| i.state)
    }

    pub fn last_lsn(&self, txn_id: u32) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.txns.get(&txn_id).map(|i| i.last_lsn).unwrap_or(NULL_LSN)
    }

    fn set_last_lsn(&self, txn_id: u32, lsn: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(info) = inner.txns.get_mut(&txn_id) {
            info.last_lsn = lsn;
        }
    }

    fn active_last_lsn(&self, txn_id: u32) -> MiniDbResult<u64> {
        let inner = self.inner.lock().unwrap();
        let info = inner
            .txns
            .get(&txn_id)
            .ok_or_else(|| MiniDbError::Transaction(format!("Unknown transaction {}", txn_id)))?;
        if info.state != TxnState::Active {
            return Err(MiniDbError::Transaction(format!(
                "Transaction {} is {:?}, not Active",
                txn_id, info.state
            )));
        }
        Ok(info.last_lsn)
    }

    // ==================== WAL logging (called by the executor around heap mutations) ====================

    pub fn log_insert(&self, txn_id: u32, table: &str, rid: Rid, tuple: &[u8]) -> MiniDbResult<u64> {
        let prev = self.active_last_lsn(txn_id)?;
        let lsn = self.log.append_insert(txn_id, prev, table, rid, tuple)?;
        self.set_last_lsn(txn_id, lsn);
        Ok(lsn)
    }

    pub fn log_delete(&self, txn_id: u32, table: &str, rid: Rid, before: &[u8]) -> MiniDbResult<u64> {
        let prev = self.active_last_lsn(txn_id)?;
        let lsn = self.log.append_delete(txn_id, prev, table, rid, before)?;
        self.set_last_lsn(txn_id, lsn);
        Ok(lsn)
    }

    pub fn log_update(
        &self,
        txn_id: u32,
        table: &str,
        rid: Rid,
        old: &[u8],
        new: &[u8],
    ) -> MiniDbResult<u64> {
        let prev = self.active_last_lsn(txn_id)?;
        let lsn = self.log.append_update(txn_id, prev, table, rid, old, new)?;
        self.set_last_lsn(txn_id, lsn);
        Ok(lsn)
    }

    /// Register callbacks fired after commit / after rollback (catalog
    /// persistence, file deletion). Hooks must not fail.
    pub fn register_hook(
        &self,
        txn_id: u32,
        commit: Option<TxnHook>,
        rollback: Option<TxnHook>,
    ) -> MiniDbResult<()> {
        self.active_last_lsn(txn_id)?;
        let mut inner = self.inner.lock().unwrap();
        let info = inner.txns.get_mut(&txn_id).expect("txn checked active");
        if let Some(h) = commit {
            info.commit_hooks.push(h);
        }
        if let Some(h) = rollback {
            info.rollback_hooks.push(h);
        }
        Ok(())
    }

    // ==================== Undo ====================

    /// Walk backward through the transaction's WAL chain and compensate
    /// every mutation. CLRs encountered jump to their undo_next_lsn so
    /// already-compensated work is never undone twice.
    pub(crate) fn undo_txn(&self, txn_id: u32, from_lsn: u64) -> MiniDbResult<()> {
        let mut lsn = from_lsn;
        while lsn != NULL_LSN {
            let entry = self.log.read_record(lsn)?;
            if entry.txn_id != txn_id {
                return Err(MiniDbError::WalCorruption(format!(
                    "LSN chain corrupt: expected txn {}, got {} at {}",
                    txn_id, entry.txn_id, lsn
                )));
            }

            let mut next_lsn = entry.prev_lsn;
            match entry.record_type {
                WalRecordType::Clr => {
                    let (undo_next, _, _) = parse_clr_payload(&entry.payload)?;
                    next_lsn = undo_next;
                }
                WalRecordType::Insert => {
                    let (table, rid, _) = parse_dml_payload(&entry.payload)?;
                    self.undo_insert(txn_id, &table, rid, next_lsn)?;
                }
                WalRecordType::Delete => {
                    let (table, rid, before) = parse_dml_payload(&entry.payload)?;
                    self.undo_delete(txn_id, &table, rid, &before, next_lsn)?;
                }
                WalRecordType::Update => {
                    let (table, rid, old, new) = parse_update_payload(&entry.payload)?;
                    self.undo_update(txn_id, &table, rid, &old, &new, next_lsn)?;
                }
                // BEGIN, COMMIT, ABORT, CHECKPOINT: nothing to undo.
                _ => {}
            }
            lsn = next_lsn;
        }
        Ok(())
    }

    fn undo_insert(&self, txn_id: u32, table: &str, rid: Rid, undo_next: u64) -> MiniDbResult<()> {
        let path = self.resolve_table_path(table);
        let page = self.fetch(&path, rid.page_id)?;
        if let Some(page) = &page {
            page.write().unwrap().delete_tuple(rid.slot_id);
            self.buffer.mark_dirty(&path, rid.page_id);
        }

        let clr_payload = pack_dml_payload(table, rid, &[]);
        let clr_lsn = self.log.append_clr(
            txn_id,
            self.last_lsn(txn_id),
            undo_next,
            WalRecordType::Delete,
            &clr_payload,
        )?;
        self.set_last_lsn(txn_id, clr_lsn);

        if let Some(page) = page {
            page.write().unwrap().set_page_lsn(clr_lsn);
        }
        Ok(())
    }

    fn undo_delete(
        &self,
        txn_id: u32,
        table: &str,
        rid: Rid,
        before: &[u8],
        undo_next: u64,
    ) -> MiniDbResult<()> {
        let path = self.resolve_table_path(table);
        let page = self.fetch(&path, rid.page_id)?;
        if let Some(page) = &page {
            page.write().unwrap().restore_tuple(rid.slot_id, before)?;
            self.buffer.mark_dirty(&path, rid.page_id);
        }

        let clr_payload = pack_dml_payload(table, rid, before);
        let clr_lsn = self.log.append_clr(
            txn_id,
            self.last_lsn(txn_id),
            undo_next,
            WalRecordType::Insert,
            &clr_payload,
        )?;
        self.set_last_lsn(txn_id, clr_lsn);

        if let Some(page) = page {
            page.write().unwrap().set_page_lsn(clr_lsn);
        }
        Ok(())
    }

    fn undo_update(
        &self,
        txn_id: u32,
        table: &str,
        rid: Rid,
        old: &[u8],
        new: &[u8],
        undo_next: u64,
    ) -> MiniDbResult<()> {
        let path = self.resolve_table_path(table);
        let page = self.fetch(&path, rid.page_id)?;
        if let Some(page) = &page {
            page.write().unwrap().update_tuple(rid.slot_id, old);
            self.buffer.mark_dirty(&path, rid.page_id);
        }

        // The inner images are swapped so redoing the CLR applies `old`.
        let clr_payload = pack_update_payload(table, rid, new, old);
        let clr_lsn = self.log.append_clr(
            txn_id,
            self.last_lsn(txn_id),
            undo_next,
            WalRecordType::Update,
            &clr_payload,
        )?;
        self.set_last_lsn(txn_id, clr_lsn);

        if let Some(page) = page {
            page.write().unwrap().set_page_lsn(clr_lsn);
        }
        Ok(())
    }

    // ==================== Page plumbing ====================

    /// WAL payloads carry either a bare table name (resolved inside the
    /// data dir) or an absolute file path.
    pub(crate) fn resolve_table_path(&self, table: &str) -> PathBuf {
        let p = Path::new(table);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.data_dir.join(format!("{}.tbl", table))
        }
    }

    pub(crate) fn fetch(&self, path: &Path, page_id: u32) -> MiniDbResult<Option<Arc<RwLock<Page>>>> {
        let found = fetch_page(&self.buffer, path, page_id, true)?;
        if found.is_none() {
            warn!(path = %path.display(), page_id, "undo/redo target page missing, skipping");
        }
        Ok(found)
    }

    /// Flush every dirty page in the pool with fsync, grouped per file.
    pub fn flush_dirty_pages(&self) -> MiniDbResult<()> {
        let dirty = self.buffer.flush_all();
        let mut by_file: HashMap<PathBuf, Vec<(u32, Arc<RwLock<Page>>)>> = HashMap::new();
        for (path, page_id, page) in dirty {
            by_file.entry(path).or_default().push((page_id, page));
        }
        for (path, pages) in by_file {
            flush_pages_to_disk(&path, &pages)?;
        }
        Ok(())
    }

    // ==================== Recovery support ====================

    pub fn set_next_txn_id(&self, next: u32) {
        self.inner.lock().unwrap().next_txn_id = next;
    }

    /// Register a transaction discovered by recovery analysis.
    pub fn register_recovered(&self, txn_id: u32, state: TxnState, last_lsn: u64) {
        let mut inner = self.inner.lock().unwrap();
        let mut info = TxnInfo::new();
        info.state = state;
        info.last_lsn = last_lsn;
        inner.txns.insert(txn_id, info);
    }

    /// Force-transition a recovered transaction (used after recovery's
    /// undo pass, which bypasses the lock manager).
    pub(crate) fn mark_aborted(&self, txn_id: u32, last_lsn: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(info) = inner.txns.get_mut(&txn_id) {
            info.state = TxnState::Aborted;
            info.last_lsn = last_lsn;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Column, Schema};
    use crate::common::{DataType, Value};
    use crate::storage::TableHeap;
    use crate::wal::WAL_PADDING;
    use tempfile::TempDir;

    fn schema() -> Schema {
        Schema::new(vec![
            Column::new("x", DataType::Int, false),
            Column::new("note", DataType::String, true),
        ])
    }

    struct Fixture {
        _dir: TempDir,
        data_dir: PathBuf,
        buffer: Arc<BufferPool>,
        log: Arc<LogManager>,
        txns: Arc<TransactionManager>,
    }

    fn setup() -> Fixture {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().to_path_buf();
        let buffer = Arc::new(BufferPool::new(32));
        let log = Arc::new(LogManager::new(&data_dir).unwrap());
        let locks = Arc::new(LockManager::new());
        let txns = Arc::new(TransactionManager::new(
            Arc::clone(&log),
            Arc::clone(&buffer),
            locks,
            &data_dir,
        ));
        Fixture {
            _dir: dir,
            data_dir,
            buffer,
            log,
            txns,
        }
    }

    fn create_table(fx: &Fixture, name: &str) -> TableHeap {
        let path = fx.data_dir.join(format!("{}.tbl", name));
        TableHeap::create(&path, name, schema(), Arc::clone(&fx.buffer)).unwrap()
    }

    fn logged_insert(fx: &Fixture, heap: &mut TableHeap, txn: u32, row: &[Value]) -> Rid {
        let rid = heap.insert_row(row).unwrap();
        let bytes = heap.tuple_bytes(rid).unwrap().unwrap();
        let lsn = fx.txns.log_insert(txn, heap.table_name(), rid, &bytes).unwrap();
        heap.stamp_page_lsn(rid.page_id, lsn).unwrap();
        rid
    }

    #[test]
    fn test_begin_commit_durability() {
        let fx = setup();
        let txn = fx.txns.begin().unwrap();
        assert!(fx.txns.is_active(txn));
        assert_eq!(fx.txns.last_lsn(txn), WAL_PADDING);

        fx.txns.commit(txn).unwrap();
        assert!(!fx.txns.is_active(txn));
        assert_eq!(fx.txns.state(txn), Some(TxnState::Committed));

        // The on-disk log ends with this txn's COMMIT.
        assert_eq!(fx.log.durable_lsn(), fx.log.next_lsn());
        let records = fx.log.scan().unwrap();
        assert_eq!(records.last().unwrap().record_type, WalRecordType::Commit);
        assert_eq!(records.last().unwrap().txn_id, txn);
    }

    #[test]
    fn test_txn_ids_monotonic() {
        let fx = setup();
        let a = fx.txns.begin().unwrap();
        let b = fx.txns.begin().unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_wal_chain_links_backward() {
        let fx = setup();
        let mut heap = create_table(&fx, "t");
        let txn = fx.txns.begin().unwrap();
        let begin_lsn = fx.txns.last_lsn(txn);

        logged_insert(&fx, &mut heap, txn, &[Value::Int(1), Value::Null]);
        let lsn1 = fx.txns.last_lsn(txn);
        logged_insert(&fx, &mut heap, txn, &[Value::Int(2), Value::Null]);
        let lsn2 = fx.txns.last_lsn(txn);

        let rec2 = fx.log.read_record(lsn2).unwrap();
        assert_eq!(rec2.prev_lsn, lsn1);
        let rec1 = fx.log.read_record(lsn1).unwrap();
        assert_eq!(rec1.prev_lsn, begin_lsn);
        fx.txns.commit(txn).unwrap();
    }

    #[test]
    fn test_abort_undoes_insert_with_clr() {
        let fx = setup();
        let mut heap = create_table(&fx, "t");

        let txn = fx.txns.begin().unwrap();
        let rid = logged_insert(&fx, &mut heap, txn, &[Value::Int(99), Value::Null]);
        assert!(heap.get_row(rid).unwrap().is_some());

        fx.txns.abort(txn).unwrap();
        assert_eq!(heap.get_row(rid).unwrap(), None);
        assert_eq!(fx.txns.state(txn), Some(TxnState::Aborted));

        // The log carries a CLR (inner DELETE) followed by ABORT.
        let records = fx.log.scan().unwrap();
        let types: Vec<WalRecordType> = records.iter().map(|r| r.record_type).collect();
        assert!(types.contains(&WalRecordType::Clr));
        assert_eq!(*types.last().unwrap(), WalRecordType::Abort);

        let clr = records
            .iter()
            .find(|r| r.record_type == WalRecordType::Clr)
            .unwrap();
        let (undo_next, inner_type, _) = parse_clr_payload(&clr.payload).unwrap();
        assert_eq!(inner_type, WalRecordType::Delete);
        assert_eq!(undo_next, WAL_PADDING); // points at BEGIN
    }

    #[test]
    fn test_abort_restores_delete_and_update() {
        let fx = setup();
        let mut heap = create_table(&fx, "t");

        // Committed base row.
        let setup_txn = fx.txns.begin().unwrap();
        let rid = logged_insert(&fx, &mut heap, setup_txn, &[Value::Int(1), Value::Str("orig".into())]);
        fx.txns.commit(setup_txn).unwrap();

        // An aborted transaction updates then deletes the row.
        let txn = fx.txns.begin().unwrap();
        let old = heap.tuple_bytes(rid).unwrap().unwrap();
        let new_row = vec![Value::Int(1), Value::Str("changed".into())];
        assert!(heap.update_row(rid, &new_row).unwrap());
        let new = heap.tuple_bytes(rid).unwrap().unwrap();
        let lsn = fx.txns.log_update(txn, "t", rid, &old, &new).unwrap();
        heap.stamp_page_lsn(rid.page_id, lsn).unwrap();

        let before = heap.tuple_bytes(rid).unwrap().unwrap();
        let lsn = fx.txns.log_delete(txn, "t", rid, &before).unwrap();
        heap.delete_row(rid).unwrap();
        heap.stamp_page_lsn(rid.page_id, lsn).unwrap();
        assert_eq!(heap.get_row(rid).unwrap(), None);

        fx.txns.abort(txn).unwrap();

        // Both mutations rolled back: the original image is visible again.
        assert_eq!(
            heap.get_row(rid).unwrap().unwrap(),
            vec![Value::Int(1), Value::Str("orig".into())]
        );
    }

    #[test]
    fn test_page_lsn_advances_monotonically() {
        let fx = setup();
        let mut heap = create_table(&fx, "t");
        let txn = fx.txns.begin().unwrap();

        let rid = logged_insert(&fx, &mut heap, txn, &[Value::Int(5), Value::Null]);
        let page = fetch_page(&fx.buffer, heap.file_path(), rid.page_id, true)
            .unwrap()
            .unwrap();
        let lsn_after_insert = page.read().unwrap().page_lsn();
        assert!(lsn_after_insert > 0);

        // Undo CLRs have higher LSNs than the records they compensate.
        fx.txns.abort(txn).unwrap();
        let lsn_after_abort = page.read().unwrap().page_lsn();
        assert!(lsn_after_abort > lsn_after_insert);
    }

    #[test]
    fn test_commit_and_rollback_hooks() {
        let fx = setup();
        use std::sync::atomic::{AtomicU32, Ordering};
        let fired = Arc::new(AtomicU32::new(0));

        let txn = fx.txns.begin().unwrap();
        let f1 = Arc::clone(&fired);
        let f2 = Arc::clone(&fired);
        fx.txns
            .register_hook(
                txn,
                Some(Box::new(move || {
                    f1.fetch_add(1, Ordering::SeqCst);
                })),
                Some(Box::new(move || {
                    f2.fetch_add(100, Ordering::SeqCst);
                })),
            )
            .unwrap();
        fx.txns.commit(txn).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1); // only the commit hook

        let txn2 = fx.txns.begin().unwrap();
        let f3 = Arc::clone(&fired);
        fx.txns
            .register_hook(
                txn2,
                None,
                Some(Box::new(move || {
                    f3.fetch_add(10, Ordering::SeqCst);
                })),
            )
            .unwrap();
        fx.txns.abort(txn2).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_operations_on_finished_txn_fail() {
        let fx = setup();
        let txn = fx.txns.begin().unwrap();
        fx.txns.commit(txn).unwrap();
        assert!(fx.txns.commit(txn).is_err());
        assert!(fx.txns.abort(txn).is_err());
        assert!(fx
            .txns
            .log_insert(txn, "t", Rid::new(1, 0), b"x")
            .is_err());
    }
}
