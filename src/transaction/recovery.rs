//! ARIES-style crash recovery: Analysis, Redo, Undo, then a checkpoint
//! and WAL truncation. Runs at startup before any client work.
//!
//! Idempotence comes from two mechanisms: redo is guarded by the page LSN
//! (`record.lsn > page.page_lsn`), and undo writes CLRs so a crash during
//! recovery never compensates the same record twice.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info};

use crate::common::MiniDbResult;
use crate::storage::{BufferPool, Rid};
use crate::wal::record::{parse_clr_payload, parse_dml_payload, parse_update_payload};
use crate::wal::{LogManager, WalRecord, WalRecordType, WAL_PADDING};

use super::manager::{TransactionManager, TxnState};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryStats {
    pub committed_txns: usize,
    pub uncommitted_txns: usize,
    pub redo_count: usize,
    pub undo_count: usize,
}

impl RecoveryStats {
    pub fn is_noop(&self) -> bool {
        *self == RecoveryStats::default()
    }
}

pub struct RecoveryManager {
    log: Arc<LogManager>,
    txns: Arc<TransactionManager>,
    buffer: Arc<BufferPool>,
}

struct AnalysisResult {
    committed: HashSet<u32>,
    uncommitted: HashMap<u32, u64>,
    max_txn_id: u32,
    max_lsn: u64,
}

impl RecoveryManager {
    pub fn new(log: Arc<LogManager>, txns: Arc<TransactionManager>, buffer: Arc<BufferPool>) -> Self {
        RecoveryManager { log, txns, buffer }
    }

    pub fn recover(&self) -> MiniDbResult<RecoveryStats> {
        // The WAL itself must be durable before we trust its contents.
        self.log.flush()?;

        let analysis = self.analysis()?;
        self.log.set_next_lsn(analysis.max_lsn);
        self.txns.set_next_txn_id(analysis.max_txn_id + 1);

        let mut stats = RecoveryStats {
            committed_txns: analysis.committed.len(),
            uncommitted_txns: analysis.uncommitted.len(),
            ..Default::default()
        };
        if analysis.committed.is_empty() && analysis.uncommitted.is_empty() {
            debug!("clean WAL, nothing to recover");
            return Ok(stats);
        }

        stats.redo_count = self.redo(&analysis.committed)?;
        stats.undo_count = self.undo(&analysis.uncommitted)?;
        self.post_recovery()?;

        info!(
            committed = stats.committed_txns,
            uncommitted = stats.uncommitted_txns,
            redone = stats.redo_count,
            undone = stats.undo_count,
            "recovery complete"
        );
        Ok(stats)
    }

    // ==================== Phase A: Analysis ====================

    fn analysis(&self) -> MiniDbResult<AnalysisResult> {
        let mut committed = HashSet::new();
        let mut aborted = HashSet::new();
        let mut active: HashMap<u32, u64> = HashMap::new();
        let mut max_txn_id = 0;
        let mut max_lsn = self.log.next_lsn();

        for entry in self.log.scan()? {
            let tid = entry.txn_id;
            max_txn_id = max_txn_id.max(tid);
            max_lsn = max_lsn.max(entry.lsn + entry.total_len as u64);

            match entry.record_type {
                WalRecordType::Begin => {
                    active.insert(tid, entry.lsn);
                }
                WalRecordType::Commit => {
                    committed.insert(tid);
                    active.remove(&tid);
                }
                WalRecordType::Abort => {
                    aborted.insert(tid);
                    active.remove(&tid);
                }
                // A checkpoint is only a hint; correctness never depends
                // on its payload.
                WalRecordType::Checkpoint => {}
                _ => {}
            }
            if let Some(last) = active.get_mut(&tid) {
                *last = entry.lsn;
            }
        }

        let uncommitted: HashMap<u32, u64> = active
            .into_iter()
            .filter(|(tid, _)| !committed.contains(tid) && !aborted.contains(tid))
            .collect();

        Ok(AnalysisResult {
            committed,
            uncommitted,
            max_txn_id,
            max_lsn,
        })
    }

    // ==================== Phase B: Redo ====================

    fn redo(&self, committed: &HashSet<u32>) -> MiniDbResult<usize> {
        let mut count = 0;
        for entry in self.log.scan()? {
            if !committed.contains(&entry.txn_id) {
                continue;
            }
            match entry.record_type {
                WalRecordType::Insert => {
                    let (table, rid, tuple) = parse_dml_payload(&entry.payload)?;
                    if self.redo_restore(&entry, &table, rid, &tuple)? {
                        count += 1;
                    }
                }
                WalRecordType::Delete => {
                    let (table, rid, _) = parse_dml_payload(&entry.payload)?;
                    if self.redo_delete(&entry, &table, rid)? {
                        count += 1;
                    }
                }
                WalRecordType::Update => {
                    let (table, rid, _, new) = parse_update_payload(&entry.payload)?;
                    if self.redo_update(&entry, &table, rid, &new)? {
                        count += 1;
                    }
                }
                WalRecordType::Clr => {
                    let (_, inner_type, inner_payload) = parse_clr_payload(&entry.payload)?;
                    let applied = match inner_type {
                        WalRecordType::Insert => {
                            let (table, rid, tuple) = parse_dml_payload(&inner_payload)?;
                            self.redo_restore(&entry, &table, rid, &tuple)?
                        }
                        WalRecordType::Delete => {
                            let (table, rid, _) = parse_dml_payload(&inner_payload)?;
                            self.redo_delete(&entry, &table, rid)?
                        }
                        WalRecordType::Update => {
                            let (table, rid, _, new) = parse_update_payload(&inner_payload)?;
                            self.redo_update(&entry, &table, rid, &new)?
                        }
                        _ => false,
                    };
                    if applied {
                        count += 1;
                    }
                }
                _ => {}
            }
        }
        Ok(count)
    }

    /// Redo applies only when the page is behind the record
    /// (`record.lsn > page.page_lsn`); pages at or past it already carry
    /// the effect on disk.
    fn redo_restore(&self, entry: &WalRecord, table: &str, rid: Rid, tuple: &[u8]) -> MiniDbResult<bool> {
        let path = self.txns.resolve_table_path(table);
        let Some(page) = self.txns.fetch(&path, rid.page_id)? else {
            return Ok(false);
        };
        {
            let mut page = page.write().unwrap();
            if entry.lsn <= page.page_lsn() {
                return Ok(false);
            }
            page.restore_tuple(rid.slot_id, tuple)?;
            page.set_page_lsn(entry.lsn);
        }
        self.buffer.mark_dirty(&path, rid.page_id);
        Ok(true)
    }

    fn redo_delete(&self, entry: &WalRecord, table: &str, rid: Rid) -> MiniDbResult<bool> {
        let path = self.txns.resolve_table_path(table);
        let Some(page) = self.txns.fetch(&path, rid.page_id)? else {
            return Ok(false);
        };
        {
            let mut page = page.write().unwrap();
            if entry.lsn <= page.page_lsn() {
                return Ok(false);
            }
            page.delete_tuple(rid.slot_id);
            page.set_page_lsn(entry.lsn);
        }
        self.buffer.mark_dirty(&path, rid.page_id);
        Ok(true)
    }

    fn redo_update(&self, entry: &WalRecord, table: &str, rid: Rid, new: &[u8]) -> MiniDbResult<bool> {
        let path = self.txns.resolve_table_path(table);
        let Some(page) = self.txns.fetch(&path, rid.page_id)? else {
            return Ok(false);
        };
        {
            let mut page = page.write().unwrap();
            if entry.lsn <= page.page_lsn() {
                return Ok(false);
            }
            page.restore_tuple(rid.slot_id, new)?;
            page.set_page_lsn(entry.lsn);
        }
        self.buffer.mark_dirty(&path, rid.page_id);
        Ok(true)
    }

    // ==================== Phase C: Undo ====================

    /// Roll back every uncommitted transaction through the normal undo
    /// path (emitting CLRs), then write its ABORT record.
    fn undo(&self, uncommitted: &HashMap<u32, u64>) -> MiniDbResult<usize> {
        let mut count = 0;
        for (&txn_id, &last_lsn) in uncommitted {
            debug!(txn_id, last_lsn, "undoing loser transaction");
            self.txns.register_recovered(txn_id, TxnState::Active, last_lsn);
            self.txns.undo_txn(txn_id, last_lsn)?;

            let chained = self.txns.last_lsn(txn_id);
            let abort_lsn = self.log.append_abort(txn_id, chained)?;
            self.txns.mark_aborted(txn_id, abort_lsn);
            count += 1;
        }
        Ok(count)
    }

    // ==================== Phase D: Post-recovery ====================

    /// Flush every dirty page with fsync, write an empty checkpoint and
    /// truncate the WAL back to its 4-byte padding.
    fn post_recovery(&self) -> MiniDbResult<()> {
        self.txns.flush_dirty_pages()?;
        self.log.append_checkpoint(&[])?;
        self.log.truncate(WAL_PADDING)?;
        Ok(())
    }
}
