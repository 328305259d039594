//! Append-only write-ahead log.
//!
//! The log file starts with 4 reserved zero bytes so that offset 0 can
//! serve as the NULL_LSN sentinel; every record's LSN is its byte offset.
//! COMMIT, ABORT and CHECKPOINT appends force an fsync before returning.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, trace};

use crate::common::{MiniDbError, MiniDbResult};
use crate::config::WAL_FILE_NAME;
use crate::storage::Rid;

use super::record::{
    pack_checkpoint_payload, pack_clr_payload, pack_dml_payload, pack_update_payload,
    WalRecord, WalRecordType, RECORD_HEADER_LEN, RECORD_TRAILER_LEN,
};

pub const NULL_LSN: u64 = 0;
pub const WAL_PADDING: u64 = 4;

struct LogInner {
    file: File,
    next_lsn: u64,
    durable_lsn: u64,
}

pub struct LogManager {
    path: PathBuf,
    inner: Mutex<LogInner>,
}

impl LogManager {
    /// Open (or create) `wal.log` inside the data directory.
    pub fn new(data_dir: &Path) -> MiniDbResult<Self> {
        let path = data_dir.join(WAL_FILE_NAME);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut len = file.metadata()?.len();
        if len < WAL_PADDING {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&[0u8; WAL_PADDING as usize])?;
            file.sync_data()?;
            len = WAL_PADDING;
        }

        debug!(path = %path.display(), end = len, "opened WAL");
        Ok(LogManager {
            path,
            inner: Mutex::new(LogInner {
                file,
                next_lsn: len,
                durable_lsn: len,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn next_lsn(&self) -> u64 {
        self.inner.lock().unwrap().next_lsn
    }

    pub fn durable_lsn(&self) -> u64 {
        self.inner.lock().unwrap().durable_lsn
    }

    fn append(
        &self,
        txn_id: u32,
        prev_lsn: u64,
        rtype: WalRecordType,
        payload: &[u8],
        force: bool,
    ) -> MiniDbResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        let lsn = inner.next_lsn;
        let bytes = WalRecord::encode(lsn, txn_id, prev_lsn, rtype, payload);

        inner.file.seek(SeekFrom::Start(lsn))?;
        inner.file.write_all(&bytes)?;
        inner.next_lsn = lsn + bytes.len() as u64;

        if force {
            inner.file.sync_data()?;
            inner.durable_lsn = inner.next_lsn;
        }
        trace!(lsn, txn_id, ?rtype, len = bytes.len(), force, "WAL append");
        Ok(lsn)
    }

    // ==================== Typed appends ====================

    pub fn append_begin(&self, txn_id: u32) -> MiniDbResult<u64> {
        self.append(txn_id, NULL_LSN, WalRecordType::Begin, &[], false)
    }

    /// COMMIT forces the log to disk before returning.
    pub fn append_commit(&self, txn_id: u32, prev_lsn: u64) -> MiniDbResult<u64> {
        self.append(txn_id, prev_lsn, WalRecordType::Commit, &[], true)
    }

    /// ABORT forces the log to disk before returning.
    pub fn append_abort(&self, txn_id: u32, prev_lsn: u64) -> MiniDbResult<u64> {
        self.append(txn_id, prev_lsn, WalRecordType::Abort, &[], true)
    }

    pub fn append_insert(
        &self,
        txn_id: u32,
        prev_lsn: u64,
        table: &str,
        rid: Rid,
        tuple: &[u8],
    ) -> MiniDbResult<u64> {
        let payload = pack_dml_payload(table, rid, tuple);
        self.append(txn_id, prev_lsn, WalRecordType::Insert, &payload, false)
    }

    /// DELETE stores the before-image for undo.
    pub fn append_delete(
        &self,
        txn_id: u32,
        prev_lsn: u64,
        table: &str,
        rid: Rid,
        before: &[u8],
    ) -> MiniDbResult<u64> {
        let payload = pack_dml_payload(table, rid, before);
        self.append(txn_id, prev_lsn, WalRecordType::Delete, &payload, false)
    }

    pub fn append_update(
        &self,
        txn_id: u32,
        prev_lsn: u64,
        table: &str,
        rid: Rid,
        old: &[u8],
        new: &[u8],
    ) -> MiniDbResult<u64> {
        let payload = pack_update_payload(table, rid, old, new);
        self.append(txn_id, prev_lsn, WalRecordType::Update, &payload, false)
    }

    pub fn append_clr(
        &self,
        txn_id: u32,
        prev_lsn: u64,
        undo_next_lsn: u64,
        inner_type: WalRecordType,
        inner_payload: &[u8],
    ) -> MiniDbResult<u64> {
        let payload = pack_clr_payload(undo_next_lsn, inner_type, inner_payload);
        self.append(txn_id, prev_lsn, WalRecordType::Clr, &payload, false)
    }

    /// CHECKPOINT lists the active transactions and forces the log.
    pub fn append_checkpoint(&self, active: &[(u32, u64)]) -> MiniDbResult<u64> {
        let payload = pack_checkpoint_payload(active);
        self.append(0, NULL_LSN, WalRecordType::Checkpoint, &payload, true)
    }

    // ==================== Reading ====================

    pub fn flush(&self) -> MiniDbResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.file.sync_data()?;
        inner.durable_lsn = inner.next_lsn;
        Ok(())
    }

    /// Random-access read of the record at `lsn`. The stored LSN and CRC
    /// are both verified.
    pub fn read_record(&self, lsn: u64) -> MiniDbResult<WalRecord> {
        let mut inner = self.inner.lock().unwrap();
        let end = inner.next_lsn;
        if lsn < WAL_PADDING || lsn >= end {
            return Err(MiniDbError::WalCorruption(format!(
                "LSN {} out of log range [{}, {})",
                lsn, WAL_PADDING, end
            )));
        }
        inner.file.seek(SeekFrom::Start(lsn))?;
        let mut len_buf = [0u8; 4];
        inner.file.read_exact(&mut len_buf)?;
        let total_len = u32::from_be_bytes(len_buf) as usize;
        if total_len < RECORD_HEADER_LEN + RECORD_TRAILER_LEN || lsn + total_len as u64 > end {
            return Err(MiniDbError::WalCorruption(format!(
                "WAL record at {} has invalid length {}",
                lsn, total_len
            )));
        }
        let mut buf = vec![0u8; total_len];
        buf[0..4].copy_from_slice(&len_buf);
        inner.file.read_exact(&mut buf[4..])?;
        WalRecord::decode(lsn, &buf)
    }

    /// Forward scan from `from_lsn` to the end of the log. A torn record
    /// at the very tail (incomplete write before a crash) ends the scan;
    /// a CRC mismatch anywhere is corruption.
    pub fn scan_from(&self, from_lsn: u64) -> MiniDbResult<Vec<WalRecord>> {
        let mut inner = self.inner.lock().unwrap();
        let file_len = inner.file.metadata()?.len();
        let mut records = Vec::new();
        let mut lsn = from_lsn.max(WAL_PADDING);

        while lsn + (RECORD_HEADER_LEN + RECORD_TRAILER_LEN) as u64 <= file_len {
            inner.file.seek(SeekFrom::Start(lsn))?;
            let mut len_buf = [0u8; 4];
            inner.file.read_exact(&mut len_buf)?;
            let total_len = u32::from_be_bytes(len_buf) as u64;
            if total_len < (RECORD_HEADER_LEN + RECORD_TRAILER_LEN) as u64 {
                return Err(MiniDbError::WalCorruption(format!(
                    "WAL record at {} has invalid length {}",
                    lsn, total_len
                )));
            }
            if lsn + total_len > file_len {
                // Torn tail from a crash mid-append: the log ends here.
                debug!(lsn, total_len, file_len, "torn WAL tail, stopping scan");
                break;
            }
            let mut buf = vec![0u8; total_len as usize];
            buf[0..4].copy_from_slice(&len_buf);
            inner.file.read_exact(&mut buf[4..])?;
            records.push(WalRecord::decode(lsn, &buf)?);
            lsn += total_len;
        }
        Ok(records)
    }

    pub fn scan(&self) -> MiniDbResult<Vec<WalRecord>> {
        self.scan_from(WAL_PADDING)
    }

    // ==================== Recovery support ====================

    /// Set by recovery after analysis so new records land past the
    /// recovered tail.
    pub fn set_next_lsn(&self, lsn: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.next_lsn = lsn.max(WAL_PADDING);
    }

    /// Truncate the log back to `to` (normally the 4-byte padding), after
    /// a checkpoint has made everything before it redundant.
    pub fn truncate(&self, to: u64) -> MiniDbResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.file.set_len(to)?;
        inner.file.sync_data()?;
        inner.next_lsn = to;
        inner.durable_lsn = to;
        debug!(to, "WAL truncated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::record::{parse_dml_payload, parse_update_payload};
    use tempfile::TempDir;

    /// WAL smoke: BEGIN at LSN 4, a DML chain, COMMIT, reopen.
    #[test]
    fn test_wal_smoke() {
        let dir = TempDir::new().unwrap();
        let log = LogManager::new(dir.path()).unwrap();

        let lsn1 = log.append_begin(100).unwrap();
        assert_eq!(lsn1, 4);

        let rid = Rid::new(1, 0);
        let lsn2 = log.append_insert(100, lsn1, "users", rid, b"hello world").unwrap();
        let lsn3 = log
            .append_update(100, lsn2, "users", rid, b"hello world", b"hi world")
            .unwrap();
        let lsn4 = log.append_delete(100, lsn3, "users", rid, b"hi world").unwrap();
        let lsn5 = log.append_commit(100, lsn4).unwrap();
        assert!(lsn1 < lsn2 && lsn2 < lsn3 && lsn3 < lsn4 && lsn4 < lsn5);

        let records = log.scan().unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records[0].record_type, WalRecordType::Begin);
        assert_eq!(records[4].record_type, WalRecordType::Commit);

        // Random access read keeps both images intact.
        let rec = log.read_record(lsn3).unwrap();
        assert_eq!(rec.record_type, WalRecordType::Update);
        assert_eq!(rec.txn_id, 100);
        let (name, r, old, new) = parse_update_payload(&rec.payload).unwrap();
        assert_eq!(name, "users");
        assert_eq!(r, rid);
        assert_eq!(old, b"hello world");
        assert_eq!(new, b"hi world");

        let rec2 = log.read_record(lsn2).unwrap();
        let (_, _, tuple) = parse_dml_payload(&rec2.payload).unwrap();
        assert_eq!(tuple, b"hello world");

        // COMMIT forced the log: durable == next.
        assert_eq!(log.durable_lsn(), log.next_lsn());

        // Reopen and scan again.
        drop(log);
        let log2 = LogManager::new(dir.path()).unwrap();
        let records2 = log2.scan().unwrap();
        assert_eq!(records2.len(), 5);
        assert_eq!(records2[0].record_type, WalRecordType::Begin);
        assert_eq!(records2[4].record_type, WalRecordType::Commit);
    }

    #[test]
    fn test_scan_from_returns_record_first() {
        let dir = TempDir::new().unwrap();
        let log = LogManager::new(dir.path()).unwrap();
        let a = log.append_begin(1).unwrap();
        let b = log.append_begin(2).unwrap();
        let from_b = log.scan_from(b).unwrap();
        assert_eq!(from_b[0].lsn, b);
        let from_a = log.scan_from(a).unwrap();
        assert_eq!(from_a.len(), 2);
    }

    #[test]
    fn test_lsn_is_byte_offset() {
        let dir = TempDir::new().unwrap();
        let log = LogManager::new(dir.path()).unwrap();
        let a = log.append_begin(1).unwrap();
        let rec = log.read_record(a).unwrap();
        let b = log.append_begin(2).unwrap();
        assert_eq!(b, a + rec.total_len as u64);
    }

    #[test]
    fn test_torn_tail_is_tolerated() {
        let dir = TempDir::new().unwrap();
        let path;
        {
            let log = LogManager::new(dir.path()).unwrap();
            log.append_begin(1).unwrap();
            log.append_commit(1, 4).unwrap();
            path = log.path().to_path_buf();
        }
        // Simulate a crash mid-append: half a header at the tail.
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[0, 0, 0, 40, 0, 0]).unwrap();
        drop(f);

        let log = LogManager::new(dir.path()).unwrap();
        let records = log.scan().unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_corrupted_record_fails_scan() {
        let dir = TempDir::new().unwrap();
        let first_lsn;
        let path;
        {
            let log = LogManager::new(dir.path()).unwrap();
            first_lsn = log.append_begin(1).unwrap();
            log.append_commit(1, first_lsn).unwrap();
            path = log.path().to_path_buf();
        }
        // Flip a byte inside the first record's header region.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[first_lsn as usize + 8] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let log = LogManager::new(dir.path()).unwrap();
        match log.scan() {
            Err(MiniDbError::WalCorruption(_)) => {}
            other => panic!("expected WalCorruption, got {:?}", other.map(|r| r.len())),
        }
    }

    #[test]
    fn test_truncate_resets_log() {
        let dir = TempDir::new().unwrap();
        let log = LogManager::new(dir.path()).unwrap();
        log.append_begin(1).unwrap();
        log.append_checkpoint(&[]).unwrap();
        log.truncate(WAL_PADDING).unwrap();
        assert_eq!(log.next_lsn(), WAL_PADDING);
        assert!(log.scan().unwrap().is_empty());
        // Appending after truncation starts at LSN 4 again.
        assert_eq!(log.append_begin(2).unwrap(), 4);
    }
}
