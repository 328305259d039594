//! WAL record format and payload codecs.
//!
//! Record layout (big-endian):
//!   [total_len: u32][lsn: u32][txn_id: u32][prev_txn_lsn: u32][type: u8]
//!   [payload][crc32: u32]
//! total_len covers the whole record including header and CRC, so the next
//! record starts at lsn + total_len. The CRC covers header + payload.
//!
//! Payload shapes:
//!   BEGIN/COMMIT/ABORT  empty
//!   INSERT/DELETE       name_len u16 | name | page_id u32 | slot_id u16 |
//!                       tuple_len u16 | tuple bytes
//!                       (DELETE carries the before-image, INSERT the new one)
//!   UPDATE              name_len u16 | name | page_id u32 | slot_id u16 |
//!                       old_len u16 | old | new_len u16 | new
//!   CLR                 undo_next_lsn u32 | inner_type u8 | inner payload
//!   CHECKPOINT          count u32 | count * (txn_id u32, last_lsn u32)

use crate::common::{MiniDbError, MiniDbResult};
use crate::storage::Rid;

pub const RECORD_HEADER_LEN: usize = 17;
pub const RECORD_TRAILER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalRecordType {
    Begin = 0,
    Commit = 1,
    Abort = 2,
    Insert = 3,
    Delete = 4,
    Update = 5,
    Clr = 6,
    Checkpoint = 7,
}

impl WalRecordType {
    pub fn from_u8(value: u8) -> MiniDbResult<Self> {
        match value {
            0 => Ok(WalRecordType::Begin),
            1 => Ok(WalRecordType::Commit),
            2 => Ok(WalRecordType::Abort),
            3 => Ok(WalRecordType::Insert),
            4 => Ok(WalRecordType::Delete),
            5 => Ok(WalRecordType::Update),
            6 => Ok(WalRecordType::Clr),
            7 => Ok(WalRecordType::Checkpoint),
            other => Err(MiniDbError::WalCorruption(format!(
                "Invalid WAL record type: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WalRecord {
    pub lsn: u64,
    pub txn_id: u32,
    pub prev_lsn: u64,
    pub record_type: WalRecordType,
    pub payload: Vec<u8>,
    pub total_len: u32,
}

impl WalRecord {
    /// Encode a record to be written at `lsn`.
    pub fn encode(lsn: u64, txn_id: u32, prev_lsn: u64, rtype: WalRecordType, payload: &[u8]) -> Vec<u8> {
        let total_len = (RECORD_HEADER_LEN + payload.len() + RECORD_TRAILER_LEN) as u32;
        let mut buf = Vec::with_capacity(total_len as usize);
        buf.extend_from_slice(&total_len.to_be_bytes());
        buf.extend_from_slice(&(lsn as u32).to_be_bytes());
        buf.extend_from_slice(&txn_id.to_be_bytes());
        buf.extend_from_slice(&(prev_lsn as u32).to_be_bytes());
        buf.push(rtype as u8);
        buf.extend_from_slice(payload);
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Decode a record from a full record image. `lsn` is the offset the
    /// bytes were read from; it must match the stored LSN.
    pub fn decode(lsn: u64, bytes: &[u8]) -> MiniDbResult<WalRecord> {
        if bytes.len() < RECORD_HEADER_LEN + RECORD_TRAILER_LEN {
            return Err(MiniDbError::WalCorruption(format!(
                "WAL record at {} too short: {} bytes",
                lsn,
                bytes.len()
            )));
        }
        let total_len = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        if total_len as usize != bytes.len() {
            return Err(MiniDbError::WalCorruption(format!(
                "WAL record at {}: length mismatch (header says {}, have {})",
                lsn,
                total_len,
                bytes.len()
            )));
        }
        let stored_lsn = u32::from_be_bytes(bytes[4..8].try_into().unwrap()) as u64;
        if stored_lsn != lsn {
            return Err(MiniDbError::WalCorruption(format!(
                "WAL record at {}: stored LSN is {}",
                lsn, stored_lsn
            )));
        }
        let crc_offset = bytes.len() - RECORD_TRAILER_LEN;
        let stored_crc = u32::from_be_bytes(bytes[crc_offset..].try_into().unwrap());
        let computed = crc32fast::hash(&bytes[..crc_offset]);
        if stored_crc != computed {
            return Err(MiniDbError::WalCorruption(format!(
                "WAL record at {}: CRC mismatch (stored=0x{:08X}, computed=0x{:08X})",
                lsn, stored_crc, computed
            )));
        }

        Ok(WalRecord {
            lsn,
            txn_id: u32::from_be_bytes(bytes[8..12].try_into().unwrap()),
            prev_lsn: u32::from_be_bytes(bytes[12..16].try_into().unwrap()) as u64,
            record_type: WalRecordType::from_u8(bytes[16])?,
            payload: bytes[RECORD_HEADER_LEN..crc_offset].to_vec(),
            total_len,
        })
    }
}

// ==================== Payload codecs ====================

fn pack_table_rid(table: &str, rid: Rid) -> Vec<u8> {
    let name = table.as_bytes();
    let mut buf = Vec::with_capacity(2 + name.len() + 6);
    buf.extend_from_slice(&(name.len() as u16).to_be_bytes());
    buf.extend_from_slice(name);
    buf.extend_from_slice(&rid.page_id.to_be_bytes());
    buf.extend_from_slice(&rid.slot_id.to_be_bytes());
    buf
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> MiniDbResult<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(MiniDbError::WalCorruption("WAL payload truncated".to_string()));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u16(&mut self) -> MiniDbResult<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> MiniDbResult<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u8(&mut self) -> MiniDbResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.data[self.pos..];
        self.pos = self.data.len();
        out
    }
}

fn parse_table_rid(cur: &mut Cursor) -> MiniDbResult<(String, Rid)> {
    let name_len = cur.u16()? as usize;
    let name = std::str::from_utf8(cur.take(name_len)?)
        .map_err(|_| MiniDbError::WalCorruption("Invalid UTF-8 table name in WAL".to_string()))?
        .to_string();
    let page_id = cur.u32()?;
    let slot_id = cur.u16()?;
    Ok((name, Rid::new(page_id, slot_id)))
}

/// INSERT / DELETE payload.
pub fn pack_dml_payload(table: &str, rid: Rid, tuple: &[u8]) -> Vec<u8> {
    let mut buf = pack_table_rid(table, rid);
    buf.extend_from_slice(&(tuple.len() as u16).to_be_bytes());
    buf.extend_from_slice(tuple);
    buf
}

pub fn parse_dml_payload(payload: &[u8]) -> MiniDbResult<(String, Rid, Vec<u8>)> {
    let mut cur = Cursor::new(payload);
    let (name, rid) = parse_table_rid(&mut cur)?;
    let tuple_len = cur.u16()? as usize;
    let tuple = cur.take(tuple_len)?.to_vec();
    Ok((name, rid, tuple))
}

/// UPDATE payload with both images.
pub fn pack_update_payload(table: &str, rid: Rid, old: &[u8], new: &[u8]) -> Vec<u8> {
    let mut buf = pack_table_rid(table, rid);
    buf.extend_from_slice(&(old.len() as u16).to_be_bytes());
    buf.extend_from_slice(old);
    buf.extend_from_slice(&(new.len() as u16).to_be_bytes());
    buf.extend_from_slice(new);
    buf
}

pub fn parse_update_payload(payload: &[u8]) -> MiniDbResult<(String, Rid, Vec<u8>, Vec<u8>)> {
    let mut cur = Cursor::new(payload);
    let (name, rid) = parse_table_rid(&mut cur)?;
    let old_len = cur.u16()? as usize;
    let old = cur.take(old_len)?.to_vec();
    let new_len = cur.u16()? as usize;
    let new = cur.take(new_len)?.to_vec();
    Ok((name, rid, old, new))
}

/// CLR payload: the inner record describes the compensating (redo-only)
/// action; undo_next_lsn points past the compensated record.
pub fn pack_clr_payload(undo_next_lsn: u64, inner_type: WalRecordType, inner_payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5 + inner_payload.len());
    buf.extend_from_slice(&(undo_next_lsn as u32).to_be_bytes());
    buf.push(inner_type as u8);
    buf.extend_from_slice(inner_payload);
    buf
}

pub fn parse_clr_payload(payload: &[u8]) -> MiniDbResult<(u64, WalRecordType, Vec<u8>)> {
    let mut cur = Cursor::new(payload);
    let undo_next = cur.u32()? as u64;
    let inner_type = WalRecordType::from_u8(cur.u8()?)?;
    let inner = cur.rest().to_vec();
    Ok((undo_next, inner_type, inner))
}

pub fn pack_checkpoint_payload(active: &[(u32, u64)]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + active.len() * 8);
    buf.extend_from_slice(&(active.len() as u32).to_be_bytes());
    for (txn_id, last_lsn) in active {
        buf.extend_from_slice(&txn_id.to_be_bytes());
        buf.extend_from_slice(&(*last_lsn as u32).to_be_bytes());
    }
    buf
}

pub fn parse_checkpoint_payload(payload: &[u8]) -> MiniDbResult<Vec<(u32, u64)>> {
    let mut cur = Cursor::new(payload);
    let count = cur.u32()? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let txn_id = cur.u32()?;
        let last_lsn = cur.u32()? as u64;
        out.push((txn_id, last_lsn));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_encode_decode() {
        let payload = pack_dml_payload("users", Rid::new(1, 0), b"hello world");
        let bytes = WalRecord::encode(4, 100, 0, WalRecordType::Insert, &payload);
        let rec = WalRecord::decode(4, &bytes).unwrap();
        assert_eq!(rec.txn_id, 100);
        assert_eq!(rec.prev_lsn, 0);
        assert_eq!(rec.record_type, WalRecordType::Insert);
        assert_eq!(rec.total_len as usize, bytes.len());

        let (name, rid, tuple) = parse_dml_payload(&rec.payload).unwrap();
        assert_eq!(name, "users");
        assert_eq!(rid, Rid::new(1, 0));
        assert_eq!(tuple, b"hello world");
    }

    #[test]
    fn test_crc_mismatch_rejected() {
        let bytes = WalRecord::encode(4, 1, 0, WalRecordType::Begin, &[]);
        let mut bad = bytes.clone();
        *bad.last_mut().unwrap() ^= 0xFF;
        match WalRecord::decode(4, &bad) {
            Err(MiniDbError::WalCorruption(_)) => {}
            other => panic!("expected WalCorruption, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_lsn_mismatch_rejected() {
        let bytes = WalRecord::encode(4, 1, 0, WalRecordType::Begin, &[]);
        assert!(WalRecord::decode(8, &bytes).is_err());
    }

    #[test]
    fn test_update_payload_roundtrip() {
        let payload = pack_update_payload("t", Rid::new(2, 3), b"old", b"newer");
        let (name, rid, old, new) = parse_update_payload(&payload).unwrap();
        assert_eq!((name.as_str(), rid), ("t", Rid::new(2, 3)));
        assert_eq!((old.as_slice(), new.as_slice()), (&b"old"[..], &b"newer"[..]));
    }

    #[test]
    fn test_clr_payload_roundtrip() {
        let inner = pack_dml_payload("t", Rid::new(1, 1), b"img");
        let payload = pack_clr_payload(42, WalRecordType::Delete, &inner);
        let (undo_next, itype, ipayload) = parse_clr_payload(&payload).unwrap();
        assert_eq!(undo_next, 42);
        assert_eq!(itype, WalRecordType::Delete);
        assert_eq!(ipayload, inner);
    }

    #[test]
    fn test_checkpoint_payload_roundtrip() {
        let active = vec![(1u32, 4u64), (7u32, 100u64)];
        let payload = pack_checkpoint_payload(&active);
        assert_eq!(parse_checkpoint_payload(&payload).unwrap(), active);
    }
}
