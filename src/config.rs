//! This file provides configuration for minidb.
//! Caution: if you change any on-disk constant below, make sure you have
//! deleted old database files before starting minidb, or it may cause some
//! unexpected errors.

pub const _NAME: &str = "minidb";
pub const _VERSION: &str = "0.1.0";

pub const LOG_LEVEL: &str = "info";
pub const LOG_PATH: &str = "./logs/minidb.log";

pub const DEFAULT_DB_DIR: &str = "./minidb_data";

pub const PAGE_SIZE_BYTES: usize = 4 * 1024; // 4 KB, fixed

/// Default number of pages held by the buffer pool (100 pages = 400 KB).
pub const DEFAULT_BUFFER_POOL_CAPACITY: usize = 100;

/// Default time a lock request waits before giving up.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5000;

pub const MAX_STRING_SIZE: usize = 65535; // u16 length prefix

pub const WAL_FILE_NAME: &str = "wal.log";
pub const CATALOG_FILE_NAME: &str = "catalog.json";

/// Engine tuning knobs. The fields mirror the recognized options of the
/// session layer; anything not listed here is not configurable.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub buffer_pool_capacity: usize,
    pub lock_timeout_ms: u64,
    /// Fixed true: COMMIT records are fsynced before commit returns.
    pub wal_force_on_commit: bool,
    pub page_crc_verify_on_load: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            buffer_pool_capacity: DEFAULT_BUFFER_POOL_CAPACITY,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            wal_force_on_commit: true,
            page_crc_verify_on_load: true,
        }
    }
}
