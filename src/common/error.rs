use thiserror::Error;

#[derive(Error, Debug)]
pub enum MiniDbError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parser Error: {0}")]
    Parser(String),

    #[error("Schema Violation: {0}")]
    Schema(String),

    #[error("Page Full: need {needed} bytes, only {free} free")]
    PageFull { needed: usize, free: usize },

    #[error("Page Corruption: {0}")]
    PageCorruption(String),

    #[error("WAL Corruption: {0}")]
    WalCorruption(String),

    #[error("Storage Error: {0}")]
    Storage(String),

    #[error("Catalog Error: {0}")]
    Catalog(String),

    #[error("Execution Error: {0}")]
    Execution(String),

    #[error("Transaction Error: {0}")]
    Transaction(String),

    #[error("Lock timeout on {0}")]
    LockTimeout(String),

    #[error("Deadlock detected: transaction {0} chosen as victim")]
    Deadlock(u32),

    #[error("Transaction {0} aborted while waiting for a lock")]
    LockAborted(u32),

    #[error("Buffer pool exhausted: all frames are pinned")]
    BufferExhausted,
}

impl MiniDbError {
    /// Lock outcomes that must abort the requesting transaction.
    pub fn is_lock_failure(&self) -> bool {
        matches!(
            self,
            MiniDbError::LockTimeout(_) | MiniDbError::Deadlock(_) | MiniDbError::LockAborted(_)
        )
    }
}
