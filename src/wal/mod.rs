pub mod record;
pub use record::{WalRecord, WalRecordType};

pub mod log_manager;
pub use log_manager::{LogManager, NULL_LSN, WAL_PADDING};
