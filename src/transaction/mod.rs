pub mod manager;
pub use manager::{TransactionManager, TxnHook, TxnState};

pub mod recovery;
pub use recovery::{RecoveryManager, RecoveryStats};
