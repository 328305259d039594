pub mod lock_manager;
pub use lock_manager::{LockManager, LockMode, LockOutcome, ResourceKey};
