//! Per-statement execution context: explicit handles to every engine
//! component plus the active transaction. There is no process-global
//! state; the session wires one of these up for each statement.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::catalog::Catalog;
use crate::common::MiniDbResult;
use crate::concurrency::{LockManager, LockMode, ResourceKey};
use crate::config::EngineConfig;
use crate::index::BTree;
use crate::storage::{BufferPool, TableHeap};
use crate::transaction::TransactionManager;

pub struct ExecutionContext {
    pub catalog: Arc<Mutex<Catalog>>,
    pub buffer: Arc<BufferPool>,
    pub txns: Arc<TransactionManager>,
    pub locks: Arc<LockManager>,
    pub config: EngineConfig,
    /// Transaction the current statement runs in.
    pub txn_id: u32,
}

impl ExecutionContext {
    /// Lazily take a table lock; Shared before reading, Exclusive before
    /// writing. Non-granted outcomes surface as errors the session turns
    /// into an abort.
    pub fn acquire_table_lock(&self, table: &str, mode: LockMode) -> MiniDbResult<()> {
        let resource = ResourceKey::table(&table.to_lowercase());
        let outcome = self.locks.acquire(
            self.txn_id,
            resource.clone(),
            mode,
            Duration::from_millis(self.config.lock_timeout_ms),
        );
        outcome.into_result(self.txn_id, &resource)
    }

    pub fn open_table(&self, name: &str) -> MiniDbResult<TableHeap> {
        let path = self.catalog.lock().unwrap().table_path(name)?;
        TableHeap::open(
            &path,
            Arc::clone(&self.buffer),
            self.config.page_crc_verify_on_load,
        )
    }

    /// All open B+Trees of a table, as (index_name, column, tree).
    pub fn open_table_indexes(&self, table: &str) -> MiniDbResult<Vec<(String, String, BTree)>> {
        let entries = {
            let catalog = self.catalog.lock().unwrap();
            catalog
                .indexes_for_table(table)
                .into_iter()
                .map(|(name, ix)| (name.clone(), ix.column.clone(), catalog.data_dir().join(&ix.file)))
                .collect::<Vec<_>>()
        };
        let mut out = Vec::with_capacity(entries.len());
        for (name, column, path) in entries {
            let tree = BTree::open(
                &path,
                Arc::clone(&self.buffer),
                self.config.page_crc_verify_on_load,
            )?;
            out.push((name, column, tree));
        }
        Ok(out)
    }
}
