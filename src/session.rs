//! Database session: owns every engine component, runs recovery at
//! startup, and drives statements with autocommit semantics.
//!
//! Autocommit: each statement runs in its own transaction unless BEGIN
//! opened an explicit one; COMMIT/ROLLBACK return to autocommit. Any
//! execution error aborts the current transaction.
//!
//! The components are explicit owned objects handed to the executor
//! through an ExecutionContext; nothing engine-wide lives in globals.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::catalog::{Catalog, Schema};
use crate::common::{MiniDbError, MiniDbResult};
use crate::concurrency::LockManager;
use crate::config::EngineConfig;
use crate::execution::{
    execute_explain, execute_plan, ExecutionContext, StatementResult,
};
use crate::sql::plan::{build_command, parse_statements, ExplainMode, SqlCommand};
use crate::storage::BufferPool;
use crate::transaction::{RecoveryManager, RecoveryStats, TransactionManager};

#[derive(Debug, Default, Clone, Copy)]
pub struct SessionStats {
    pub statements_executed: u64,
    pub transactions_committed: u64,
    pub transactions_aborted: u64,
}

pub struct Session {
    data_dir: PathBuf,
    config: EngineConfig,
    catalog: Arc<Mutex<Catalog>>,
    buffer: Arc<BufferPool>,
    locks: Arc<LockManager>,
    txns: Arc<TransactionManager>,
    autocommit: bool,
    active_txn: Option<u32>,
    recovery_stats: RecoveryStats,
    stats: SessionStats,
    closed: bool,
}

impl Session {
    pub fn open(data_dir: &Path, config: EngineConfig) -> MiniDbResult<Self> {
        std::fs::create_dir_all(data_dir)?;

        let catalog = Arc::new(Mutex::new(Catalog::open(data_dir)?));
        let buffer = Arc::new(BufferPool::new(config.buffer_pool_capacity));
        let log = Arc::new(crate::wal::LogManager::new(data_dir)?);
        let locks = Arc::new(LockManager::new());
        let txns = Arc::new(TransactionManager::new(
            Arc::clone(&log),
            Arc::clone(&buffer),
            Arc::clone(&locks),
            data_dir,
        ));

        // Recovery runs before the first statement is accepted.
        let recovery = RecoveryManager::new(log, Arc::clone(&txns), Arc::clone(&buffer));
        let recovery_stats = recovery.recover()?;
        if !recovery_stats.is_noop() {
            info!(?recovery_stats, "crash recovery applied");
        }

        debug!(data_dir = %data_dir.display(), "session opened");
        Ok(Session {
            data_dir: data_dir.to_path_buf(),
            config,
            catalog,
            buffer,
            locks,
            txns,
            autocommit: true,
            active_txn: None,
            recovery_stats,
            stats: SessionStats::default(),
            closed: false,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn recovery_stats(&self) -> RecoveryStats {
        self.recovery_stats
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn in_transaction(&self) -> bool {
        self.active_txn.is_some()
    }

    pub fn autocommit(&self) -> bool {
        self.autocommit
    }

    // ==================== Statement execution ====================

    /// Execute a SQL string (one or more `;`-separated statements); the
    /// last statement's result is returned.
    pub fn execute(&mut self, sql: &str) -> MiniDbResult<StatementResult> {
        self.check_open()?;
        let (sql, explain_hint) = Self::strip_explain_mode(sql);
        let statements = parse_statements(&sql)?;
        if statements.is_empty() {
            return Ok(StatementResult::message(String::new()));
        }
        let mut last = None;
        for stmt in &statements {
            let cmd = build_command(stmt)?;
            last = Some(self.execute_command(cmd, explain_hint)?);
        }
        Ok(last.expect("at least one statement"))
    }

    /// `EXPLAIN LOGICAL ...` / `EXPLAIN PHYSICAL ...` are dialect sugar
    /// handled before parsing; bare EXPLAIN means logical.
    fn strip_explain_mode(sql: &str) -> (String, Option<ExplainMode>) {
        let trimmed = sql.trim_start();
        let mut words = trimmed.split_whitespace();
        if !words
            .next()
            .map(|w| w.eq_ignore_ascii_case("EXPLAIN"))
            .unwrap_or(false)
        {
            return (sql.to_string(), None);
        }
        match words.next() {
            Some(w) if w.eq_ignore_ascii_case("LOGICAL") => {
                let rest = trimmed["EXPLAIN".len()..].trim_start();
                let rest = rest[w.len()..].trim_start();
                (format!("EXPLAIN {}", rest), Some(ExplainMode::Logical))
            }
            Some(w) if w.eq_ignore_ascii_case("PHYSICAL") => {
                let rest = trimmed["EXPLAIN".len()..].trim_start();
                let rest = rest[w.len()..].trim_start();
                (format!("EXPLAIN {}", rest), Some(ExplainMode::Physical))
            }
            _ => (sql.to_string(), None),
        }
    }

    fn execute_command(
        &mut self,
        cmd: SqlCommand,
        explain_hint: Option<ExplainMode>,
    ) -> MiniDbResult<StatementResult> {
        match cmd {
            SqlCommand::Begin => self.begin(),
            SqlCommand::Commit => self.commit(),
            SqlCommand::Rollback => self.rollback(),
            SqlCommand::Explain { mode, plan } => {
                // EXPLAIN reads only; no transaction, no locks.
                let ctx = self.make_context(0);
                self.stats.statements_executed += 1;
                execute_explain(explain_hint.unwrap_or(mode), &plan, &ctx)
            }
            SqlCommand::Plan(plan) => {
                let implicit = self.active_txn.is_none();
                let txn_id = match self.active_txn {
                    Some(t) => t,
                    None => {
                        let t = self.txns.begin()?;
                        self.active_txn = Some(t);
                        t
                    }
                };

                let mut ctx = self.make_context(txn_id);
                match execute_plan(&plan, &mut ctx) {
                    Ok(result) => {
                        self.stats.statements_executed += 1;
                        if implicit {
                            self.txns.commit(txn_id)?;
                            self.active_txn = None;
                            self.stats.transactions_committed += 1;
                        }
                        Ok(result)
                    }
                    Err(e) => {
                        // Any execution failure aborts the transaction,
                        // explicit or implicit.
                        if e.is_lock_failure() {
                            debug!(txn_id, "lock wait lost, aborting transaction");
                        }
                        if self.txns.is_active(txn_id) {
                            if let Err(abort_err) = self.txns.abort(txn_id) {
                                tracing::warn!("abort after failed statement failed: {}", abort_err);
                            }
                        }
                        self.active_txn = None;
                        self.autocommit = true;
                        self.stats.transactions_aborted += 1;
                        Err(e)
                    }
                }
            }
        }
    }

    // ==================== Transaction control ====================

    pub fn begin(&mut self) -> MiniDbResult<StatementResult> {
        self.check_open()?;
        if self.active_txn.is_some() {
            return Err(MiniDbError::Transaction(
                "Transaction already active; COMMIT or ROLLBACK first".to_string(),
            ));
        }
        let txn_id = self.txns.begin()?;
        self.active_txn = Some(txn_id);
        self.autocommit = false;
        Ok(StatementResult::message(format!(
            "BEGIN (transaction {})",
            txn_id
        )))
    }

    pub fn commit(&mut self) -> MiniDbResult<StatementResult> {
        self.check_open()?;
        let Some(txn_id) = self.active_txn.take() else {
            return Err(MiniDbError::Transaction(
                "No active transaction".to_string(),
            ));
        };
        self.autocommit = true;
        self.txns.commit(txn_id)?;
        self.stats.transactions_committed += 1;
        Ok(StatementResult::message(format!(
            "COMMIT (transaction {})",
            txn_id
        )))
    }

    pub fn rollback(&mut self) -> MiniDbResult<StatementResult> {
        self.check_open()?;
        let Some(txn_id) = self.active_txn.take() else {
            return Err(MiniDbError::Transaction(
                "No active transaction".to_string(),
            ));
        };
        self.autocommit = true;
        self.txns.abort(txn_id)?;
        self.stats.transactions_aborted += 1;
        Ok(StatementResult::message(format!(
            "ROLLBACK (transaction {})",
            txn_id
        )))
    }

    // ==================== Introspection (REPL meta-commands) ====================

    pub fn table_names(&self) -> Vec<String> {
        self.catalog.lock().unwrap().table_names()
    }

    pub fn table_schema(&self, name: &str) -> MiniDbResult<Schema> {
        let path = self.catalog.lock().unwrap().table_path(name)?;
        let heap = crate::storage::TableHeap::open(
            &path,
            Arc::clone(&self.buffer),
            self.config.page_crc_verify_on_load,
        )?;
        Ok(heap.schema().clone())
    }

    /// (index, table, column) triples, optionally filtered by table.
    pub fn index_list(&self, table: Option<&str>) -> Vec<(String, String, String)> {
        let catalog = self.catalog.lock().unwrap();
        catalog
            .index_names()
            .into_iter()
            .filter_map(|name| {
                let entry = catalog.index(&name).ok()?;
                if let Some(t) = table {
                    if !entry.table.eq_ignore_ascii_case(t) {
                        return None;
                    }
                }
                Some((name, entry.table.clone(), entry.column.clone()))
            })
            .collect()
    }

    // ==================== Shutdown ====================

    /// Abort any open transaction and flush dirty pages.
    pub fn close(&mut self) -> MiniDbResult<()> {
        if self.closed {
            return Ok(());
        }
        if let Some(txn_id) = self.active_txn.take() {
            self.txns.abort(txn_id)?;
            self.stats.transactions_aborted += 1;
        }
        self.txns.flush_dirty_pages()?;
        self.closed = true;
        debug!("session closed");
        Ok(())
    }

    fn check_open(&self) -> MiniDbResult<()> {
        if self.closed {
            return Err(MiniDbError::Execution("Session is closed".to_string()));
        }
        Ok(())
    }

    fn make_context(&self, txn_id: u32) -> ExecutionContext {
        ExecutionContext {
            catalog: Arc::clone(&self.catalog),
            buffer: Arc::clone(&self.buffer),
            txns: Arc::clone(&self.txns),
            locks: Arc::clone(&self.locks),
            config: self.config.clone(),
            txn_id,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Value;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> Session {
        Session::open(dir.path(), EngineConfig::default()).unwrap()
    }

    fn int_rows(result: &StatementResult) -> Vec<i32> {
        result
            .rows
            .as_ref()
            .unwrap()
            .iter()
            .map(|r| match r[0] {
                Value::Int(i) => i,
                ref other => panic!("expected int, got {:?}", other),
            })
            .collect()
    }

    #[test]
    fn test_ddl_dml_select_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut s = open(&dir);

        s.execute("CREATE TABLE users (id INT NOT NULL, name VARCHAR(20))").unwrap();
        s.execute("INSERT INTO users VALUES (1, 'alice'), (2, 'bob'), (3, NULL)").unwrap();

        let res = s.execute("SELECT id, name FROM users WHERE id >= 2 ORDER BY id DESC").unwrap();
        assert_eq!(res.columns, vec!["id", "name"]);
        assert_eq!(int_rows(&res), vec![3, 2]);

        let res = s.execute("SELECT * FROM users ORDER BY id LIMIT 2").unwrap();
        assert_eq!(int_rows(&res), vec![1, 2]);

        let res = s.execute("UPDATE users SET name = 'carol' WHERE id = 2").unwrap();
        assert_eq!(res.message.as_deref(), Some("1 row(s) updated"));

        let res = s.execute("SELECT name FROM users WHERE id = 2").unwrap();
        assert_eq!(res.rows.as_ref().unwrap()[0][0], Value::Str("carol".into()));

        let res = s.execute("DELETE FROM users WHERE name IS NULL").unwrap();
        assert_eq!(res.message.as_deref(), Some("1 row(s) deleted"));
        let res = s.execute("SELECT id FROM users ORDER BY id").unwrap();
        assert_eq!(int_rows(&res), vec![1, 2]);
    }

    /// Commit vs rollback visibility, across a full engine restart.
    #[test]
    fn test_rollback_and_commit_visibility_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut s = open(&dir);
            s.execute("CREATE TABLE t (x INT)").unwrap();

            s.execute("BEGIN").unwrap();
            s.execute("INSERT INTO t VALUES (99)").unwrap();
            // Inside the transaction, the row is visible.
            let res = s.execute("SELECT x FROM t").unwrap();
            assert_eq!(int_rows(&res), vec![99]);
            s.execute("ROLLBACK").unwrap();

            let res = s.execute("SELECT x FROM t").unwrap();
            assert!(int_rows(&res).is_empty());
        }

        {
            let mut s = open(&dir);
            let res = s.execute("SELECT x FROM t").unwrap();
            assert!(int_rows(&res).is_empty());

            s.execute("BEGIN").unwrap();
            s.execute("INSERT INTO t VALUES (42)").unwrap();
            s.execute("COMMIT").unwrap();
        }

        let mut s = open(&dir);
        let res = s.execute("SELECT x FROM t").unwrap();
        assert_eq!(int_rows(&res), vec![42]);
    }

    #[test]
    fn test_ddl_rollback() {
        let dir = TempDir::new().unwrap();
        let mut s = open(&dir);

        s.execute("BEGIN").unwrap();
        s.execute("CREATE TABLE ghost (x INT)").unwrap();
        s.execute("ROLLBACK").unwrap();

        assert!(s.table_names().is_empty());
        assert!(!dir.path().join("ghost.tbl").exists());

        // And the reverse: committed DDL persists across reopen.
        s.execute("CREATE TABLE solid (x INT)").unwrap();
        drop(s);
        let s = open(&dir);
        assert_eq!(s.table_names(), vec!["solid".to_string()]);
    }

    #[test]
    fn test_index_scan_and_maintenance() {
        let dir = TempDir::new().unwrap();
        let mut s = open(&dir);
        s.execute("CREATE TABLE items (id INT NOT NULL, price FLOAT)").unwrap();
        for i in 0..50 {
            s.execute(&format!("INSERT INTO items VALUES ({}, {}.5)", i, i)).unwrap();
        }
        s.execute("CREATE INDEX ix_items_id ON items (id)").unwrap();

        // The planner picks the index for an equality probe.
        let res = s.execute("EXPLAIN PHYSICAL SELECT * FROM items WHERE id = 7").unwrap();
        assert!(res.message.unwrap().contains("IndexScan"));

        let res = s.execute("SELECT id FROM items WHERE id = 7").unwrap();
        assert_eq!(int_rows(&res), vec![7]);
        let res = s.execute("SELECT id FROM items WHERE id > 45 ORDER BY id").unwrap();
        assert_eq!(int_rows(&res), vec![46, 47, 48, 49]);

        // Inserts after CREATE INDEX are visible through the index.
        s.execute("INSERT INTO items VALUES (100, 1.0)").unwrap();
        let res = s.execute("SELECT id FROM items WHERE id = 100").unwrap();
        assert_eq!(int_rows(&res), vec![100]);

        // Deleted rows leave stale entries that scans filter out.
        s.execute("DELETE FROM items WHERE id = 7").unwrap();
        let res = s.execute("SELECT id FROM items WHERE id = 7").unwrap();
        assert!(int_rows(&res).is_empty());

        // Updates redirect probes to the new key.
        s.execute("UPDATE items SET id = 200 WHERE id = 8").unwrap();
        let res = s.execute("SELECT id FROM items WHERE id = 8").unwrap();
        assert!(int_rows(&res).is_empty());
        let res = s.execute("SELECT id FROM items WHERE id = 200").unwrap();
        assert_eq!(int_rows(&res), vec![200]);

        s.execute("DROP INDEX ix_items_id").unwrap();
        let res = s.execute("EXPLAIN PHYSICAL SELECT * FROM items WHERE id = 7").unwrap();
        assert!(res.message.unwrap().contains("SeqScan"));
    }

    #[test]
    fn test_explain_modes() {
        let dir = TempDir::new().unwrap();
        let mut s = open(&dir);
        s.execute("CREATE TABLE t (a INT)").unwrap();

        let res = s.execute("EXPLAIN SELECT * FROM t WHERE a = 1").unwrap();
        let text = res.message.unwrap();
        assert!(text.contains("Project"));
        assert!(text.contains("Filter"));
        assert!(text.contains("Scan [t]"));

        let res = s.execute("EXPLAIN LOGICAL SELECT * FROM t").unwrap();
        assert!(res.message.unwrap().contains("Scan [t]"));

        let res = s.execute("EXPLAIN PHYSICAL SELECT * FROM t WHERE a = 1").unwrap();
        assert!(res.message.unwrap().contains("SeqScan [t]"));
    }

    #[test]
    fn test_schema_violation_aborts_statement_only() {
        let dir = TempDir::new().unwrap();
        let mut s = open(&dir);
        s.execute("CREATE TABLE t (x INT NOT NULL)").unwrap();

        let err = s.execute("INSERT INTO t VALUES (NULL)").unwrap_err();
        assert!(matches!(err, MiniDbError::Schema(_)));

        // The session keeps working afterwards.
        s.execute("INSERT INTO t VALUES (1)").unwrap();
        let res = s.execute("SELECT x FROM t").unwrap();
        assert_eq!(int_rows(&res), vec![1]);
    }

    #[test]
    fn test_error_aborts_explicit_transaction() {
        let dir = TempDir::new().unwrap();
        let mut s = open(&dir);
        s.execute("CREATE TABLE t (x INT NOT NULL)").unwrap();

        s.execute("BEGIN").unwrap();
        s.execute("INSERT INTO t VALUES (1)").unwrap();
        let _ = s.execute("INSERT INTO t VALUES (NULL)").unwrap_err();

        // The failed statement rolled the whole transaction back.
        assert!(!s.in_transaction());
        let res = s.execute("SELECT x FROM t").unwrap();
        assert!(int_rows(&res).is_empty());
        // COMMIT now fails: there is nothing to commit.
        assert!(s.execute("COMMIT").is_err());
    }

    #[test]
    fn test_multi_statement_string() {
        let dir = TempDir::new().unwrap();
        let mut s = open(&dir);
        let res = s
            .execute("CREATE TABLE t (x INT); INSERT INTO t VALUES (1); SELECT x FROM t")
            .unwrap();
        assert_eq!(int_rows(&res), vec![1]);
    }

    #[test]
    fn test_update_that_moves_the_row() {
        let dir = TempDir::new().unwrap();
        let mut s = open(&dir);
        s.execute("CREATE TABLE docs (id INT NOT NULL, body VARCHAR(4000))").unwrap();

        // Two ~1.5 KB rows share a page; growing one to ~3 KB cannot fit
        // even after compaction, so the row moves to a fresh RID.
        let filler = "x".repeat(1500);
        s.execute(&format!("INSERT INTO docs VALUES (1, '{}'), (2, '{}')", filler, filler))
            .unwrap();
        let big = "y".repeat(3000);
        let res = s.execute(&format!("UPDATE docs SET body = '{}' WHERE id = 1", big)).unwrap();
        assert_eq!(res.message.as_deref(), Some("1 row(s) updated"));

        let res = s.execute("SELECT id FROM docs ORDER BY id").unwrap();
        assert_eq!(int_rows(&res), vec![1, 2]);
        let res = s.execute("SELECT body FROM docs WHERE id = 1").unwrap();
        assert_eq!(res.rows.as_ref().unwrap()[0][0], Value::Str(big));

        // And the move survives rollback of a later transaction intact.
        s.execute("BEGIN").unwrap();
        s.execute("DELETE FROM docs WHERE id = 1").unwrap();
        s.execute("ROLLBACK").unwrap();
        let res = s.execute("SELECT id FROM docs ORDER BY id").unwrap();
        assert_eq!(int_rows(&res), vec![1, 2]);
    }

    #[test]
    fn test_date_and_boolean_columns() {
        let dir = TempDir::new().unwrap();
        let mut s = open(&dir);
        s.execute("CREATE TABLE ev (name VARCHAR(10), d DATE, flag BOOLEAN)").unwrap();
        s.execute("INSERT INTO ev VALUES ('a', '2024-01-15', true)").unwrap();
        s.execute("INSERT INTO ev VALUES ('b', '2023-06-01', false)").unwrap();

        let res = s.execute("SELECT name FROM ev WHERE d > '2023-12-31'").unwrap();
        assert_eq!(res.rows.as_ref().unwrap().len(), 1);
        assert_eq!(res.rows.as_ref().unwrap()[0][0], Value::Str("a".into()));

        let res = s.execute("SELECT name FROM ev WHERE flag = false").unwrap();
        assert_eq!(res.rows.as_ref().unwrap()[0][0], Value::Str("b".into()));
    }
}
