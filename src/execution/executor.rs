//! Statement execution: DDL runs directly against the catalog and
//! storage with commit/rollback hooks; queries and DML run through the
//! Volcano pipeline.

use std::sync::Arc;

use tracing::{info, warn};

use crate::catalog::Schema;
use crate::common::{MiniDbError, MiniDbResult, Value};
use crate::concurrency::LockMode;
use crate::index::BTree;
use crate::sql::plan::{render_logical, ExplainMode, PlanNode};
use crate::storage::TableHeap;

use super::context::ExecutionContext;
use super::planner::{explain_physical, plan_physical};

#[derive(Debug)]
pub struct StatementResult {
    pub rows: Option<Vec<Vec<Value>>>,
    pub columns: Vec<String>,
    pub message: Option<String>,
}

impl StatementResult {
    pub fn message(text: String) -> Self {
        StatementResult {
            rows: None,
            columns: Vec::new(),
            message: Some(text),
        }
    }

    pub fn rows(rows: Vec<Vec<Value>>, columns: Vec<String>) -> Self {
        StatementResult {
            rows: Some(rows),
            columns,
            message: None,
        }
    }
}

pub fn execute_plan(plan: &PlanNode, ctx: &mut ExecutionContext) -> MiniDbResult<StatementResult> {
    match plan {
        PlanNode::CreateTable { table, columns } => create_table(ctx, table, columns.clone()),
        PlanNode::DropTable { table, if_exists } => drop_table(ctx, table, *if_exists),
        PlanNode::CreateIndex {
            index,
            table,
            column,
        } => create_index(ctx, index, table, column),
        PlanNode::DropIndex { index, if_exists } => drop_index(ctx, index, *if_exists),
        _ => run_pipeline(plan, ctx),
    }
}

/// EXPLAIN never takes locks: both renderings only read the catalog.
pub fn execute_explain(
    mode: ExplainMode,
    plan: &PlanNode,
    ctx: &ExecutionContext,
) -> MiniDbResult<StatementResult> {
    let text = match mode {
        ExplainMode::Logical => render_logical(plan),
        ExplainMode::Physical => explain_physical(plan, ctx)?,
    };
    Ok(StatementResult::message(text.trim_end().to_string()))
}

// ==================== Query / DML pipeline ====================

fn run_pipeline(plan: &PlanNode, ctx: &mut ExecutionContext) -> MiniDbResult<StatementResult> {
    let mut planned = plan_physical(plan, ctx)?;

    planned.root.open(ctx)?;
    let mut rows = Vec::new();
    loop {
        match planned.root.next(ctx) {
            Ok(Some(row)) => rows.push(row.values),
            Ok(None) => break,
            Err(e) => {
                let _ = planned.root.close(ctx);
                return Err(e);
            }
        }
    }
    planned.root.close(ctx)?;

    let verb = match plan {
        PlanNode::Insert { .. } => Some("inserted"),
        PlanNode::Update { .. } => Some("updated"),
        PlanNode::Delete { .. } => Some("deleted"),
        _ => None,
    };
    match verb {
        Some(verb) => {
            let count = match rows.first().and_then(|r| r.first()) {
                Some(Value::Int(n)) => *n,
                _ => 0,
            };
            Ok(StatementResult::message(format!("{} row(s) {}", count, verb)))
        }
        None => Ok(StatementResult::rows(rows, planned.columns)),
    }
}

// ==================== DDL ====================

fn create_table(
    ctx: &mut ExecutionContext,
    table: &str,
    columns: Vec<crate::catalog::Column>,
) -> MiniDbResult<StatementResult> {
    let name = table.to_lowercase();
    ctx.acquire_table_lock(&name, LockMode::Exclusive)?;

    let path = ctx.catalog.lock().unwrap().register_table(&name)?;

    // Rollback drops the half-created file and restores the catalog from
    // disk; commit makes the registration durable.
    let cat_commit = Arc::clone(&ctx.catalog);
    let cat_rollback = Arc::clone(&ctx.catalog);
    let buffer = Arc::clone(&ctx.buffer);
    let rollback_path = path.clone();
    ctx.txns.register_hook(
        ctx.txn_id,
        Some(Box::new(move || {
            if let Err(e) = cat_commit.lock().unwrap().save() {
                warn!("catalog save after CREATE TABLE failed: {}", e);
            }
        })),
        Some(Box::new(move || {
            buffer.invalidate_file(&rollback_path);
            let _ = std::fs::remove_file(&rollback_path);
            if let Err(e) = cat_rollback.lock().unwrap().reload() {
                warn!("catalog reload on rollback failed: {}", e);
            }
        })),
    )?;

    TableHeap::create(&path, &name, Schema::new(columns), Arc::clone(&ctx.buffer))?;
    info!(table = %name, "table created");
    Ok(StatementResult::message(format!("Table '{}' created", name)))
}

fn drop_table(
    ctx: &mut ExecutionContext,
    table: &str,
    if_exists: bool,
) -> MiniDbResult<StatementResult> {
    let name = table.to_lowercase();
    {
        let catalog = ctx.catalog.lock().unwrap();
        if !catalog.has_table(&name) {
            if if_exists {
                return Ok(StatementResult::message(format!(
                    "Table '{}' does not exist, skipping",
                    name
                )));
            }
            return Err(MiniDbError::Catalog(format!(
                "Table '{}' does not exist",
                name
            )));
        }
    }
    ctx.acquire_table_lock(&name, LockMode::Exclusive)?;

    let files = ctx.catalog.lock().unwrap().unregister_table(&name)?;

    // The files disappear only once the drop commits; a rollback just
    // restores the catalog.
    let cat_commit = Arc::clone(&ctx.catalog);
    let cat_rollback = Arc::clone(&ctx.catalog);
    let buffer = Arc::clone(&ctx.buffer);
    ctx.txns.register_hook(
        ctx.txn_id,
        Some(Box::new(move || {
            for f in &files {
                buffer.invalidate_file(f);
                let _ = std::fs::remove_file(f);
            }
            if let Err(e) = cat_commit.lock().unwrap().save() {
                warn!("catalog save after DROP TABLE failed: {}", e);
            }
        })),
        Some(Box::new(move || {
            if let Err(e) = cat_rollback.lock().unwrap().reload() {
                warn!("catalog reload on rollback failed: {}", e);
            }
        })),
    )?;

    info!(table = %name, "table dropped");
    Ok(StatementResult::message(format!("Table '{}' dropped", name)))
}

fn create_index(
    ctx: &mut ExecutionContext,
    index: &str,
    table: &str,
    column: &str,
) -> MiniDbResult<StatementResult> {
    let index_name = index.to_lowercase();
    let table_name = table.to_lowercase();
    ctx.acquire_table_lock(&table_name, LockMode::Exclusive)?;

    let heap = ctx.open_table(&table_name)?;
    let col = heap.schema().column(column)?.clone();
    let col_idx = heap.schema().column_index(column)?;

    let path = ctx
        .catalog
        .lock()
        .unwrap()
        .register_index(&index_name, &table_name, column)?;

    let cat_commit = Arc::clone(&ctx.catalog);
    let cat_rollback = Arc::clone(&ctx.catalog);
    let buffer = Arc::clone(&ctx.buffer);
    let rollback_path = path.clone();
    ctx.txns.register_hook(
        ctx.txn_id,
        Some(Box::new(move || {
            if let Err(e) = cat_commit.lock().unwrap().save() {
                warn!("catalog save after CREATE INDEX failed: {}", e);
            }
        })),
        Some(Box::new(move || {
            buffer.invalidate_file(&rollback_path);
            let _ = std::fs::remove_file(&rollback_path);
            if let Err(e) = cat_rollback.lock().unwrap().reload() {
                warn!("catalog reload on rollback failed: {}", e);
            }
        })),
    )?;

    // Bulk load from a full scan; NULLs (and NaN) are not indexed.
    let mut tree = BTree::create(
        &path,
        &table_name,
        &col.name.to_lowercase(),
        col.data_type,
        Arc::clone(&ctx.buffer),
    )?;
    let mut entries = 0u64;
    for item in heap.scan() {
        let (rid, row) = item?;
        let value = &row[col_idx];
        if value.is_null() {
            continue;
        }
        if let Value::Float(f) = value {
            if f.is_nan() {
                continue;
            }
        }
        tree.insert(value, rid)?;
        entries += 1;
    }
    tree.flush()?;

    info!(index = %index_name, table = %table_name, entries, "index created");
    Ok(StatementResult::message(format!(
        "Index '{}' created on {}({}) ({} entries)",
        index_name, table_name, column, entries
    )))
}

fn drop_index(
    ctx: &mut ExecutionContext,
    index: &str,
    if_exists: bool,
) -> MiniDbResult<StatementResult> {
    let index_name = index.to_lowercase();
    let table_name = {
        let catalog = ctx.catalog.lock().unwrap();
        if !catalog.has_index(&index_name) {
            if if_exists {
                return Ok(StatementResult::message(format!(
                    "Index '{}' does not exist, skipping",
                    index_name
                )));
            }
            return Err(MiniDbError::Catalog(format!(
                "Index '{}' does not exist",
                index_name
            )));
        }
        catalog.index(&index_name)?.table.clone()
    };
    ctx.acquire_table_lock(&table_name, LockMode::Exclusive)?;

    let path = ctx.catalog.lock().unwrap().unregister_index(&index_name)?;

    let cat_commit = Arc::clone(&ctx.catalog);
    let cat_rollback = Arc::clone(&ctx.catalog);
    let buffer = Arc::clone(&ctx.buffer);
    ctx.txns.register_hook(
        ctx.txn_id,
        Some(Box::new(move || {
            buffer.invalidate_file(&path);
            let _ = std::fs::remove_file(&path);
            if let Err(e) = cat_commit.lock().unwrap().save() {
                warn!("catalog save after DROP INDEX failed: {}", e);
            }
        })),
        Some(Box::new(move || {
            if let Err(e) = cat_rollback.lock().unwrap().reload() {
                warn!("catalog reload on rollback failed: {}", e);
            }
        })),
    )?;

    info!(index = %index_name, "index dropped");
    Ok(StatementResult::message(format!(
        "Index '{}' dropped",
        index_name
    )))
}
