//! Volcano-style physical operators: every operator exposes
//! open/next/close and pulls rows from its child.
//!
//! Locking is lazy: scans take a Shared table lock at open, DML
//! operators take Exclusive. UPDATE and DELETE materialise their full
//! candidate set before mutating anything, so a statement never observes
//! its own writes.

use std::cmp::Ordering;

use sqlparser::ast::Expr;
use tracing::debug;

use crate::catalog::Schema;
use crate::common::{MiniDbError, MiniDbResult, Value};
use crate::concurrency::LockMode;
use crate::index::BTree;
use crate::storage::heap::HeapScan;
use crate::storage::{Rid, TableHeap};

use super::context::ExecutionContext;
use super::expr::{eval, eval_literal, eval_predicate};

#[derive(Debug, Clone)]
pub struct ExecRow {
    pub values: Vec<Value>,
    pub rid: Option<Rid>,
}

impl ExecRow {
    pub fn new(values: Vec<Value>) -> Self {
        ExecRow { values, rid: None }
    }

    pub fn with_rid(values: Vec<Value>, rid: Rid) -> Self {
        ExecRow {
            values,
            rid: Some(rid),
        }
    }
}

pub trait PhysicalNode {
    fn open(&mut self, ctx: &mut ExecutionContext) -> MiniDbResult<()>;
    fn next(&mut self, ctx: &mut ExecutionContext) -> MiniDbResult<Option<ExecRow>>;
    fn close(&mut self, ctx: &mut ExecutionContext) -> MiniDbResult<()>;
}

// ==================== SeqScan ====================

pub struct SeqScanExec {
    table: String,
    scan: Option<HeapScan>,
}

impl SeqScanExec {
    pub fn new(table: &str) -> Self {
        SeqScanExec {
            table: table.to_string(),
            scan: None,
        }
    }
}

impl PhysicalNode for SeqScanExec {
    fn open(&mut self, ctx: &mut ExecutionContext) -> MiniDbResult<()> {
        ctx.acquire_table_lock(&self.table, LockMode::Shared)?;
        let heap = ctx.open_table(&self.table)?;
        self.scan = Some(heap.scan());
        Ok(())
    }

    fn next(&mut self, _ctx: &mut ExecutionContext) -> MiniDbResult<Option<ExecRow>> {
        let Some(scan) = self.scan.as_mut() else {
            return Ok(None);
        };
        match scan.next() {
            Some(Ok((rid, values))) => Ok(Some(ExecRow::with_rid(values, rid))),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    fn close(&mut self, _ctx: &mut ExecutionContext) -> MiniDbResult<()> {
        self.scan = None;
        Ok(())
    }
}

// ==================== IndexScan ====================

#[derive(Debug, Clone)]
pub struct IndexBounds {
    pub low: Option<Value>,
    pub high: Option<Value>,
    pub low_inclusive: bool,
    pub high_inclusive: bool,
}

pub struct IndexScanExec {
    table: String,
    index_name: String,
    column: String,
    bounds: IndexBounds,
    heap: Option<TableHeap>,
    column_idx: usize,
    entries: Vec<(Value, Rid)>,
    pos: usize,
}

impl IndexScanExec {
    pub fn new(table: &str, index_name: &str, column: &str, bounds: IndexBounds) -> Self {
        IndexScanExec {
            table: table.to_string(),
            index_name: index_name.to_string(),
            column: column.to_string(),
            bounds,
            heap: None,
            column_idx: 0,
            entries: Vec::new(),
            pos: 0,
        }
    }
}

impl PhysicalNode for IndexScanExec {
    fn open(&mut self, ctx: &mut ExecutionContext) -> MiniDbResult<()> {
        ctx.acquire_table_lock(&self.table, LockMode::Shared)?;
        let heap = ctx.open_table(&self.table)?;
        self.column_idx = heap.schema().column_index(&self.column)?;

        let path = ctx.catalog.lock().unwrap().index_path(&self.index_name)?;
        let tree = BTree::open(
            &path,
            std::sync::Arc::clone(&ctx.buffer),
            ctx.config.page_crc_verify_on_load,
        )?;
        self.entries = tree.range_scan(
            self.bounds.low.as_ref(),
            self.bounds.high.as_ref(),
            self.bounds.low_inclusive,
            self.bounds.high_inclusive,
        )?;
        debug!(
            index = %self.index_name,
            matches = self.entries.len(),
            "index scan"
        );
        self.heap = Some(heap);
        self.pos = 0;
        Ok(())
    }

    fn next(&mut self, _ctx: &mut ExecutionContext) -> MiniDbResult<Option<ExecRow>> {
        let Some(heap) = self.heap.as_ref() else {
            return Ok(None);
        };
        while self.pos < self.entries.len() {
            let (key, rid) = self.entries[self.pos].clone();
            self.pos += 1;
            // The tree is insert-only: entries may be stale after a
            // delete or update. Re-check against the heap row.
            let Some(values) = heap.get_row(rid)? else {
                continue;
            };
            if !values[self.column_idx].same_as(&key) {
                continue;
            }
            return Ok(Some(ExecRow::with_rid(values, rid)));
        }
        Ok(None)
    }

    fn close(&mut self, _ctx: &mut ExecutionContext) -> MiniDbResult<()> {
        self.heap = None;
        self.entries.clear();
        Ok(())
    }
}

// ==================== Filter / Project / Sort / Limit / Values ====================

pub struct FilterExec {
    predicate: Expr,
    schema: Schema,
    child: Box<dyn PhysicalNode>,
}

impl FilterExec {
    pub fn new(predicate: Expr, schema: Schema, child: Box<dyn PhysicalNode>) -> Self {
        FilterExec {
            predicate,
            schema,
            child,
        }
    }
}

impl PhysicalNode for FilterExec {
    fn open(&mut self, ctx: &mut ExecutionContext) -> MiniDbResult<()> {
        self.child.open(ctx)
    }

    fn next(&mut self, ctx: &mut ExecutionContext) -> MiniDbResult<Option<ExecRow>> {
        while let Some(row) = self.child.next(ctx)? {
            if eval_predicate(&self.predicate, &row.values, &self.schema)? {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    fn close(&mut self, ctx: &mut ExecutionContext) -> MiniDbResult<()> {
        self.child.close(ctx)
    }
}

pub enum ProjectColumn {
    /// Pass the whole input row through (SELECT *).
    Wildcard,
    Expr(Expr),
}

pub struct ProjectExec {
    columns: Vec<ProjectColumn>,
    schema: Schema,
    child: Box<dyn PhysicalNode>,
}

impl ProjectExec {
    pub fn new(columns: Vec<ProjectColumn>, schema: Schema, child: Box<dyn PhysicalNode>) -> Self {
        ProjectExec {
            columns,
            schema,
            child,
        }
    }
}

impl PhysicalNode for ProjectExec {
    fn open(&mut self, ctx: &mut ExecutionContext) -> MiniDbResult<()> {
        self.child.open(ctx)
    }

    fn next(&mut self, ctx: &mut ExecutionContext) -> MiniDbResult<Option<ExecRow>> {
        let Some(row) = self.child.next(ctx)? else {
            return Ok(None);
        };
        let mut out = Vec::new();
        for col in &self.columns {
            match col {
                ProjectColumn::Wildcard => out.extend(row.values.iter().cloned()),
                ProjectColumn::Expr(e) => out.push(eval(e, &row.values, &self.schema)?),
            }
        }
        Ok(Some(ExecRow {
            values: out,
            rid: row.rid,
        }))
    }

    fn close(&mut self, ctx: &mut ExecutionContext) -> MiniDbResult<()> {
        self.child.close(ctx)
    }
}

pub struct SortExec {
    /// (column index in the input row, ascending)
    keys: Vec<(usize, bool)>,
    child: Box<dyn PhysicalNode>,
    buffered: Vec<ExecRow>,
    pos: usize,
}

impl SortExec {
    pub fn new(keys: Vec<(usize, bool)>, child: Box<dyn PhysicalNode>) -> Self {
        SortExec {
            keys,
            child,
            buffered: Vec::new(),
            pos: 0,
        }
    }

    /// NULLs sort first ascending (and therefore last descending).
    fn cmp_values(a: &Value, b: &Value) -> Ordering {
        match (a.is_null(), b.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => a.compare(b).unwrap_or(Ordering::Equal),
        }
    }
}

impl PhysicalNode for SortExec {
    fn open(&mut self, ctx: &mut ExecutionContext) -> MiniDbResult<()> {
        self.child.open(ctx)?;
        let mut rows = Vec::new();
        while let Some(row) = self.child.next(ctx)? {
            rows.push(row);
        }
        let keys = self.keys.clone();
        rows.sort_by(|a, b| {
            for &(idx, asc) in &keys {
                let ord = Self::cmp_values(&a.values[idx], &b.values[idx]);
                let ord = if asc { ord } else { ord.reverse() };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
        self.buffered = rows;
        self.pos = 0;
        Ok(())
    }

    fn next(&mut self, _ctx: &mut ExecutionContext) -> MiniDbResult<Option<ExecRow>> {
        if self.pos >= self.buffered.len() {
            return Ok(None);
        }
        let row = self.buffered[self.pos].clone();
        self.pos += 1;
        Ok(Some(row))
    }

    fn close(&mut self, ctx: &mut ExecutionContext) -> MiniDbResult<()> {
        self.buffered.clear();
        self.child.close(ctx)
    }
}

pub struct LimitExec {
    count: u64,
    returned: u64,
    child: Box<dyn PhysicalNode>,
}

impl LimitExec {
    pub fn new(count: u64, child: Box<dyn PhysicalNode>) -> Self {
        LimitExec {
            count,
            returned: 0,
            child,
        }
    }
}

impl PhysicalNode for LimitExec {
    fn open(&mut self, ctx: &mut ExecutionContext) -> MiniDbResult<()> {
        self.returned = 0;
        self.child.open(ctx)
    }

    fn next(&mut self, ctx: &mut ExecutionContext) -> MiniDbResult<Option<ExecRow>> {
        if self.returned >= self.count {
            return Ok(None);
        }
        match self.child.next(ctx)? {
            Some(row) => {
                self.returned += 1;
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }

    fn close(&mut self, ctx: &mut ExecutionContext) -> MiniDbResult<()> {
        self.child.close(ctx)
    }
}

pub struct ValuesExec {
    rows: Vec<Vec<Expr>>,
    pos: usize,
}

impl ValuesExec {
    pub fn new(rows: Vec<Vec<Expr>>) -> Self {
        ValuesExec { rows, pos: 0 }
    }
}

impl PhysicalNode for ValuesExec {
    fn open(&mut self, _ctx: &mut ExecutionContext) -> MiniDbResult<()> {
        self.pos = 0;
        Ok(())
    }

    fn next(&mut self, _ctx: &mut ExecutionContext) -> MiniDbResult<Option<ExecRow>> {
        if self.pos >= self.rows.len() {
            return Ok(None);
        }
        let exprs = &self.rows[self.pos];
        self.pos += 1;
        let mut values = Vec::with_capacity(exprs.len());
        for e in exprs {
            values.push(eval_literal(e)?);
        }
        Ok(Some(ExecRow::new(values)))
    }

    fn close(&mut self, _ctx: &mut ExecutionContext) -> MiniDbResult<()> {
        Ok(())
    }
}

// ==================== DML operators ====================

/// Open B+Trees of the target table, paired with their column index.
struct TableIndexes {
    trees: Vec<(usize, BTree)>,
}

impl TableIndexes {
    fn open(ctx: &ExecutionContext, table: &str, schema: &Schema) -> MiniDbResult<Self> {
        let mut trees = Vec::new();
        for (_name, column, tree) in ctx.open_table_indexes(table)? {
            let idx = schema.column_index(&column)?;
            trees.push((idx, tree));
        }
        Ok(TableIndexes { trees })
    }

    /// Insert the row's key into every index whose column is non-NULL.
    /// NaN floats are unindexable and skipped, like NULLs.
    fn insert_row(&mut self, values: &[Value], rid: Rid) -> MiniDbResult<()> {
        for (col_idx, tree) in &mut self.trees {
            let v = &values[*col_idx];
            if v.is_null() {
                continue;
            }
            if let Value::Float(f) = v {
                if f.is_nan() {
                    continue;
                }
            }
            tree.insert(v, rid)?;
        }
        Ok(())
    }

    fn maintain_update(
        &mut self,
        old_values: &[Value],
        new_values: &[Value],
        old_rid: Rid,
        new_rid: Rid,
    ) -> MiniDbResult<()> {
        for (col_idx, tree) in &mut self.trees {
            let old_v = &old_values[*col_idx];
            let new_v = &new_values[*col_idx];
            if old_rid == new_rid && new_v.same_as(old_v) {
                continue; // the existing entry is still exact
            }
            if new_v.is_null() {
                continue;
            }
            if let Value::Float(f) = new_v {
                if f.is_nan() {
                    continue;
                }
            }
            tree.insert(new_v, new_rid)?;
        }
        Ok(())
    }
}

pub struct InsertExec {
    table: String,
    columns: Option<Vec<String>>,
    child: Box<dyn PhysicalNode>,
    done: bool,
}

impl InsertExec {
    pub fn new(table: &str, columns: Option<Vec<String>>, child: Box<dyn PhysicalNode>) -> Self {
        InsertExec {
            table: table.to_string(),
            columns,
            child,
            done: false,
        }
    }

    /// Reorder a VALUES row to schema order, coercing literals to the
    /// column types. Unlisted columns become NULL.
    fn shape_row(&self, schema: &Schema, input: &[Value]) -> MiniDbResult<Vec<Value>> {
        let full = match &self.columns {
            None => {
                if input.len() != schema.column_count() {
                    return Err(MiniDbError::Schema(format!(
                        "Expected {} values, got {}",
                        schema.column_count(),
                        input.len()
                    )));
                }
                input.to_vec()
            }
            Some(names) => {
                if input.len() != names.len() {
                    return Err(MiniDbError::Schema(format!(
                        "Expected {} values for {} columns",
                        names.len(),
                        names.len()
                    )));
                }
                let mut full = vec![Value::Null; schema.column_count()];
                for (name, value) in names.iter().zip(input.iter()) {
                    let idx = schema.column_index(name)?;
                    full[idx] = value.clone();
                }
                full
            }
        };
        full.iter()
            .zip(schema.columns.iter())
            .map(|(v, col)| v.coerce_to(col.data_type))
            .collect()
    }
}

impl PhysicalNode for InsertExec {
    fn open(&mut self, ctx: &mut ExecutionContext) -> MiniDbResult<()> {
        ctx.acquire_table_lock(&self.table, LockMode::Exclusive)?;
        self.child.open(ctx)?;
        self.done = false;
        Ok(())
    }

    fn next(&mut self, ctx: &mut ExecutionContext) -> MiniDbResult<Option<ExecRow>> {
        if self.done {
            return Ok(None);
        }
        self.done = true;

        let mut heap = ctx.open_table(&self.table)?;
        let schema = heap.schema().clone();
        let mut indexes = TableIndexes::open(ctx, &self.table, &schema)?;
        let table_name = heap.table_name().to_string();

        let mut count = 0i32;
        while let Some(row) = self.child.next(ctx)? {
            let values = self.shape_row(&schema, &row.values)?;

            let rid = heap.insert_row(&values)?;
            let tuple = heap
                .tuple_bytes(rid)?
                .expect("tuple just inserted");
            let lsn = ctx.txns.log_insert(ctx.txn_id, &table_name, rid, &tuple)?;
            heap.stamp_page_lsn(rid.page_id, lsn)?;

            indexes.insert_row(&values, rid)?;
            count += 1;
        }
        debug!(table = %self.table, count, "insert complete");
        Ok(Some(ExecRow::new(vec![Value::Int(count)])))
    }

    fn close(&mut self, ctx: &mut ExecutionContext) -> MiniDbResult<()> {
        self.child.close(ctx)
    }
}

pub struct UpdateExec {
    table: String,
    assignments: Vec<(String, Expr)>,
    child: Box<dyn PhysicalNode>,
    done: bool,
}

impl UpdateExec {
    pub fn new(table: &str, assignments: Vec<(String, Expr)>, child: Box<dyn PhysicalNode>) -> Self {
        UpdateExec {
            table: table.to_string(),
            assignments,
            child,
            done: false,
        }
    }
}

impl PhysicalNode for UpdateExec {
    fn open(&mut self, ctx: &mut ExecutionContext) -> MiniDbResult<()> {
        ctx.acquire_table_lock(&self.table, LockMode::Exclusive)?;
        self.child.open(ctx)?;
        self.done = false;
        Ok(())
    }

    fn next(&mut self, ctx: &mut ExecutionContext) -> MiniDbResult<Option<ExecRow>> {
        if self.done {
            return Ok(None);
        }
        self.done = true;

        // Materialise the candidate set before touching any page, so the
        // statement cannot chase its own updates.
        let mut candidates: Vec<(Rid, Vec<Value>)> = Vec::new();
        while let Some(row) = self.child.next(ctx)? {
            let rid = row.rid.ok_or_else(|| {
                MiniDbError::Execution("UPDATE requires a base-table scan".to_string())
            })?;
            candidates.push((rid, row.values));
        }

        let mut heap = ctx.open_table(&self.table)?;
        let schema = heap.schema().clone();
        let mut indexes = TableIndexes::open(ctx, &self.table, &schema)?;
        let table_name = heap.table_name().to_string();

        let mut resolved: Vec<(usize, &Expr)> = Vec::new();
        for (name, expr) in &self.assignments {
            resolved.push((schema.column_index(name)?, expr));
        }

        let mut count = 0i32;
        for (rid, old_values) in candidates {
            let mut new_values = old_values.clone();
            for (idx, expr) in &resolved {
                let raw = eval(expr, &old_values, &schema)?;
                new_values[*idx] = raw.coerce_to(schema.columns[*idx].data_type)?;
            }

            let old_bytes = match heap.tuple_bytes(rid)? {
                Some(b) => b,
                None => continue, // vanished candidate
            };

            if heap.update_row(rid, &new_values)? {
                let new_bytes = heap.tuple_bytes(rid)?.expect("row just updated");
                let lsn = ctx
                    .txns
                    .log_update(ctx.txn_id, &table_name, rid, &old_bytes, &new_bytes)?;
                heap.stamp_page_lsn(rid.page_id, lsn)?;
                indexes.maintain_update(&old_values, &new_values, rid, rid)?;
            } else {
                // The new image does not fit in the page: the row moves,
                // logged as a delete plus an insert.
                let lsn = ctx.txns.log_delete(ctx.txn_id, &table_name, rid, &old_bytes)?;
                heap.delete_row(rid)?;
                heap.stamp_page_lsn(rid.page_id, lsn)?;

                let new_rid = heap.insert_row(&new_values)?;
                let new_bytes = heap.tuple_bytes(new_rid)?.expect("row just inserted");
                let lsn = ctx.txns.log_insert(ctx.txn_id, &table_name, new_rid, &new_bytes)?;
                heap.stamp_page_lsn(new_rid.page_id, lsn)?;
                indexes.maintain_update(&old_values, &new_values, rid, new_rid)?;
            }
            count += 1;
        }
        debug!(table = %self.table, count, "update complete");
        Ok(Some(ExecRow::new(vec![Value::Int(count)])))
    }

    fn close(&mut self, ctx: &mut ExecutionContext) -> MiniDbResult<()> {
        self.child.close(ctx)
    }
}

pub struct DeleteExec {
    table: String,
    child: Box<dyn PhysicalNode>,
    done: bool,
}

impl DeleteExec {
    pub fn new(table: &str, child: Box<dyn PhysicalNode>) -> Self {
        DeleteExec {
            table: table.to_string(),
            child,
            done: false,
        }
    }
}

impl PhysicalNode for DeleteExec {
    fn open(&mut self, ctx: &mut ExecutionContext) -> MiniDbResult<()> {
        ctx.acquire_table_lock(&self.table, LockMode::Exclusive)?;
        self.child.open(ctx)?;
        self.done = false;
        Ok(())
    }

    fn next(&mut self, ctx: &mut ExecutionContext) -> MiniDbResult<Option<ExecRow>> {
        if self.done {
            return Ok(None);
        }
        self.done = true;

        let mut candidates: Vec<Rid> = Vec::new();
        while let Some(row) = self.child.next(ctx)? {
            let rid = row.rid.ok_or_else(|| {
                MiniDbError::Execution("DELETE requires a base-table scan".to_string())
            })?;
            candidates.push(rid);
        }

        let mut heap = ctx.open_table(&self.table)?;
        let table_name = heap.table_name().to_string();

        let mut count = 0i32;
        for rid in candidates {
            let Some(before) = heap.tuple_bytes(rid)? else {
                continue;
            };
            // Before-image is logged before the slot is cleared.
            let lsn = ctx.txns.log_delete(ctx.txn_id, &table_name, rid, &before)?;
            heap.delete_row(rid)?;
            heap.stamp_page_lsn(rid.page_id, lsn)?;
            count += 1;
        }
        debug!(table = %self.table, count, "delete complete");
        Ok(Some(ExecRow::new(vec![Value::Int(count)])))
    }

    fn close(&mut self, ctx: &mut ExecutionContext) -> MiniDbResult<()> {
        self.child.close(ctx)
    }
}
