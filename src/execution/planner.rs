//! Lowering from the logical plan to the Volcano operator tree.
//!
//! The only optimization applied is access-path selection: an equality
//! or range conjunct on an indexed column turns the base scan into an
//! index scan. The Filter stays on top for the residual predicate and to
//! re-check rows behind stale index entries.

use sqlparser::ast::{BinaryOperator, Expr};

use crate::catalog::Schema;
use crate::common::{MiniDbError, MiniDbResult, Value};
use crate::sql::plan::{PlanNode, ProjectItem};

use super::context::ExecutionContext;
use super::expr::eval_literal;
use super::physical::{
    DeleteExec, FilterExec, IndexBounds, IndexScanExec, InsertExec, LimitExec, PhysicalNode,
    ProjectColumn, ProjectExec, SeqScanExec, SortExec, UpdateExec, ValuesExec,
};

pub struct PlannedStatement {
    pub root: Box<dyn PhysicalNode>,
    pub columns: Vec<String>,
}

struct Planned {
    op: Box<dyn PhysicalNode>,
    names: Vec<String>,
    /// Base-table schema flowing through scan-shaped nodes; projections
    /// replace it with their output shape for name resolution only.
    schema: Schema,
}

pub fn plan_physical(node: &PlanNode, ctx: &ExecutionContext) -> MiniDbResult<PlannedStatement> {
    let planned = build(node, ctx)?;
    Ok(PlannedStatement {
        root: planned.op,
        columns: planned.names,
    })
}

fn build(node: &PlanNode, ctx: &ExecutionContext) -> MiniDbResult<Planned> {
    match node {
        PlanNode::TableScan { table } => {
            let schema = table_schema(ctx, table)?;
            let names = schema.column_names().iter().map(|s| s.to_string()).collect();
            Ok(Planned {
                op: Box::new(SeqScanExec::new(table)),
                names,
                schema,
            })
        }
        PlanNode::Filter { predicate, input } => {
            // Access-path selection applies to a filter directly over a
            // base scan.
            if let PlanNode::TableScan { table } = input.as_ref() {
                let schema = table_schema(ctx, table)?;
                let names: Vec<String> =
                    schema.column_names().iter().map(|s| s.to_string()).collect();
                let scan: Box<dyn PhysicalNode> =
                    match choose_index(ctx, table, predicate)? {
                        Some((index_name, column, bounds)) => Box::new(IndexScanExec::new(
                            table,
                            &index_name,
                            &column,
                            bounds,
                        )),
                        None => Box::new(SeqScanExec::new(table)),
                    };
                return Ok(Planned {
                    op: Box::new(FilterExec::new(predicate.clone(), schema.clone(), scan)),
                    names,
                    schema,
                });
            }
            let child = build(input, ctx)?;
            Ok(Planned {
                op: Box::new(FilterExec::new(
                    predicate.clone(),
                    child.schema.clone(),
                    child.op,
                )),
                names: child.names,
                schema: child.schema,
            })
        }
        PlanNode::Project { items, input } => {
            let child = build(input, ctx)?;
            let mut columns = Vec::new();
            let mut names = Vec::new();
            for item in items {
                match item {
                    ProjectItem::Wildcard => {
                        columns.push(ProjectColumn::Wildcard);
                        names.extend(child.names.iter().cloned());
                    }
                    ProjectItem::Expr { expr, alias } => {
                        names.push(match alias {
                            Some(a) => a.clone(),
                            None => format!("{}", expr),
                        });
                        columns.push(ProjectColumn::Expr(expr.clone()));
                    }
                }
            }
            Ok(Planned {
                op: Box::new(ProjectExec::new(columns, child.schema.clone(), child.op)),
                names,
                schema: child.schema,
            })
        }
        PlanNode::Sort {
            columns,
            asc,
            input,
        } => {
            let child = build(input, ctx)?;
            let mut keys = Vec::new();
            for (col, ascending) in columns.iter().zip(asc.iter()) {
                let idx = child
                    .names
                    .iter()
                    .position(|n| n.eq_ignore_ascii_case(col))
                    .ok_or_else(|| {
                        MiniDbError::Execution(format!(
                            "ORDER BY column '{}' must appear in the select list",
                            col
                        ))
                    })?;
                keys.push((idx, *ascending));
            }
            Ok(Planned {
                op: Box::new(SortExec::new(keys, child.op)),
                names: child.names,
                schema: child.schema,
            })
        }
        PlanNode::Limit { count, input } => {
            let child = build(input, ctx)?;
            Ok(Planned {
                op: Box::new(LimitExec::new(*count, child.op)),
                names: child.names,
                schema: child.schema,
            })
        }
        PlanNode::Values { rows } => Ok(Planned {
            op: Box::new(ValuesExec::new(rows.clone())),
            names: Vec::new(),
            schema: Schema::new(Vec::new()),
        }),
        PlanNode::Insert {
            table,
            columns,
            input,
        } => {
            let child = build(input, ctx)?;
            Ok(Planned {
                op: Box::new(InsertExec::new(table, columns.clone(), child.op)),
                names: vec!["count".to_string()],
                schema: Schema::new(Vec::new()),
            })
        }
        PlanNode::Update {
            table,
            assignments,
            input,
        } => {
            let child = build(input, ctx)?;
            Ok(Planned {
                op: Box::new(UpdateExec::new(table, assignments.clone(), child.op)),
                names: vec!["count".to_string()],
                schema: Schema::new(Vec::new()),
            })
        }
        PlanNode::Delete { table, input } => {
            let child = build(input, ctx)?;
            Ok(Planned {
                op: Box::new(DeleteExec::new(table, child.op)),
                names: vec!["count".to_string()],
                schema: Schema::new(Vec::new()),
            })
        }
        PlanNode::CreateTable { .. }
        | PlanNode::DropTable { .. }
        | PlanNode::CreateIndex { .. }
        | PlanNode::DropIndex { .. } => Err(MiniDbError::Execution(
            "DDL is executed directly, not through the operator pipeline".to_string(),
        )),
    }
}

fn table_schema(ctx: &ExecutionContext, table: &str) -> MiniDbResult<Schema> {
    Ok(ctx.open_table(table)?.schema().clone())
}

// ==================== Access-path selection ====================

fn choose_index(
    ctx: &ExecutionContext,
    table: &str,
    predicate: &Expr,
) -> MiniDbResult<Option<(String, String, IndexBounds)>> {
    let indexes = ctx.catalog.lock().unwrap().indexes_for_table(table);
    if indexes.is_empty() {
        return Ok(None);
    }
    for (conj_col, bounds) in extract_conjunct_bounds(predicate) {
        if let Some((name, entry)) = indexes
            .iter()
            .find(|(_, ix)| ix.column.eq_ignore_ascii_case(&conj_col))
        {
            return Ok(Some((name.clone(), entry.column.clone(), bounds)));
        }
    }
    Ok(None)
}

/// Indexable conjuncts of the predicate: `col op literal` (either side)
/// reachable through top-level ANDs.
fn extract_conjunct_bounds(expr: &Expr) -> Vec<(String, IndexBounds)> {
    let mut out = Vec::new();
    collect_conjuncts(expr, &mut out);
    out
}

fn collect_conjuncts(expr: &Expr, out: &mut Vec<(String, IndexBounds)>) {
    match expr {
        Expr::Nested(inner) => collect_conjuncts(inner, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_conjuncts(left, out);
            collect_conjuncts(right, out);
        }
        Expr::BinaryOp { left, op, right } => {
            if let Some(hit) = indexable_comparison(left, op, right) {
                out.push(hit);
            }
        }
        _ => {}
    }
}

fn indexable_comparison(
    left: &Expr,
    op: &BinaryOperator,
    right: &Expr,
) -> Option<(String, IndexBounds)> {
    let (column, literal, op) = match (column_name(left), literal_value(right)) {
        (Some(c), Some(v)) => (c, v, op.clone()),
        _ => match (column_name(right), literal_value(left)) {
            // `5 < col` is `col > 5`
            (Some(c), Some(v)) => (c, v, flip(op)?),
            _ => return None,
        },
    };
    let bounds = match op {
        BinaryOperator::Eq => IndexBounds {
            low: Some(literal.clone()),
            high: Some(literal),
            low_inclusive: true,
            high_inclusive: true,
        },
        BinaryOperator::Lt => IndexBounds {
            low: None,
            high: Some(literal),
            low_inclusive: true,
            high_inclusive: false,
        },
        BinaryOperator::LtEq => IndexBounds {
            low: None,
            high: Some(literal),
            low_inclusive: true,
            high_inclusive: true,
        },
        BinaryOperator::Gt => IndexBounds {
            low: Some(literal),
            high: None,
            low_inclusive: false,
            high_inclusive: true,
        },
        BinaryOperator::GtEq => IndexBounds {
            low: Some(literal),
            high: None,
            low_inclusive: true,
            high_inclusive: true,
        },
        _ => return None,
    };
    Some((column, bounds))
}

fn flip(op: &BinaryOperator) -> Option<BinaryOperator> {
    match op {
        BinaryOperator::Eq => Some(BinaryOperator::Eq),
        BinaryOperator::Lt => Some(BinaryOperator::Gt),
        BinaryOperator::LtEq => Some(BinaryOperator::GtEq),
        BinaryOperator::Gt => Some(BinaryOperator::Lt),
        BinaryOperator::GtEq => Some(BinaryOperator::LtEq),
        _ => None,
    }
}

fn column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.clone()),
        Expr::CompoundIdentifier(idents) => idents.last().map(|i| i.value.clone()),
        _ => None,
    }
}

fn literal_value(expr: &Expr) -> Option<Value> {
    eval_literal(expr).ok()
}

// ==================== EXPLAIN PHYSICAL ====================

/// Render the operator tree this planner would build, without taking any
/// locks or constructing operators.
pub fn explain_physical(node: &PlanNode, ctx: &ExecutionContext) -> MiniDbResult<String> {
    let mut out = String::new();
    render(node, ctx, 0, &mut out)?;
    Ok(out)
}

fn render(node: &PlanNode, ctx: &ExecutionContext, depth: usize, out: &mut String) -> MiniDbResult<()> {
    let pad = "  ".repeat(depth);
    match node {
        PlanNode::TableScan { table } => {
            out.push_str(&format!("{}SeqScan [{}]\n", pad, table));
        }
        PlanNode::Filter { predicate, input } => {
            out.push_str(&format!("{}Filter [{}]\n", pad, predicate));
            if let PlanNode::TableScan { table } = input.as_ref() {
                match choose_index(ctx, table, predicate)? {
                    Some((index_name, column, bounds)) => {
                        out.push_str(&format!(
                            "{}  IndexScan [{} via {} on {}; {}]\n",
                            pad,
                            table,
                            index_name,
                            column,
                            describe_bounds(&bounds)
                        ));
                    }
                    None => out.push_str(&format!("{}  SeqScan [{}]\n", pad, table)),
                }
                return Ok(());
            }
            render(input, ctx, depth + 1, out)?;
        }
        PlanNode::Project { items, input } => {
            let cols: Vec<String> = items
                .iter()
                .map(|i| match i {
                    ProjectItem::Wildcard => "*".to_string(),
                    ProjectItem::Expr { expr, alias: Some(a) } => format!("{} AS {}", expr, a),
                    ProjectItem::Expr { expr, alias: None } => format!("{}", expr),
                })
                .collect();
            out.push_str(&format!("{}Project [{}]\n", pad, cols.join(", ")));
            render(input, ctx, depth + 1, out)?;
        }
        PlanNode::Sort { columns, asc, input } => {
            let keys: Vec<String> = columns
                .iter()
                .zip(asc.iter())
                .map(|(c, a)| format!("{} {}", c, if *a { "ASC" } else { "DESC" }))
                .collect();
            out.push_str(&format!("{}Sort [{}]\n", pad, keys.join(", ")));
            render(input, ctx, depth + 1, out)?;
        }
        PlanNode::Limit { count, input } => {
            out.push_str(&format!("{}Limit [{}]\n", pad, count));
            render(input, ctx, depth + 1, out)?;
        }
        PlanNode::Values { rows } => {
            out.push_str(&format!("{}Values [{} rows]\n", pad, rows.len()));
        }
        PlanNode::Insert { table, input, .. } => {
            out.push_str(&format!("{}Insert [{}]\n", pad, table));
            render(input, ctx, depth + 1, out)?;
        }
        PlanNode::Update { table, input, .. } => {
            out.push_str(&format!("{}Update [{}]\n", pad, table));
            render(input, ctx, depth + 1, out)?;
        }
        PlanNode::Delete { table, input } => {
            out.push_str(&format!("{}Delete [{}]\n", pad, table));
            render(input, ctx, depth + 1, out)?;
        }
        // DDL nodes carry no physical pipeline; show the logical form.
        other => {
            for line in crate::sql::plan::render_logical(other).lines() {
                out.push_str(&format!("{}{}\n", pad, line));
            }
        }
    }
    Ok(())
}

fn describe_bounds(bounds: &IndexBounds) -> String {
    match (&bounds.low, &bounds.high) {
        (Some(lo), Some(hi)) if lo.same_as(hi) => format!("= {}", lo),
        (Some(lo), Some(hi)) => format!(
            "{} {} .. {} {}",
            if bounds.low_inclusive { ">=" } else { ">" },
            lo,
            if bounds.high_inclusive { "<=" } else { "<" },
            hi
        ),
        (Some(lo), None) => format!("{} {}", if bounds.low_inclusive { ">=" } else { ">" }, lo),
        (None, Some(hi)) => format!("{} {}", if bounds.high_inclusive { "<=" } else { "<" }, hi),
        (None, None) => "full".to_string(),
    }
}
