//! SQL front end: sqlparser AST -> logical plan.
//!
//! The engine accepts a small dialect: CREATE/DROP TABLE, CREATE/DROP
//! INDEX, INSERT (VALUES), SELECT over one table with WHERE / ORDER BY /
//! LIMIT, UPDATE, DELETE, BEGIN/COMMIT/ROLLBACK and EXPLAIN. Anything
//! else is rejected with a parser error.

use sqlparser::ast::{
    ColumnOption, Expr, FromTable, GroupByExpr, LimitClause, ObjectType, OrderByKind, Query,
    Select, SelectItem, SetExpr, Statement, TableFactor, TableWithJoins, Value as AstValue,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::catalog::Column;
use crate::common::{DataType, MiniDbError, MiniDbResult};

#[derive(Debug, Clone)]
pub enum ProjectItem {
    Wildcard,
    Expr { expr: Expr, alias: Option<String> },
}

/// Logical plan tree for queries and DML.
#[derive(Debug, Clone)]
pub enum PlanNode {
    TableScan {
        table: String,
    },
    Filter {
        predicate: Expr,
        input: Box<PlanNode>,
    },
    Project {
        items: Vec<ProjectItem>,
        input: Box<PlanNode>,
    },
    Sort {
        columns: Vec<String>,
        asc: Vec<bool>,
        input: Box<PlanNode>,
    },
    Limit {
        count: u64,
        input: Box<PlanNode>,
    },
    Values {
        rows: Vec<Vec<Expr>>,
    },
    Insert {
        table: String,
        columns: Option<Vec<String>>,
        input: Box<PlanNode>,
    },
    Update {
        table: String,
        assignments: Vec<(String, Expr)>,
        input: Box<PlanNode>,
    },
    Delete {
        table: String,
        input: Box<PlanNode>,
    },
    CreateTable {
        table: String,
        columns: Vec<Column>,
    },
    DropTable {
        table: String,
        if_exists: bool,
    },
    CreateIndex {
        index: String,
        table: String,
        column: String,
    },
    DropIndex {
        index: String,
        if_exists: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExplainMode {
    Logical,
    Physical,
}

/// A fully classified statement, ready for the executor.
#[derive(Debug, Clone)]
pub enum SqlCommand {
    Begin,
    Commit,
    Rollback,
    Explain { mode: ExplainMode, plan: Box<PlanNode> },
    Plan(PlanNode),
}

pub fn parse_statements(sql: &str) -> MiniDbResult<Vec<Statement>> {
    let dialect = GenericDialect {};
    Parser::parse_sql(&dialect, sql).map_err(|e| MiniDbError::Parser(e.to_string()))
}

pub fn build_command(stmt: &Statement) -> MiniDbResult<SqlCommand> {
    match stmt {
        Statement::StartTransaction { .. } => Ok(SqlCommand::Begin),
        Statement::Commit { .. } => Ok(SqlCommand::Commit),
        Statement::Rollback { .. } => Ok(SqlCommand::Rollback),
        Statement::Explain { statement, .. } => {
            let inner = build_command(statement)?;
            match inner {
                SqlCommand::Plan(plan) => Ok(SqlCommand::Explain {
                    mode: ExplainMode::Logical,
                    plan: Box::new(plan),
                }),
                _ => Err(MiniDbError::Parser(
                    "EXPLAIN supports only query and DML statements".to_string(),
                )),
            }
        }
        other => Ok(SqlCommand::Plan(build_plan(other)?)),
    }
}

fn build_plan(stmt: &Statement) -> MiniDbResult<PlanNode> {
    match stmt {
        Statement::Query(query) => build_query(query),
        Statement::Insert(insert) => {
            let source = insert.source.as_ref().ok_or_else(|| {
                MiniDbError::Parser("INSERT requires a VALUES clause".to_string())
            })?;
            let rows = match &*source.body {
                SetExpr::Values(values) => values.rows.clone(),
                _ => {
                    return Err(MiniDbError::Parser(
                        "Only INSERT ... VALUES is supported".to_string(),
                    ));
                }
            };
            let columns = if insert.columns.is_empty() {
                None
            } else {
                Some(insert.columns.iter().map(|c| c.value.clone()).collect())
            };
            Ok(PlanNode::Insert {
                table: insert.table.to_string(),
                columns,
                input: Box::new(PlanNode::Values { rows }),
            })
        }
        Statement::Update(update) => {
            let table = table_factor_name(&update.table.relation)?;
            let mut input = PlanNode::TableScan {
                table: table.clone(),
            };
            if let Some(selection) = &update.selection {
                input = PlanNode::Filter {
                    predicate: selection.clone(),
                    input: Box::new(input),
                };
            }
            let assignments = update
                .assignments
                .iter()
                .map(|a| (format!("{}", a.target), a.value.clone()))
                .collect();
            Ok(PlanNode::Update {
                table,
                assignments,
                input: Box::new(input),
            })
        }
        Statement::Delete(delete) => {
            let tables = match &delete.from {
                FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables) => tables,
            };
            if tables.len() != 1 {
                return Err(MiniDbError::Parser(
                    "DELETE supports exactly one table".to_string(),
                ));
            }
            let table = table_factor_name(&tables[0].relation)?;
            let mut input = PlanNode::TableScan {
                table: table.clone(),
            };
            if let Some(selection) = &delete.selection {
                input = PlanNode::Filter {
                    predicate: selection.clone(),
                    input: Box::new(input),
                };
            }
            Ok(PlanNode::Delete {
                table,
                input: Box::new(input),
            })
        }
        Statement::CreateTable(create) => {
            let mut columns = Vec::new();
            for col in &create.columns {
                let dtype = map_data_type(&col.data_type)?;
                let nullable = !col
                    .options
                    .iter()
                    .any(|o| matches!(o.option, ColumnOption::NotNull));
                columns.push(Column::new(&col.name.value, dtype, nullable));
            }
            if columns.is_empty() {
                return Err(MiniDbError::Parser(
                    "CREATE TABLE requires at least one column".to_string(),
                ));
            }
            Ok(PlanNode::CreateTable {
                table: create.name.to_string(),
                columns,
            })
        }
        Statement::Drop {
            object_type,
            names,
            if_exists,
            ..
        } => {
            if names.len() != 1 {
                return Err(MiniDbError::Parser(
                    "DROP supports exactly one object".to_string(),
                ));
            }
            match object_type {
                ObjectType::Table => Ok(PlanNode::DropTable {
                    table: names[0].to_string(),
                    if_exists: *if_exists,
                }),
                ObjectType::Index => Ok(PlanNode::DropIndex {
                    index: names[0].to_string(),
                    if_exists: *if_exists,
                }),
                other => Err(MiniDbError::Parser(format!(
                    "DROP {:?} is not supported",
                    other
                ))),
            }
        }
        Statement::CreateIndex(create_index) => {
            let index = match &create_index.name {
                Some(name) => name.to_string(),
                None => {
                    return Err(MiniDbError::Parser(
                        "CREATE INDEX must have a name".to_string(),
                    ));
                }
            };
            if create_index.columns.len() != 1 {
                return Err(MiniDbError::Parser(
                    "CREATE INDEX supports a single column".to_string(),
                ));
            }
            Ok(PlanNode::CreateIndex {
                index,
                table: create_index.table_name.to_string(),
                column: create_index.columns[0].to_string(),
            })
        }
        other => Err(MiniDbError::Parser(format!(
            "Unsupported statement: {}",
            statement_kind(other)
        ))),
    }
}

fn statement_kind(stmt: &Statement) -> String {
    let text = format!("{}", stmt);
    text.split_whitespace()
        .take(2)
        .collect::<Vec<_>>()
        .join(" ")
}

fn table_factor_name(factor: &TableFactor) -> MiniDbResult<String> {
    match factor {
        TableFactor::Table { name, .. } => Ok(name.to_string()),
        other => Err(MiniDbError::Parser(format!(
            "Unsupported table reference: {}",
            other
        ))),
    }
}

fn map_data_type(dtype: &sqlparser::ast::DataType) -> MiniDbResult<DataType> {
    use sqlparser::ast::DataType as Ast;
    match dtype {
        Ast::Int(_) | Ast::Integer(_) => Ok(DataType::Int),
        Ast::Float(_) | Ast::Real | Ast::Double { .. } => Ok(DataType::Float),
        Ast::Varchar(_) | Ast::Char(_) | Ast::Text | Ast::String { .. } => Ok(DataType::String),
        Ast::Bool | Ast::Boolean => Ok(DataType::Boolean),
        Ast::Date => Ok(DataType::Date),
        other => Err(MiniDbError::Parser(format!(
            "Unsupported column type: {}",
            other
        ))),
    }
}

// ==================== SELECT ====================

fn build_query(query: &Query) -> MiniDbResult<PlanNode> {
    let select = match &*query.body {
        SetExpr::Select(select) => select,
        _ => {
            return Err(MiniDbError::Parser(
                "Only simple SELECT is supported".to_string(),
            ));
        }
    };
    let mut plan = build_select(select)?;

    if let Some(order_by) = &query.order_by {
        if let OrderByKind::Expressions(items) = &order_by.kind {
            let mut columns = Vec::new();
            let mut asc = Vec::new();
            for ob in items {
                let col = match &ob.expr {
                    Expr::Identifier(ident) => ident.value.clone(),
                    Expr::CompoundIdentifier(idents) => idents
                        .last()
                        .map(|i| i.value.clone())
                        .unwrap_or_default(),
                    _ => {
                        return Err(MiniDbError::Parser(
                            "ORDER BY supports only column identifiers".to_string(),
                        ));
                    }
                };
                columns.push(col);
                asc.push(ob.options.asc.unwrap_or(true));
            }
            plan = PlanNode::Sort {
                columns,
                asc,
                input: Box::new(plan),
            };
        }
    }

    if let Some(limit_clause) = &query.limit_clause {
        match limit_clause {
            LimitClause::LimitOffset {
                limit: Some(limit_expr),
                offset: None,
                ..
            } => {
                let count = limit_literal(limit_expr)?;
                plan = PlanNode::Limit {
                    count,
                    input: Box::new(plan),
                };
            }
            _ => {
                return Err(MiniDbError::Parser(
                    "Only a plain LIMIT n is supported".to_string(),
                ));
            }
        }
    }

    Ok(plan)
}

fn limit_literal(expr: &Expr) -> MiniDbResult<u64> {
    match expr {
        Expr::Value(v) => match &v.value {
            AstValue::Number(n, _) => n
                .parse::<u64>()
                .map_err(|_| MiniDbError::Parser(format!("Invalid LIMIT value: {}", n))),
            other => Err(MiniDbError::Parser(format!(
                "Invalid LIMIT value: {}",
                other
            ))),
        },
        other => Err(MiniDbError::Parser(format!(
            "LIMIT must be a literal number, got {}",
            other
        ))),
    }
}

fn build_select(select: &Select) -> MiniDbResult<PlanNode> {
    if matches!(&select.group_by, GroupByExpr::Expressions(exprs, _) if !exprs.is_empty()) {
        return Err(MiniDbError::Parser("GROUP BY is not supported".to_string()));
    }
    if select.having.is_some() {
        return Err(MiniDbError::Parser("HAVING is not supported".to_string()));
    }

    let mut plan = build_from(&select.from)?;

    if let Some(selection) = &select.selection {
        plan = PlanNode::Filter {
            predicate: selection.clone(),
            input: Box::new(plan),
        };
    }

    let mut items = Vec::new();
    for item in &select.projection {
        match item {
            SelectItem::Wildcard(_) => items.push(ProjectItem::Wildcard),
            SelectItem::UnnamedExpr(expr) => items.push(ProjectItem::Expr {
                expr: expr.clone(),
                alias: None,
            }),
            SelectItem::ExprWithAlias { expr, alias } => items.push(ProjectItem::Expr {
                expr: expr.clone(),
                alias: Some(alias.value.clone()),
            }),
            other => {
                return Err(MiniDbError::Parser(format!(
                    "Unsupported projection item: {}",
                    other
                )));
            }
        }
    }
    plan = PlanNode::Project {
        items,
        input: Box::new(plan),
    };
    Ok(plan)
}

fn build_from(from: &[TableWithJoins]) -> MiniDbResult<PlanNode> {
    if from.is_empty() {
        return Err(MiniDbError::Parser("FROM clause is empty".to_string()));
    }
    if from.len() > 1 || !from[0].joins.is_empty() {
        return Err(MiniDbError::Parser(
            "Joins are not supported; query one table at a time".to_string(),
        ));
    }
    Ok(PlanNode::TableScan {
        table: table_factor_name(&from[0].relation)?,
    })
}

// ==================== EXPLAIN rendering ====================

/// Indented tree rendering of a logical plan.
pub fn render_logical(plan: &PlanNode) -> String {
    let mut out = String::new();
    render_node(plan, 0, &mut out);
    out
}

fn render_node(plan: &PlanNode, depth: usize, out: &mut String) {
    let pad = "  ".repeat(depth);
    match plan {
        PlanNode::TableScan { table } => {
            out.push_str(&format!("{}Scan [{}]\n", pad, table));
        }
        PlanNode::Filter { predicate, input } => {
            out.push_str(&format!("{}Filter [{}]\n", pad, predicate));
            render_node(input, depth + 1, out);
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
            render_node(input, depth + 1, out);
        }
        PlanNode::Sort { columns, asc, input } => {
            let keys: Vec<String> = columns
                .iter()
                .zip(asc.iter())
                .map(|(c, a)| format!("{} {}", c, if *a { "ASC" } else { "DESC" }))
                .collect();
            out.push_str(&format!("{}Sort [{}]\n", pad, keys.join(", ")));
            render_node(input, depth + 1, out);
        }
        PlanNode::Limit { count, input } => {
            out.push_str(&format!("{}Limit [{}]\n", pad, count));
            render_node(input, depth + 1, out);
        }
        PlanNode::Values { rows } => {
            out.push_str(&format!("{}Values [{} rows]\n", pad, rows.len()));
        }
        PlanNode::Insert { table, input, .. } => {
            out.push_str(&format!("{}Insert [{}]\n", pad, table));
            render_node(input, depth + 1, out);
        }
        PlanNode::Update { table, assignments, input } => {
            let sets: Vec<String> = assignments
                .iter()
                .map(|(c, e)| format!("{} = {}", c, e))
                .collect();
            out.push_str(&format!("{}Update [{}] SET {}\n", pad, table, sets.join(", ")));
            render_node(input, depth + 1, out);
        }
        PlanNode::Delete { table, input } => {
            out.push_str(&format!("{}Delete [{}]\n", pad, table));
            render_node(input, depth + 1, out);
        }
        PlanNode::CreateTable { table, columns } => {
            out.push_str(&format!(
                "{}CreateTable [{}] ({} columns)\n",
                pad,
                table,
                columns.len()
            ));
        }
        PlanNode::DropTable { table, .. } => {
            out.push_str(&format!("{}DropTable [{}]\n", pad, table));
        }
        PlanNode::CreateIndex { index, table, column } => {
            out.push_str(&format!("{}CreateIndex [{}] on {}({})\n", pad, index, table, column));
        }
        PlanNode::DropIndex { index, .. } => {
            out.push_str(&format!("{}DropIndex [{}]\n", pad, index));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_one(sql: &str) -> SqlCommand {
        let stmts = parse_statements(sql).unwrap();
        assert_eq!(stmts.len(), 1);
        build_command(&stmts[0]).unwrap()
    }

    fn plan_node(sql: &str) -> PlanNode {
        match plan_one(sql) {
            SqlCommand::Plan(node) => node,
            other => panic!("expected plan, got {:?}", other),
        }
    }

    #[test]
    fn test_select_pipeline_shape() {
        let node = plan_node("SELECT id, name FROM users WHERE id > 5 ORDER BY name DESC LIMIT 3");
        let PlanNode::Limit { count, input } = node else {
            panic!("expected Limit on top")
        };
        assert_eq!(count, 3);
        let PlanNode::Sort { columns, asc, input } = *input else {
            panic!("expected Sort")
        };
        assert_eq!(columns, vec!["name"]);
        assert_eq!(asc, vec![false]);
        let PlanNode::Project { items, input } = *input else {
            panic!("expected Project")
        };
        assert_eq!(items.len(), 2);
        let PlanNode::Filter { input, .. } = *input else {
            panic!("expected Filter")
        };
        assert!(matches!(*input, PlanNode::TableScan { ref table } if table == "users"));
    }

    #[test]
    fn test_select_star() {
        let node = plan_node("SELECT * FROM t");
        let PlanNode::Project { items, .. } = node else {
            panic!("expected Project")
        };
        assert!(matches!(items[0], ProjectItem::Wildcard));
    }

    #[test]
    fn test_insert_values() {
        let node = plan_node("INSERT INTO t (a, b) VALUES (1, 'x'), (2, 'y')");
        let PlanNode::Insert { table, columns, input } = node else {
            panic!("expected Insert")
        };
        assert_eq!(table, "t");
        assert_eq!(columns, Some(vec!["a".to_string(), "b".to_string()]));
        let PlanNode::Values { rows } = *input else {
            panic!("expected Values")
        };
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_update_delete_shape() {
        let node = plan_node("UPDATE t SET a = 2 WHERE a = 1");
        let PlanNode::Update { table, assignments, input } = node else {
            panic!("expected Update")
        };
        assert_eq!(table, "t");
        assert_eq!(assignments[0].0, "a");
        assert!(matches!(*input, PlanNode::Filter { .. }));

        let node = plan_node("DELETE FROM t");
        let PlanNode::Delete { input, .. } = node else {
            panic!("expected Delete")
        };
        assert!(matches!(*input, PlanNode::TableScan { .. }));
    }

    #[test]
    fn test_create_table_columns() {
        let node =
            plan_node("CREATE TABLE t (id INT NOT NULL, name VARCHAR(20), ok BOOLEAN, d DATE)");
        let PlanNode::CreateTable { table, columns } = node else {
            panic!("expected CreateTable")
        };
        assert_eq!(table, "t");
        assert_eq!(columns.len(), 4);
        assert_eq!(columns[0].data_type, DataType::Int);
        assert!(!columns[0].nullable);
        assert_eq!(columns[1].data_type, DataType::String);
        assert!(columns[1].nullable);
        assert_eq!(columns[2].data_type, DataType::Boolean);
        assert_eq!(columns[3].data_type, DataType::Date);
    }

    #[test]
    fn test_index_ddl() {
        let node = plan_node("CREATE INDEX ix_t_a ON t (a)");
        assert!(matches!(
            node,
            PlanNode::CreateIndex { ref index, ref table, ref column }
                if index == "ix_t_a" && table == "t" && column == "a"
        ));

        let node = plan_node("DROP INDEX ix_t_a");
        assert!(matches!(node, PlanNode::DropIndex { ref index, .. } if index == "ix_t_a"));
    }

    #[test]
    fn test_transaction_control() {
        assert!(matches!(plan_one("BEGIN"), SqlCommand::Begin));
        assert!(matches!(plan_one("BEGIN TRANSACTION"), SqlCommand::Begin));
        assert!(matches!(plan_one("COMMIT"), SqlCommand::Commit));
        assert!(matches!(plan_one("ROLLBACK"), SqlCommand::Rollback));
    }

    #[test]
    fn test_explain() {
        let cmd = plan_one("EXPLAIN SELECT * FROM t");
        let SqlCommand::Explain { mode, plan } = cmd else {
            panic!("expected Explain")
        };
        assert_eq!(mode, ExplainMode::Logical);
        let rendered = render_logical(&plan);
        assert!(rendered.contains("Project"));
        assert!(rendered.contains("Scan [t]"));
    }

    #[test]
    fn test_unsupported_statements() {
        assert!(matches!(
            plan_one_err("SELECT a FROM t1 JOIN t2 ON t1.a = t2.a"),
            MiniDbError::Parser(_)
        ));
        assert!(matches!(
            plan_one_err("SELECT a, COUNT(*) FROM t GROUP BY a"),
            MiniDbError::Parser(_)
        ));
    }

    fn plan_one_err(sql: &str) -> MiniDbError {
        let stmts = parse_statements(sql).unwrap();
        build_command(&stmts[0]).unwrap_err()
    }
}
