//! Expression evaluation over rows.
//!
//! NULL follows SQL three-valued logic collapsed to the engine's needs:
//! any comparison against NULL yields NULL, and a NULL predicate result
//! filters the row out. Arithmetic propagates NULL.

use std::cmp::Ordering;

use sqlparser::ast::{BinaryOperator, Expr, UnaryOperator, Value as AstValue};

use crate::catalog::Schema;
use crate::common::{MiniDbError, MiniDbResult, Value};

/// Evaluate an expression against a row. `schema` resolves identifiers.
pub fn eval(expr: &Expr, row: &[Value], schema: &Schema) -> MiniDbResult<Value> {
    match expr {
        Expr::Identifier(ident) => {
            let idx = schema.column_index(&ident.value)?;
            Ok(row[idx].clone())
        }
        Expr::CompoundIdentifier(idents) => {
            let last = idents.last().ok_or_else(|| {
                MiniDbError::Execution("Empty compound identifier".to_string())
            })?;
            let idx = schema.column_index(&last.value)?;
            Ok(row[idx].clone())
        }
        Expr::Value(v) => literal(&v.value),
        Expr::Nested(inner) => eval(inner, row, schema),
        Expr::IsNull(inner) => Ok(Value::Bool(eval(inner, row, schema)?.is_null())),
        Expr::IsNotNull(inner) => Ok(Value::Bool(!eval(inner, row, schema)?.is_null())),
        Expr::UnaryOp { op, expr } => {
            let v = eval(expr, row, schema)?;
            match (op, v) {
                (_, Value::Null) => Ok(Value::Null),
                (UnaryOperator::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                (UnaryOperator::Minus, Value::Int(i)) => Ok(Value::Int(-i)),
                (UnaryOperator::Minus, Value::Float(f)) => Ok(Value::Float(-f)),
                (UnaryOperator::Plus, v @ (Value::Int(_) | Value::Float(_))) => Ok(v),
                (op, v) => Err(MiniDbError::Execution(format!(
                    "Cannot apply {} to {:?}",
                    op, v
                ))),
            }
        }
        Expr::BinaryOp { left, op, right } => {
            let l = eval(left, row, schema)?;
            let r = eval(right, row, schema)?;
            eval_binary(op, l, r)
        }
        Expr::Between {
            expr,
            negated,
            low,
            high,
        } => {
            let v = eval(expr, row, schema)?;
            let lo = eval(low, row, schema)?;
            let hi = eval(high, row, schema)?;
            match (v.compare(&lo), v.compare(&hi)) {
                (Some(a), Some(b)) => {
                    let inside = a != Ordering::Less && b != Ordering::Greater;
                    Ok(Value::Bool(inside != *negated))
                }
                _ => Ok(Value::Null),
            }
        }
        other => Err(MiniDbError::Execution(format!(
            "Unsupported expression: {}",
            other
        ))),
    }
}

/// Evaluate a literal-only expression (VALUES rows, assignments without
/// column references).
pub fn eval_literal(expr: &Expr) -> MiniDbResult<Value> {
    static EMPTY: &[Value] = &[];
    let schema = Schema::new(Vec::new());
    eval(expr, EMPTY, &schema)
}

fn literal(v: &AstValue) -> MiniDbResult<Value> {
    match v {
        AstValue::Number(n, _) => {
            if let Ok(i) = n.parse::<i32>() {
                Ok(Value::Int(i))
            } else if let Ok(f) = n.parse::<f64>() {
                Ok(Value::Float(f))
            } else {
                Err(MiniDbError::Execution(format!("Invalid number: {}", n)))
            }
        }
        AstValue::SingleQuotedString(s) => Ok(Value::Str(s.clone())),
        AstValue::Boolean(b) => Ok(Value::Bool(*b)),
        AstValue::Null => Ok(Value::Null),
        other => Err(MiniDbError::Execution(format!(
            "Unsupported literal: {}",
            other
        ))),
    }
}

fn eval_binary(op: &BinaryOperator, l: Value, r: Value) -> MiniDbResult<Value> {
    match op {
        BinaryOperator::And => match (truthy(&l), truthy(&r)) {
            (Some(false), _) | (_, Some(false)) => Ok(Value::Bool(false)),
            (Some(true), Some(true)) => Ok(Value::Bool(true)),
            _ => Ok(Value::Null),
        },
        BinaryOperator::Or => match (truthy(&l), truthy(&r)) {
            (Some(true), _) | (_, Some(true)) => Ok(Value::Bool(true)),
            (Some(false), Some(false)) => Ok(Value::Bool(false)),
            _ => Ok(Value::Null),
        },
        BinaryOperator::Eq
        | BinaryOperator::NotEq
        | BinaryOperator::Lt
        | BinaryOperator::LtEq
        | BinaryOperator::Gt
        | BinaryOperator::GtEq => {
            let Some(ord) = l.compare(&r) else {
                return Ok(Value::Null);
            };
            let result = match op {
                BinaryOperator::Eq => ord == Ordering::Equal,
                BinaryOperator::NotEq => ord != Ordering::Equal,
                BinaryOperator::Lt => ord == Ordering::Less,
                BinaryOperator::LtEq => ord != Ordering::Greater,
                BinaryOperator::Gt => ord == Ordering::Greater,
                BinaryOperator::GtEq => ord != Ordering::Less,
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }
        BinaryOperator::Plus
        | BinaryOperator::Minus
        | BinaryOperator::Multiply
        | BinaryOperator::Divide
        | BinaryOperator::Modulo => arithmetic(op, l, r),
        other => Err(MiniDbError::Execution(format!(
            "Unsupported operator: {}",
            other
        ))),
    }
}

fn truthy(v: &Value) -> Option<bool> {
    match v {
        Value::Null => None,
        Value::Bool(b) => Some(*b),
        _ => Some(true),
    }
}

fn arithmetic(op: &BinaryOperator, l: Value, r: Value) -> MiniDbResult<Value> {
    if l.is_null() || r.is_null() {
        return Ok(Value::Null);
    }
    match (&l, &r) {
        (Value::Int(a), Value::Int(b)) => {
            let (a, b) = (*a, *b);
            let out = match op {
                BinaryOperator::Plus => a.checked_add(b),
                BinaryOperator::Minus => a.checked_sub(b),
                BinaryOperator::Multiply => a.checked_mul(b),
                BinaryOperator::Divide => {
                    if b == 0 {
                        return Err(MiniDbError::Execution("Division by zero".to_string()));
                    }
                    a.checked_div(b)
                }
                BinaryOperator::Modulo => {
                    if b == 0 {
                        return Err(MiniDbError::Execution("Division by zero".to_string()));
                    }
                    a.checked_rem(b)
                }
                _ => unreachable!(),
            };
            out.map(Value::Int)
                .ok_or_else(|| MiniDbError::Execution("Integer overflow".to_string()))
        }
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            let a = as_f64(&l);
            let b = as_f64(&r);
            let out = match op {
                BinaryOperator::Plus => a + b,
                BinaryOperator::Minus => a - b,
                BinaryOperator::Multiply => a * b,
                BinaryOperator::Divide => {
                    if b == 0.0 {
                        return Err(MiniDbError::Execution("Division by zero".to_string()));
                    }
                    a / b
                }
                BinaryOperator::Modulo => {
                    if b == 0.0 {
                        return Err(MiniDbError::Execution("Division by zero".to_string()));
                    }
                    a % b
                }
                _ => unreachable!(),
            };
            Ok(Value::Float(out))
        }
        _ => Err(MiniDbError::Execution(format!(
            "Cannot apply {} to {:?} and {:?}",
            op, l, r
        ))),
    }
}

fn as_f64(v: &Value) -> f64 {
    match v {
        Value::Int(i) => *i as f64,
        Value::Float(f) => *f,
        _ => unreachable!("checked by caller"),
    }
}

/// Predicate evaluation: a NULL result filters the row out.
pub fn eval_predicate(expr: &Expr, row: &[Value], schema: &Schema) -> MiniDbResult<bool> {
    match eval(expr, row, schema)? {
        Value::Bool(b) => Ok(b),
        Value::Null => Ok(false),
        other => Err(MiniDbError::Execution(format!(
            "WHERE clause must be boolean, got {:?}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Column;
    use crate::common::DataType;
    use crate::sql::plan::parse_statements;
    use sqlparser::ast::{SetExpr, Statement};

    fn schema() -> Schema {
        Schema::new(vec![
            Column::new("id", DataType::Int, false),
            Column::new("name", DataType::String, true),
            Column::new("score", DataType::Float, true),
        ])
    }

    fn where_expr(clause: &str) -> Expr {
        let sql = format!("SELECT * FROM t WHERE {}", clause);
        let stmts = parse_statements(&sql).unwrap();
        let Statement::Query(q) = &stmts[0] else {
            panic!()
        };
        let SetExpr::Select(s) = &*q.body else { panic!() };
        s.selection.clone().unwrap()
    }

    fn row() -> Vec<Value> {
        vec![Value::Int(7), Value::Str("alice".into()), Value::Null]
    }

    #[test]
    fn test_comparisons() {
        let s = schema();
        assert!(eval_predicate(&where_expr("id = 7"), &row(), &s).unwrap());
        assert!(eval_predicate(&where_expr("id >= 7"), &row(), &s).unwrap());
        assert!(!eval_predicate(&where_expr("id < 7"), &row(), &s).unwrap());
        assert!(eval_predicate(&where_expr("name = 'alice'"), &row(), &s).unwrap());
        assert!(eval_predicate(&where_expr("id BETWEEN 5 AND 10"), &row(), &s).unwrap());
        assert!(!eval_predicate(&where_expr("id NOT BETWEEN 5 AND 10"), &row(), &s).unwrap());
    }

    #[test]
    fn test_null_semantics() {
        let s = schema();
        // Comparisons with NULL never match.
        assert!(!eval_predicate(&where_expr("score = 1.0"), &row(), &s).unwrap());
        assert!(!eval_predicate(&where_expr("score <> 1.0"), &row(), &s).unwrap());
        assert!(eval_predicate(&where_expr("score IS NULL"), &row(), &s).unwrap());
        assert!(!eval_predicate(&where_expr("score IS NOT NULL"), &row(), &s).unwrap());
        // NULL OR true = true, NULL AND true = NULL (filtered).
        assert!(eval_predicate(&where_expr("score = 1.0 OR id = 7"), &row(), &s).unwrap());
        assert!(!eval_predicate(&where_expr("score = 1.0 AND id = 7"), &row(), &s).unwrap());
    }

    #[test]
    fn test_arithmetic() {
        let s = schema();
        assert_eq!(
            eval(&where_expr("id + 3 = 10"), &row(), &s).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            eval(&where_expr("id / 2 = 3"), &row(), &s).unwrap(),
            Value::Bool(true) // integer division truncates
        );
        assert!(eval(&where_expr("id / 0 = 1"), &row(), &s).is_err());
        // NULL propagates through arithmetic.
        assert_eq!(
            eval(&where_expr("score + 1 = 1"), &row(), &s).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_literals() {
        assert_eq!(eval_literal(&where_expr("1 = 1")).unwrap(), Value::Bool(true));
        let big = format!("{} = {}", i64::from(i32::MAX) + 1, 0);
        // Numbers beyond i32 become floats.
        assert_eq!(eval_literal(&where_expr(&big)).unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_unknown_column() {
        let s = schema();
        assert!(eval_predicate(&where_expr("missing = 1"), &row(), &s).is_err());
    }
}
