use std::cmp::Ordering;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::{MiniDbError, MiniDbResult};

/// Column data types supported by the engine.
/// The serde names are the ones stored in catalog / header JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    #[serde(rename = "INT")]
    Int,
    #[serde(rename = "FLOAT")]
    Float,
    #[serde(rename = "STRING")]
    String,
    #[serde(rename = "BOOLEAN")]
    Boolean,
    #[serde(rename = "DATE")]
    Date,
}

impl DataType {
    pub fn parse(s: &str) -> MiniDbResult<Self> {
        match s.trim().to_uppercase().as_str() {
            "INT" | "INTEGER" => Ok(DataType::Int),
            "FLOAT" | "DOUBLE" | "REAL" => Ok(DataType::Float),
            "STRING" | "VARCHAR" | "TEXT" | "CHAR" => Ok(DataType::String),
            "BOOLEAN" | "BOOL" => Ok(DataType::Boolean),
            "DATE" => Ok(DataType::Date),
            other => Err(MiniDbError::Schema(format!("Unknown data type: {}", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Int => "INT",
            DataType::Float => "FLOAT",
            DataType::String => "STRING",
            DataType::Boolean => "BOOLEAN",
            DataType::Date => "DATE",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Runtime value of a column. DATE is carried as a calendar date and
/// serialized as days since 1970-01-01.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Int(i32),
    Float(f64),
    Str(String),
    Bool(bool),
    Date(NaiveDate),
}

pub fn date_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()
}

pub fn days_since_epoch(d: NaiveDate) -> i32 {
    (d - date_epoch()).num_days() as i32
}

pub fn date_from_days(days: i32) -> NaiveDate {
    date_epoch() + chrono::Duration::days(days as i64)
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Int(_) => Some(DataType::Int),
            Value::Float(_) => Some(DataType::Float),
            Value::Str(_) => Some(DataType::String),
            Value::Bool(_) => Some(DataType::Boolean),
            Value::Date(_) => Some(DataType::Date),
        }
    }

    /// Coerce a value into the given column type.
    /// INT literals widen to FLOAT, string literals parse into DATE.
    pub fn coerce_to(&self, dtype: DataType) -> MiniDbResult<Value> {
        match (self, dtype) {
            (Value::Null, _) => Ok(Value::Null),
            (Value::Int(v), DataType::Int) => Ok(Value::Int(*v)),
            (Value::Int(v), DataType::Float) => Ok(Value::Float(*v as f64)),
            (Value::Float(v), DataType::Float) => Ok(Value::Float(*v)),
            (Value::Str(s), DataType::String) => Ok(Value::Str(s.clone())),
            (Value::Bool(b), DataType::Boolean) => Ok(Value::Bool(*b)),
            (Value::Date(d), DataType::Date) => Ok(Value::Date(*d)),
            (Value::Str(s), DataType::Date) => {
                let d = NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| {
                    MiniDbError::Schema(format!("Cannot coerce '{}' to DATE (expected YYYY-MM-DD)", s))
                })?;
                Ok(Value::Date(d))
            }
            (v, t) => Err(MiniDbError::Schema(format!(
                "Cannot coerce {} to {}",
                v.type_name(),
                t
            ))),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Int(_) => "INT",
            Value::Float(_) => "FLOAT",
            Value::Str(_) => "STRING",
            Value::Bool(_) => "BOOLEAN",
            Value::Date(_) => "DATE",
        }
    }

    /// SQL comparison. Returns None when either side is NULL or the types
    /// are not comparable; INT and FLOAT compare numerically.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            // Date literals arrive as strings from SQL text.
            (Value::Date(a), Value::Str(s)) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .map(|b| a.cmp(&b)),
            (Value::Str(s), Value::Date(b)) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .map(|a| a.cmp(b)),
            _ => None,
        }
    }

    /// Equality used by tests and scan comparisons: NULL equals NULL here,
    /// unlike the three-valued SQL comparison above.
    pub fn same_as(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            _ => self.compare(other) == Some(Ordering::Equal),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Str(s) => write!(f, "{}", s),
            Value::Bool(b) => write!(f, "{}", if *b { "true" } else { "false" }),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}
