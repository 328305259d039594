use serde::{Deserialize, Serialize};

use crate::common::{DataType, MiniDbError, MiniDbResult, Value};

/// Definition of a single column in a table schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl Column {
    pub fn new(name: &str, data_type: DataType, nullable: bool) -> Self {
        Column {
            name: name.to_string(),
            data_type,
            nullable,
        }
    }
}

/// Table schema: an ordered list of column definitions.
/// Stored as JSON (`{"columns": [...]}`) in the table header page and the
/// catalog file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Schema {
    pub columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Schema { columns }
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Zero-based index of a column by name, case-insensitive.
    pub fn column_index(&self, name: &str) -> MiniDbResult<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                MiniDbError::Schema(format!(
                    "Column '{}' not found. Available: {:?}",
                    name,
                    self.column_names()
                ))
            })
    }

    pub fn column(&self, name: &str) -> MiniDbResult<&Column> {
        let idx = self.column_index(name)?;
        Ok(&self.columns[idx])
    }

    /// Validate a row against the schema: arity, NOT NULL, value types.
    /// Returns the collected error messages (empty = valid).
    pub fn validate_row(&self, row: &[Value]) -> Vec<String> {
        let mut errors = Vec::new();
        if row.len() != self.columns.len() {
            errors.push(format!(
                "Expected {} values, got {}",
                self.columns.len(),
                row.len()
            ));
            return errors;
        }
        for (col, val) in self.columns.iter().zip(row.iter()) {
            if val.is_null() {
                if !col.nullable {
                    errors.push(format!("Column '{}' does not allow NULL", col.name));
                }
                continue;
            }
            if val.data_type() != Some(col.data_type) {
                errors.push(format!(
                    "Column '{}' expects {}, got {}",
                    col.name,
                    col.data_type,
                    val.data_type().map(|t| t.as_str()).unwrap_or("NULL")
                ));
            }
        }
        errors
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("schema serialization cannot fail")
    }

    pub fn from_json(v: &serde_json::Value) -> MiniDbResult<Self> {
        serde_json::from_value(v.clone())
            .map_err(|e| MiniDbError::Catalog(format!("Invalid schema JSON: {}", e)))
    }
}
