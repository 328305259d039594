//! Result rendering for the CLI: aligned ASCII tables, a vertical mode
//! for wide rows, and a raw tab-separated mode for scripting.

use std::time::Duration;

use crate::common::{MiniDbError, Value};
use crate::execution::StatementResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Table,
    Vertical,
    Raw,
}

impl OutputMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "table" => Some(OutputMode::Table),
            "vertical" => Some(OutputMode::Vertical),
            "raw" => Some(OutputMode::Raw),
            _ => None,
        }
    }
}

pub struct Renderer {
    pub mode: OutputMode,
    pub show_timer: bool,
}

impl Default for Renderer {
    fn default() -> Self {
        Renderer {
            mode: OutputMode::Table,
            show_timer: true,
        }
    }
}

impl Renderer {
    pub fn render_result(&self, result: &StatementResult, elapsed: Duration) -> String {
        let mut out = String::new();
        if let Some(rows) = &result.rows {
            out.push_str(&self.render_rows(rows, &result.columns));
            out.push_str(&format!(
                "({} row{})",
                rows.len(),
                if rows.len() == 1 { "" } else { "s" }
            ));
        } else if let Some(message) = &result.message {
            out.push_str(message);
        }
        if self.show_timer {
            out.push_str(&format!("  [{:.1} ms]", elapsed.as_secs_f64() * 1000.0));
        }
        out
    }

    pub fn render_rows(&self, rows: &[Vec<Value>], columns: &[String]) -> String {
        match self.mode {
            OutputMode::Table => Self::render_table(rows, columns),
            OutputMode::Vertical => Self::render_vertical(rows, columns),
            OutputMode::Raw => Self::render_raw(rows),
        }
    }

    fn render_table(rows: &[Vec<Value>], columns: &[String]) -> String {
        let mut widths: Vec<usize> = columns.iter().map(|c| c.len()).collect();
        let rendered: Vec<Vec<String>> = rows
            .iter()
            .map(|row| row.iter().map(|v| format!("{}", v)).collect())
            .collect();
        for row in &rendered {
            for (i, cell) in row.iter().enumerate() {
                if i < widths.len() && cell.len() > widths[i] {
                    widths[i] = cell.len();
                } else if i >= widths.len() {
                    widths.push(cell.len());
                }
            }
        }

        let separator = {
            let mut s = String::from("+");
            for w in &widths {
                s.push_str(&"-".repeat(w + 2));
                s.push('+');
            }
            s.push('\n');
            s
        };

        let mut out = String::new();
        out.push_str(&separator);
        if !columns.is_empty() {
            out.push('|');
            for (c, w) in columns.iter().zip(widths.iter()) {
                out.push_str(&format!(" {:<width$} |", c, width = w));
            }
            out.push('\n');
            out.push_str(&separator);
        }
        for row in &rendered {
            out.push('|');
            for (cell, w) in row.iter().zip(widths.iter()) {
                out.push_str(&format!(" {:<width$} |", cell, width = w));
            }
            out.push('\n');
        }
        out.push_str(&separator);
        out
    }

    fn render_vertical(rows: &[Vec<Value>], columns: &[String]) -> String {
        let name_width = columns.iter().map(|c| c.len()).max().unwrap_or(0);
        let mut out = String::new();
        for (i, row) in rows.iter().enumerate() {
            out.push_str(&format!("-- row {} --\n", i + 1));
            for (col, val) in columns.iter().zip(row.iter()) {
                out.push_str(&format!("{:>width$}: {}\n", col, val, width = name_width));
            }
        }
        out
    }

    fn render_raw(rows: &[Vec<Value>]) -> String {
        let mut out = String::new();
        for row in rows {
            let cells: Vec<String> = row.iter().map(|v| format!("{}", v)).collect();
            out.push_str(&cells.join("\t"));
            out.push('\n');
        }
        out
    }

    pub fn render_error(&self, error: &MiniDbError) -> String {
        format!("Error: {}", error)
    }
}
