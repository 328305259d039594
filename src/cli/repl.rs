//! Interactive REPL: line-based input with `;`-terminated statements and
//! dot meta-commands. Ctrl-C aborts any open transaction and exits
//! cleanly.

use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::warn;

use crate::common::MiniDbResult;
use crate::session::Session;

use super::renderer::{OutputMode, Renderer};

const HELP: &str = "\
Meta-commands:
  .help           Show this help
  .tables         List tables
  .schema [T]     Show table schema(s)
  .indexes [T]    List indexes
  .mode M         Output mode: table | vertical | raw
  .timer on|off   Toggle statement timing
  .stats          Session statistics
  .quit           Exit";

pub struct Repl {
    session: Session,
    renderer: Renderer,
    interrupted: Arc<AtomicBool>,
}

impl Repl {
    pub fn new(session: Session) -> Self {
        let interrupted = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&interrupted);
        if let Err(e) = ctrlc::set_handler(move || {
            flag.store(true, Ordering::SeqCst);
        }) {
            warn!("could not install Ctrl-C handler: {}", e);
        }
        Repl {
            session,
            renderer: Renderer::default(),
            interrupted,
        }
    }

    pub fn run(&mut self) -> MiniDbResult<()> {
        println!("minidb {} (data dir: {})", crate::config::_VERSION, self.session.data_dir().display());
        println!("Type .help for meta-commands, .quit to exit.");

        let stdin = std::io::stdin();
        let mut buffer = String::new();
        loop {
            if self.interrupted.load(Ordering::SeqCst) {
                println!();
                break;
            }
            let prompt = if buffer.is_empty() {
                if self.session.autocommit() { "minidb> " } else { "minidb*> " }
            } else {
                "   ...> "
            };
            print!("{}", prompt);
            std::io::stdout().flush()?;

            let mut line = String::new();
            let n = stdin.lock().read_line(&mut line)?;
            if n == 0 {
                break; // EOF
            }
            let trimmed = line.trim();

            if buffer.is_empty() && trimmed.starts_with('.') {
                if !self.handle_meta(trimmed) {
                    break;
                }
                continue;
            }
            if trimmed.is_empty() && buffer.is_empty() {
                continue;
            }

            buffer.push_str(&line);
            if !statement_complete(&buffer) {
                continue;
            }
            let sql = std::mem::take(&mut buffer);
            self.run_statement(sql.trim());
        }

        self.session.close()
    }

    fn run_statement(&mut self, sql: &str) {
        let sql = sql.trim_end_matches(';');
        if sql.trim().is_empty() {
            return;
        }
        let started = Instant::now();
        match self.session.execute(sql) {
            Ok(result) => {
                println!("{}", self.renderer.render_result(&result, started.elapsed()));
            }
            Err(e) => {
                println!("{}", self.renderer.render_error(&e));
            }
        }
    }

    /// Returns false when the REPL should exit.
    fn handle_meta(&mut self, command: &str) -> bool {
        let mut parts = command.split_whitespace();
        let head = parts.next().unwrap_or("");
        let arg = parts.next();

        match head {
            ".quit" | ".exit" => return false,
            ".help" => println!("{}", HELP),
            ".tables" => {
                let names = self.session.table_names();
                if names.is_empty() {
                    println!("(no tables)");
                } else {
                    for name in names {
                        println!("{}", name);
                    }
                }
            }
            ".schema" => {
                let tables = match arg {
                    Some(t) => vec![t.to_string()],
                    None => self.session.table_names(),
                };
                for table in tables {
                    match self.session.table_schema(&table) {
                        Ok(schema) => {
                            println!("{}:", table);
                            for col in &schema.columns {
                                println!(
                                    "  {} {}{}",
                                    col.name,
                                    col.data_type,
                                    if col.nullable { "" } else { " NOT NULL" }
                                );
                            }
                        }
                        Err(e) => println!("{}", self.renderer.render_error(&e)),
                    }
                }
            }
            ".indexes" => {
                let list = self.session.index_list(arg);
                if list.is_empty() {
                    println!("(no indexes)");
                } else {
                    for (index, table, column) in list {
                        println!("{} on {}({})", index, table, column);
                    }
                }
            }
            ".mode" => match arg.and_then(OutputMode::parse) {
                Some(mode) => {
                    self.renderer.mode = mode;
                    println!("mode set");
                }
                None => println!("usage: .mode table|vertical|raw"),
            },
            ".timer" => match arg {
                Some("on") => self.renderer.show_timer = true,
                Some("off") => self.renderer.show_timer = false,
                _ => println!("usage: .timer on|off"),
            },
            ".stats" => {
                let stats = self.session.stats();
                println!("statements executed:    {}", stats.statements_executed);
                println!("transactions committed: {}", stats.transactions_committed);
                println!("transactions aborted:   {}", stats.transactions_aborted);
            }
            other => println!("unknown meta-command: {} (try .help)", other),
        }
        true
    }
}

/// A statement is complete once a `;` appears outside single quotes.
pub fn statement_complete(text: &str) -> bool {
    let mut in_quote = false;
    for ch in text.chars() {
        match ch {
            '\'' => in_quote = !in_quote,
            ';' if !in_quote => return true,
            _ => {}
        }
    }
    false
}

/// Split a script on `;` outside single quotes; comment-only lines are
/// dropped.
pub fn split_statements(content: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    for ch in content.chars() {
        match ch {
            '\'' => {
                in_quote = !in_quote;
                current.push(ch);
            }
            ';' if !in_quote => {
                statements.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        statements.push(current);
    }
    statements
        .into_iter()
        .map(|s| {
            s.lines()
                .filter(|l| !l.trim_start().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .filter(|s| !s.trim().is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_complete() {
        assert!(statement_complete("SELECT 1;"));
        assert!(!statement_complete("SELECT 1"));
        assert!(!statement_complete("INSERT INTO t VALUES ('a;b'"));
        assert!(statement_complete("INSERT INTO t VALUES ('a;b');"));
    }

    #[test]
    fn test_split_statements() {
        let script = "\
-- schema
CREATE TABLE t (x INT);
INSERT INTO t VALUES ('a;b');
SELECT * FROM t";
        let stmts = split_statements(script);
        assert_eq!(stmts.len(), 3);
        assert!(stmts[0].contains("CREATE TABLE"));
        assert!(stmts[1].contains("'a;b'"));
        assert!(stmts[2].contains("SELECT"));
    }
}
