//! minidb entry point.
//!
//! Usage:
//!   minidb [database_path]                interactive REPL
//!   minidb --execute "SQL" [db_path]      run one statement and exit
//!   minidb --file script.sql [db_path]    run a SQL script and exit
//!
//! Exit code 0 on success, 1 on any unhandled error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use minidb::cli::repl::split_statements;
use minidb::cli::{Renderer, Repl};
use minidb::config::{EngineConfig, DEFAULT_DB_DIR};
use minidb::session::Session;

fn print_help() {
    println!(
        "\
minidb - a small relational storage engine

Usage:
    minidb [database_path]                Interactive REPL
    minidb --execute \"SQL\" [db_path]      Execute a single statement
    minidb --file script.sql [db_path]    Execute a SQL script

Options:
    --help          Show this help
    --execute SQL   Execute SQL and exit
    --file PATH     Execute a SQL script file and exit
    database_path   Database directory (default: {})",
        DEFAULT_DB_DIR
    );
}

fn open_session(db_path: &PathBuf) -> Result<Session, ExitCode> {
    match Session::open(db_path, EngineConfig::default()) {
        Ok(session) => {
            let stats = session.recovery_stats();
            if !stats.is_noop() {
                println!(
                    "recovery: {} committed, {} rolled back, {} redo, {} undo",
                    stats.committed_txns, stats.uncommitted_txns, stats.redo_count, stats.undo_count
                );
            }
            Ok(session)
        }
        Err(e) => {
            eprintln!("Failed to open database: {}", e);
            Err(ExitCode::FAILURE)
        }
    }
}

fn execute_single(db_path: &PathBuf, sql: &str) -> ExitCode {
    let mut session = match open_session(db_path) {
        Ok(s) => s,
        Err(code) => return code,
    };
    let renderer = Renderer {
        show_timer: false,
        ..Renderer::default()
    };
    let started = Instant::now();
    match session.execute(sql) {
        Ok(result) => {
            println!("{}", renderer.render_result(&result, started.elapsed()));
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}", renderer.render_error(&e));
            ExitCode::FAILURE
        }
    }
}

fn execute_script(db_path: &PathBuf, script_path: &str) -> ExitCode {
    let content = match std::fs::read_to_string(script_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Cannot read script {}: {}", script_path, e);
            return ExitCode::FAILURE;
        }
    };
    let mut session = match open_session(db_path) {
        Ok(s) => s,
        Err(code) => return code,
    };
    let renderer = Renderer {
        show_timer: false,
        ..Renderer::default()
    };

    for stmt in split_statements(&content) {
        let started = Instant::now();
        match session.execute(&stmt) {
            Ok(result) => {
                let rendered = renderer.render_result(&result, started.elapsed());
                if !rendered.is_empty() {
                    println!("{}", rendered);
                }
            }
            Err(e) => {
                eprintln!("{}", renderer.render_error(&e));
                eprintln!("Error in statement: {}", stmt.trim());
                return ExitCode::FAILURE;
            }
        }
    }
    ExitCode::SUCCESS
}

fn main() -> ExitCode {
    minidb::init_log();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return ExitCode::SUCCESS;
    }

    let mut db_path: Option<PathBuf> = None;
    let mut execute_sql: Option<String> = None;
    let mut script_file: Option<String> = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--execute" if i + 1 < args.len() => {
                execute_sql = Some(args[i + 1].clone());
                i += 2;
            }
            "--file" if i + 1 < args.len() => {
                script_file = Some(args[i + 1].clone());
                i += 2;
            }
            other if other.starts_with('-') => {
                eprintln!("Unknown option: {}", other);
                print_help();
                return ExitCode::FAILURE;
            }
            other => {
                db_path = Some(PathBuf::from(other));
                i += 1;
            }
        }
    }
    let db_path = db_path.unwrap_or_else(|| PathBuf::from(DEFAULT_DB_DIR));

    if let Some(sql) = execute_sql {
        execute_single(&db_path, &sql)
    } else if let Some(script) = script_file {
        execute_script(&db_path, &script)
    } else {
        let session = match open_session(&db_path) {
            Ok(s) => s,
            Err(code) => return code,
        };
        match Repl::new(session).run() {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("REPL error: {}", e);
                ExitCode::FAILURE
            }
        }
    }
}
