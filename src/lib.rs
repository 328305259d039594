pub mod config;
pub mod common;
pub mod catalog;
pub mod storage;
pub mod wal;
pub mod transaction;
pub mod concurrency;
pub mod index;
pub mod sql;
pub mod execution;
pub mod session;
pub mod cli;

use std::fs;
use std::path;

use tracing_subscriber::prelude::*;

pub fn init_log() {
    let log_dir = path::Path::new(config::LOG_PATH).parent().unwrap();
    let log_filename = path::Path::new(config::LOG_PATH)
        .file_name()
        .unwrap()
        .to_str()
        .unwrap();
    fs::create_dir_all(log_dir).unwrap();

    let stderr_log = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(false);

    let file_appender = tracing_appender::rolling::daily(log_dir, log_filename);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    Box::leak(Box::new(guard));

    let file_log = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_thread_names(true);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(format!("minidb={}", config::LOG_LEVEL))
        }))
        .with(stderr_log.with_filter(tracing_subscriber::filter::LevelFilter::WARN))
        .with(file_log)
        .init();
}
