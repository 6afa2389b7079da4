//! Logging initialisation for the CPI.
//!
//! Logs always go to stderr (filtered by `RUST_LOG`, default `info`);
//! stdout carries the JSON response and nothing else. When `CPI_LOG_FILE`
//! names a file, the same events are appended to it as well.
//!
//! Returns a guard that must be kept alive for the duration of the process
//! so that buffered log lines are flushed on exit.

use std::path::Path;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialise the global tracing subscriber.
///
/// Call once from `main`, store the returned `LogGuard` in a local variable
/// for the duration of the process.
pub fn init() -> LogGuard {
    let log_file = std::env::var("CPI_LOG_FILE").ok().filter(|p| !p.is_empty());

    let file_guard = if let Some(path) = log_file {
        let path = Path::new(&path);
        let dir = path
            .parent()
            .filter(|d| !d.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let name = path.file_name().unwrap_or_else(|| "cpi.log".as_ref());
        let _ = std::fs::create_dir_all(dir);
        let file_appender = tracing_appender::rolling::never(dir, name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

        tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().with_writer(std::io::stderr).with_ansi(false))
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().with_writer(std::io::stderr).with_ansi(false))
            .init();

        None
    };

    LogGuard { _file_guard: file_guard }
}
