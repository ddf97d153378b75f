//! Tracing initialization: stderr layer plus an optional daily-rolling file.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;

const LOG_FILE_PREFIX: &str = "cligate.log";

static TRACING_GUARD: OnceLock<Mutex<Option<WorkerGuard>>> = OnceLock::new();
static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Idempotent. With `log_dir` set, logs also go to a daily-rolling file in
/// that directory through a non-blocking writer.
pub fn init(log_dir: Option<&Path>) {
    TRACING_INIT.get_or_init(|| {
        if let Err(err) = init_impl(log_dir) {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(default_env_filter())
                .with_target(false)
                .try_init();
            eprintln!("tracing init failed: {err}");
        }
    });
}

fn init_impl(log_dir: Option<&Path>) -> Result<(), String> {
    let env_filter = default_env_filter();

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let file_layer = match log_dir {
        Some(dir) => {
            let dir = ensure_log_dir(dir)?;
            let file_appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            TRACING_GUARD
                .get_or_init(|| Mutex::new(None))
                .lock()
                .map_err(|_| "logging guard mutex poisoned".to_string())?
                .replace(guard);

            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_target(false)
                    .with_file(true)
                    .with_line_number(true),
            )
        }
        None => None,
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer);

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("failed to set global tracing subscriber: {e}"))?;

    // Bridge `log` records from dependencies; skip silently if a logger is
    // already installed.
    let _ = tracing_log::LogTracer::init();

    Ok(())
}

fn default_env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,cligate=debug"))
}

fn ensure_log_dir(dir: &Path) -> Result<PathBuf, String> {
    std::fs::create_dir_all(dir)
        .map_err(|e| format!("failed to create log dir {}: {e}", dir.display()))?;
    Ok(dir.to_path_buf())
}
