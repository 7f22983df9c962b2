//! Tracing setup: compact stdout output plus a daily-rolling file under
//! the gamepipe logs directory, with old files swept on startup.

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt::time::ChronoUtc, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// Keep the non-blocking writer alive for the process lifetime.
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

const LOG_FILE_PREFIX: &str = "gamepipe";
const RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Initializes tracing and returns the log directory. `level` overrides
/// `RUST_LOG`; without either, the gateway logs at info while the HTTP
/// stack stays at warn.
pub fn setup_tracing(level: Option<&str>) -> Result<PathBuf> {
    let log_dir = crate::paths::logs_dir();
    std::fs::create_dir_all(&log_dir)?;
    sweep_old_logs(&log_dir);

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    LOG_GUARD
        .set(guard)
        .map_err(|_| anyhow!("logging already initialized"))?;

    // Second precision keeps lines short; sub-second detail is rarely
    // useful in a gateway log.
    let timer = ChronoUtc::new("%Y-%m-%dT%H:%M:%S".to_string());
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .compact()
        .with_timer(timer.clone());
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .compact()
        .with_timer(timer);

    let filter = match level {
        Some(level) => directive_filter(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| directive_filter("info")),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init();

    Ok(log_dir)
}

fn directive_filter(level: &str) -> EnvFilter {
    EnvFilter::new(format!(
        "gamepipe={level},axum=warn,tower_http=warn,hyper=warn,hyper_util=warn,\
         reqwest=warn,tungstenite=warn,mio=warn"
    ))
}

/// Removes gamepipe log files older than the retention window. Errors
/// are not worth failing startup over; skip and move on.
fn sweep_old_logs(log_dir: &Path) {
    let Ok(entries) = std::fs::read_dir(log_dir) else {
        return;
    };
    let now = SystemTime::now();
    for entry in entries.flatten() {
        let path = entry.path();
        let is_log = path.is_file()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(LOG_FILE_PREFIX));
        if !is_log {
            continue;
        }
        let expired = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .is_some_and(|age| age >= RETENTION);
        if expired {
            if let Err(e) = std::fs::remove_file(&path) {
                eprintln!("failed to remove old log file {}: {e}", path.display());
            }
        }
    }
}
