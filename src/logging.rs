//! Structured logging setup for embedding applications.
//!
//! Library code only emits `tracing` events; this module is the optional
//! one-call subscriber setup for binaries that do not bring their own:
//! console output plus a rolling daily file when a log directory is given.

use std::path::Path;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize console + rolling-file logging.
///
/// Returns the appender guard; hold it for the process lifetime, since
/// dropping it flushes and stops the background writer. Returns `None` when a global
/// subscriber is already installed or no file layer was requested.
pub fn init_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,till_sync=debug"));

    let console_layer = fmt::layer().with_target(true);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).ok();
            let file_appender = tracing_appender::rolling::daily(dir, "till");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true);

            if tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .with(file_layer)
                .try_init()
                .is_err()
            {
                return None;
            }
            info!("logging initialized (console + {})", dir.display());
            Some(guard)
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .try_init();
            None
        }
    }
}
