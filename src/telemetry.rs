//! Logging setup for the binary.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Console logging plus a daily rolling file when `HARVEST_LOG_DIR` is set and
/// writable. `RUST_LOG` overrides the configured level.
///
/// Keep the returned guard alive for as long as file logs should be flushed.
pub fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,harvest={}", config.level)));

    let mut guard = None;
    let file_layer = std::env::var("HARVEST_LOG_DIR")
        .ok()
        .and_then(|dir| match writable_dir(&dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(&dir, "harvest.log");
                let (writer, worker) = tracing_appender::non_blocking(appender);
                guard = Some(worker);
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!("Warning: log directory {dir} unusable ({e}), file logging disabled");
                None
            }
        });

    let json_layer = config
        .json
        .then(|| tracing_subscriber::fmt::layer().json().with_target(true));
    let text_layer = (!config.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .try_init();

    guard
}

// rolling::daily panics when it cannot create its first file
fn writable_dir(dir: &str) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let marker = Path::new(dir).join(".harvest_write_test");
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&marker)?;
    std::fs::remove_file(&marker)
}
