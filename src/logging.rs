use std::path::PathBuf;

use anyhow::{Context, Result};
use time::macros::format_description;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, Layer};

use crate::config::LogConfig;

/// Keeps the file writer thread alive; drop it last
pub struct LogGuard {
    _guard: WorkerGuard,
}

/// Install the global subscriber.
///
/// Console output goes to stderr because stdout belongs to the host
/// protocol. Returns a guard when file logging is on and its directory is
/// usable. Only a second initialization is an error.
pub fn init(config: &LogConfig) -> Result<Option<LogGuard>> {
    // RUST_LOG takes precedence over the configured level
    let filter = || {
        EnvFilter::builder()
            .with_default_directive(config.parse_level().into())
            .from_env_lossy()
    };
    let timer = || UtcTime::new(format_description!("[hour]:[minute]:[second].[subsecond digits:3]"));

    let console_layer = config.console_output.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_timer(timer())
            .with_filter(filter())
    });

    // A log directory we cannot create costs the file layer, never the process
    let mut file_failure = None;
    let (file_layer, guard) = match config.file_output.then(|| open_log_directory(config)) {
        Some(Ok(directory)) => {
            let appender = tracing_appender::rolling::daily(&directory, "radioscope.log");
            let (writer, worker_guard) = tracing_appender::non_blocking(appender);

            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_timer(timer())
                .with_filter(filter());

            (Some(layer), Some(LogGuard { _guard: worker_guard }))
        }
        Some(Err(e)) => {
            file_failure = Some(e);
            (None, None)
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Logging already initialized")?;

    tracing::info!("[Main] Logging at level {}", config.parse_level());
    if guard.is_some() {
        tracing::info!("[Main] Log files in {}", config.log_directory().display());
    }
    if let Some(e) = file_failure {
        tracing::warn!("[Main] File logging disabled, console only: {:#}", e);
    }

    Ok(guard)
}

fn open_log_directory(config: &LogConfig) -> Result<PathBuf> {
    let directory = config.log_directory();
    std::fs::create_dir_all(&directory)
        .with_context(|| format!("Failed to create log directory {}", directory.display()))?;
    Ok(directory)
}

// === Tests ====
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unusable_log_directory_falls_back_to_console() {
        // A directory nested under a plain file can never be created
        let blocker = std::env::temp_dir().join(format!("radioscope-log-blocker-{}", std::process::id()));
        std::fs::write(&blocker, b"").unwrap();

        let config = LogConfig {
            console_output: false,
            file_output: true,
            directory: Some(blocker.join("logs")),
            ..LogConfig::default()
        };

        let guard = init(&config).unwrap();
        assert!(guard.is_none());

        let _ = std::fs::remove_file(&blocker);
    }
}
