//! Tracing subscriber setup.
//!
//! Logs go to stderr through `tracing-subscriber`'s fmt layer. When a log
//! directory is configured a daily rolling file is written as well; the
//! returned [`WorkerGuard`] must be kept alive until shutdown so buffered
//! lines are flushed.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

/// Prefix of the rolling log file names.
const LOG_FILE_PREFIX: &str = "adbshell.log";

/// Builds the filter: `RUST_LOG` wins when set, the configured level otherwise.
pub fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_lowercase()))
}

/// Installs the global tracing subscriber.
///
/// Returns the file writer guard when file logging is enabled.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = build_filter(&config.level);
    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    match &config.directory {
        Some(directory) => {
            std::fs::create_dir_all(directory).with_context(|| {
                format!("Failed to create log directory: {}", directory.display())
            })?;
            let appender = tracing_appender::rolling::daily(directory, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .try_init()
                .context("Failed to install tracing subscriber")?;

            tracing::debug!("Logging to {:?}", directory);
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .try_init()
                .context("Failed to install tracing subscriber")?;
            Ok(None)
        }
    }
}
