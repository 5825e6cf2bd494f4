//! Process-level runtime setup shared by the heapctl binaries.
//!
//! Logging goes to stdout through `tracing-subscriber`. When `LOG_DIR` is set,
//! the same events are also written to a daily-rolling file through a
//! non-blocking `tracing-appender` writer.

use std::{env, path::PathBuf};

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info";

/// Where and how verbosely to log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is not set.
    pub default_filter: String,
    /// Directory for rolling log files; stdout only when `None`.
    pub log_dir: Option<PathBuf>,
    /// File name prefix of the rolling log files.
    pub file_prefix: String,
}

impl LoggingConfig {
    /// Reads `LOG_DIR` and `LOG_LEVEL` from the process environment.
    pub fn from_env(file_prefix: &str) -> Self {
        Self::from_lookup(file_prefix, |key| env::var(key).ok())
    }

    /// Same as [`LoggingConfig::from_env`] with an explicit variable lookup.
    pub fn from_lookup<F>(file_prefix: &str, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let default_filter = lookup("LOG_LEVEL")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_FILTER.to_string());
        let log_dir = lookup("LOG_DIR")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);

        Self {
            default_filter,
            log_dir,
            file_prefix: file_prefix.to_string(),
        }
    }
}

/// Keeps the background file writer alive; dropping it flushes pending lines.
#[must_use = "dropping the guard stops the file writer"]
pub struct LoggingGuard {
    _file_writer: Option<WorkerGuard>,
}

/// Installs the global tracing subscriber.
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));
    let stdout_layer = fmt::layer().with_target(true);

    let Some(log_dir) = config.log_dir.as_ref() else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .try_init()
            .context("failed to install tracing subscriber")?;
        return Ok(LoggingGuard {
            _file_writer: None,
        });
    };

    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;
    let appender = tracing_appender::rolling::daily(log_dir, &config.file_prefix);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = fmt::layer().with_ansi(false).with_writer(writer);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(LoggingGuard {
        _file_writer: Some(guard),
    })
}
