// SPDX-License-Identifier: Apache-2.0

//! Structured logging setup. See [`init_tracing`] and [`LogConfig`].
//!
//! Hot-path code (ring back-off, per-cycle event counts) logs at `trace`/`debug` only,
//! and the handful of call sites in genuinely hot loops are gated behind
//! `tracing::enabled!` so a release build doesn't pay formatting cost per fiber switch.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Where (if anywhere) rolling log files are written, and the default level used when
/// `RUST_LOG` is unset.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Default filter applied when the `RUST_LOG` environment variable is absent.
    pub default_level: LogLevel,
    /// When set, logs are additionally written to a daily-rolling file in this
    /// directory, named after `log_file_prefix`.
    pub log_dir: Option<PathBuf>,
    pub log_file_prefix: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Holds the non-blocking writer's background flush thread alive. Drop it only at
/// process shutdown; dropping it early silently stops file logging.
#[must_use = "dropping the guard stops log flushing"]
pub struct TracingGuard {
    _file_guard: Option<WorkerGuard>,
}

#[derive(Debug, thiserror::Error)]
pub enum LogInitError {
    #[error("a tracing subscriber is already installed for this process")]
    AlreadyInitialized,
}

/// Installs a global `tracing` subscriber: an `EnvFilter` seeded from `RUST_LOG` (or
/// `config.default_level` when unset) plus a formatted stdout layer, and an optional
/// daily-rolling file layer when `config.log_dir` is set.
///
/// Returns a guard that must be kept alive for the lifetime of the process; dropping it
/// flushes and stops the non-blocking file writer.
pub fn init_tracing(config: &LogConfig) -> Result<TracingGuard, LogInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_level.as_str()));

    let stdout_layer = fmt::layer().with_target(true).with_thread_names(true);

    let (file_layer, file_guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, &config.log_file_prefix);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer);

    registry
        .try_init()
        .map_err(|_| LogInitError::AlreadyInitialized)?;

    Ok(TracingGuard {
        _file_guard: file_guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_level_is_info() {
        assert!(matches!(LogLevel::default(), LogLevel::Info));
    }

    #[test]
    fn level_strings_match_tracing_filter_names() {
        assert_eq!(LogLevel::Error.as_str(), "error");
        assert_eq!(LogLevel::Trace.as_str(), "trace");
    }
}
