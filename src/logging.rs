//! Logging setup
//!
//! Installs a `tracing` subscriber with an [`EnvFilter`] and a console fmt
//! layer. When a log directory is configured, a second layer writes plain
//! text to a daily-rolling file through a non-blocking writer; the returned
//! [`WorkerGuard`] must be held until exit so buffered lines are flushed.

use crate::config::LoggingConfig;
use crate::error::{Result, ResultExt, TelemetryError};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// File name prefix for rolling log files
pub const LOG_FILE_PREFIX: &str = "telemetry-bus.log";

/// Build the level filter: `RUST_LOG` wins over the configured directives
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.filter)
        .map_err(|e| TelemetryError::Config(format!("Invalid log filter '{}': {}", config.filter, e)))
}

/// Install the global subscriber
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = build_filter(config)?;

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {:?}", dir))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .try_init()
        .map_err(|e| TelemetryError::Config(format!("Failed to install logger: {}", e)))?;

    if let Some(dir) = &config.log_dir {
        tracing::info!("Writing logs to {:?}", dir);
    }

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_filter_rejects_garbage() {
        // Skip when the environment overrides the configured filter
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }

        let good = LoggingConfig {
            filter: "info,telemetry_bus=debug".to_string(),
            log_dir: None,
        };
        assert!(build_filter(&good).is_ok());

        let bad = LoggingConfig {
            filter: "telemetry_bus=notalevel".to_string(),
            log_dir: None,
        };
        assert!(matches!(build_filter(&bad), Err(TelemetryError::Config(_))));
    }
}
