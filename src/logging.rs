//! Logging Setup
//!
//! Installs the global `tracing` subscriber from [`LoggingConfig`]. `RUST_LOG`
//! takes precedence over the configured level.

use std::fs::OpenOptions;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LogOutput, LoggingConfig};
use crate::errors::{ConfigError, Result};

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Install the global subscriber. Later calls are no-ops.
pub fn init(config: &LoggingConfig) -> Result<()> {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    let result = match &config.output {
        LogOutput::Stdout => install(config, std::io::stdout),
        LogOutput::Stderr => install(config, std::io::stderr),
        LogOutput::File { path } => {
            let file = OpenOptions::new().create(true).append(true).open(path).map_err(|e| {
                INITIALIZED.store(false, Ordering::SeqCst);
                ConfigError::ValidationFailed {
                    field: "logging.output".to_string(),
                    reason: format!("cannot open log file {}: {}", path, e),
                }
            })?;
            install(config, Mutex::new(file))
        }
    };

    if result.is_ok() {
        tracing::debug!("Logging initialized at level {}", config.level.as_str());
    }
    result
}

fn filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.as_str()))
}

fn install<W>(config: &LoggingConfig, writer: W) -> Result<()>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter(config))
        .with_target(config.with_target)
        .with_writer(writer);

    // Another subscriber already installed (e.g. by the host binary) is left in place
    let _ = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig::default();
        assert!(init(&config).is_ok());
        assert!(init(&config).is_ok());
        tracing::info!("logging test line");
    }
}
