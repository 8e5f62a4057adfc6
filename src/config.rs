//! certflow Configuration Management
//!
//! Central configuration for the lifecycle core: retry budgets, batch and
//! collaborator concurrency bounds, expiry scanning, orphaned-key retention,
//! storage locations and logging.

use std::time::Duration;
use serde::{Serialize, Deserialize};
use anyhow::{Result as AnyResult, anyhow};

use crate::errors::{ConfigError, Result};

/// Main certflow configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CertFlowConfig {
    /// Collaborator retry configuration
    pub retry: RetryConfig,
    /// Batch fan-out configuration
    pub batch: BatchConfig,
    /// Expiry scanner configuration
    pub scanner: ScannerConfig,
    /// Orphaned key retention
    pub keys: KeyRetentionConfig,
    /// Durable storage locations
    pub storage: StorageConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per step, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub cap_delay: Duration,
    /// Random spread applied to each delay, as a fraction
    pub jitter: f64,
    /// Bound on every single collaborator call
    pub call_timeout: Duration,
    /// Resumes allowed before a parked workflow is aborted
    pub max_resume_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(200),
            cap_delay: Duration::from_secs(10),
            jitter: 0.2,
            call_timeout: Duration::from_secs(30),
            max_resume_attempts: 3,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Concurrent calls allowed against any single collaborator
    pub max_in_flight_per_collaborator: usize,
    /// Workflows a batch runs at once
    pub max_concurrent_workflows: usize,
    pub max_batch_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_in_flight_per_collaborator: 8,
            max_concurrent_workflows: 32,
            max_batch_size: 1000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScannerConfig {
    pub interval: Duration,
    /// Used when the policy in effect does not set a renewal threshold
    pub default_threshold_days: u32,
    /// Role renewal requests are submitted under
    pub requester_role: String,
    /// Move already-expired active certificates to `expired`
    pub mark_expired: bool,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            default_threshold_days: 30,
            requester_role: "automation".to_string(),
            mark_expired: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyRetentionConfig {
    /// Age after which keys of aborted or cancelled workflows are destroyed
    pub orphan_retention: Duration,
}

impl Default for KeyRetentionConfig {
    fn default() -> Self {
        Self {
            orphan_retention: Duration::from_secs(24 * 3600),
        }
    }
}

/// Storage locations; `None` keeps the corresponding store in memory
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub workflow_dir: Option<String>,
    pub audit_log_path: Option<String>,
    /// Policy document published at startup instead of the built-in baseline
    pub policy_path: Option<String>,
}

impl StorageConfig {
    pub fn production() -> Self {
        Self {
            workflow_dir: Some("/var/lib/certflow/workflows".to_string()),
            audit_log_path: Some("/var/lib/certflow/audit.jsonl".to_string()),
            policy_path: Some("/etc/certflow/policy.yaml".to_string()),
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: LogLevel,
    /// Log format
    pub format: LogFormat,
    /// Log output
    pub output: LogOutput,
    /// Include the emitting module in each line
    pub with_target: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    #[serde(rename = "trace")]
    Trace,
    #[serde(rename = "debug")]
    Debug,
    #[serde(rename = "info")]
    Info,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFormat {
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "pretty")]
    Pretty,
    #[serde(rename = "compact")]
    Compact,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LogOutput {
    #[serde(rename = "stdout")]
    Stdout,
    #[serde(rename = "stderr")]
    Stderr,
    #[serde(rename = "file")]
    File { path: String },
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Pretty,
            output: LogOutput::Stdout,
            with_target: false,
        }
    }
}

impl CertFlowConfig {
    /// Configuration for local development and tests
    pub fn localhost_testing() -> Self {
        Self::default()
    }

    /// Configuration for production deployment
    pub fn production() -> Self {
        Self {
            retry: RetryConfig {
                max_attempts: 5,
                base_delay: Duration::from_millis(500),
                cap_delay: Duration::from_secs(30),
                jitter: 0.2,
                call_timeout: Duration::from_secs(30),
                max_resume_attempts: 5,
            },
            batch: BatchConfig::default(),
            scanner: ScannerConfig::default(),
            keys: KeyRetentionConfig::default(),
            storage: StorageConfig::production(),
            logging: LoggingConfig {
                level: LogLevel::Info,
                format: LogFormat::Json,
                output: LogOutput::File {
                    path: "/var/log/certflow/certflow.log".to_string(),
                },
                with_target: true,
            },
        }
    }

    /// Load configuration from file
    pub fn from_file(path: &str) -> AnyResult<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        if path.ends_with(".toml") {
            toml::from_str(&contents)
                .map_err(|e| anyhow!("Failed to parse TOML config: {}", e))
        } else if path.ends_with(".yaml") || path.ends_with(".yml") {
            serde_yaml::from_str(&contents)
                .map_err(|e| anyhow!("Failed to parse YAML config: {}", e))
        } else if path.ends_with(".json") {
            serde_json::from_str(&contents)
                .map_err(|e| anyhow!("Failed to parse JSON config: {}", e))
        } else {
            Err(anyhow!("Unsupported config file format: {}", path))
        }
    }

    /// Save configuration to file
    pub fn to_file(&self, path: &str) -> AnyResult<()> {
        let contents = if path.ends_with(".toml") {
            toml::to_string_pretty(self)
                .map_err(|e| anyhow!("Failed to serialize config to TOML: {}", e))?
        } else if path.ends_with(".yaml") || path.ends_with(".yml") {
            serde_yaml::to_string(self)
                .map_err(|e| anyhow!("Failed to serialize config to YAML: {}", e))?
        } else if path.ends_with(".json") {
            serde_json::to_string_pretty(self)
                .map_err(|e| anyhow!("Failed to serialize config to JSON: {}", e))?
        } else {
            return Err(anyhow!("Unsupported config file format: {}", path));
        };

        std::fs::write(path, contents)
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, reason: &str| -> Result<()> {
            Err(ConfigError::ValidationFailed {
                field: field.to_string(),
                reason: reason.to_string(),
            }
            .into())
        };

        let retry = &self.retry;
        if retry.max_attempts == 0 {
            return invalid("retry.max_attempts", "must be at least 1");
        }
        if retry.cap_delay < retry.base_delay {
            return invalid("retry.cap_delay", "must not be shorter than base_delay");
        }
        if !(0.0..=1.0).contains(&retry.jitter) {
            return invalid("retry.jitter", "must be within [0, 1]");
        }
        if retry.call_timeout.is_zero() {
            return invalid("retry.call_timeout", "must be positive");
        }

        if self.batch.max_in_flight_per_collaborator == 0 {
            return invalid("batch.max_in_flight_per_collaborator", "must be at least 1");
        }
        if self.batch.max_concurrent_workflows == 0 {
            return invalid("batch.max_concurrent_workflows", "must be at least 1");
        }
        if self.batch.max_batch_size == 0 {
            return invalid("batch.max_batch_size", "must be at least 1");
        }

        if self.scanner.default_threshold_days == 0 {
            return invalid("scanner.default_threshold_days", "must be at least 1");
        }
        if self.scanner.interval.is_zero() {
            return invalid("scanner.interval", "must be positive");
        }
        if self.scanner.requester_role.trim().is_empty() {
            return invalid("scanner.requester_role", "must not be empty");
        }

        Ok(())
    }
}
