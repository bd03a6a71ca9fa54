//! Logging configuration and initialization.
//!
//! JSON for production, pretty output for local runs. Settings come from
//! `CLOUDCTL_LOG_FORMAT`, `CLOUDCTL_LOG_LEVEL` and `CLOUDCTL_LOG_FILE`.

use std::path::PathBuf;
use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl LogFormat {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" | "text" => Some(Self::Pretty),
            _ => None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Filter directive, e.g. `info` or `cloudctl_core::pool=debug`.
    pub level: String,
    /// Log file. Stderr when `None`.
    pub output_path: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            level: "info".to_string(),
            output_path: None,
        }
    }
}

impl LogConfig {
    /// Build from `CLOUDCTL_LOG_*` variables, keeping defaults for unset or
    /// unparseable values.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(format) = std::env::var("CLOUDCTL_LOG_FORMAT")
            .ok()
            .and_then(|v| LogFormat::parse(&v))
        {
            config.format = format;
        }
        if let Ok(level) = std::env::var("CLOUDCTL_LOG_LEVEL") {
            if !level.trim().is_empty() {
                config.level = level;
            }
        }
        config.output_path = std::env::var("CLOUDCTL_LOG_FILE")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        config
    }
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("Invalid log filter: {0}")]
    InvalidFilter(String),
    #[error("Failed to open log file: {0}")]
    FileOpen(String),
    #[error("Subscriber already initialized")]
    AlreadyInitialized,
}

/// Install the global tracing subscriber. Call once at startup.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    let filter =
        EnvFilter::try_new(&config.level).map_err(|e| LogError::InvalidFilter(e.to_string()))?;

    match (config.format, &config.output_path) {
        (LogFormat::Json, Some(path)) => {
            let file =
                std::fs::File::create(path).map_err(|e| LogError::FileOpen(e.to_string()))?;
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::sync::Mutex::new(file)))
                .try_init()
                .map_err(|_| LogError::AlreadyInitialized)
        }
        (LogFormat::Json, None) => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
            .map_err(|_| LogError::AlreadyInitialized),
        (LogFormat::Pretty, _) => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().pretty().with_writer(std::io::stderr))
            .try_init()
            .map_err(|_| LogError::AlreadyInitialized),
    }
}
