//! Logging initialisation
//!
//! Installs a global `tracing` subscriber from [`LogConfig`]. Text output is
//! meant for terminals, JSON for log shippers.

use serde::{Deserialize, Serialize};
use std::io::IsTerminal;
use std::str::FromStr;
use tracing::Subscriber;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logger errors
#[derive(Debug, thiserror::Error)]
pub enum LoggerError {
    #[error("invalid logger format: {0} (expected: text|json)")]
    InvalidFormat(String),
    #[error("logger has already been initialized")]
    AlreadyInitialized,
    #[error("failed to initialize logger: {0}")]
    InitializationFailed(String),
    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),
}

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = LoggerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(LoggerError::InvalidFormat(s.to_string())),
        }
    }
}

/// Logging section of the orchestrator config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
    /// `EnvFilter` directive, e.g. `info` or `assay_kernel=debug,info`
    pub level: String,
    pub with_targets: bool,
    /// Colour text output; `None` detects a terminal on stdout
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_color: Option<bool>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            level: "info".to_string(),
            with_targets: true,
            use_color: None,
        }
    }
}

impl LogConfig {
    /// Check the level directive parses
    pub fn validate(&self) -> Result<(), LoggerError> {
        mk_filter(&self.level).map(|_| ())
    }
}

/// Global subscriber installer
#[derive(Debug, Clone, Copy)]
pub struct Logger;

impl Logger {
    /// Install a subscriber for `cfg`
    ///
    /// # Errors
    /// `InvalidLogLevel` for a bad directive, `AlreadyInitialized` when a
    /// global subscriber is already set.
    pub fn init(cfg: &LogConfig) -> Result<(), LoggerError> {
        match cfg.format {
            LogFormat::Text => Self::text(cfg),
            LogFormat::Json => Self::json(cfg),
        }
    }

    fn text(cfg: &LogConfig) -> Result<(), LoggerError> {
        let filter = mk_filter(&cfg.level)?;
        let use_color = cfg
            .use_color
            .unwrap_or_else(|| std::io::stdout().is_terminal());
        let fmt_layer = fmt::layer()
            .with_ansi(use_color)
            .with_target(cfg.with_targets);

        init_with(tracing_subscriber::registry().with(filter).with(fmt_layer))
    }

    fn json(cfg: &LogConfig) -> Result<(), LoggerError> {
        let filter = mk_filter(&cfg.level)?;
        let fmt_layer = fmt::layer()
            .json()
            .with_ansi(false)
            .with_target(cfg.with_targets);

        init_with(tracing_subscriber::registry().with(filter).with(fmt_layer))
    }
}

fn mk_filter(level: &str) -> Result<EnvFilter, LoggerError> {
    EnvFilter::try_new(level).map_err(|_| LoggerError::InvalidLogLevel(level.to_string()))
}

fn init_with<S>(subscriber: S) -> Result<(), LoggerError>
where
    S: Subscriber + Send + Sync + 'static,
{
    subscriber.try_init().map_err(|e| {
        let message = e.to_string();
        if message.contains("SetGlobalDefaultError") || message.contains("global default") {
            LoggerError::AlreadyInitialized
        } else {
            LoggerError::InitializationFailed(message)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parsing() {
        assert_eq!(" JSON ".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!(matches!(
            "journald".parse::<LogFormat>(),
            Err(LoggerError::InvalidFormat(_))
        ));
    }

    #[test]
    fn level_validation() {
        assert!(LogConfig::default().validate().is_ok());
        let cfg = LogConfig {
            level: "assay_kernel=debug,info".into(),
            ..LogConfig::default()
        };
        assert!(cfg.validate().is_ok());
        let cfg = LogConfig {
            level: "assay_kernel=loud".into(),
            ..LogConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(LoggerError::InvalidLogLevel(_))));
    }

    #[test]
    fn second_init_is_rejected() {
        let cfg = LogConfig {
            level: "warn".into(),
            use_color: Some(false),
            ..LogConfig::default()
        };
        // Another test binary thread may have installed one first
        let _ = Logger::init(&cfg);
        assert!(Logger::init(&cfg).is_err());
    }
}
