//! Global `tracing` subscriber from the `log` config section.

use std::str::FromStr;

use keel_core::{Config, ConfigError};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Logfmt,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "logfmt" | "text" => Ok(Self::Logfmt),
            other => Err(ConfigError::Invalid(format!("log.format: unknown format {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// `debug`, `info`, `warn`, `error` or `none`.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Logfmt,
        }
    }
}

impl LogConfig {
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an unknown level or format.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let level = config
            .string("log.level")
            .unwrap_or_else(|| "info".to_string())
            .to_ascii_lowercase();
        if !matches!(level.as_str(), "debug" | "info" | "warn" | "error" | "none") {
            return Err(ConfigError::Invalid(format!("log.level: unknown level {level:?}")));
        }
        let format = match config.string("log.format") {
            Some(raw) => raw.parse()?,
            None => LogFormat::Logfmt,
        };
        Ok(Self { level, format })
    }

    /// `RUST_LOG` wins over the configured level when set.
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level))
    }
}

/// Installs the global subscriber. Later calls, and `level = none`, do
/// nothing.
pub fn init(config: &LogConfig) {
    if config.level == "none" {
        return;
    }
    let registry = tracing_subscriber::registry().with(config.filter());
    let _ = match config.format {
        LogFormat::Json => registry.with(fmt::layer().json().with_current_span(true)).try_init(),
        LogFormat::Logfmt => registry.with(fmt::layer().compact().with_target(false)).try_init(),
    };
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn defaults_to_info_logfmt() {
        let config = LogConfig::from_config(&Config::from_value(json!({}))).unwrap();
        assert_eq!(config, LogConfig::default());
    }

    #[test]
    fn reads_level_and_format() {
        let config = LogConfig::from_config(&Config::from_value(json!({"log": {"level": "WARN", "format": "json"}}))).unwrap();
        assert_eq!(config.level, "warn");
        assert_eq!(config.format, LogFormat::Json);
    }

    #[test]
    fn rejects_unknown_values() {
        assert!(LogConfig::from_config(&Config::from_value(json!({"log": {"level": "loud"}}))).is_err());
        assert!(LogConfig::from_config(&Config::from_value(json!({"log": {"format": "xml"}}))).is_err());
    }

    #[test]
    fn init_twice_is_harmless() {
        let config = LogConfig {
            level: "none".to_string(),
            format: LogFormat::Logfmt,
        };
        init(&config);
        init(&LogConfig::default());
        init(&LogConfig::default());
    }
}
