//! `tracing` subscriber setup.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::{fmt as tfmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoggingError {
    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("global subscriber already installed")]
    AlreadyInitialized,
}

impl FromStr for LogLevel {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(LoggingError::InvalidLevel(s.to_string())),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Include the module path of each event.
    pub target: bool,
    pub file_line: bool,
    pub json: bool,
    /// Extra `EnvFilter` directives, e.g. `savannah_snow::bootstrap=trace`.
    pub directives: Vec<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            target: true,
            file_line: false,
            json: false,
            directives: Vec::new(),
        }
    }
}

impl LogConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    #[must_use]
    pub fn with_json(mut self, enabled: bool) -> Self {
        self.json = enabled;
        self
    }

    #[must_use]
    pub fn with_file_line(mut self, enabled: bool) -> Self {
        self.file_line = enabled;
        self
    }

    #[must_use]
    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    fn filter(&self) -> EnvFilter {
        let mut filter = EnvFilter::new(self.level.to_string());
        for directive in &self.directives {
            match directive.parse() {
                Ok(d) => filter = filter.add_directive(d),
                Err(err) => eprintln!("ignoring log directive {directive:?}: {err}"),
            }
        }
        filter
    }
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn try_init(config: &LogConfig) -> Result<(), LoggingError> {
    let registry = tracing_subscriber::registry().with(config.filter());
    let result = if config.json {
        registry
            .with(
                tfmt::layer()
                    .json()
                    .with_target(config.target)
                    .with_file(config.file_line)
                    .with_line_number(config.file_line),
            )
            .try_init()
    } else {
        registry
            .with(
                tfmt::layer()
                    .with_target(config.target)
                    .with_file(config.file_line)
                    .with_line_number(config.file_line),
            )
            .try_init()
    };
    result.map_err(|_| LoggingError::AlreadyInitialized)
}

/// Installs the global subscriber, ignoring an existing one. Handy in tests.
pub fn init(config: &LogConfig) {
    let _ = try_init(config);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parse() {
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("trace".parse::<LogLevel>().unwrap(), LogLevel::Trace);
        assert_eq!(
            "loud".parse::<LogLevel>(),
            Err(LoggingError::InvalidLevel("loud".to_string()))
        );
    }

    #[test]
    fn test_level_display_roundtrip() {
        for level in [
            LogLevel::Trace,
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warn,
            LogLevel::Error,
        ] {
            assert_eq!(level.to_string().parse::<LogLevel>().unwrap(), level);
        }
    }

    #[test]
    fn test_builder() {
        let config = LogConfig::new()
            .with_level(LogLevel::Debug)
            .with_json(true)
            .with_directive("savannah_snow=trace");
        assert_eq!(config.level, LogLevel::Debug);
        assert!(config.json);
        assert_eq!(config.directives.len(), 1);
    }

    #[test]
    fn test_second_init_reports_error() {
        init(&LogConfig::default());
        assert_eq!(
            try_init(&LogConfig::default()),
            Err(LoggingError::AlreadyInitialized)
        );
    }
}
