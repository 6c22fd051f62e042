//! Shared observability configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per line.
    Json,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// `EnvFilter` directives used when `RUST_LOG` is unset.
    pub default_filter: String,
    /// Log line format.
    pub log_format: LogFormat,
}

#[derive(Debug, Error)]
pub enum ObservabilityError {
    #[error("Invalid LOG_FORMAT '{0}': expected 'text' or 'json'")]
    InvalidLogFormat(String),

    #[error("Failed to install tracing subscriber: {0}")]
    Install(String),
}

impl ObservabilityConfig {
    /// Read `LOG_FORMAT` from the given variables.
    ///
    /// # Errors
    ///
    /// Returns `InvalidLogFormat` for anything other than `text` or `json`.
    pub fn from_vars(
        vars: &HashMap<String, String>,
        default_filter: &str,
    ) -> Result<Self, ObservabilityError> {
        let log_format = match vars.get("LOG_FORMAT").map(|v| v.trim().to_ascii_lowercase()) {
            None => LogFormat::Text,
            Some(v) if v == "text" => LogFormat::Text,
            Some(v) if v == "json" => LogFormat::Json,
            Some(v) => return Err(ObservabilityError::InvalidLogFormat(v)),
        };

        Ok(Self {
            default_filter: default_filter.to_string(),
            log_format,
        })
    }

    /// Install the global tracing subscriber.
    ///
    /// `RUST_LOG` takes precedence over `default_filter`.
    ///
    /// # Errors
    ///
    /// Returns `Install` if a global subscriber is already set.
    pub fn init_tracing(&self) -> Result<(), ObservabilityError> {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.default_filter));

        let registry = tracing_subscriber::registry().with(filter);
        let result = match self.log_format {
            LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).try_init(),
            LogFormat::Json => registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init(),
        };
        result.map_err(|e| ObservabilityError::Install(e.to_string()))
    }
}
