//! Incoming authorization service configuration.
//!
//! Configuration is loaded from environment variables. Nothing in it is
//! secret, so the derived `Debug` output is safe to log.

use common::jwt::{DEFAULT_CLOCK_SKEW, MAX_CLOCK_SKEW};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default HTTP bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8090";

/// Default interval between declarative file polls.
pub const DEFAULT_CONFIG_POLL_INTERVAL_SECONDS: u64 = 10;

/// Default JWKS cache TTL (5 minutes).
pub const DEFAULT_JWKS_CACHE_TTL_SECONDS: u64 = 300;

/// Default age after which a provider's key set is considered stale (1 hour).
pub const DEFAULT_JWKS_MAX_STALENESS_SECONDS: u64 = 3600;

/// Default timeout for a single JWKS fetch.
pub const DEFAULT_JWKS_HTTP_TIMEOUT_SECONDS: u64 = 10;

/// Default node ID prefix.
pub const DEFAULT_NODE_ID_PREFIX: &str = "authz";

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Node the compiled snapshot is produced for.
    pub node_id: String,

    /// HTTP bind address (default: "0.0.0.0:8090").
    pub bind_address: String,

    /// Provider registry files, merged in order.
    pub providers_paths: Vec<PathBuf>,

    /// Incoming-permissions file for this node.
    pub policy_path: PathBuf,

    /// How often the declarative files are re-read.
    pub config_poll_interval: Duration,

    /// Key set refresh interval.
    pub jwks_cache_ttl: Duration,

    /// Key set age after which a provider is marked unhealthy.
    pub jwks_max_staleness: Duration,

    /// Timeout for one JWKS HTTP fetch.
    pub jwks_http_timeout: Duration,

    /// Leeway applied to `exp` and `nbf`.
    pub jwt_clock_skew: Duration,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid bind address: {0}")]
    InvalidBindAddress(String),

    #[error("Invalid duration configuration: {0}")]
    InvalidDuration(String),

    #[error("Invalid JWT clock skew configuration: {0}")]
    InvalidJwtClockSkew(String),

    #[error("Invalid JWKS staleness configuration: {0}")]
    InvalidStaleness(String),
}

impl Config {
    /// Load configuration from a map of environment variables.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let providers_paths: Vec<PathBuf> = vars
            .get("PROVIDERS_PATH")
            .ok_or_else(|| ConfigError::MissingEnvVar("PROVIDERS_PATH".to_string()))?
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .collect();
        if providers_paths.is_empty() {
            return Err(ConfigError::MissingEnvVar("PROVIDERS_PATH".to_string()));
        }

        let policy_path = vars
            .get("POLICY_PATH")
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| ConfigError::MissingEnvVar("POLICY_PATH".to_string()))?;

        let bind_address = vars
            .get("BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());
        bind_address.parse::<SocketAddr>().map_err(|e| {
            ConfigError::InvalidBindAddress(format!(
                "BIND_ADDRESS must be host:port, got '{bind_address}': {e}"
            ))
        })?;

        let config_poll_interval = positive_seconds(
            vars,
            "CONFIG_POLL_INTERVAL_SECONDS",
            DEFAULT_CONFIG_POLL_INTERVAL_SECONDS,
        )?;
        let jwks_cache_ttl =
            positive_seconds(vars, "JWKS_CACHE_TTL_SECONDS", DEFAULT_JWKS_CACHE_TTL_SECONDS)?;
        let jwks_max_staleness = positive_seconds(
            vars,
            "JWKS_MAX_STALENESS_SECONDS",
            DEFAULT_JWKS_MAX_STALENESS_SECONDS,
        )?;
        let jwks_http_timeout = positive_seconds(
            vars,
            "JWKS_HTTP_TIMEOUT_SECONDS",
            DEFAULT_JWKS_HTTP_TIMEOUT_SECONDS,
        )?;

        if jwks_max_staleness < jwks_cache_ttl {
            return Err(ConfigError::InvalidStaleness(format!(
                "JWKS_MAX_STALENESS_SECONDS ({}) must not be less than JWKS_CACHE_TTL_SECONDS ({})",
                jwks_max_staleness.as_secs(),
                jwks_cache_ttl.as_secs()
            )));
        }

        // Parse JWT clock skew tolerance with validation
        let jwt_clock_skew = if let Some(value_str) = vars.get("JWT_CLOCK_SKEW_SECONDS") {
            let value: i64 = value_str.trim().parse().map_err(|e| {
                ConfigError::InvalidJwtClockSkew(format!(
                    "JWT_CLOCK_SKEW_SECONDS must be a valid integer, got '{value_str}': {e}"
                ))
            })?;

            let value = u64::try_from(value)
                .ok()
                .filter(|v| *v > 0)
                .ok_or_else(|| {
                    ConfigError::InvalidJwtClockSkew(format!(
                        "JWT_CLOCK_SKEW_SECONDS must be positive, got {value}"
                    ))
                })?;

            if value > MAX_CLOCK_SKEW.as_secs() {
                return Err(ConfigError::InvalidJwtClockSkew(format!(
                    "JWT_CLOCK_SKEW_SECONDS must not exceed {} seconds, got {}",
                    MAX_CLOCK_SKEW.as_secs(),
                    value
                )));
            }

            Duration::from_secs(value)
        } else {
            DEFAULT_CLOCK_SKEW
        };

        let node_id = vars.get("NODE_ID").cloned().unwrap_or_else(|| {
            let hostname = vars
                .get("HOSTNAME")
                .cloned()
                .unwrap_or_else(|| "unknown".to_string());
            format!("{DEFAULT_NODE_ID_PREFIX}-{hostname}")
        });

        Ok(Config {
            node_id,
            bind_address,
            providers_paths,
            policy_path,
            config_poll_interval,
            jwks_cache_ttl,
            jwks_max_staleness,
            jwks_http_timeout,
            jwt_clock_skew,
        })
    }
}

fn positive_seconds(
    vars: &HashMap<String, String>,
    name: &str,
    default: u64,
) -> Result<Duration, ConfigError> {
    let Some(value_str) = vars.get(name) else {
        return Ok(Duration::from_secs(default));
    };

    let value: u64 = value_str.trim().parse().map_err(|e| {
        ConfigError::InvalidDuration(format!(
            "{name} must be a valid positive integer, got '{value_str}': {e}"
        ))
    })?;

    if value == 0 {
        return Err(ConfigError::InvalidDuration(format!(
            "{name} must be greater than 0"
        )));
    }

    Ok(Duration::from_secs(value))
}
