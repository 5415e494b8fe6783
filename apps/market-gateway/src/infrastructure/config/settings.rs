//! Gateway Configuration Settings
//!
//! Configuration types for the gateway, loaded from environment variables.

use std::time::Duration;

/// Upstream access token.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    /// Wrap a token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Token text.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Token([REDACTED])")
    }
}

/// Where and how to reach the upstream.
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    /// WebSocket URL.
    pub url: String,
    /// Access token.
    pub token: Token,
}

/// Per-connection timing and buffering.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    /// Deadline for one fetch or subscribe round trip.
    pub request_timeout: Duration,
    /// Keepalive frame interval.
    pub keepalive_interval: Duration,
    /// Silence after which the transport counts as dead.
    pub keepalive_timeout: Duration,
    /// Queued outbound requests before senders wait.
    pub outbound_capacity: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(20),
            keepalive_timeout: Duration::from_secs(60),
            outbound_capacity: 1_024,
        }
    }
}

/// Connection pool sizing.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    /// Connections opened at initialization.
    pub size: usize,
    /// Deadline for one connection's bootstrap.
    pub bootstrap_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            size: 4,
            bootstrap_timeout: Duration::from_secs(30),
        }
    }
}

/// Event channel capacities.
#[derive(Debug, Clone, Copy)]
pub struct EventSettings {
    /// Lifecycle channel capacity.
    pub lifecycle_capacity: usize,
    /// Data channel capacity.
    pub data_capacity: usize,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            lifecycle_capacity: 1_024,
            data_capacity: 16_384,
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone, Copy)]
pub struct ServerSettings {
    /// Health check HTTP port (0 = disabled).
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8082 }
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Upstream endpoint.
    pub upstream: UpstreamSettings,
    /// Connection settings.
    pub connection: ConnectionSettings,
    /// Pool settings.
    pub pool: PoolSettings,
    /// Event channel settings.
    pub events: EventSettings,
    /// Server port settings.
    pub server: ServerSettings,
}

impl GatewayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing,
    /// empty, or the URL is not a WebSocket URL.
    pub fn from_env() -> Result<Self, ConfigError> {
        let url = required_env("GATEWAY_UPSTREAM_URL")?;
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue {
                key: "GATEWAY_UPSTREAM_URL".to_string(),
                reason: "expected a ws:// or wss:// URL".to_string(),
            });
        }
        let token = required_env("GATEWAY_UPSTREAM_TOKEN")?;

        let connection_defaults = ConnectionSettings::default();
        let connection = ConnectionSettings {
            request_timeout: parse_env_duration_secs(
                "GATEWAY_REQUEST_TIMEOUT_SECS",
                connection_defaults.request_timeout,
            ),
            keepalive_interval: parse_env_duration_secs(
                "GATEWAY_KEEPALIVE_INTERVAL_SECS",
                connection_defaults.keepalive_interval,
            ),
            keepalive_timeout: parse_env_duration_secs(
                "GATEWAY_KEEPALIVE_TIMEOUT_SECS",
                connection_defaults.keepalive_timeout,
            ),
            outbound_capacity: parse_env_usize(
                "GATEWAY_OUTBOUND_CAPACITY",
                connection_defaults.outbound_capacity,
            ),
        };

        let pool_defaults = PoolSettings::default();
        let pool = PoolSettings {
            size: parse_env_usize("GATEWAY_POOL_SIZE", pool_defaults.size).max(1),
            bootstrap_timeout: parse_env_duration_secs(
                "GATEWAY_BOOTSTRAP_TIMEOUT_SECS",
                pool_defaults.bootstrap_timeout,
            ),
        };

        let event_defaults = EventSettings::default();
        let events = EventSettings {
            lifecycle_capacity: parse_env_usize(
                "GATEWAY_LIFECYCLE_EVENT_CAPACITY",
                event_defaults.lifecycle_capacity,
            ),
            data_capacity: parse_env_usize(
                "GATEWAY_DATA_EVENT_CAPACITY",
                event_defaults.data_capacity,
            ),
        };

        let server = ServerSettings {
            health_port: parse_env_u16("GATEWAY_HEALTH_PORT", ServerSettings::default().health_port),
        };

        Ok(Self {
            upstream: UpstreamSettings {
                url,
                token: Token::new(token),
            },
            connection,
            pool,
            events,
            server,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable has an unusable value.
    #[error("environment variable {key} is invalid: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// What is wrong with it.
        reason: String,
    },
}

fn required_env(key: &str) -> Result<String, ConfigError> {
    let value = std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))?;
    if value.trim().is_empty() {
        return Err(ConfigError::EmptyValue(key.to_string()));
    }
    Ok(value)
}

fn parse_env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}
