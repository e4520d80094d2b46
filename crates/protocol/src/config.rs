//! Configuration for servers, clients, and connection pools.
//!
//! Every struct fills unspecified fields from its `Default`, so a JSON
//! document only has to name the options it changes. Unknown keys are
//! rejected. Durations are expressed in (fractional) seconds on the outside
//! and converted to [`Duration`] by accessor methods, which also perform the
//! range checks used by `validate()`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default receive-buffer growth hint: 1 MiB.
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

/// Default ceiling for a single partially received frame: 64 MiB.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Default per-call deadline in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: f64 = 10.0;

/// Default port for both ends.
pub const DEFAULT_PORT: u16 = 6000;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A configuration document could not be parsed or holds an invalid value.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field is outside its permitted range.
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue {
        /// Name of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// The document is not valid JSON or does not match the schema.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

fn seconds(field: &'static str, secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::InvalidValue {
        field,
        reason: e.to_string(),
    })
}

fn optional_seconds(field: &'static str, secs: Option<f64>) -> Result<Option<Duration>, ConfigError> {
    secs.map(|s| seconds(field, s)).transpose()
}

fn non_zero(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            field,
            reason: "must be greater than zero".to_owned(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// What the server does when a handler outlives the per-call deadline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlinePolicy {
    /// Let the handler finish, send its real outcome, and report the overrun
    /// to the call observer.
    #[default]
    Observe,
    /// Abort the handler and answer with a `TimeoutError` payload.
    Abort,
}

/// Listening socket and dispatch options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Interface to bind, e.g. `"0.0.0.0"`.
    pub bind_address: String,
    /// TCP port. `0` asks the OS for an ephemeral port.
    pub port: u16,
    /// Per-call handler deadline; `None` disables it.
    pub timeout_seconds: Option<f64>,
    /// Emit a call record for every dispatched call.
    pub debug: bool,
    /// Receive-buffer growth hint in bytes.
    pub buffer_size: usize,
    /// Largest frame accepted before the connection is dropped.
    pub max_frame_size: usize,
    /// Behaviour on deadline overrun.
    pub deadline_policy: DeadlinePolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_owned(),
            port: DEFAULT_PORT,
            timeout_seconds: Some(DEFAULT_TIMEOUT_SECONDS),
            debug: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            deadline_policy: DeadlinePolicy::Observe,
        }
    }
}

impl ServerConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every field's range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.timeout()?;
        non_zero("buffer_size", self.buffer_size)?;
        non_zero("max_frame_size", self.max_frame_size)?;
        Ok(())
    }

    /// The handler deadline as a [`Duration`].
    pub fn timeout(&self) -> Result<Option<Duration>, ConfigError> {
        optional_seconds("timeout_seconds", self.timeout_seconds)
    }

    /// The `(host, port)` pair to bind.
    pub fn address(&self) -> (&str, u16) {
        (self.bind_address.as_str(), self.port)
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Remote endpoint and call options for a single connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Per-call deadline; `None` waits indefinitely.
    pub timeout_seconds: Option<f64>,
    /// Receive-buffer growth hint in bytes.
    pub buffer_size: usize,
    /// Largest frame accepted before the connection is dropped.
    pub max_frame_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: DEFAULT_PORT,
            timeout_seconds: Some(DEFAULT_TIMEOUT_SECONDS),
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ClientConfig {
    /// Creates a config for `host:port` with default options.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every field's range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "host",
                reason: "must not be empty".to_owned(),
            });
        }
        self.timeout()?;
        non_zero("buffer_size", self.buffer_size)?;
        non_zero("max_frame_size", self.max_frame_size)?;
        Ok(())
    }

    /// The per-call deadline as a [`Duration`].
    pub fn timeout(&self) -> Result<Option<Duration>, ConfigError> {
        optional_seconds("timeout_seconds", self.timeout_seconds)
    }

    /// The `(host, port)` pair to connect to.
    pub fn address(&self) -> (&str, u16) {
        (self.host.as_str(), self.port)
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Sizing and waiting policy for a connection pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Connections opened eagerly when the pool is created.
    pub initial_connections: usize,
    /// Upper bound on simultaneously open connections.
    pub max_connections: usize,
    /// How long `acquire` waits for capacity. `0` fails immediately.
    pub acquire_timeout_seconds: f64,
    /// Idle connections older than this are closed instead of reused.
    pub max_idle_seconds: Option<f64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_connections: 0,
            max_connections: 200,
            acquire_timeout_seconds: 30.0,
            max_idle_seconds: Some(180.0),
        }
    }
}

impl PoolConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every field's range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("max_connections", self.max_connections)?;
        if self.initial_connections > self.max_connections {
            return Err(ConfigError::InvalidValue {
                field: "initial_connections",
                reason: format!(
                    "{} exceeds max_connections ({})",
                    self.initial_connections, self.max_connections
                ),
            });
        }
        self.acquire_timeout()?;
        self.max_idle()?;
        Ok(())
    }

    /// The acquire wait as a [`Duration`].
    pub fn acquire_timeout(&self) -> Result<Duration, ConfigError> {
        seconds("acquire_timeout_seconds", self.acquire_timeout_seconds)
    }

    /// The idle expiry as a [`Duration`].
    pub fn max_idle(&self) -> Result<Option<Duration>, ConfigError> {
        optional_seconds("max_idle_seconds", self.max_idle_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_documents_fill_defaults() {
        let config = ServerConfig::from_json_str(r#"{ "port": 7000, "debug": true }"#).unwrap();
        assert_eq!(config.port, 7000);
        assert!(config.debug);
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.timeout().unwrap(), Some(Duration::from_secs(10)));
        assert_eq!(config.deadline_policy, DeadlinePolicy::Observe);
    }

    #[test]
    fn deadline_policy_parses_snake_case() {
        let config =
            ServerConfig::from_json_str(r#"{ "deadline_policy": "abort", "timeout_seconds": null }"#)
                .unwrap();
        assert_eq!(config.deadline_policy, DeadlinePolicy::Abort);
        assert_eq!(config.timeout().unwrap(), None);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = ClientConfig::from_json_str(r#"{ "hots": "example" }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn negative_timeout_is_rejected() {
        let config = ClientConfig {
            timeout_seconds: Some(-1.0),
            ..ClientConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "timeout_seconds",
                ..
            })
        ));
    }

    #[test]
    fn fractional_timeouts_convert() {
        let config = ClientConfig {
            timeout_seconds: Some(0.01),
            ..ClientConfig::new("localhost", 1)
        };
        assert_eq!(config.timeout().unwrap(), Some(Duration::from_millis(10)));
        assert_eq!(config.address(), ("localhost", 1));
    }

    #[test]
    fn pool_rejects_initial_above_max() {
        let err = PoolConfig::from_json_str(r#"{ "initial_connections": 3, "max_connections": 2 }"#)
            .unwrap_err();
        assert!(err.to_string().contains("initial_connections"));
    }

    #[test]
    fn pool_rejects_zero_capacity() {
        let config = PoolConfig {
            max_connections: 0,
            ..PoolConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_buffer_is_rejected() {
        let config = ServerConfig {
            buffer_size: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
