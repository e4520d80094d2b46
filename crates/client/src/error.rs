use std::io;
use std::time::Duration;

use protocol::{ConfigError, ErrorKind, ErrorPayload, Value};
use thiserror::Error;

// ---------------------------------------------------------------------------
// RemoteError
// ---------------------------------------------------------------------------

/// The error value a server placed in a response.
///
/// Structured `{kind, message, data}` maps are decoded field by field. Any
/// other value (e.g. a bare string from a foreign peer) is rendered into the
/// message of an `InvocationError`; the original is kept in [`RemoteError::value`].
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{payload}")]
pub struct RemoteError {
    payload: ErrorPayload,
    value: Value,
}

impl RemoteError {
    /// Interprets a response's error field. A `{kind, message, data}` map is
    /// read as such; any other value becomes the message of an
    /// `InvocationError`.
    pub fn from_value(value: Value) -> Self {
        let payload = ErrorPayload::from_value(&value)
            .unwrap_or_else(|| ErrorPayload::new(ErrorKind::Invocation, value.to_string()));
        Self { payload, value }
    }

    /// Error kind name, such as `"MethodNotFoundError"` or a handler's own.
    pub fn kind(&self) -> &str {
        &self.payload.kind
    }

    /// The built-in kind, if the server reported one.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.payload.error_kind()
    }

    /// Human-readable description.
    pub fn message(&self) -> &str {
        &self.payload.message
    }

    /// Structured detail attached by the server, if any.
    pub fn data(&self) -> Option<&Value> {
        self.payload.data.as_ref()
    }

    /// The error field exactly as received.
    pub fn value(&self) -> &Value {
        &self.value
    }
}

// ---------------------------------------------------------------------------
// CallError
// ---------------------------------------------------------------------------

/// Why a call did not produce a result.
///
/// `Clone` because a connection fault is fanned out to every pending call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    /// The server answered with an error.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// No response arrived within the deadline. The connection stays usable.
    #[error("call to '{method}' timed out after {after:?}")]
    Timeout {
        /// Method that was called.
        method: String,
        /// The deadline that elapsed.
        after: Duration,
    },

    /// The connection failed or was closed; it is dead for all callers.
    #[error("connection error: {reason}")]
    Connection {
        /// Why the connection is dead.
        reason: String,
    },

    /// The arguments could not be converted to a parameter list or encoded.
    #[error("invalid arguments: {reason}")]
    InvalidArguments {
        /// Conversion or encoding failure.
        reason: String,
    },

    /// The result could not be converted to the requested type.
    #[error("invalid result: {reason}")]
    InvalidResult {
        /// Deserialisation failure.
        reason: String,
    },
}

impl CallError {
    pub(crate) fn connection(reason: impl Into<String>) -> Self {
        Self::Connection {
            reason: reason.into(),
        }
    }

    /// Returns the server's error, if that is what this is.
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(remote) => Some(remote),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}

// ---------------------------------------------------------------------------
// ConnectError
// ---------------------------------------------------------------------------

/// Failure to open a client connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The client configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The TCP connect failed.
    #[error("failed to connect to {address}: {source}")]
    Io {
        /// Address being connected to.
        address: String,
        /// Underlying socket error.
        #[source]
        source: io::Error,
    },

    /// The TCP connect did not complete within the call timeout.
    #[error("timed out after {after:?} connecting to {address}")]
    Timeout {
        /// Address being connected to.
        address: String,
        /// The connect deadline.
        after: Duration,
    },
}

// ---------------------------------------------------------------------------
// PoolError
// ---------------------------------------------------------------------------

/// Failure to lease a pooled connection or to complete a pooled call.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool has been closed.
    #[error("connection pool is closed")]
    Closed,

    /// Every connection is leased and the pool does not wait.
    #[error("connection pool exhausted: all {max} connections are in use")]
    Exhausted {
        /// Configured `max_connections`.
        max: usize,
    },

    /// No connection became free within the acquire timeout.
    #[error("timed out after {after:?} waiting for a pooled connection")]
    AcquireTimeout {
        /// The configured acquire timeout.
        after: Duration,
    },

    /// Opening a new connection failed.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// The pool configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A call made through the pool failed.
    #[error(transparent)]
    Call(#[from] CallError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_remote_error_exposes_fields() {
        let payload = ErrorPayload::method_not_found("frobnicate");
        let remote = RemoteError::from_value(payload.to_value());
        assert_eq!(remote.error_kind(), Some(ErrorKind::MethodNotFound));
        assert_eq!(remote.message(), "Method not found: frobnicate");
        assert!(remote.data().is_none());
    }

    #[test]
    fn unrecognised_error_value_keeps_the_original() {
        let raw = Value::from(42);
        let remote = RemoteError::from_value(raw.clone());
        assert_eq!(remote.kind(), "InvocationError");
        assert_eq!(remote.message(), "42");
        assert_eq!(remote.value(), &raw);
    }

    #[test]
    fn timeout_message_names_the_method() {
        let err = CallError::Timeout {
            method: "sleep".to_owned(),
            after: Duration::from_millis(10),
        };
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "call to 'sleep' timed out after 10ms");
    }
}
