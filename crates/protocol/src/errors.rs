//! Codec errors and the structured error payload.
//!
//! [`DecodeError`] is fatal to the connection it was raised on: once the byte
//! stream is out of sync there is no way to find the next message boundary.
//!
//! [`ErrorPayload`] is the value a server places in the `error` field of a
//! response. Handler failures are always translated into one before they
//! cross the connection boundary.

use rmpv::Value;
use thiserror::Error;

use crate::MessageType;

// ---------------------------------------------------------------------------
// Codec errors
// ---------------------------------------------------------------------------

/// Structurally invalid wire data.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    /// The bytes are not valid MessagePack.
    #[error("malformed MessagePack: {reason}")]
    Malformed {
        /// Rendered decoder error.
        reason: String,
    },

    /// The top-level value is not an array.
    #[error("message is not an array")]
    NotAnArray,

    /// The array has the wrong number of elements for its type tag.
    #[error("{message_type} must have {expected} elements, got {actual}")]
    WrongArity {
        /// The type the tag announced.
        message_type: MessageType,
        /// Element count required by that type.
        expected: usize,
        /// Element count actually present.
        actual: usize,
    },

    /// The leading type tag is not 0, 1 or 2.
    #[error("unknown message type tag {tag}")]
    UnknownType {
        /// The rendered tag value.
        tag: String,
    },

    /// A field has the wrong MessagePack type or an out-of-range value.
    #[error("invalid {field}: {reason}")]
    InvalidField {
        /// Field name (`msgid`, `method`, `params`).
        field: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// A frame is, or is known to become, larger than the configured limit.
    #[error("frame of at least {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Lower bound on the frame's length.
        size: usize,
        /// Configured maximum frame size.
        max: usize,
    },
}

/// A message could not be serialised.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EncodeError {
    /// The MessagePack writer rejected a value.
    #[error("failed to encode MessagePack value: {reason}")]
    Value {
        /// Rendered writer error.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Structured error payload
// ---------------------------------------------------------------------------

/// Category of a handler-side failure reported in a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No method with the requested name is registered.
    MethodNotFound,
    /// Wrong number or wrong types of arguments.
    InvalidParams,
    /// The handler returned an error or panicked.
    Invocation,
    /// The handler exceeded the server deadline (abort policy only).
    Timeout,
}

impl ErrorKind {
    /// The name carried in the `kind` field on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MethodNotFound => "MethodNotFoundError",
            Self::InvalidParams => "InvalidParamsError",
            Self::Invocation => "InvocationError",
            Self::Timeout => "TimeoutError",
        }
    }

    /// Parses a wire `kind` name; unknown names yield `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "MethodNotFoundError" => Some(Self::MethodNotFound),
            "InvalidParamsError" => Some(Self::InvalidParams),
            "InvocationError" => Some(Self::Invocation),
            "TimeoutError" => Some(Self::Timeout),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The structured value a server writes into a response's `error` field.
///
/// On the wire this is a map `{"kind": str, "message": str}` with an optional
/// `"data"` entry carrying handler-supplied detail.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorPayload {
    /// Error category name. Usually an [`ErrorKind`] name, but handlers may
    /// report their own.
    pub kind: String,
    /// Human-readable description.
    pub message: String,
    /// Optional handler-supplied detail.
    pub data: Option<Value>,
}

impl ErrorPayload {
    /// Creates a payload for one of the built-in kinds.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind: kind.as_str().to_owned(),
            message: message.into(),
            data: None,
        }
    }

    /// Payload for an unresolvable method name.
    pub fn method_not_found(method: &str) -> Self {
        Self::new(ErrorKind::MethodNotFound, format!("Method not found: {method}"))
    }

    /// Returns the built-in kind, if the kind name is one.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        ErrorKind::from_name(&self.kind)
    }

    /// Converts the payload to its wire value.
    pub fn to_value(&self) -> Value {
        let mut entries = vec![
            (Value::from("kind"), Value::from(self.kind.as_str())),
            (Value::from("message"), Value::from(self.message.as_str())),
        ];
        if let Some(data) = &self.data {
            entries.push((Value::from("data"), data.clone()));
        }
        Value::Map(entries)
    }

    /// Reads a payload back from a wire value.
    ///
    /// Accepts the structured map form, and a bare string (as sent by peers
    /// that report errors as text) which becomes the message of an
    /// `InvocationError`. Anything else yields `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Map(entries) => {
                let mut kind = None;
                let mut message = None;
                let mut data = None;
                for (key, val) in entries {
                    match key.as_str() {
                        Some("kind") => kind = val.as_str().map(str::to_owned),
                        Some("message") => message = val.as_str().map(str::to_owned),
                        Some("data") => data = Some(val.clone()),
                        _ => {}
                    }
                }
                Some(Self {
                    kind: kind?,
                    message: message.unwrap_or_default(),
                    data,
                })
            }
            Value::String(s) => Some(Self::new(
                ErrorKind::Invocation,
                s.as_str().unwrap_or_default(),
            )),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_survives_value_conversion() {
        let mut payload = ErrorPayload::new(ErrorKind::Invocation, "division by zero");
        payload.data = Some(Value::from(42));

        let parsed = ErrorPayload::from_value(&payload.to_value()).unwrap();
        assert_eq!(parsed, payload);
        assert_eq!(parsed.error_kind(), Some(ErrorKind::Invocation));
    }

    #[test]
    fn bare_string_error_becomes_invocation_payload() {
        let parsed = ErrorPayload::from_value(&Value::from("it broke")).unwrap();
        assert_eq!(parsed.kind, "InvocationError");
        assert_eq!(parsed.message, "it broke");
    }

    #[test]
    fn map_without_kind_is_rejected() {
        let value = Value::Map(vec![(Value::from("message"), Value::from("x"))]);
        assert!(ErrorPayload::from_value(&value).is_none());
        assert!(ErrorPayload::from_value(&Value::from(7)).is_none());
    }

    #[test]
    fn method_not_found_message_names_the_method() {
        let payload = ErrorPayload::method_not_found("frobnicate");
        assert_eq!(payload.error_kind(), Some(ErrorKind::MethodNotFound));
        assert!(payload.message.contains("frobnicate"));
        assert!(payload.to_string().starts_with("MethodNotFoundError"));
    }

    #[test]
    fn unknown_kind_names_are_preserved() {
        assert_eq!(ErrorKind::from_name("ValueError"), None);
        assert_eq!(ErrorKind::from_name("TimeoutError"), Some(ErrorKind::Timeout));
    }
}
