//! Protocol message model.
//!
//! A message is a MessagePack array whose first element is an integer type tag:
//!
//! ```text
//! Request      [0, msgid, method, params]
//! Response     [1, msgid, error, result]
//! Notification [2, method, params]
//! ```
//!
//! Messages are transient: decoded, consumed, and discarded.

use rmpv::Value;

use crate::MsgId;

// ---------------------------------------------------------------------------
// Type tag
// ---------------------------------------------------------------------------

/// The leading integer that discriminates the three message shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// A call that expects a response.
    Request = 0,
    /// The answer to a request, correlated by msgid.
    Response = 1,
    /// A one-way call; no response frame is ever written.
    Notification = 2,
}

impl MessageType {
    /// Maps a wire tag to a message type, returning `None` for unknown tags.
    pub fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            2 => Some(Self::Notification),
            _ => None,
        }
    }

    /// Returns the wire tag.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Number of array elements a message of this type carries, tag included.
    pub fn arity(self) -> usize {
        match self {
            Self::Request | Self::Response => 4,
            Self::Notification => 3,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Notification => "notification",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Message shapes
// ---------------------------------------------------------------------------

/// A call that expects a [`Response`] carrying the same [`MsgId`].
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Caller-chosen correlation id.
    pub msgid: MsgId,
    /// Method name, resolved by exact match on the server.
    pub method: String,
    /// Positional arguments.
    pub params: Vec<Value>,
}

impl Request {
    /// Creates a new request.
    pub fn new(msgid: MsgId, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            msgid,
            method: method.into(),
            params,
        }
    }
}

/// The answer to a [`Request`].
///
/// The wire form carries separate `error` and `result` fields; here they are
/// folded into a single `Result` so that exactly one side is ever observed.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// The msgid of the request being answered.
    pub msgid: MsgId,
    /// `Ok(result)` when the error field is nil, otherwise `Err(error)`.
    pub outcome: Result<Value, Value>,
}

impl Response {
    /// Creates a successful response.
    pub fn success(msgid: MsgId, result: Value) -> Self {
        Self {
            msgid,
            outcome: Ok(result),
        }
    }

    /// Creates a failed response carrying an error value.
    pub fn failure(msgid: MsgId, error: Value) -> Self {
        Self {
            msgid,
            outcome: Err(error),
        }
    }

    /// Returns `true` if the response carries an error.
    pub fn is_error(&self) -> bool {
        self.outcome.is_err()
    }
}

/// A one-way call. The server never answers it.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Method name, resolved by exact match on the server.
    pub method: String,
    /// Positional arguments.
    pub params: Vec<Value>,
}

impl Notification {
    /// Creates a new notification.
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// Any protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// See [`Request`].
    Request(Request),
    /// See [`Response`].
    Response(Response),
    /// See [`Notification`].
    Notification(Notification),
}

impl Message {
    /// Returns the type tag of this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Request(_) => MessageType::Request,
            Self::Response(_) => MessageType::Response,
            Self::Notification(_) => MessageType::Notification,
        }
    }

    /// Returns the msgid for requests and responses.
    pub fn msgid(&self) -> Option<MsgId> {
        match self {
            Self::Request(r) => Some(r.msgid),
            Self::Response(r) => Some(r.msgid),
            Self::Notification(_) => None,
        }
    }
}

impl From<Request> for Message {
    fn from(value: Request) -> Self {
        Self::Request(value)
    }
}

impl From<Response> for Message {
    fn from(value: Response) -> Self {
        Self::Response(value)
    }
}

impl From<Notification> for Message {
    fn from(value: Notification) -> Self {
        Self::Notification(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_tags_match_wire_values() {
        assert_eq!(MessageType::from_tag(0), Some(MessageType::Request));
        assert_eq!(MessageType::from_tag(1), Some(MessageType::Response));
        assert_eq!(MessageType::from_tag(2), Some(MessageType::Notification));
        assert_eq!(MessageType::from_tag(3), None);
        assert_eq!(MessageType::Notification.tag(), 2);
    }

    #[test]
    fn notification_has_no_msgid() {
        let msg = Message::from(Notification::new("log", vec![]));
        assert_eq!(msg.msgid(), None);
        assert_eq!(msg.message_type().arity(), 3);
    }

    #[test]
    fn response_constructors_set_outcome() {
        let ok = Response::success(MsgId::new(1), Value::from(3));
        let err = Response::failure(MsgId::new(1), Value::from("boom"));
        assert!(!ok.is_error());
        assert!(err.is_error());
    }
}
