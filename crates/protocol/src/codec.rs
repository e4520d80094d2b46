//! Wire codec: MessagePack encoding of protocol messages.
//!
//! MessagePack values are self-delimiting, so concatenated messages on a
//! stream can be split without any external length prefix. Decoding is
//! resumable: [`decode_one`] reports "need more data" without consuming
//! anything, and the caller retries once more bytes have arrived.
//!
//! [`FrameScanner`] finds where the next message ends by walking markers and
//! length fields only. Stream readers use it to defer the full decode until a
//! frame is complete, so a large frame arriving in many segments is decoded
//! once rather than once per segment.

use std::io::ErrorKind as IoErrorKind;

use rmp::Marker;
use rmpv::Value;

use crate::{
    DecodeError, EncodeError, Message, MessageType, MsgId, Notification, Request, Response,
};

/// Encodes a message into a fresh byte vector.
pub fn encode(message: &Message) -> Result<Vec<u8>, EncodeError> {
    let mut buf = Vec::new();
    encode_into(message, &mut buf)?;
    Ok(buf)
}

/// Appends the encoding of `message` to `buf`.
pub fn encode_into(message: &Message, buf: &mut Vec<u8>) -> Result<(), EncodeError> {
    let value = message_to_value(message);
    rmpv::encode::write_value(buf, &value).map_err(|e| EncodeError::Value {
        reason: e.to_string(),
    })
}

/// Decodes the first complete message in `buf`.
///
/// Returns `Ok(Some((message, consumed)))` when a full message is present,
/// where `consumed` is the number of bytes it occupied. Returns `Ok(None)`
/// when `buf` holds only a prefix of the next message; nothing is consumed
/// and the caller should append more bytes and retry.
pub fn decode_one(buf: &[u8]) -> Result<Option<(Message, usize)>, DecodeError> {
    if buf.is_empty() {
        return Ok(None);
    }

    let mut cursor = buf;
    let value = match rmpv::decode::read_value(&mut cursor) {
        Ok(value) => value,
        Err(rmpv::decode::Error::InvalidMarkerRead(ref e))
        | Err(rmpv::decode::Error::InvalidDataRead(ref e))
            if e.kind() == IoErrorKind::UnexpectedEof =>
        {
            return Ok(None);
        }
        Err(e) => {
            return Err(DecodeError::Malformed {
                reason: e.to_string(),
            })
        }
    };
    let consumed = buf.len() - cursor.len();

    Ok(Some((message_from_value(value)?, consumed)))
}

// ---------------------------------------------------------------------------
// Frame boundaries
// ---------------------------------------------------------------------------

/// Result of [`FrameScanner::scan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameScan {
    /// The first `len` bytes hold one complete MessagePack value.
    Complete(usize),
    /// The value continues past the end of the buffer; at least `needed` more
    /// bytes must arrive before it can end.
    Incomplete {
        /// Lower bound on the bytes still missing.
        needed: usize,
    },
}

/// Locates the end of the next MessagePack value without decoding it.
///
/// The scanner is resumable. On [`FrameScan::Incomplete`] it remembers how
/// far it got, and the next call continues from there, so the buffer passed
/// in must start at the same byte and may only have grown. After
/// [`FrameScan::Complete`] it is ready for the value that follows.
#[derive(Debug, Clone, Default)]
pub struct FrameScanner {
    /// Bytes of the current value already walked.
    offset: usize,
    /// Values still to walk before the current one ends; zero between values.
    remaining: u64,
}

impl FrameScanner {
    /// Creates a scanner positioned at the start of a value.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of the current value walked so far.
    pub fn scanned(&self) -> usize {
        self.offset
    }

    /// Continues scanning `buf`.
    pub fn scan(&mut self, buf: &[u8]) -> Result<FrameScan, DecodeError> {
        if self.remaining == 0 {
            self.offset = 0;
            self.remaining = 1;
        }
        while self.remaining > 0 {
            let rest = buf.get(self.offset..).unwrap_or_default();
            let (len, children) = match item_extent(rest)? {
                Extent::Item { len, children } => (len, children),
                Extent::Short { needed } => return Ok(FrameScan::Incomplete { needed }),
            };
            if len > rest.len() {
                return Ok(FrameScan::Incomplete {
                    needed: len - rest.len(),
                });
            }
            self.offset += len;
            self.remaining = (self.remaining - 1).saturating_add(children);
        }
        Ok(FrameScan::Complete(std::mem::take(&mut self.offset)))
    }
}

enum Extent {
    /// An item whose own bytes span `len`, followed by `children` nested items.
    Item { len: usize, children: u64 },
    /// The marker or length field itself is cut off.
    Short { needed: usize },
}

fn item_extent(buf: &[u8]) -> Result<Extent, DecodeError> {
    let Some(&first) = buf.first() else {
        return Ok(Extent::Short { needed: 1 });
    };
    let scalar = |len: usize| -> Result<Extent, DecodeError> { Ok(Extent::Item { len, children: 0 }) };
    match Marker::from_u8(first) {
        Marker::FixPos(_) | Marker::FixNeg(_) | Marker::Null | Marker::True | Marker::False => {
            scalar(1)
        }
        Marker::U8 | Marker::I8 => scalar(2),
        Marker::U16 | Marker::I16 | Marker::FixExt1 => scalar(3),
        Marker::FixExt2 => scalar(4),
        Marker::U32 | Marker::I32 | Marker::F32 => scalar(5),
        Marker::FixExt4 => scalar(6),
        Marker::U64 | Marker::I64 | Marker::F64 => scalar(9),
        Marker::FixExt8 => scalar(10),
        Marker::FixExt16 => scalar(18),
        Marker::FixStr(len) => scalar(1 + usize::from(len)),
        Marker::Str8 | Marker::Bin8 => Ok(sized(buf, 1, 0)),
        Marker::Str16 | Marker::Bin16 => Ok(sized(buf, 2, 0)),
        Marker::Str32 | Marker::Bin32 => Ok(sized(buf, 4, 0)),
        Marker::Ext8 => Ok(sized(buf, 1, 1)),
        Marker::Ext16 => Ok(sized(buf, 2, 1)),
        Marker::Ext32 => Ok(sized(buf, 4, 1)),
        Marker::FixArray(count) => Ok(Extent::Item {
            len: 1,
            children: u64::from(count),
        }),
        Marker::Array16 => Ok(container(buf, 2, 1)),
        Marker::Array32 => Ok(container(buf, 4, 1)),
        Marker::FixMap(count) => Ok(Extent::Item {
            len: 1,
            children: 2 * u64::from(count),
        }),
        Marker::Map16 => Ok(container(buf, 2, 2)),
        Marker::Map32 => Ok(container(buf, 4, 2)),
        Marker::Reserved => Err(DecodeError::Malformed {
            reason: format!("reserved marker {first:#04x}"),
        }),
    }
}

/// Reads the big-endian length field of `width` bytes that follows the marker.
fn length_field(buf: &[u8], width: usize) -> Result<u64, Extent> {
    match buf.get(1..1 + width) {
        Some(field) => Ok(field.iter().fold(0, |acc, &b| (acc << 8) | u64::from(b))),
        None => Err(Extent::Short {
            needed: 1 + width - buf.len(),
        }),
    }
}

/// A str, bin or ext item: marker, length field, optional ext type byte, body.
fn sized(buf: &[u8], width: usize, type_byte: usize) -> Extent {
    match length_field(buf, width) {
        Ok(body) => Extent::Item {
            // Length fields are at most 32 bits wide.
            len: 1 + width + type_byte + body as usize,
            children: 0,
        },
        Err(short) => short,
    }
}

/// An array or map header; each entry is `per_entry` nested items.
fn container(buf: &[u8], width: usize, per_entry: u64) -> Extent {
    match length_field(buf, width) {
        Ok(count) => Extent::Item {
            len: 1 + width,
            children: count * per_entry,
        },
        Err(short) => short,
    }
}

// ---------------------------------------------------------------------------
// Value <-> Message
// ---------------------------------------------------------------------------

fn message_to_value(message: &Message) -> Value {
    let tag = Value::from(message.message_type().tag());
    let fields = match message {
        Message::Request(r) => vec![
            tag,
            Value::from(r.msgid.as_u32()),
            Value::from(r.method.as_str()),
            Value::Array(r.params.clone()),
        ],
        Message::Response(r) => {
            let (error, result) = match &r.outcome {
                Ok(result) => (Value::Nil, result.clone()),
                Err(error) => (error.clone(), Value::Nil),
            };
            vec![tag, Value::from(r.msgid.as_u32()), error, result]
        }
        Message::Notification(n) => vec![
            tag,
            Value::from(n.method.as_str()),
            Value::Array(n.params.clone()),
        ],
    };
    Value::Array(fields)
}

fn message_from_value(value: Value) -> Result<Message, DecodeError> {
    let Value::Array(fields) = value else {
        return Err(DecodeError::NotAnArray);
    };

    let tag = fields.first().ok_or(DecodeError::UnknownType {
        tag: "<missing>".to_owned(),
    })?;
    let message_type = tag
        .as_u64()
        .and_then(MessageType::from_tag)
        .ok_or_else(|| DecodeError::UnknownType {
            tag: tag.to_string(),
        })?;

    if fields.len() != message_type.arity() {
        return Err(DecodeError::WrongArity {
            message_type,
            expected: message_type.arity(),
            actual: fields.len(),
        });
    }

    let mut rest = fields.into_iter().skip(1);
    // Arity was checked above, so every `next()` below yields a value.
    let mut field = || rest.next().unwrap_or(Value::Nil);

    let message = match message_type {
        MessageType::Request => {
            let msgid = parse_msgid(field())?;
            let method = parse_method(field())?;
            let params = parse_params(field())?;
            Message::Request(Request {
                msgid,
                method,
                params,
            })
        }
        MessageType::Response => {
            let msgid = parse_msgid(field())?;
            let error = field();
            let result = field();
            let outcome = if error.is_nil() { Ok(result) } else { Err(error) };
            Message::Response(Response { msgid, outcome })
        }
        MessageType::Notification => {
            let method = parse_method(field())?;
            let params = parse_params(field())?;
            Message::Notification(Notification { method, params })
        }
    };
    Ok(message)
}

fn parse_msgid(value: Value) -> Result<MsgId, DecodeError> {
    value
        .as_u64()
        .and_then(|raw| u32::try_from(raw).ok())
        .map(MsgId::new)
        .ok_or_else(|| DecodeError::InvalidField {
            field: "msgid",
            reason: format!("expected an unsigned 32-bit integer, got {value}"),
        })
}

fn parse_method(value: Value) -> Result<String, DecodeError> {
    match value {
        Value::String(s) => s.into_str().ok_or_else(|| DecodeError::InvalidField {
            field: "method",
            reason: "name is not valid UTF-8".to_owned(),
        }),
        Value::Binary(bytes) => String::from_utf8(bytes).map_err(|_| DecodeError::InvalidField {
            field: "method",
            reason: "name is not valid UTF-8".to_owned(),
        }),
        other => Err(DecodeError::InvalidField {
            field: "method",
            reason: format!("expected a string, got {other}"),
        }),
    }
}

fn parse_params(value: Value) -> Result<Vec<Value>, DecodeError> {
    match value {
        Value::Array(params) => Ok(params),
        other => Err(DecodeError::InvalidField {
            field: "params",
            reason: format!("expected an array, got {other}"),
        }),
    }
}
