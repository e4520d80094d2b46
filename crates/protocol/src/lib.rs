//! MessagePack-RPC protocol domain.
//!
//! This crate contains the message model, the wire codec, the structured error
//! payload carried in responses, and the configuration types shared by the
//! server and client crates. Transport crates build on these types; they never
//! redefine the wire format.
//!
//! ## Architectural Layer
//!
//! **Domain.** This crate has no I/O dependencies. Encoding and decoding are
//! pure functions over byte slices; reading and writing sockets lives in the
//! `framer` crate.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype identifiers (`MsgId`, `ConnectionId`) |
//! | [`message`] | `Request`, `Response`, `Notification` and the `Message` sum type |
//! | [`codec`] | `encode` / `decode_one` over MessagePack, `FrameScanner` for frame boundaries |
//! | [`errors`] | Codec errors and the structured `ErrorPayload` |
//! | [`ext`] | Extension-type plugin trait and the tag-keyed `ExtensionRegistry` |
//! | [`config`] | Server, client and pool configuration |
//! | [`types`] | Shared value types (`Timestamp`) |

pub mod codec;
pub mod config;
pub mod errors;
pub mod ext;
pub mod identifiers;
pub mod message;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use codec::{decode_one, encode, encode_into, FrameScan, FrameScanner};
pub use config::{ClientConfig, ConfigError, DeadlinePolicy, PoolConfig, ServerConfig};
pub use errors::{DecodeError, EncodeError, ErrorKind, ErrorPayload};
pub use ext::{Extension, ExtensionRegistry};
pub use identifiers::{ConnectionId, MsgId};
pub use message::{Message, MessageType, Notification, Request, Response};
pub use types::Timestamp;

/// The dynamic MessagePack value exchanged as call arguments and results.
pub use rmpv::Value;
