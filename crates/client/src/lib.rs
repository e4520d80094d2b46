//! MessagePack-RPC client.
//!
//! A [`Client`] owns one connection and correlates responses to calls by
//! msgid, so any number of tasks may call through it at once. A [`Pool`]
//! leases clients to one endpoint, bounded by `max_connections`, and recycles
//! them between calls.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Depends on `protocol` for the message model and on
//! `framer` for the socket.
//!
//! ## Failure model
//!
//! | Event | Affected calls | Connection |
//! |-------|----------------|------------|
//! | Error response | that call ([`CallError::Remote`]) | usable |
//! | Call deadline | that call ([`CallError::Timeout`]) | usable; late reply discarded |
//! | Reset, EOF, undecodable data | every pending call ([`CallError::Connection`]) | dead |
//!
//! A pooled connection that dies is discarded when its lease ends; a later
//! acquire opens a replacement.

mod engine;
mod error;
mod pool;

pub use engine::Client;
pub use error::{CallError, ConnectError, PoolError, RemoteError};
pub use pool::{Pool, PoolStatus, PooledClient};
