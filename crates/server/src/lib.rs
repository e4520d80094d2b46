//! MessagePack-RPC server.
//!
//! Exposes the methods of a handler over TCP. A [`Handler`] is a table from
//! method name to a bound [`Method`], built once with a [`HandlerBuilder`]
//! (directly, or by a [`Service`] registering its own capability set). The
//! [`Server`] accepts connections and runs one [`Dispatcher`] loop per
//! connection.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Socket accept, per-connection tasks, and deadline
//! enforcement live here. Wire encoding is delegated to `protocol`, framing
//! to `framer`.
//!
//! ## Dispatch guarantees
//!
//! - Within one connection, messages are handled strictly in arrival order and
//!   responses are written in the same order.
//! - Connections progress independently of one another.
//! - Handler failures (unknown method, bad arguments, returned errors,
//!   panics) become error responses; they never close the connection.
//! - Notifications are never answered; their failures are only logged.

mod dispatcher;
mod handler;
mod observer;
mod params;
mod server;

pub use dispatcher::{DispatchOptions, Dispatcher};
pub use handler::{Handler, HandlerBuilder, InvocationError, Method, Service};
pub use observer::{CallKind, CallObserver, CallRecord, TracingObserver};
pub use params::FromParams;
pub use server::{serve_connection, Server, ServerError, ServerHandle};
