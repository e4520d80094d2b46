//! Message framing over tokio byte streams.
//!
//! [`FrameReader`] turns the read half of a connection into a pull-based
//! sequence of [`protocol::Message`]s, tolerating short reads and frames split
//! across any number of TCP segments. [`FrameWriter`] is the inverse: it
//! encodes one message at a time and flushes it to the write half.
//!
//! ## Architectural Layer
//!
//! **Transport.** This crate owns the receive buffer and the socket calls.
//! It knows nothing about handlers, pending calls, or pools; the `server` and
//! `client` crates drive it.
//!
//! ## Close semantics
//!
//! | Situation | Result |
//! |-----------|--------|
//! | EOF with nothing buffered | [`FrameError::Closed`] `{ clean: true }` |
//! | EOF with a partial frame buffered | [`FrameError::Closed`] `{ clean: false }` |
//! | Reset / aborted / broken pipe | [`FrameError::Closed`] `{ clean: false }` |
//! | Structurally invalid bytes | [`FrameError::Decode`] |

mod error;
mod reader;
mod writer;

pub use error::FrameError;
pub use reader::FrameReader;
pub use writer::FrameWriter;

use protocol::config::{DEFAULT_BUFFER_SIZE, DEFAULT_MAX_FRAME_SIZE};
use protocol::{ClientConfig, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};

/// Buffering limits applied to one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameOptions {
    /// How many bytes to reserve whenever the receive buffer runs out of room.
    pub buffer_size: usize,
    /// Largest partial frame tolerated before the stream is declared invalid.
    pub max_frame_size: usize,
}

impl Default for FrameOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl From<&ServerConfig> for FrameOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            buffer_size: config.buffer_size,
            max_frame_size: config.max_frame_size,
        }
    }
}

impl From<&ClientConfig> for FrameOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            buffer_size: config.buffer_size,
            max_frame_size: config.max_frame_size,
        }
    }
}

/// Splits a duplex stream into a framed reader and writer.
pub fn split<S>(stream: S, options: FrameOptions) -> (FrameReader<ReadHalf<S>>, FrameWriter<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let (read_half, write_half) = tokio::io::split(stream);
    (
        FrameReader::new(read_half, options),
        FrameWriter::new(write_half),
    )
}
