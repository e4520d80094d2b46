use std::io;

use protocol::{DecodeError, EncodeError};
use thiserror::Error;

/// Failure to read or write a framed message.
///
/// Every variant is fatal to the connection it was raised on.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The peer closed or reset the stream.
    ///
    /// `clean` is `true` only for an orderly EOF that fell between two
    /// messages.
    #[error("connection closed (clean: {clean})")]
    Closed {
        /// Whether the close happened on a message boundary.
        clean: bool,
    },

    /// The peer sent bytes that are not a valid message.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// An outgoing message could not be serialised.
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// Any other socket failure.
    #[error("i/o error: {0}")]
    Io(io::Error),
}

impl FrameError {
    /// Classifies a socket error, folding reset-class failures into
    /// [`FrameError::Closed`].
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => Self::Closed { clean: false },
            _ => Self::Io(err),
        }
    }

    /// Returns `true` for an orderly EOF between messages.
    pub fn is_clean_close(&self) -> bool {
        matches!(self, Self::Closed { clean: true })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_class_errors_become_unclean_close() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::UnexpectedEof,
        ] {
            let err = FrameError::from_io(io::Error::new(kind, "gone"));
            assert!(matches!(err, FrameError::Closed { clean: false }));
            assert!(!err.is_clean_close());
        }
    }

    #[test]
    fn other_io_errors_are_preserved() {
        let err = FrameError::from_io(io::Error::new(io::ErrorKind::PermissionDenied, "nope"));
        assert!(matches!(err, FrameError::Io(_)));
        assert!(err.to_string().contains("nope"));
    }
}
