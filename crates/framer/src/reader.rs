use protocol::{decode_one, DecodeError, FrameScan, FrameScanner, Message};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use crate::{FrameError, FrameOptions};

/// Never issue a read with less free space than this.
const MIN_READ_SPACE: usize = 4096;

/// Pulls decoded messages off a byte stream.
///
/// Holds a single growing receive buffer. Each call to
/// [`FrameReader::next_message`] first drains a complete message already
/// buffered, and only reads from the stream when none is available. Every
/// message is yielded exactly once. A partial frame is only scanned for its
/// end as bytes arrive; it is decoded once, when complete.
///
/// `next_message` is cancel-safe: bytes are only appended to the buffer once a
/// read has completed, so dropping the future mid-read loses nothing.
pub struct FrameReader<R> {
    reader: R,
    buffer: Vec<u8>,
    /// Start of the undecoded region of `buffer`.
    consumed: usize,
    /// Progress through the frame starting at `consumed`.
    scanner: FrameScanner,
    options: FrameOptions,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Wraps the read half of a stream.
    pub fn new(reader: R, options: FrameOptions) -> Self {
        Self {
            reader,
            buffer: Vec::new(),
            consumed: 0,
            scanner: FrameScanner::new(),
            options,
        }
    }

    /// Returns the next message, reading from the stream as needed.
    pub async fn next_message(&mut self) -> Result<Message, FrameError> {
        loop {
            let pending = &self.buffer[self.consumed..];
            match self.scanner.scan(pending)? {
                FrameScan::Complete(len) => {
                    self.check_size(len)?;
                    let Some((message, used)) = decode_one(&pending[..len])? else {
                        return Err(DecodeError::Malformed {
                            reason: "frame ended before its value".to_owned(),
                        }
                        .into());
                    };
                    self.consumed += used;
                    if self.consumed == self.buffer.len() {
                        self.buffer.clear();
                        self.consumed = 0;
                    }
                    return Ok(message);
                }
                FrameScan::Incomplete { needed } => {
                    self.check_size(pending.len() + needed)?;
                    self.fill().await?;
                }
            }
        }
    }

    /// Number of received bytes not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buffer.len() - self.consumed
    }

    /// Consumes the reader, returning the underlying stream half.
    pub fn into_inner(self) -> R {
        self.reader
    }

    fn check_size(&self, size: usize) -> Result<(), FrameError> {
        if size > self.options.max_frame_size {
            return Err(DecodeError::FrameTooLarge {
                size,
                max: self.options.max_frame_size,
            }
            .into());
        }
        Ok(())
    }

    async fn fill(&mut self) -> Result<(), FrameError> {
        if self.consumed > 0 {
            self.buffer.drain(..self.consumed);
            self.consumed = 0;
        }
        if self.buffer.capacity() - self.buffer.len() < MIN_READ_SPACE {
            self.buffer
                .reserve(self.options.buffer_size.max(MIN_READ_SPACE));
        }

        let read = self
            .reader
            .read_buf(&mut self.buffer)
            .await
            .map_err(FrameError::from_io)?;
        if read == 0 {
            return Err(FrameError::Closed {
                clean: self.buffer.is_empty(),
            });
        }

        trace!(read, buffered = self.buffer.len(), "filled receive buffer");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use protocol::{encode, MsgId, Notification, Request, Value};
    use tokio::io::AsyncWriteExt;

    use super::*;

    fn sample_request() -> Message {
        Request::new(
            MsgId::new(11),
            "echo",
            vec![Value::from("hello"), Value::from(3.5)],
        )
        .into()
    }

    #[tokio::test]
    async fn byte_at_a_time_yields_one_message_after_last_byte() {
        let message = sample_request();
        let bytes = encode(&message).unwrap();
        let (mut remote, local) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(local, FrameOptions::default());

        for (i, byte) in bytes.iter().enumerate() {
            remote.write_all(&[*byte]).await.unwrap();
            if i + 1 < bytes.len() {
                let early =
                    tokio::time::timeout(Duration::from_millis(5), reader.next_message()).await;
                assert!(early.is_err(), "message surfaced after {} bytes", i + 1);
            }
        }

        let decoded = reader.next_message().await.unwrap();
        assert_eq!(decoded, message);
        assert_eq!(reader.buffered(), 0);
    }

    #[tokio::test]
    async fn several_messages_in_one_segment_are_all_yielded() {
        let first = sample_request();
        let second: Message = Notification::new("tick", vec![]).into();
        let mut bytes = encode(&first).unwrap();
        bytes.extend(encode(&second).unwrap());

        let (mut remote, local) = tokio::io::duplex(4096);
        remote.write_all(&bytes).await.unwrap();
        drop(remote);

        let mut reader = FrameReader::new(local, FrameOptions::default());
        assert_eq!(reader.next_message().await.unwrap(), first);
        assert_eq!(reader.next_message().await.unwrap(), second);
        let end = reader.next_message().await.unwrap_err();
        assert!(end.is_clean_close());
    }

    #[tokio::test]
    async fn eof_inside_a_frame_is_unclean() {
        let bytes = encode(&sample_request()).unwrap();
        let (mut remote, local) = tokio::io::duplex(4096);
        remote.write_all(&bytes[..bytes.len() / 2]).await.unwrap();
        drop(remote);

        let mut reader = FrameReader::new(local, FrameOptions::default());
        let err = reader.next_message().await.unwrap_err();
        assert!(matches!(err, FrameError::Closed { clean: false }));
    }

    #[tokio::test]
    async fn oversized_partial_frame_is_rejected() {
        let message: Message =
            Notification::new("blob", vec![Value::Binary(vec![7; 200])]).into();
        let bytes = encode(&message).unwrap();
        let (mut remote, local) = tokio::io::duplex(4096);
        remote.write_all(&bytes[..100]).await.unwrap();

        let options = FrameOptions {
            buffer_size: 16,
            max_frame_size: 32,
        };
        let mut reader = FrameReader::new(local, options);
        let err = reader.next_message().await.unwrap_err();
        assert!(matches!(
            err,
            FrameError::Decode(DecodeError::FrameTooLarge { max: 32, .. })
        ));
    }

    #[tokio::test]
    async fn large_frame_in_small_segments_is_decoded_once_complete() {
        let payload = vec![0xab; 8 << 20];
        let message: Message = Notification::new("blob", vec![Value::Binary(payload)]).into();
        let bytes = encode(&message).unwrap();

        let (mut remote, local) = tokio::io::duplex(64 * 1024);
        let sender = tokio::spawn(async move {
            for chunk in bytes.chunks(64 * 1024) {
                remote.write_all(chunk).await.unwrap();
            }
            remote
        });

        let mut reader = FrameReader::new(local, FrameOptions::default());
        let decoded = tokio::time::timeout(Duration::from_secs(10), reader.next_message())
            .await
            .expect("chunked frame took too long to decode")
            .unwrap();
        assert_eq!(decoded, message);
        assert_eq!(reader.buffered(), 0);
        drop(sender.await.unwrap());
    }

    #[tokio::test]
    async fn declared_length_past_the_limit_is_rejected_early() {
        let message: Message =
            Notification::new("blob", vec![Value::Binary(vec![7; 10_000])]).into();
        let bytes = encode(&message).unwrap();
        let (mut remote, local) = tokio::io::duplex(4096);
        // Only the headers arrive; the declared bin length alone is too big.
        remote.write_all(&bytes[..16]).await.unwrap();

        let options = FrameOptions {
            buffer_size: 1024,
            max_frame_size: 1024,
        };
        let mut reader = FrameReader::new(local, options);
        let err = reader.next_message().await.unwrap_err();
        assert!(matches!(
            err,
            FrameError::Decode(DecodeError::FrameTooLarge { max: 1024, .. })
        ));
    }

    #[tokio::test]
    async fn garbage_is_a_decode_error() {
        let (mut remote, local) = tokio::io::duplex(4096);
        // A bare integer is valid MessagePack but not a message.
        remote.write_all(&[0x05]).await.unwrap();

        let mut reader = FrameReader::new(local, FrameOptions::default());
        let err = reader.next_message().await.unwrap_err();
        assert!(matches!(err, FrameError::Decode(DecodeError::NotAnArray)));
    }
}
