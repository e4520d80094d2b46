use protocol::{encode_into, Message};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::FrameError;

/// Writes encoded messages to a byte stream.
///
/// Encodes into a reusable scratch buffer, then writes and flushes it so each
/// message reaches the socket before `write_message` returns.
pub struct FrameWriter<W> {
    writer: W,
    scratch: Vec<u8>,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    /// Wraps the write half of a stream.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            scratch: Vec::new(),
        }
    }

    /// Encodes and sends one message.
    pub async fn write_message(&mut self, message: &Message) -> Result<(), FrameError> {
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        encode_into(message, &mut scratch)?;

        let written = self.write_frame(&scratch).await;
        self.scratch = scratch;
        written?;

        trace!(message_type = %message.message_type(), "wrote message");
        Ok(())
    }

    /// Sends bytes that already hold exactly one encoded message.
    ///
    /// Not cancel-safe: dropping the future mid-write leaves a partial frame
    /// on the stream. Callers that may be cancelled should hand frames to a
    /// task that owns the writer.
    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<(), FrameError> {
        self.writer
            .write_all(frame)
            .await
            .map_err(FrameError::from_io)?;
        self.writer.flush().await.map_err(FrameError::from_io)?;

        trace!(bytes = frame.len(), "wrote frame");
        Ok(())
    }

    /// Shuts down the write direction, signalling EOF to the peer.
    pub async fn shutdown(&mut self) -> Result<(), FrameError> {
        self.writer.shutdown().await.map_err(FrameError::from_io)
    }

    /// Consumes the writer, returning the underlying stream half.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use protocol::{MsgId, Response, Value};

    use super::*;
    use crate::{split, FrameOptions};

    #[tokio::test]
    async fn written_messages_are_read_back_in_order() {
        let (near, far) = tokio::io::duplex(4096);
        let (_, mut writer) = split(near, FrameOptions::default());
        let (mut reader, _) = split(far, FrameOptions::default());

        let messages: Vec<Message> = (0..3)
            .map(|i| Response::success(MsgId::new(i), Value::from(i * 10)).into())
            .collect();
        for message in &messages {
            writer.write_message(message).await.unwrap();
        }

        for expected in &messages {
            assert_eq!(&reader.next_message().await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn pre_encoded_frames_are_read_back() {
        let (near, far) = tokio::io::duplex(4096);
        let (_, mut writer) = split(near, FrameOptions::default());
        let (mut reader, _) = split(far, FrameOptions::default());

        let message: Message = Response::success(MsgId::new(4), Value::from("ok")).into();
        let frame = protocol::encode(&message).unwrap();
        writer.write_frame(&frame).await.unwrap();

        assert_eq!(reader.next_message().await.unwrap(), message);
    }

    #[tokio::test]
    async fn shutdown_is_a_clean_close_for_the_peer() {
        let (near, far) = tokio::io::duplex(4096);
        let (_near_reader, mut writer) = split(near, FrameOptions::default());
        let (mut reader, _far_writer) = split(far, FrameOptions::default());

        writer
            .write_message(&Response::success(MsgId::new(1), Value::Nil).into())
            .await
            .unwrap();
        writer.shutdown().await.unwrap();

        assert!(reader.next_message().await.is_ok());
        assert!(reader.next_message().await.unwrap_err().is_clean_close());
    }
}
