use bytes::BytesMut;
use serde::Serialize;
use thiserror::Error;

use sidedrop_core::channel::ByteChannel;
use sidedrop_core::protocol::{self, Frame, MessageType};

/// Read buffer size for draining the channel into the frame accumulator.
const READ_BUF_LEN: usize = 8 * 1024;

/// Error from [`FramedChannel::recv`].
///
/// Read failures and malformed frames are kept apart because callers
/// react differently: a read failure is a channel problem, a decode
/// failure is the remote peer violating the protocol.
#[derive(Debug, Error)]
pub enum RecvError {
    #[error("channel read failed")]
    Read(#[source] anyhow::Error),
    #[error("channel closed mid-frame ({pending} bytes pending)")]
    ClosedMidFrame { pending: usize },
    #[error("malformed frame")]
    Decode(#[source] anyhow::Error),
}

/// A [`ByteChannel`] with frame-level send/receive on top.
///
/// Owns the accumulation buffer, so partial frames left over from one
/// read survive into the next — the same drain discipline as the frame
/// codec's `Ok(None)` contract.
pub struct FramedChannel<C: ByteChannel> {
    channel: C,
    accum: BytesMut,
}

impl<C: ByteChannel> FramedChannel<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            accum: BytesMut::with_capacity(READ_BUF_LEN),
        }
    }

    /// Human-readable identifier of the remote end.
    pub fn peer(&self) -> String {
        self.channel.peer()
    }

    /// Sends one frame with a raw byte payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel write fails.
    pub async fn send(&mut self, msg_type: MessageType, payload: &[u8]) -> anyhow::Result<()> {
        let frame = protocol::encode_frame_to_bytes(msg_type, payload);
        self.channel.write_all(&frame).await
    }

    /// Sends one frame with a JSON-serialized payload.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the channel write fails.
    pub async fn send_payload<T: Serialize>(
        &mut self,
        msg_type: MessageType,
        payload: &T,
    ) -> anyhow::Result<()> {
        let frame = protocol::encode_payload_frame(msg_type, payload)?;
        self.channel.write_all(&frame).await
    }

    /// Receives the next complete frame.
    ///
    /// Returns `Ok(None)` when the remote end closed the channel cleanly
    /// between frames.
    ///
    /// # Errors
    ///
    /// [`RecvError::Read`] on channel failure, [`RecvError::ClosedMidFrame`]
    /// when the remote end closes in the middle of a frame (never a clean
    /// end of stream), [`RecvError::Decode`] when the peer sent bytes that
    /// do not decode.
    pub async fn recv(&mut self) -> Result<Option<Frame>, RecvError> {
        loop {
            if let Some(frame) = protocol::try_decode_frame(&mut self.accum).map_err(RecvError::Decode)? {
                return Ok(Some(frame));
            }

            let mut buf = [0u8; READ_BUF_LEN];
            let n = self.channel.read(&mut buf).await.map_err(RecvError::Read)?;
            if n == 0 {
                if self.accum.is_empty() {
                    return Ok(None);
                }
                return Err(RecvError::ClosedMidFrame {
                    pending: self.accum.len(),
                });
            }
            self.accum.extend_from_slice(&buf[..n]);
        }
    }

    /// Shuts down the write half of the underlying channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport-level shutdown fails.
    pub async fn shutdown(&mut self) -> anyhow::Result<()> {
        self.channel.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem;
    use sidedrop_core::protocol::BindPayload;

    #[tokio::test]
    async fn when_frame_sent_expect_same_frame_received() {
        let (a, b) = mem::channel_pair(64 * 1024);
        let mut tx = FramedChannel::new(a);
        let mut rx = FramedChannel::new(b);

        tx.send(MessageType::FileChunk, b"payload bytes").await.unwrap();

        let frame = rx.recv().await.unwrap().unwrap();
        assert_eq!(frame.header.msg_type, MessageType::FileChunk);
        assert_eq!(frame.payload, b"payload bytes");
    }

    #[tokio::test]
    async fn when_json_payload_sent_expect_decoded_payload_matches() {
        let (a, b) = mem::channel_pair(64 * 1024);
        let mut tx = FramedChannel::new(a);
        let mut rx = FramedChannel::new(b);

        let payload = BindPayload {
            token: "feedface".into(),
        };
        tx.send_payload(MessageType::Bind, &payload).await.unwrap();

        let frame = rx.recv().await.unwrap().unwrap();
        let decoded: BindPayload = protocol::decode_payload(&frame.payload).unwrap();
        assert_eq!(decoded, payload);
    }

    #[tokio::test]
    async fn when_channel_closed_between_frames_expect_none() {
        let (a, b) = mem::channel_pair(64 * 1024);
        let mut tx = FramedChannel::new(a);
        let mut rx = FramedChannel::new(b);

        tx.send(MessageType::FileDone, &[]).await.unwrap();
        tx.shutdown().await.unwrap();
        drop(tx);

        assert!(rx.recv().await.unwrap().is_some());
        assert!(rx.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn when_channel_closed_mid_frame_expect_read_error() {
        let (mut a, b) = mem::channel_pair(64 * 1024);
        let mut rx = FramedChannel::new(b);

        // Hand-write a header advertising more payload than will ever come.
        let full = protocol::encode_frame_to_bytes(MessageType::FileChunk, b"truncated payload");
        use sidedrop_core::channel::ByteChannel;
        a.write_all(&full[..full.len() - 4]).await.unwrap();
        a.shutdown().await.unwrap();
        drop(a);

        let err = rx.recv().await.unwrap_err();
        assert!(matches!(err, RecvError::ClosedMidFrame { .. }));
    }

    #[tokio::test]
    async fn when_garbage_bytes_arrive_expect_decode_error() {
        let (mut a, b) = mem::channel_pair(64 * 1024);
        let mut rx = FramedChannel::new(b);

        use sidedrop_core::channel::ByteChannel;
        a.write_all(b"GARBAGE GARBAGE GARBAGE").await.unwrap();

        let err = rx.recv().await.unwrap_err();
        assert!(matches!(err, RecvError::Decode(_)));
    }
}
