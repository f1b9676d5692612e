use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, info, warn};

use sidedrop_core::channel::ByteChannel;
use sidedrop_core::protocol::{self, FileHeaderPayload, Frame, MessageType};

use crate::framed::{FramedChannel, RecvError};
use crate::session::{Session, SessionState};

/// Errors from the chunked transfer protocol.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The session has no open channel to move bytes over.
    #[error("session is not connected")]
    NotConnected,

    /// A frame could not be written; the transfer is aborted and the
    /// session fails. Callers reconnect and restart from the beginning —
    /// there is no partial resume.
    #[error("channel write failed mid-transfer")]
    ChannelWrite(#[source] anyhow::Error),

    /// A read from the channel failed mid-transfer.
    #[error("channel read failed mid-transfer")]
    ChannelRead(#[source] anyhow::Error),

    /// The peer sent a frame the protocol does not allow here.
    #[error("transfer protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    /// The channel closed before the end-of-transfer marker arrived.
    /// Never reported as success — completion is carried only by the
    /// marker.
    #[error("channel closed before end-of-transfer marker ({received} bytes received)")]
    IncompleteTransfer { received: u64 },
}

/// A fully reassembled inbound artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub file_name: String,
    pub bytes: Bytes,
}

/// Sends `bytes` as one file over a connected session.
///
/// Emits a `FileHeader` frame, the payload split into
/// [`SessionConfig::chunk_size`](crate::session::SessionConfig) chunks
/// strictly in order, then the mandatory `FileDone` marker. Returns the
/// number of payload bytes sent.
///
/// # Errors
///
/// [`TransferError::NotConnected`] outside `Connected`;
/// [`TransferError::ChannelWrite`] if any frame fails to go out — the
/// session is driven to `Failed`, since the stream position is no longer
/// knowable.
pub async fn send_file<S: Session>(
    session: &mut S,
    bytes: &[u8],
    file_name: &str,
) -> Result<u64, TransferError> {
    if session.state() != SessionState::Connected {
        return Err(TransferError::NotConnected);
    }
    // A chunk is one frame payload, so it can never exceed the codec bound.
    let chunk_size = session
        .config()
        .chunk_size
        .clamp(1, protocol::MAX_PAYLOAD_LEN);
    let Some(framed) = session.framed_mut() else {
        return Err(TransferError::NotConnected);
    };

    match send_frames(framed, bytes, file_name, chunk_size).await {
        Ok(()) => {
            info!(
                file = %file_name,
                size = bytes.len(),
                "Transfer complete"
            );
            Ok(bytes.len() as u64)
        }
        Err(e) => {
            warn!(file = %file_name, error = %e, "Transfer aborted");
            session.mark_failed();
            Err(TransferError::ChannelWrite(e))
        }
    }
}

async fn send_frames<C: ByteChannel>(
    framed: &mut FramedChannel<C>,
    bytes: &[u8],
    file_name: &str,
    chunk_size: usize,
) -> anyhow::Result<()> {
    let header = FileHeaderPayload {
        file_name: file_name.to_string(),
        size_bytes: bytes.len() as u64,
    };
    framed.send_payload(MessageType::FileHeader, &header).await?;

    for chunk in bytes.chunks(chunk_size) {
        // write_all resolves only once the transport takes the bytes, so
        // a slow reader stalls us here instead of growing a queue.
        framed.send(MessageType::FileChunk, chunk).await?;
    }

    framed.send(MessageType::FileDone, &[]).await?;
    Ok(())
}

/// Outcome of feeding one frame to a [`TransferState`].
#[derive(Debug)]
pub enum FrameOutcome {
    /// Frame consumed; the transfer continues.
    Accepted,
    /// The end-of-transfer marker arrived; the artifact is final.
    Completed(ReceivedFile),
}

/// Reassembly state for one inbound transfer.
///
/// Pure and synchronous — frames go in via [`on_frame`](Self::on_frame)
/// in arrival order, and the completed artifact comes out exactly once.
/// The async plumbing around it lives in [`receive_file`].
#[derive(Debug, Default)]
pub struct TransferState {
    file_name: Option<String>,
    expected_size: Option<u64>,
    buffers: Vec<Bytes>,
    received: u64,
    complete: bool,
}

impl TransferState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Payload bytes accumulated so far.
    #[must_use]
    pub fn received(&self) -> u64 {
        self.received
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Feeds the next frame, in arrival order.
    ///
    /// # Errors
    ///
    /// [`TransferError::ProtocolViolation`] for any frame the sequence
    /// does not allow: data before the header, a second header, bind
    /// frames mid-transfer, or anything at all after completion.
    pub fn on_frame(&mut self, frame: &Frame) -> Result<FrameOutcome, TransferError> {
        if self.complete {
            return Err(violation("frame received after completed transfer"));
        }

        match frame.header.msg_type {
            MessageType::FileHeader => {
                if self.file_name.is_some() {
                    return Err(violation("second file header in one transfer"));
                }
                let header: FileHeaderPayload = protocol::decode_payload(&frame.payload)
                    .map_err(|e| violation(&format!("bad file header: {e}")))?;
                debug!(file = %header.file_name, size = header.size_bytes, "Transfer started");
                self.file_name = Some(header.file_name);
                self.expected_size = Some(header.size_bytes);
                Ok(FrameOutcome::Accepted)
            }

            MessageType::FileChunk => {
                if self.file_name.is_none() {
                    return Err(violation("file chunk before file header"));
                }
                // An empty chunk is a harmless no-op: completion is
                // carried by FileDone alone, never by chunk emptiness.
                if !frame.payload.is_empty() {
                    self.received += frame.payload.len() as u64;
                    self.buffers.push(Bytes::copy_from_slice(&frame.payload));
                }
                Ok(FrameOutcome::Accepted)
            }

            MessageType::FileDone => {
                let Some(file_name) = self.file_name.take() else {
                    return Err(violation("end-of-transfer marker before file header"));
                };
                if let Some(expected) = self.expected_size
                    && expected != self.received
                {
                    warn!(
                        expected,
                        received = self.received,
                        "Transfer size differs from advertised size"
                    );
                }
                let bytes = self.finalize();
                self.complete = true;
                Ok(FrameOutcome::Completed(ReceivedFile { file_name, bytes }))
            }

            MessageType::Bind | MessageType::BindAck => {
                Err(violation("bind frame during transfer"))
            }
        }
    }

    /// Concatenates the accumulated buffers into the final artifact.
    /// Runs at most once — guarded by the `complete` flag in `on_frame`.
    fn finalize(&mut self) -> Bytes {
        #[allow(clippy::cast_possible_truncation)]
        let mut out = BytesMut::with_capacity(self.received as usize);
        for buffer in self.buffers.drain(..) {
            out.extend_from_slice(&buffer);
        }
        out.freeze()
    }
}

fn violation(reason: &str) -> TransferError {
    TransferError::ProtocolViolation {
        reason: reason.to_string(),
    }
}

/// Receives one file over a connected session.
///
/// Reads frames in arrival order and feeds them to a [`TransferState`]
/// until the end-of-transfer marker. Any failure — read error, protocol
/// violation, or the channel closing early — drives the session to
/// `Failed`.
///
/// # Errors
///
/// [`TransferError::NotConnected`] outside `Connected`;
/// [`TransferError::IncompleteTransfer`] if the channel closes before
/// the marker; [`TransferError::ChannelRead`] /
/// [`TransferError::ProtocolViolation`] as reported by the channel and
/// the reassembly state machine.
pub async fn receive_file<S: Session>(session: &mut S) -> Result<ReceivedFile, TransferError> {
    if session.state() != SessionState::Connected {
        return Err(TransferError::NotConnected);
    }
    let Some(framed) = session.framed_mut() else {
        return Err(TransferError::NotConnected);
    };

    match receive_frames(framed).await {
        Ok(file) => {
            info!(file = %file.file_name, size = file.bytes.len(), "Transfer received");
            Ok(file)
        }
        Err(e) => {
            warn!(error = %e, "Transfer failed");
            session.mark_failed();
            Err(e)
        }
    }
}

async fn receive_frames<C: ByteChannel>(
    framed: &mut FramedChannel<C>,
) -> Result<ReceivedFile, TransferError> {
    let mut state = TransferState::new();
    loop {
        match framed.recv().await {
            Ok(Some(frame)) => match state.on_frame(&frame)? {
                FrameOutcome::Accepted => {}
                FrameOutcome::Completed(file) => return Ok(file),
            },
            Ok(None) => {
                return Err(TransferError::IncompleteTransfer {
                    received: state.received(),
                });
            }
            Err(RecvError::Read(e)) => {
                return Err(TransferError::ChannelRead(e));
            }
            Err(RecvError::ClosedMidFrame { .. }) => {
                // The marker never arrived; a torn frame is still a close.
                return Err(TransferError::IncompleteTransfer {
                    received: state.received(),
                });
            }
            Err(RecvError::Decode(e)) => {
                return Err(TransferError::ProtocolViolation {
                    reason: e.to_string(),
                });
            }
        }
    }
}
