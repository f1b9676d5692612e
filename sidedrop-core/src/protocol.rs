use anyhow::{Result, bail, ensure};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

/// ASCII magic bytes that open every sidedrop frame.
const MAGIC: &[u8; 5] = b"SDROP";
/// Protocol version understood by this build.
const VERSION: u8 = 0x01;
/// Total header size: magic(5) + version(1) + type(1) + flags(2) + length(4).
const HEADER_LEN: usize = 13;
/// Upper bound on a single frame payload to protect against malicious peers.
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024;
/// Default size of one file chunk. Large enough to amortise per-frame
/// overhead, small enough to stay under typical channel buffering limits.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 5;
const OFF_TYPE: usize = 6;
const OFF_FLAGS: usize = 7;
const OFF_LENGTH: usize = 9;

/// Protocol-level message type codes (v1).
///
/// `Bind`/`BindAck` are exchanged once, immediately after the transport
/// reports the channel open, to tie the channel to a specific negotiation.
/// The transfer itself is `FileHeader`, any number of `FileChunk`s, and a
/// mandatory `FileDone` marker — completion is carried by that marker and
/// never inferred from channel-close timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Bind = 0x01,
    BindAck = 0x02,
    FileHeader = 0x10,
    FileChunk = 0x11,
    FileDone = 0x12,
}

impl TryFrom<u8> for MessageType {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Bind),
            0x02 => Ok(Self::BindAck),
            0x10 => Ok(Self::FileHeader),
            0x11 => Ok(Self::FileChunk),
            0x12 => Ok(Self::FileDone),
            other => bail!("unknown message type: 0x{other:02X}"),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(mt: MessageType) -> u8 {
        mt as u8
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub msg_type: MessageType,
    /// Reserved flags — MUST be `0x0000` in v1.
    pub flags: u16,
    pub payload_length: u32,
}

/// A fully decoded frame (header + payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Vec<u8>,
}

/// Attempts to decode one complete frame from the front of `buf`.
///
/// * `Ok(Some(frame))` — a full frame was present; its bytes have been consumed
///   from `buf`.
/// * `Ok(None)` — not enough bytes yet; `buf` is left untouched.  The caller
///   should read more data and try again.
/// * `Err(..)` — protocol violation (bad magic, unsupported version, unknown
///   message type, oversized payload).  The caller should close the channel.
///
/// # Errors
///
/// Returns an error on protocol violations: bad magic, unsupported version,
/// unknown message type, or payload exceeding [`MAX_PAYLOAD_LEN`].
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    ensure!(
        &buf[OFF_MAGIC..OFF_MAGIC + MAGIC.len()] == MAGIC,
        "bad magic: expected SDROP"
    );

    let version = buf[OFF_VERSION];
    ensure!(version == VERSION, "unsupported version: 0x{version:02X}");

    let msg_type = MessageType::try_from(buf[OFF_TYPE])?;

    // These slices are exactly 2 and 4 bytes respectively (guaranteed by
    // the HEADER_LEN check above), so the conversions cannot fail.
    let flags = u16::from_be_bytes(
        buf[OFF_FLAGS..OFF_FLAGS + 2]
            .try_into()
            .expect("flags slice is exactly 2 bytes"),
    );

    let payload_len = u32::from_be_bytes(
        buf[OFF_LENGTH..OFF_LENGTH + 4]
            .try_into()
            .expect("length slice is exactly 4 bytes"),
    ) as usize;

    ensure!(
        payload_len <= MAX_PAYLOAD_LEN,
        "payload too large: {payload_len} bytes (max {MAX_PAYLOAD_LEN})"
    );

    if buf.len() < HEADER_LEN + payload_len {
        return Ok(None);
    }

    buf.advance(HEADER_LEN);
    let payload = buf.split_to(payload_len).to_vec();

    let header = Header {
        version,
        msg_type,
        flags,
        #[allow(clippy::cast_possible_truncation)] // guarded by MAX_PAYLOAD_LEN (fits in u32)
        payload_length: payload_len as u32,
    };

    Ok(Some(Frame { header, payload }))
}

/// Encodes a frame into `buf`.
///
/// Appends the 13-byte header followed by `payload` to the buffer.
pub fn encode_frame(msg_type: MessageType, payload: &[u8], buf: &mut BytesMut) {
    buf.reserve(HEADER_LEN + payload.len());
    buf.put_slice(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u8(msg_type.into());
    buf.put_u16(0x0000);
    #[allow(clippy::cast_possible_truncation)] // frame payloads are bounded by MAX_PAYLOAD_LEN
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
}

/// Convenience wrapper that allocates and returns a new `BytesMut`.
#[must_use]
pub fn encode_frame_to_bytes(msg_type: MessageType, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    encode_frame(msg_type, payload, &mut buf);
    buf
}

// ── JSON payload types ──────────────────────────────────────────────

/// Payload for [`MessageType::Bind`] (offerer → answerer).
///
/// Carries the answer's token so the answerer can confirm the inbound
/// channel belongs to the negotiation it produced an answer for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindPayload {
    pub token: String,
}

/// Payload for [`MessageType::FileHeader`] (sender → receiver).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeaderPayload {
    pub file_name: String,
    pub size_bytes: u64,
}

/// Encodes a serializable payload into a protocol frame stored in a new
/// [`BytesMut`].
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn encode_payload_frame<T: Serialize>(msg_type: MessageType, payload: &T) -> Result<BytesMut> {
    let json = serde_json::to_vec(payload)?;
    Ok(encode_frame_to_bytes(msg_type, &json))
}

/// Decodes a frame's payload bytes into the requested type.
///
/// # Errors
///
/// Returns an error if the payload is not valid JSON or does not match `T`.
pub fn decode_payload<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Given a frame with an empty payload, when encoded and decoded, then the header and payload match.
    #[test]
    fn given_empty_payload_when_round_tripped_then_frame_matches() {
        let encoded = encode_frame_to_bytes(MessageType::FileDone, &[]);
        let mut buf = encoded;
        let frame = try_decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header.msg_type, MessageType::FileDone);
        assert_eq!(frame.header.version, VERSION);
        assert_eq!(frame.header.flags, 0);
        assert_eq!(frame.header.payload_length, 0);
        assert!(frame.payload.is_empty());
        assert!(buf.is_empty());
    }

    /// Given a frame with a raw byte payload, when encoded and decoded, then the payload matches.
    #[test]
    fn given_chunk_payload_when_round_tripped_then_frame_matches() {
        let chunk = b"some file bytes, not JSON";
        let encoded = encode_frame_to_bytes(MessageType::FileChunk, chunk);
        let mut buf = encoded;
        let frame = try_decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header.msg_type, MessageType::FileChunk);
        #[allow(clippy::cast_possible_truncation)]
        let expected_len = chunk.len() as u32;
        assert_eq!(frame.header.payload_length, expected_len);
        assert_eq!(frame.payload, chunk);
        assert!(buf.is_empty());
    }

    /// Given two frames back to back in one buffer, when decoded, then both come out in order.
    #[test]
    fn given_two_frames_when_decoded_then_both_returned_in_order() {
        let mut buf = encode_frame_to_bytes(MessageType::FileChunk, b"first");
        encode_frame(MessageType::FileDone, &[], &mut buf);

        let first = try_decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(first.header.msg_type, MessageType::FileChunk);
        assert_eq!(first.payload, b"first");

        let second = try_decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(second.header.msg_type, MessageType::FileDone);
        assert!(buf.is_empty());
    }

    /// Given a buffer with only a partial header, when decoding, then None is returned and the buffer is untouched.
    #[test]
    fn given_partial_header_when_decoded_then_returns_none() {
        let full = encode_frame_to_bytes(MessageType::Bind, b"{}");
        let mut buf = BytesMut::from(&full[..7]); // only 7 of 13 header bytes
        assert!(try_decode_frame(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 7);
    }

    /// Given a complete header but truncated payload, when decoding, then None is returned and the buffer is untouched.
    #[test]
    fn given_truncated_payload_when_decoded_then_returns_none() {
        let payload = b"hello world";
        let full = encode_frame_to_bytes(MessageType::FileChunk, payload);
        // Give the full header + half the payload.
        let partial_len = HEADER_LEN + payload.len() / 2;
        let mut buf = BytesMut::from(&full[..partial_len]);
        assert!(try_decode_frame(&mut buf).unwrap().is_none());
    }

    /// Given a frame with invalid magic bytes, when decoded, then an error is returned.
    #[test]
    fn given_bad_magic_when_decoded_then_returns_error() {
        let mut buf = BytesMut::from(&b"XXXXX\x01\x01\x00\x00\x00\x00\x00\x00"[..]);
        let err = try_decode_frame(&mut buf).unwrap_err();
        assert!(err.to_string().contains("bad magic"));
    }

    /// Given a frame with an unsupported version, when decoded, then an error is returned.
    #[test]
    fn given_unsupported_version_when_decoded_then_returns_error() {
        let mut buf = BytesMut::from(&b"SDROP\xFF\x01\x00\x00\x00\x00\x00\x00"[..]);
        let err = try_decode_frame(&mut buf).unwrap_err();
        assert!(err.to_string().contains("unsupported version"));
    }

    /// Given a frame with an unknown message type, when decoded, then an error is returned.
    #[test]
    fn given_unknown_message_type_when_decoded_then_returns_error() {
        let mut buf = BytesMut::from(&b"SDROP\x01\xFE\x00\x00\x00\x00\x00\x00"[..]);
        let err = try_decode_frame(&mut buf).unwrap_err();
        assert!(err.to_string().contains("unknown message type"));
    }

    /// Given a header advertising an oversized payload, when decoded, then an error is returned.
    #[test]
    fn given_oversized_payload_length_when_decoded_then_returns_error() {
        let mut buf = BytesMut::new();
        buf.put_slice(MAGIC);
        buf.put_u8(VERSION);
        buf.put_u8(MessageType::FileChunk.into());
        buf.put_u16(0x0000);
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32((MAX_PAYLOAD_LEN + 1) as u32);
        let err = try_decode_frame(&mut buf).unwrap_err();
        assert!(err.to_string().contains("payload too large"));
    }

    /// Given every defined message type code, when converted to u8 and back, then the original variant is preserved.
    #[test]
    fn given_all_message_types_when_converted_to_u8_and_back_then_match() {
        let types = [
            (0x01, MessageType::Bind),
            (0x02, MessageType::BindAck),
            (0x10, MessageType::FileHeader),
            (0x11, MessageType::FileChunk),
            (0x12, MessageType::FileDone),
        ];
        for (code, expected) in types {
            let parsed = MessageType::try_from(code).unwrap();
            assert_eq!(parsed, expected);
            assert_eq!(u8::from(parsed), code);
        }
    }

    // ── Payload round-trip tests ────────────────────────────────────

    /// Given a BindPayload, when encoded as a frame and decoded, then the payload round-trips.
    #[test]
    fn given_bind_payload_when_encoded_as_frame_then_frame_round_trips() {
        let payload = BindPayload {
            token: "c0ffee00c0ffee00c0ffee00c0ffee00".into(),
        };
        let frame_bytes = encode_payload_frame(MessageType::Bind, &payload).unwrap();
        let mut buf = frame_bytes;
        let frame = try_decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header.msg_type, MessageType::Bind);
        let decoded: BindPayload = decode_payload(&frame.payload).unwrap();
        assert_eq!(decoded, payload);
    }

    /// Given a FileHeaderPayload, when encoded as a frame and decoded, then the payload round-trips.
    #[test]
    fn given_file_header_payload_when_encoded_as_frame_then_frame_round_trips() {
        let payload = FileHeaderPayload {
            file_name: "photo.jpg".into(),
            size_bytes: 1_048_576,
        };
        let frame_bytes = encode_payload_frame(MessageType::FileHeader, &payload).unwrap();
        let mut buf = frame_bytes;
        let frame = try_decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header.msg_type, MessageType::FileHeader);
        let decoded: FileHeaderPayload = decode_payload(&frame.payload).unwrap();
        assert_eq!(decoded, payload);
    }

    /// Given invalid JSON bytes, when decoded as FileHeaderPayload, then an error is returned.
    #[test]
    fn given_invalid_json_when_decoded_then_returns_error() {
        let bad_json = b"not json at all";
        let result = decode_payload::<FileHeaderPayload>(bad_json);
        assert!(result.is_err());
    }

    /// Given JSON with the wrong shape, when decoded as BindPayload, then an error is returned.
    #[test]
    fn given_wrong_shape_json_when_decoded_then_returns_error() {
        let json = br#"{"file_name":"oops","size_bytes":1}"#;
        let result = decode_payload::<BindPayload>(json);
        assert!(result.is_err());
    }
}
