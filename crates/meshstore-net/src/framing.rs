//! Wire framing for the connection core (spec §4.8, §6 "Wire protocol")
//!
//! Frames are length-prefixed the way the teacher's net crate frames onion
//! cells: 4-byte big-endian length (including the type byte) + 1 type byte +
//! payload. Unlike the teacher, payloads here are JSON text or raw binary
//! rather than `postcard`-encoded protocol structs — the spec's wire protocol
//! is JSON text frames with binary frames only after encryption is
//! established (§6).

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge(usize),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown frame type byte: {0}")]
    UnknownType(u8),
}

/// The four frame kinds the connection core exchanges (spec §4.8): text and
/// binary payload frames, plus ping/pong for keepalive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Text = 0,
    Binary = 1,
    Ping = 2,
    Pong = 3,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Text),
            1 => Ok(Self::Binary),
            2 => Ok(Self::Ping),
            3 => Ok(Self::Pong),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self { frame_type, payload }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(FrameType::Text, text.into().into_bytes())
    }

    pub fn binary(bytes: Vec<u8>) -> Self {
        Self::new(FrameType::Binary, bytes)
    }

    pub fn ping() -> Self {
        Self::new(FrameType::Ping, Vec::new())
    }

    pub fn pong() -> Self {
        Self::new(FrameType::Pong, Vec::new())
    }

    /// The payload decoded as UTF-8 text, for `Text`/`Ping`/`Pong` frames.
    pub fn as_text(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.payload)
    }
}

/// Length-prefixed frame codec: `u32 BE length (includes type byte) | u8 type | payload`.
#[derive(Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 5 {
            return Ok(None);
        }
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length == 0 || length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }
        if src.len() < 4 + length {
            return Ok(None);
        }

        src.advance(4);
        let frame_type = FrameType::try_from(src[0])?;
        src.advance(1);
        let payload = src.split_to(length - 1).to_vec();
        Ok(Some(Frame { frame_type, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = 1 + item.payload.len();
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }
        dst.put_u32(length as u32);
        dst.put_u8(item.frame_type as u8);
        dst.put_slice(&item.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_frame_round_trips() {
        let mut codec = FrameCodec;
        let frame = Frame::text("hello friend");

        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn decode_waits_for_full_frame() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(Frame::binary(vec![1, 2, 3, 4, 5]), &mut buf).unwrap();

        let mut partial = buf.split_to(3);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn unknown_type_byte_is_rejected() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(2);
        buf.put_u8(99);
        buf.put_u8(0);
        assert!(matches!(codec.decode(&mut buf), Err(FrameError::UnknownType(99))));
    }
}
