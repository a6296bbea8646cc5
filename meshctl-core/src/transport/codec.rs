// Copyright 2026. The meshctl Community
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! Wire frame and its `tokio_util::codec` implementation (§6):
//!
//! ```text
//! [varInt length][varInt channelId][varInt packetUniqueId | 0 if none][payload]
//! ```
//!
//! `length` covers everything after itself (channelId + packetUniqueId +
//! payload), so a decoder can tell whether a full frame is buffered before
//! parsing the rest.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Reserved channel ids, stable across versions (§6).
pub mod channel_ids {
    pub const AUTH: u32 = 0;
    pub const CHUNKED_TRANSFER: u32 = 1;
    pub const CHANNEL_MESSAGE: u32 = 2;
    pub const QUERY_RESPONSE: u32 = 3;
    pub const SERVICE_SYNC_ACK: u32 = 4;
    /// First channel id available for ad-hoc listener registrations (agent
    /// screen-forwarding sessions, chunked-transfer session channels, ...).
    pub const FIRST_DYNAMIC: u32 = 16;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("frame exceeds the maximum frame size ({0} bytes)")]
    FrameTooLarge(usize),
    #[error("malformed varint")]
    MalformedVarint,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("channel closed")]
    ChannelClosed,
    #[error("no listener registered for channel {0}")]
    NoListener(u32),
}

/// Frames larger than this must go through chunked transfer (§4.6 default
/// 50 MiB budget).
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel_id: u32,
    pub packet_unique_id: u64,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(channel_id: u32, payload: impl Into<Bytes>) -> Self {
        Self { channel_id, packet_unique_id: 0, payload: payload.into() }
    }

    pub fn with_packet_id(channel_id: u32, packet_unique_id: u64, payload: impl Into<Bytes>) -> Self {
        Self { channel_id, packet_unique_id, payload: payload.into() }
    }
}

pub fn encode_varint(mut value: u64, out: &mut BytesMut) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

pub fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value > 0x7f {
        value >>= 7;
        len += 1;
    }
    len
}

/// Attempts to decode a varint from the front of `buf` without consuming it
/// on failure. Returns `Ok(None)` if more bytes are needed.
fn peek_varint(buf: &[u8]) -> Result<Option<(u64, usize)>, TransportError> {
    let mut value: u64 = 0;
    for (i, byte) in buf.iter().enumerate().take(10) {
        value |= ((byte & 0x7f) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= 10 {
        return Err(TransportError::MalformedVarint);
    }
    Ok(None)
}

#[derive(Debug, Default)]
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frame.payload.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge(frame.payload.len()));
        }
        let mut body = BytesMut::with_capacity(16 + frame.payload.len());
        encode_varint(frame.channel_id as u64, &mut body);
        encode_varint(frame.packet_unique_id, &mut body);
        body.extend_from_slice(&frame.payload);

        encode_varint(body.len() as u64, dst);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (length, length_bytes) = match peek_varint(src)? {
            Some(v) => v,
            None => return Ok(None),
        };
        let length = length as usize;
        if length > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge(length));
        }
        if src.len() < length_bytes + length {
            src.reserve(length_bytes + length - src.len());
            return Ok(None);
        }

        src.advance(length_bytes);
        let mut body = src.split_to(length);

        let (channel_id, n) = peek_varint(&body)?.ok_or(TransportError::MalformedVarint)?;
        body.advance(n);
        let (packet_unique_id, n) = peek_varint(&body)?.ok_or(TransportError::MalformedVarint)?;
        body.advance(n);

        Ok(Some(Frame {
            channel_id: channel_id as u32,
            packet_unique_id,
            payload: body.freeze(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_round_trips_across_byte_boundaries() {
        for value in [0u64, 1, 127, 128, 300, 16384, u32::MAX as u64, u64::MAX] {
            let mut buf = BytesMut::new();
            encode_varint(value, &mut buf);
            assert_eq!(buf.len(), varint_len(value));
            let (decoded, n) = peek_varint(&buf).unwrap().unwrap();
            assert_eq!(decoded, value);
            assert_eq!(n, buf.len());
        }
    }

    #[test]
    fn frame_round_trips_through_codec() {
        let mut codec = FrameCodec;
        let frame = Frame::with_packet_id(2, 42, Bytes::from_static(b"hello world"));
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_waits_for_more_bytes_when_frame_is_incomplete() {
        let mut codec = FrameCodec;
        let frame = Frame::new(channel_ids::CHANNEL_MESSAGE, Bytes::from_static(b"partial payload"));
        let mut full = BytesMut::new();
        codec.encode(frame, &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 3]);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);
    }

    #[test]
    fn two_frames_back_to_back_decode_independently() {
        let mut codec = FrameCodec;
        let a = Frame::new(channel_ids::AUTH, Bytes::from_static(b"a"));
        let b = Frame::new(channel_ids::CHANNEL_MESSAGE, Bytes::from_static(b"bb"));
        let mut buf = BytesMut::new();
        codec.encode(a.clone(), &mut buf).unwrap();
        codec.encode(b.clone(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(a));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(b));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        encode_varint((MAX_FRAME_SIZE + 1) as u64, &mut buf);
        assert!(matches!(codec.decode(&mut buf), Err(TransportError::FrameTooLarge(_))));
    }
}
