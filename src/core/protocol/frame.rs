// src/core/protocol/frame.rs

//! Implements the control-plane wire frame and the corresponding `Encoder`
//! and `Decoder` for network communication.
//!
//! Every frame is `[u32 length][u32 type hash][payload]`, all integers
//! big-endian. The length covers the type hash plus the payload. The type
//! hash is the CRC-32 of the stable message name; payloads are opaque at
//! this layer.

use crate::core::ShardError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Size of the length prefix.
const LENGTH_PREFIX: usize = 4;
/// Size of the type-hash header inside the length-counted region.
const TYPE_HASH_LEN: usize = 4;

// Protocol-level limit to prevent denial-of-service from malicious or
// malformed frames. Control-plane messages are small; anything near this
// limit is a fault.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB

/// A single frame on a control-plane connection: a message-type hash plus an
/// opaque payload. This is the lowest-level unit exchanged between peers.
#[derive(Debug, Clone, PartialEq)]
pub struct WireFrame {
    pub type_hash: u32,
    pub payload: Bytes,
}

impl WireFrame {
    pub fn new(type_hash: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            type_hash,
            payload: payload.into(),
        }
    }

    /// A convenience method to encode a frame into a `Vec<u8>`.
    /// Useful where a complete byte vector is needed (datagram segments, tests).
    pub fn encode_to_vec(&self) -> Result<Vec<u8>, ShardError> {
        let mut buf = BytesMut::new();
        FrameCodec.encode(self.clone(), &mut buf)?;
        Ok(buf.to_vec())
    }

    /// Decodes a single frame from a complete byte slice.
    pub fn decode_from_slice(bytes: &[u8]) -> Result<Self, ShardError> {
        let mut buf = BytesMut::from(bytes);
        match FrameCodec.decode(&mut buf)? {
            Some(frame) if buf.is_empty() => Ok(frame),
            Some(_) => Err(ShardError::InvalidRequest(
                "trailing bytes after frame".to_string(),
            )),
            None => Err(ShardError::IncompleteData),
        }
    }
}

/// A `tokio_util::codec` implementation for encoding and decoding `WireFrame`s.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Encoder<WireFrame> for FrameCodec {
    type Error = ShardError;

    fn encode(&mut self, item: WireFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body_len = TYPE_HASH_LEN + item.payload.len();
        if body_len > MAX_FRAME_SIZE {
            return Err(ShardError::FrameTooLarge(body_len));
        }
        dst.reserve(LENGTH_PREFIX + body_len);
        dst.put_u32(body_len as u32);
        dst.put_u32(item.type_hash);
        dst.extend_from_slice(&item.payload);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = WireFrame;
    type Error = ShardError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let mut len_bytes = [0u8; LENGTH_PREFIX];
        len_bytes.copy_from_slice(&src[..LENGTH_PREFIX]);
        let body_len = u32::from_be_bytes(len_bytes) as usize;

        if body_len < TYPE_HASH_LEN {
            return Err(ShardError::InvalidRequest(format!(
                "frame body too short ({body_len} bytes)"
            )));
        }
        if body_len > MAX_FRAME_SIZE {
            return Err(ShardError::FrameTooLarge(body_len));
        }

        if src.len() < LENGTH_PREFIX + body_len {
            // Reserve what we know is coming to avoid repeated reallocation.
            src.reserve(LENGTH_PREFIX + body_len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        let type_hash = src.get_u32();
        let payload = src.split_to(body_len - TYPE_HASH_LEN).freeze();

        Ok(Some(WireFrame { type_hash, payload }))
    }
}
