//! Length-prefixed framing.
//!
//! A frame is a 4-byte big-endian length `N` followed by `N` body bytes. The
//! codec is stateless apart from its size limit; partial frames stay in the
//! caller's [`Buffer`] until the rest arrives.
//!
//! # Invariants
//!
//! - Decoding never consumes a partial frame.
//! - A declared length outside `[0, max_frame_size]` is rejected before any
//!   allocation sized by it.

use bytes::{BufMut, Bytes};
use serde::Serialize;

use crate::{
    Buffer,
    errors::{ProtocolError, Result},
};

/// Size of the length prefix.
pub const HEADER_SIZE: usize = 4;

/// Maximum frame body size (2 MiB).
pub const MAX_FRAME_SIZE: usize = 2 * 1024 * 1024;

/// Encoder/decoder for length-prefixed frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl FrameCodec {
    /// Create a codec accepting bodies up to `max_frame_size` bytes.
    ///
    /// The limit is capped at `i32::MAX` since lengths travel as `i32`.
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size: max_frame_size.min(i32::MAX as usize) }
    }

    /// Largest accepted body size.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Write `body` as one frame.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::FrameTooLarge` if the body exceeds the limit
    pub fn encode(&self, body: &[u8], dst: &mut impl BufMut) -> Result<()> {
        if body.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: body.len(),
                max: self.max_frame_size,
            });
        }

        dst.put_i32(body.len() as i32);
        dst.put_slice(body);
        Ok(())
    }

    /// Serialize `value` as JSON and write it as one frame.
    pub fn encode_json<T: Serialize + ?Sized>(
        &self,
        value: &T,
        dst: &mut impl BufMut,
    ) -> Result<()> {
        let body = serde_json::to_vec(value).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        self.encode(&body, dst)
    }

    /// Append `body` as one frame to a [`Buffer`].
    pub fn encode_into(&self, body: &[u8], dst: &mut Buffer) -> Result<()> {
        let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
        self.encode(body, &mut frame)?;
        dst.append(&frame);
        Ok(())
    }

    /// Take the next complete frame body out of `src`.
    ///
    /// Returns `Ok(None)` when fewer than a full frame's bytes are buffered;
    /// nothing is consumed in that case.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::InvalidLength` if the header declares a negative or
    ///   oversized length. The header is left in place; the stream is
    ///   unrecoverable.
    pub fn decode(&self, src: &mut Buffer) -> Result<Option<Bytes>> {
        let Some(declared) = src.peek_i32() else {
            return Ok(None);
        };

        let len = usize::try_from(declared)
            .ok()
            .filter(|len| *len <= self.max_frame_size)
            .ok_or(ProtocolError::InvalidLength { declared, max: self.max_frame_size })?;

        if src.readable_bytes() < HEADER_SIZE + len {
            return Ok(None);
        }

        src.retrieve(HEADER_SIZE);
        Ok(Some(src.retrieve_as_bytes(len)))
    }
}
