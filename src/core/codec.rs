//! Stream reassembly for length-prefixed frames.
//!
//! Every frame on a TCP stream starts with a little-endian u16 holding the
//! total frame length, prefix included. For plain frames that prefix is the
//! message header's `Length` field; with an active codec pipeline it is the
//! outer length. The decoder hands out exactly one frame per call and keeps
//! any trailing bytes for the next one.

use crate::error::{ProtocolError, Result};
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

/// Size of the length prefix every frame starts with
pub const LENGTH_PREFIX: usize = 2;

/// Largest frame the u16 length prefix can describe
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    min_frame: usize,
    max_frame: usize,
}

impl FrameCodec {
    /// `min_frame` is the smallest length a well-formed peer can declare.
    pub fn new(min_frame: usize, max_frame: usize) -> Self {
        Self {
            min_frame: min_frame.max(LENGTH_PREFIX + 1),
            max_frame: max_frame.min(MAX_FRAME_SIZE),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(crate::protocol::message::HEADER_SIZE, MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let declared = u16::from_le_bytes([src[0], src[1]]) as usize;

        if declared < self.min_frame {
            warn!(declared, min = self.min_frame, "Frame length below minimum");
            return Err(ProtocolError::LengthMismatch {
                declared,
                actual: src.len(),
            });
        }

        if declared > self.max_frame {
            warn!(declared, max = self.max_frame, "Frame length above configured maximum");
            return Err(ProtocolError::OversizedFrame(declared));
        }

        if src.len() < declared {
            // Reserve the rest of the frame up front to avoid repeated growth
            src.reserve(declared - src.len());
            return Ok(None);
        }

        Ok(Some(src.split_to(declared).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<()> {
        if frame.len() > self.max_frame {
            return Err(ProtocolError::OversizedFrame(frame.len()));
        }
        dst.reserve(frame.len());
        dst.extend_from_slice(frame.chunk());
        Ok(())
    }
}
