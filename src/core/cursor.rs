//! Bounds-checked cursors over byte buffers.
//!
//! All fixed-layout encoding in the crate goes through these helpers; there is
//! no pointer arithmetic anywhere. Every multi-byte value is little-endian.

use crate::core::uint24::UInt24;
use crate::error::{ProtocolError, Result};
use bytes::{BufMut, BytesMut};

/// Append-only writer over a `BytesMut`.
pub struct ByteWriter<'a> {
    buf: &'a mut BytesMut,
}

impl<'a> ByteWriter<'a> {
    pub fn new(buf: &'a mut BytesMut) -> Self {
        Self { buf }
    }

    #[inline]
    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    #[inline]
    pub fn put_u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    #[inline]
    pub fn put_u24(&mut self, v: UInt24) {
        self.buf.put_slice(&v.to_le_bytes());
    }

    #[inline]
    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    #[inline]
    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    #[inline]
    pub fn put_slice(&mut self, src: &[u8]) {
        self.buf.put_slice(src);
    }

    /// Writes a u16 length prefix followed by `src`.
    pub fn put_prefixed(&mut self, src: &[u8]) -> Result<()> {
        let len = u16::try_from(src.len()).map_err(|_| ProtocolError::OversizedFrame(src.len()))?;
        self.put_u16(len);
        self.put_slice(src);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Forward-only reader over a byte slice.
///
/// A failed read never moves the position.
#[derive(Debug, Clone, Copy)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn at(data: &'a [u8], pos: usize) -> Self {
        Self {
            data,
            pos: pos.min(data.len()),
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    /// Borrows the next `n` bytes and advances past them.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(ProtocolError::BufferUnderrun {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let slice = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        self.take_array().map(u16::from_le_bytes)
    }

    pub fn u24(&mut self) -> Result<UInt24> {
        self.take_array().map(UInt24::from_le_bytes)
    }

    pub fn u32(&mut self) -> Result<u32> {
        self.take_array().map(u32::from_le_bytes)
    }

    pub fn u64(&mut self) -> Result<u64> {
        self.take_array().map(u64::from_le_bytes)
    }

    /// Reads a u16 length prefix and the bytes it announces.
    ///
    /// The position is restored if the payload is short.
    pub fn prefixed(&mut self) -> Result<&'a [u8]> {
        let start = self.pos;
        let len = self.u16()? as usize;
        match self.take(len) {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                self.pos = start;
                Err(e)
            }
        }
    }
}
