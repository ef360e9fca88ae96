//! Typed message blocks.
//!
//! A message body is a plain concatenation of blocks with no names or tags;
//! readers must request blocks in the order they were written. Fixed-size
//! primitives are written as-is (little-endian). Strings, byte arrays,
//! primitive arrays and nested objects carry a u16 length prefix.

use crate::core::cursor::{ByteReader, ByteWriter};
use crate::core::uint24::UInt24;
use crate::error::{constants, ProtocolError, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A value that can be appended to a message body.
pub trait Encode {
    fn encode(&self, w: &mut ByteWriter<'_>) -> Result<()>;
}

/// A value that can be read back from a message body.
pub trait Decode: Sized {
    fn decode(r: &mut ByteReader<'_>) -> Result<Self>;
}

/// Fixed-width values that may also appear inside primitive arrays.
pub trait Primitive: Encode + Decode + Copy {
    const WIDTH: usize;
}

impl<T: Encode + ?Sized> Encode for &T {
    fn encode(&self, w: &mut ByteWriter<'_>) -> Result<()> {
        (**self).encode(w)
    }
}

macro_rules! int_block {
    ($($ty:ty => $put:ident / $get:ident as $wire:ty),* $(,)?) => {
        $(
            impl Encode for $ty {
                #[inline]
                fn encode(&self, w: &mut ByteWriter<'_>) -> Result<()> {
                    w.$put(*self as $wire);
                    Ok(())
                }
            }

            impl Decode for $ty {
                #[inline]
                fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
                    Ok(r.$get()? as $ty)
                }
            }

            impl Primitive for $ty {
                const WIDTH: usize = std::mem::size_of::<$ty>();
            }
        )*
    };
}

int_block! {
    u8 => put_u8 / u8 as u8,
    i8 => put_u8 / u8 as u8,
    u16 => put_u16 / u16 as u16,
    i16 => put_u16 / u16 as u16,
    u32 => put_u32 / u32 as u32,
    i32 => put_u32 / u32 as u32,
    u64 => put_u64 / u64 as u64,
    i64 => put_u64 / u64 as u64,
}

impl Encode for bool {
    fn encode(&self, w: &mut ByteWriter<'_>) -> Result<()> {
        w.put_u8(u8::from(*self));
        Ok(())
    }
}

impl Decode for bool {
    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(r.u8()? != 0)
    }
}

impl Primitive for bool {
    const WIDTH: usize = 1;
}

// Floats travel as raw IEEE-754 bits so NaN payloads survive.
impl Encode for f32 {
    fn encode(&self, w: &mut ByteWriter<'_>) -> Result<()> {
        w.put_u32(self.to_bits());
        Ok(())
    }
}

impl Decode for f32 {
    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(f32::from_bits(r.u32()?))
    }
}

impl Primitive for f32 {
    const WIDTH: usize = 4;
}

impl Encode for f64 {
    fn encode(&self, w: &mut ByteWriter<'_>) -> Result<()> {
        w.put_u64(self.to_bits());
        Ok(())
    }
}

impl Decode for f64 {
    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(f64::from_bits(r.u64()?))
    }
}

impl Primitive for f64 {
    const WIDTH: usize = 8;
}

impl Encode for char {
    fn encode(&self, w: &mut ByteWriter<'_>) -> Result<()> {
        w.put_u32(u32::from(*self));
        Ok(())
    }
}

impl Decode for char {
    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        let mut lookahead = *r;
        let c = char::from_u32(lookahead.u32()?)
            .ok_or_else(|| ProtocolError::MalformedBlock(constants::ERR_INVALID_CHAR.into()))?;
        *r = lookahead;
        Ok(c)
    }
}

impl Primitive for char {
    const WIDTH: usize = 4;
}

impl Encode for UInt24 {
    fn encode(&self, w: &mut ByteWriter<'_>) -> Result<()> {
        w.put_u24(*self);
        Ok(())
    }
}

impl Decode for UInt24 {
    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        r.u24()
    }
}

impl Primitive for UInt24 {
    const WIDTH: usize = UInt24::SIZE;
}

impl Encode for str {
    fn encode(&self, w: &mut ByteWriter<'_>) -> Result<()> {
        w.put_prefixed(self.as_bytes())
    }
}

impl Encode for String {
    fn encode(&self, w: &mut ByteWriter<'_>) -> Result<()> {
        self.as_str().encode(w)
    }
}

impl Decode for String {
    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        let mut lookahead = *r;
        let raw = lookahead.prefixed()?;
        let s = std::str::from_utf8(raw)
            .map_err(|_| ProtocolError::MalformedBlock(constants::ERR_INVALID_UTF8.into()))?;
        *r = lookahead;
        Ok(s.to_owned())
    }
}

/// A string carried as UTF-32 code units.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Utf32String(pub String);

impl Encode for Utf32String {
    fn encode(&self, w: &mut ByteWriter<'_>) -> Result<()> {
        let byte_len = self.0.chars().count() * 4;
        let len = u16::try_from(byte_len).map_err(|_| ProtocolError::OversizedFrame(byte_len))?;
        w.put_u16(len);
        for c in self.0.chars() {
            w.put_u32(u32::from(c));
        }
        Ok(())
    }
}

impl Decode for Utf32String {
    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        let mut lookahead = *r;
        let raw = lookahead.prefixed()?;
        if raw.len() % 4 != 0 {
            return Err(ProtocolError::MalformedBlock(constants::ERR_INVALID_UTF32.into()));
        }
        let s = raw
            .chunks_exact(4)
            .map(|unit| char::from_u32(u32::from_le_bytes([unit[0], unit[1], unit[2], unit[3]])))
            .collect::<Option<String>>()
            .ok_or_else(|| ProtocolError::MalformedBlock(constants::ERR_INVALID_UTF32.into()))?;
        *r = lookahead;
        Ok(Utf32String(s))
    }
}

// Primitive arrays: u16 element count, then the elements back to back.
// For `u8` this is exactly a length-prefixed byte array.
impl<T: Primitive> Encode for [T] {
    fn encode(&self, w: &mut ByteWriter<'_>) -> Result<()> {
        let count = u16::try_from(self.len())
            .map_err(|_| ProtocolError::OversizedFrame(self.len() * T::WIDTH))?;
        w.put_u16(count);
        for item in self {
            item.encode(w)?;
        }
        Ok(())
    }
}

impl<T: Primitive> Encode for Vec<T> {
    fn encode(&self, w: &mut ByteWriter<'_>) -> Result<()> {
        self.as_slice().encode(w)
    }
}

impl<T: Primitive> Decode for Vec<T> {
    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        let mut lookahead = *r;
        let count = lookahead.u16()? as usize;
        let needed = count * T::WIDTH;
        if needed > lookahead.remaining() {
            return Err(ProtocolError::BufferUnderrun {
                needed: needed + 2,
                remaining: r.remaining(),
            });
        }
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(T::decode(&mut lookahead)?);
        }
        *r = lookahead;
        Ok(out)
    }
}

impl Encode for Bytes {
    fn encode(&self, w: &mut ByteWriter<'_>) -> Result<()> {
        w.put_prefixed(self)
    }
}

impl Decode for Bytes {
    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        let raw = r.prefixed()?;
        Ok(Bytes::copy_from_slice(raw))
    }
}

/// A nested serde object, bincode-encoded inside a length-prefixed block.
#[derive(Debug, Clone, PartialEq)]
pub struct Object<T>(pub T);

impl<T: Serialize> Encode for Object<T> {
    fn encode(&self, w: &mut ByteWriter<'_>) -> Result<()> {
        let bytes = bincode::serialize(&self.0)?;
        w.put_prefixed(&bytes)
    }
}

impl<T: DeserializeOwned> Decode for Object<T> {
    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        let mut lookahead = *r;
        let raw = lookahead.prefixed()?;
        let value = bincode::deserialize(raw)?;
        *r = lookahead;
        Ok(Object(value))
    }
}
