use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A 3-byte unsigned integer.
///
/// Connection identifiers and message type ids travel in three bytes on the
/// wire. In memory the value is a `u32` whose top byte is always zero, so
/// equality, ordering and hashing match the equivalent `u32`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct UInt24(u32);

impl UInt24 {
    pub const MAX: UInt24 = UInt24(0x00FF_FFFF);
    pub const MIN: UInt24 = UInt24(0);
    pub const ZERO: UInt24 = UInt24(0);

    /// Encoded width in bytes
    pub const SIZE: usize = 3;

    /// Checked construction; fails if `value` needs more than 24 bits.
    pub fn new(value: u32) -> Result<Self> {
        if value > Self::MAX.0 {
            Err(ProtocolError::ValueOutOfRange(value))
        } else {
            Ok(Self(value))
        }
    }

    /// Keeps the low 24 bits of `value`.
    pub const fn truncating(value: u32) -> Self {
        Self(value & Self::MAX.0)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    pub const fn to_le_bytes(self) -> [u8; 3] {
        let b = self.0.to_le_bytes();
        [b[0], b[1], b[2]]
    }

    pub const fn from_le_bytes(bytes: [u8; 3]) -> Self {
        Self(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]))
    }

    /// Wrapping increment inside the 24-bit range.
    pub const fn wrapping_add(self, rhs: u32) -> Self {
        Self::truncating(self.0.wrapping_add(rhs))
    }
}

impl From<u16> for UInt24 {
    fn from(value: u16) -> Self {
        Self(u32::from(value))
    }
}

impl From<u8> for UInt24 {
    fn from(value: u8) -> Self {
        Self(u32::from(value))
    }
}

impl TryFrom<u32> for UInt24 {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<usize> for UInt24 {
    type Error = ProtocolError;

    fn try_from(value: usize) -> Result<Self> {
        let narrowed = u32::try_from(value).map_err(|_| ProtocolError::ValueOutOfRange(u32::MAX))?;
        Self::new(narrowed)
    }
}

impl From<UInt24> for u32 {
    fn from(value: UInt24) -> Self {
        value.0
    }
}

impl From<UInt24> for u64 {
    fn from(value: UInt24) -> Self {
        u64::from(value.0)
    }
}

impl From<UInt24> for usize {
    fn from(value: UInt24) -> Self {
        value.0 as usize
    }
}

impl PartialEq<u32> for UInt24 {
    fn eq(&self, other: &u32) -> bool {
        self.0 == *other
    }
}

impl fmt::Display for UInt24 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}
