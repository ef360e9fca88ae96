//! # Core Protocol Components
//!
//! Low-level byte handling shared by messages, the codec pipeline and the
//! connection engine.
//!
//! ## Components
//! - **UInt24**: compact 3-byte identifiers
//! - **Cursor**: bounds-checked little-endian readers and writers
//! - **Block**: the typed values a message body is made of
//! - **Codec**: Tokio codec reassembling frames from a byte stream
//!
//! ## Wire Format
//! ```text
//! [Length(2)] [ClientID(3)] [HeadID(2)] [TypeID(3)] [Body(N)]
//! ```
//!
//! ## Safety
//! - Frames are capped at 65535 bytes by the u16 length field
//! - Every read is bounds-checked; short input yields `BufferUnderrun`

pub mod block;
pub mod codec;
pub mod cursor;
pub mod uint24;
