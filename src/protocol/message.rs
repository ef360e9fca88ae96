//! # Message
//!
//! The unit of communication: a 10-byte header followed by an ordered run of
//! untagged blocks.
//!
//! ```text
//! [0:2)  Length    u16, whole message including this header
//! [2:5)  ClientID  u24, originating/target connection
//! [5:7)  HeadID    u16, action selector
//! [7:10) TypeID    u24, 0 direct | 1 broadcast | 2 sync | 10+N reply to N
//! [10:)  Body
//! ```
//!
//! Writers append blocks with [`Message::set`]; readers pull them back in the
//! same order with [`Message::get`]. Reading past the end fails with
//! `BufferUnderrun` and leaves the read cursor untouched.
//!
//! ## Example
//! ```rust
//! use gamewire::protocol::message::Message;
//! use gamewire::protocol::pipeline::CodecPipeline;
//!
//! # fn main() -> gamewire::error::Result<()> {
//! let pipeline = CodecPipeline::passthrough();
//! let mut msg = Message::new(5);
//! msg.set("hello")?.set(42i32)?;
//!
//! let frame = msg.serialize(&pipeline)?;
//! let mut received = Message::from_frame(frame, &pipeline)?;
//! assert_eq!(received.get::<String>()?, "hello");
//! assert_eq!(received.get::<i32>()?, 42);
//! # Ok(())
//! # }
//! ```

use crate::core::block::{Decode, Encode};
use crate::core::codec::MAX_FRAME_SIZE;
use crate::core::cursor::{ByteReader, ByteWriter};
use crate::core::uint24::UInt24;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::pipeline::CodecPipeline;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Size of the fixed message header
pub const HEADER_SIZE: usize = 10;

/// TypeID of a direct call
pub const TYPE_DIRECT: u32 = 0;
/// TypeID of a message relayed to the sender's group
pub const TYPE_BROADCAST: u32 = 1;
/// TypeID of a synchronization payload
pub const TYPE_SYNC: u32 = 2;
/// TypeIDs at or above this value carry a reply slot
pub const REPLY_BASE: u32 = 10;

/// Per-entry prefix inside a packed body: entry length + client id
const PACK_ENTRY_PREFIX: usize = 2 * UInt24::SIZE;

/// Coarse classification of a TypeID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Direct,
    Broadcast,
    Sync,
    /// Answer to the outstanding request in this slot
    Reply(u32),
    /// TypeIDs 3..=9, reserved for applications
    Other(u32),
}

impl MessageKind {
    pub fn from_type_id(type_id: UInt24) -> Self {
        match type_id.get() {
            TYPE_DIRECT => MessageKind::Direct,
            TYPE_BROADCAST => MessageKind::Broadcast,
            TYPE_SYNC => MessageKind::Sync,
            t if t >= REPLY_BASE => MessageKind::Reply(t - REPLY_BASE),
            t => MessageKind::Other(t),
        }
    }
}

#[derive(Clone)]
pub struct Message {
    client_id: UInt24,
    head_id: u16,
    type_id: UInt24,
    /// Header placeholder followed by the body blocks
    buf: BytesMut,
    /// Absolute read position within `buf`
    cursor: usize,
    /// Finalized wire frame; present while the message is packed
    frame: Option<Bytes>,
}

impl Message {
    /// A direct-call message for `head_id`.
    pub fn new(head_id: u16) -> Self {
        Self::with_header(UInt24::ZERO, head_id, UInt24::ZERO)
    }

    pub fn with_header(client_id: UInt24, head_id: u16, type_id: UInt24) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_bytes(0, HEADER_SIZE);
        Self {
            client_id,
            head_id,
            type_id,
            buf,
            cursor: HEADER_SIZE,
            frame: None,
        }
    }

    /// A response addressed back to `request`.
    ///
    /// Keeps the request's HeadID, ClientID and TypeID so a pending reply slot
    /// on the requesting side resolves.
    pub fn reply_to(request: &Message) -> Self {
        Self::with_header(request.client_id, request.head_id, request.type_id)
    }

    pub fn client_id(&self) -> UInt24 {
        self.client_id
    }

    pub fn head_id(&self) -> u16 {
        self.head_id
    }

    pub fn type_id(&self) -> UInt24 {
        self.type_id
    }

    pub fn kind(&self) -> MessageKind {
        MessageKind::from_type_id(self.type_id)
    }

    /// The reply slot encoded in TypeID, if any
    pub fn reply_id(&self) -> Option<u32> {
        match self.kind() {
            MessageKind::Reply(slot) => Some(slot),
            _ => None,
        }
    }

    pub fn set_client_id(&mut self, client_id: UInt24) -> &mut Self {
        if self.client_id != client_id {
            self.client_id = client_id;
            self.frame = None;
        }
        self
    }

    pub fn set_head_id(&mut self, head_id: u16) -> &mut Self {
        if self.head_id != head_id {
            self.head_id = head_id;
            self.frame = None;
        }
        self
    }

    pub fn set_type_id(&mut self, type_id: UInt24) -> &mut Self {
        if self.type_id != type_id {
            self.type_id = type_id;
            self.frame = None;
        }
        self
    }

    /// Encodes `slot` into TypeID as `10 + slot`.
    pub fn set_reply_id(&mut self, slot: u32) -> Result<&mut Self> {
        let type_id = UInt24::new(slot.checked_add(REPLY_BASE).ok_or(ProtocolError::ValueOutOfRange(slot))?)?;
        Ok(self.set_type_id(type_id))
    }

    /// Appends one block.
    ///
    /// A block that would push the message past one frame is rolled back and
    /// reported as `OversizedFrame`.
    pub fn set<T: Encode>(&mut self, value: T) -> Result<&mut Self> {
        let mark = self.buf.len();
        let written = value.encode(&mut ByteWriter::new(&mut self.buf));
        if let Err(e) = written {
            self.buf.truncate(mark);
            return Err(e);
        }
        if self.buf.len() > MAX_FRAME_SIZE {
            let size = self.buf.len();
            self.buf.truncate(mark);
            return Err(ProtocolError::OversizedFrame(size));
        }
        self.frame = None;
        Ok(self)
    }

    /// Builder-style [`Message::set`].
    pub fn with<T: Encode>(mut self, value: T) -> Result<Self> {
        self.set(value)?;
        Ok(self)
    }

    /// Reads the next block and advances the cursor.
    pub fn get<T: Decode>(&mut self) -> Result<T> {
        let mut reader = ByteReader::at(&self.buf, self.cursor);
        let value = T::decode(&mut reader)?;
        self.cursor = reader.position();
        Ok(value)
    }

    /// Whether the next block decodes as `T`.
    pub fn can_get<T: Decode>(&self) -> bool {
        let mut reader = ByteReader::at(&self.buf, self.cursor);
        T::decode(&mut reader).is_ok()
    }

    /// Bytes left between the cursor and the end of the body
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.cursor
    }

    /// Moves the read cursor back to the first block.
    pub fn rewind(&mut self) {
        self.cursor = HEADER_SIZE;
    }

    pub fn body(&self) -> &[u8] {
        &self.buf[HEADER_SIZE..]
    }

    /// Serialized length including the header
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.len() == HEADER_SIZE
    }

    /// True while a finalized frame is cached and will be reused as-is.
    pub fn is_packed(&self) -> bool {
        self.frame.is_some()
    }

    fn write_header(&mut self) -> Result<()> {
        let len = self.buf.len();
        let len = u16::try_from(len).map_err(|_| ProtocolError::OversizedFrame(len))?;
        self.buf[0..2].copy_from_slice(&len.to_le_bytes());
        self.buf[2..5].copy_from_slice(&self.client_id.to_le_bytes());
        self.buf[5..7].copy_from_slice(&self.head_id.to_le_bytes());
        self.buf[7..10].copy_from_slice(&self.type_id.to_le_bytes());
        Ok(())
    }

    /// Header plus body, without running the codec pipeline.
    pub fn to_bytes(&mut self) -> Result<Bytes> {
        self.write_header()?;
        Ok(Bytes::copy_from_slice(&self.buf))
    }

    /// Produces the wire frame, running the pipeline once.
    ///
    /// The frame is cached; later calls return it without re-encoding until
    /// the header or body is modified.
    pub fn serialize(&mut self, pipeline: &CodecPipeline) -> Result<Bytes> {
        if let Some(frame) = &self.frame {
            return Ok(frame.clone());
        }
        let plain = self.to_bytes()?;
        let frame = pipeline.encode(plain)?;
        self.frame = Some(frame.clone());
        Ok(frame)
    }

    /// Parses a plain (pipeline-free) serialized message.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::LengthMismatch {
                declared: if data.len() >= 2 {
                    u16::from_le_bytes([data[0], data[1]]) as usize
                } else {
                    0
                },
                actual: data.len(),
            });
        }

        let mut reader = ByteReader::new(data);
        let declared = reader.u16()? as usize;
        if declared != data.len() {
            return Err(ProtocolError::LengthMismatch {
                declared,
                actual: data.len(),
            });
        }
        let client_id = reader.u24()?;
        let head_id = reader.u16()?;
        let type_id = reader.u24()?;

        Ok(Self {
            client_id,
            head_id,
            type_id,
            buf: BytesMut::from(data),
            cursor: HEADER_SIZE,
            frame: None,
        })
    }

    /// Reverses the pipeline and parses the result.
    ///
    /// The incoming frame stays cached, so relaying the message unchanged
    /// costs no re-encoding.
    pub fn from_frame(frame: Bytes, pipeline: &CodecPipeline) -> Result<Self> {
        let plain = pipeline.decode(frame.clone())?;
        let mut message = Self::from_bytes(&plain)?;
        message.frame = Some(frame);
        Ok(message)
    }

    /// Batches messages sharing `head_id` into one message.
    ///
    /// Each entry is `{u24 entry_len}{u24 client_id}{body}`, where `entry_len`
    /// includes its 6-byte prefix.
    pub fn pack(head_id: u16, messages: &[Message]) -> Result<Message> {
        let mut packed = Message::new(head_id);
        for message in messages {
            if message.head_id != head_id {
                return Err(ProtocolError::InvalidPack(constants::ERR_MIXED_HEAD_IDS.into()));
            }
            let entry_len = PACK_ENTRY_PREFIX + message.body().len();
            let entry_len24 = UInt24::try_from(entry_len)?;

            let mark = packed.buf.len();
            {
                let mut w = ByteWriter::new(&mut packed.buf);
                w.put_u24(entry_len24);
                w.put_u24(message.client_id);
                w.put_slice(message.body());
            }
            if packed.buf.len() > MAX_FRAME_SIZE {
                let size = packed.buf.len();
                packed.buf.truncate(mark);
                return Err(ProtocolError::OversizedFrame(size));
            }
        }
        Ok(packed)
    }

    /// Splits a packed message back into its entries.
    ///
    /// Stops at a zero entry length, at a prefix that does not fit, or at an
    /// entry longer than what is left.
    pub fn unpack(&self) -> Vec<Message> {
        let mut out = Vec::new();
        let mut reader = ByteReader::new(self.body());

        while reader.remaining() >= PACK_ENTRY_PREFIX {
            let mut lookahead = reader;
            let (entry_len, client_id) = match (lookahead.u24(), lookahead.u24()) {
                (Ok(len), Ok(id)) => (usize::from(len), id),
                _ => break,
            };
            if entry_len == 0 || entry_len < PACK_ENTRY_PREFIX {
                break;
            }
            let body = match lookahead.take(entry_len - PACK_ENTRY_PREFIX) {
                Ok(body) => body,
                Err(_) => break,
            };

            let mut entry = Message::with_header(client_id, self.head_id, self.type_id);
            entry.buf.put_slice(body);
            out.push(entry);
            reader = lookahead;
        }
        out
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::new(0)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("client_id", &self.client_id)
            .field("head_id", &self.head_id)
            .field("type_id", &self.type_id)
            .field("body_len", &self.body().len())
            .field("cursor", &self.cursor)
            .field("packed", &self.is_packed())
            .finish()
    }
}
