//! # Error Types
//!
//! Error handling for the wire protocol and connection engine.
//!
//! Every failure in this crate is scoped to a single connection or a single
//! message; nothing here is fatal to the process.
//!
//! ## Error Categories
//! - **I/O Errors**: socket failures, which tear the owning connection down
//! - **Codec Errors**: buffer underruns, length mismatches, oversized frames
//! - **Pipeline Errors**: missing keys, encryption/compression failures
//! - **Handshake Errors**: rejected keys and timeouts during admission
//! - **Dispatch Errors**: duplicate head actions
//!
//! ## Example Usage
//! ```rust
//! use gamewire::error::{ProtocolError, Result};
//! use gamewire::protocol::message::Message;
//!
//! fn read_score(message: &mut Message) -> Result<i32> {
//!     if !message.can_get::<i32>() {
//!         return Err(ProtocolError::BufferUnderrun { needed: 4, remaining: message.remaining() });
//!     }
//!     message.get::<i32>()
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Dispatcher-related error messages
    pub const ERR_DISPATCHER_WRITE_LOCK: &str = "Failed to acquire write lock on dispatcher";
    pub const ERR_DISPATCHER_READ_LOCK: &str = "Failed to acquire read lock on dispatcher";

    /// Codec errors
    pub const ERR_INVALID_UTF8: &str = "String block is not valid UTF-8";
    pub const ERR_INVALID_UTF32: &str = "String block is not valid UTF-32";
    pub const ERR_INVALID_CHAR: &str = "Char block is not a valid scalar value";
    pub const ERR_MIXED_HEAD_IDS: &str = "Packed messages must share one HeadID";

    /// Connection errors
    pub const ERR_NO_UDP_CHANNEL: &str = "Connection has no UDP companion channel";
    pub const ERR_UDP_PEER_UNKNOWN: &str = "UDP peer address not yet known";

    /// Handshake errors
    pub const ERR_KEY_MISMATCH: &str = "Client returned a wrong handshake key";
    pub const ERR_ID_SPACE_EXHAUSTED: &str = "No free connection identifiers";
    pub const ERR_SERVER_FULL: &str = "Server is at its connection limit";

    /// Reply errors
    pub const ERR_REPLY_DROPPED: &str = "Reply callback dropped before a response arrived";
}

// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    #[serde(skip_serializing, skip_deserializing)]
    Io(#[from] io::Error),

    #[error("Object serialization error: {0}")]
    #[serde(skip_serializing, skip_deserializing)]
    Serialization(#[from] bincode::Error),

    #[error("Buffer underrun: needed {needed} bytes, {remaining} remaining")]
    BufferUnderrun { needed: usize, remaining: usize },

    #[error("Length mismatch: header declares {declared} bytes, frame has {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Frame too large: {0} bytes")]
    OversizedFrame(usize),

    #[error("Malformed block: {0}")]
    MalformedBlock(String),

    #[error("Value {0} does not fit in 24 bits")]
    ValueOutOfRange(u32),

    #[error("Invalid packed message: {0}")]
    InvalidPack(String),

    #[error("Encryption strategy '{0}' requires a key")]
    MissingKey(String),

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Compression failed")]
    CompressionFailure,

    #[error("Decompression failed")]
    DecompressionFailure,

    #[error("Head action {0} is already registered")]
    DuplicateAction(u16),

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Handshake rejected")]
    HandshakeRejected,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// True for errors that mean the peer sent bytes we cannot trust.
    pub fn is_peer_misbehaving(&self) -> bool {
        matches!(
            self,
            ProtocolError::BufferUnderrun { .. }
                | ProtocolError::LengthMismatch { .. }
                | ProtocolError::MalformedBlock(_)
                | ProtocolError::InvalidPack(_)
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
