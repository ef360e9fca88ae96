//! The codec pipeline: one encryptor plus one compressor.
//!
//! A pipeline is an explicit value shared by `Arc` between the connections of
//! one engine, so differently configured servers and clients can coexist in a
//! process.
//!
//! ## Frame layout
//! With both strategies set to identity, a serialized message goes on the
//! wire untouched. Otherwise the wire frame is
//! ```text
//! [OuterLength(2)] [compress(encrypt(message))]
//! ```
//! where `OuterLength` counts its own two bytes. Decoding strips the outer
//! length, decompresses, then decrypts.

use crate::config::TransportConfig;
use crate::core::codec::{LENGTH_PREFIX, MAX_FRAME_SIZE};
use crate::error::{ProtocolError, Result};
use crate::protocol::message::HEADER_SIZE;
use crate::utils::compression::{CompressionKind, Compressor};
use crate::utils::crypto::{EncryptionKind, Encryptor};
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CodecPipeline {
    encryptor: Arc<dyn Encryptor>,
    compressor: Arc<dyn Compressor>,
}

impl Default for CodecPipeline {
    fn default() -> Self {
        Self::passthrough()
    }
}

impl CodecPipeline {
    /// No encryption, no compression.
    pub fn passthrough() -> Self {
        Self {
            encryptor: Arc::new(crate::utils::crypto::NoEncryption),
            compressor: CompressionKind::None.build(),
        }
    }

    /// Builds a pipeline from the built-in strategies.
    ///
    /// # Errors
    /// `ProtocolError::MissingKey` if `encryption` needs a key and none was given.
    pub fn new(
        encryption: EncryptionKind,
        key: Option<&[u8]>,
        compression: CompressionKind,
    ) -> Result<Self> {
        let encryptor = encryption.build(key)?;
        debug!(encryption = %encryption, compression = %compression, "Codec pipeline selected");
        Ok(Self {
            encryptor,
            compressor: compression.build(),
        })
    }

    pub fn from_config(config: &TransportConfig) -> Result<Self> {
        Self::new(
            config.encryption,
            config.encryption_key.as_deref().map(str::as_bytes),
            config.compression,
        )
    }

    /// Swap in a custom encryption strategy
    pub fn with_encryptor(mut self, encryptor: Arc<dyn Encryptor>) -> Self {
        self.encryptor = encryptor;
        self
    }

    /// Swap in a custom compression strategy
    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = compressor;
        self
    }

    pub fn encryptor_name(&self) -> &'static str {
        self.encryptor.name()
    }

    pub fn compressor_name(&self) -> &'static str {
        self.compressor.name()
    }

    pub fn is_passthrough(&self) -> bool {
        self.encryptor.is_identity() && self.compressor.is_identity()
    }

    /// Smallest length a well-formed frame can declare under this pipeline
    pub fn min_frame_len(&self) -> usize {
        if self.is_passthrough() {
            HEADER_SIZE
        } else {
            LENGTH_PREFIX + 1
        }
    }

    /// Turns a serialized message into a wire frame.
    pub fn encode(&self, message: Bytes) -> Result<Bytes> {
        if self.is_passthrough() {
            return Ok(message);
        }

        let encrypted = self.encryptor.encrypt(&message)?;
        let transformed = self.compressor.compress(&encrypted)?;

        let total = LENGTH_PREFIX + transformed.len();
        if total > MAX_FRAME_SIZE {
            return Err(ProtocolError::OversizedFrame(total));
        }

        let mut frame = BytesMut::with_capacity(total);
        frame.put_u16_le(total as u16);
        frame.put_slice(&transformed);
        Ok(frame.freeze())
    }

    /// Turns a wire frame back into a serialized message.
    pub fn decode(&self, frame: Bytes) -> Result<Bytes> {
        if self.is_passthrough() {
            return Ok(frame);
        }

        if frame.len() < LENGTH_PREFIX {
            return Err(ProtocolError::LengthMismatch {
                declared: 0,
                actual: frame.len(),
            });
        }
        let declared = u16::from_le_bytes([frame[0], frame[1]]) as usize;
        if declared != frame.len() {
            return Err(ProtocolError::LengthMismatch {
                declared,
                actual: frame.len(),
            });
        }

        let decompressed = self.compressor.decompress(&frame[LENGTH_PREFIX..])?;
        let decrypted = self.encryptor.decrypt(&decompressed)?;
        Ok(Bytes::from(decrypted))
    }
}
