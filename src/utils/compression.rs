use crate::core::codec::MAX_FRAME_SIZE;
use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::sync::Arc;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionKind {
    #[default]
    None,
    Lz4,
    Zstd,
}

/// Maximum output size for decompression.
/// A plain message can never exceed one frame, so anything larger is hostile.
const MAX_DECOMPRESSION_SIZE: usize = MAX_FRAME_SIZE;

/// Default zstd level; low levels keep per-message latency down
const ZSTD_LEVEL: i32 = 1;

/// Compression half of the codec pipeline
pub trait Compressor: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn is_identity(&self) -> bool {
        false
    }
}

impl CompressionKind {
    pub const ALL: [CompressionKind; 3] = [
        CompressionKind::None,
        CompressionKind::Lz4,
        CompressionKind::Zstd,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CompressionKind::None => "none",
            CompressionKind::Lz4 => "lz4",
            CompressionKind::Zstd => "zstd",
        }
    }

    pub fn build(self) -> Arc<dyn Compressor> {
        Arc::new(KindCompressor(self))
    }
}

impl fmt::Display for CompressionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Adapter exposing a built-in `CompressionKind` as a `Compressor`
#[derive(Debug, Clone, Copy)]
pub struct KindCompressor(pub CompressionKind);

impl Compressor for KindCompressor {
    fn name(&self) -> &'static str {
        self.0.name()
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        compress(data, &self.0)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        decompress(data, &self.0)
    }

    fn is_identity(&self) -> bool {
        self.0 == CompressionKind::None
    }
}

/// Compresses data using the specified compression algorithm
///
/// # Errors
/// Returns `ProtocolError::CompressionFailure` if compression fails
pub fn compress(data: &[u8], kind: &CompressionKind) -> Result<Vec<u8>> {
    match kind {
        CompressionKind::None => Ok(data.to_vec()),
        CompressionKind::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        CompressionKind::Zstd => {
            let mut out = Vec::new();
            zstd::stream::copy_encode(data, &mut out, ZSTD_LEVEL)
                .map_err(|_| ProtocolError::CompressionFailure)?;
            Ok(out)
        }
    }
}

/// Decompresses data that was compressed with the specified algorithm
///
/// Output is capped at one frame to stop decompression bombs.
///
/// # Errors
/// Returns `ProtocolError::DecompressionFailure` if:
/// - Decompression fails
/// - Output size exceeds MAX_DECOMPRESSION_SIZE
pub fn decompress(data: &[u8], kind: &CompressionKind) -> Result<Vec<u8>> {
    match *kind {
        CompressionKind::None => Ok(data.to_vec()),
        CompressionKind::Lz4 => {
            // lz4_flex prepends the uncompressed size as a 4-byte little-endian value;
            // check it before lz4_flex allocates
            if data.len() < 4 {
                return Err(ProtocolError::DecompressionFailure);
            }

            let claimed_size = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
            if claimed_size > MAX_DECOMPRESSION_SIZE {
                return Err(ProtocolError::DecompressionFailure);
            }

            let decompressed = lz4_flex::decompress_size_prepended(data)
                .map_err(|_| ProtocolError::DecompressionFailure)?;

            if decompressed.len() > MAX_DECOMPRESSION_SIZE {
                return Err(ProtocolError::DecompressionFailure);
            }
            Ok(decompressed)
        }
        CompressionKind::Zstd => {
            let mut out = Vec::new();
            let mut reader = zstd::stream::Decoder::new(data)
                .map_err(|_| ProtocolError::DecompressionFailure)?;

            // Read in chunks to enforce size limit
            let mut buffer = [0u8; 8192];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        out.extend_from_slice(&buffer[..n]);
                        if out.len() > MAX_DECOMPRESSION_SIZE {
                            return Err(ProtocolError::DecompressionFailure);
                        }
                    }
                    Err(_) => return Err(ProtocolError::DecompressionFailure),
                }
            }
            Ok(out)
        }
    }
}
