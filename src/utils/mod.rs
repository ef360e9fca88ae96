//! # Utility Modules
//!
//! Supporting utilities for the codec pipeline, logging, timing and metrics.
//!
//! ## Components
//! - **Crypto**: the pluggable encryption strategies
//! - **Compression**: LZ4 and Zstd with decompressed-size limits
//! - **Logging**: subscriber setup driven by `LoggingConfig`
//! - **Timeout**: timeout constants and async wrappers
//! - **Metrics**: per-engine atomic counters
//!
//! ## Security
//! None of the ciphers here except the AEAD offer real confidentiality. They
//! exist for wire compatibility and light obfuscation.

pub mod compression;
pub mod crypto;
pub mod logging;
pub mod metrics;
pub mod timeout;
