//! # Configuration Management
//!
//! Structured configuration for servers, clients, the codec pipeline, the
//! worker queues and logging.
//!
//! ## Configuration Sources
//! - TOML text via `from_toml()`; locating the file is up to the host
//! - Environment variables via `from_env()`
//! - Direct instantiation with defaults, optionally through `default_with_overrides()`
//!
//! ## Compatibility
//! Encryption and compression are not negotiated. A server and its clients must
//! be configured with the same `transport` section or frames will fail to decode.

use crate::core::codec::MAX_FRAME_SIZE;
use crate::error::{ProtocolError, Result};
use crate::protocol::handshake::IdWidth;
use crate::utils::compression::CompressionKind;
use crate::utils::crypto::EncryptionKind;
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::Level;

/// Default number of worker queues on a server
pub const DEFAULT_SERVER_WORKERS: usize = 4;

/// Default interval between shortest-queue scans
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_millis(5);

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub client: ClientConfig,

    /// Codec pipeline selection, shared by both ends
    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("GAMEWIRE_SERVER_ADDRESS") {
            config.server.address = addr.clone();
            config.client.address = addr;
        }

        if let Ok(max) = std::env::var("GAMEWIRE_MAX_CONNECTIONS") {
            if let Ok(val) = max.parse::<usize>() {
                config.server.max_connections = val;
            }
        }

        if let Ok(timeout) = std::env::var("GAMEWIRE_HANDSHAKE_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.server.handshake_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(timeout) = std::env::var("GAMEWIRE_RESPONSE_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.client.response_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(kind) = std::env::var("GAMEWIRE_ENCRYPTION") {
            config.transport.encryption = parse_kind(&kind)?;
        }

        if let Ok(key) = std::env::var("GAMEWIRE_ENCRYPTION_KEY") {
            config.transport.encryption_key = Some(key);
        }

        if let Ok(kind) = std::env::var("GAMEWIRE_COMPRESSION") {
            config.transport.compression = parse_kind(&kind)?;
        }

        if let Ok(workers) = std::env::var("GAMEWIRE_QUEUE_WORKERS") {
            if let Ok(val) = workers.parse::<usize>() {
                config.queue.workers = val;
            }
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.queue.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Parses a snake_case strategy name through its serde representation.
fn parse_kind<T: serde::de::DeserializeOwned>(name: &str) -> Result<T> {
    T::deserialize(serde::de::value::StrDeserializer::<serde::de::value::Error>::new(name))
        .map_err(|e| ProtocolError::ConfigError(format!("Unknown strategy '{name}': {e}")))
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// TCP listen address; the UDP companion binds the next port
    pub address: String,

    /// Maximum number of concurrent connections
    pub max_connections: usize,

    /// Deadline for the whole admission handshake
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// Timeout for graceful server shutdown
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,

    pub udp_enabled: bool,

    /// Width of the id sent to an admitted client
    pub id_width: IdWidth,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:7777"),
            max_connections: 1000,
            handshake_timeout: timeout::HANDSHAKE_TIMEOUT,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
            udp_enabled: false,
            id_width: IdWidth::Three,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else {
            match self.address.parse::<std::net::SocketAddr>() {
                Err(_) => errors.push(format!(
                    "Invalid server address format: '{}' (expected format: '0.0.0.0:7777')",
                    self.address
                )),
                Ok(addr) if self.udp_enabled && addr.port() == u16::MAX => errors.push(
                    "UDP companion needs TCP port + 1; port 65535 leaves no room".to_string(),
                ),
                Ok(_) => {}
            }
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > UINT24_IDS {
            errors.push(format!(
                "Max connections {} exceeds the 24-bit id space ({UINT24_IDS})",
                self.max_connections
            ));
        }

        if self.handshake_timeout.as_millis() < 100 {
            errors.push("Handshake timeout too short (minimum: 100ms)".to_string());
        } else if self.handshake_timeout.as_secs() > 300 {
            errors.push("Handshake timeout too long (maximum: 300s)".to_string());
        }

        if self.shutdown_timeout.as_secs() < 1 {
            errors.push("Shutdown timeout too short (minimum: 1s)".to_string());
        } else if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Usable connection ids: 1..=0xFF_FFFF
const UINT24_IDS: usize = 0x00FF_FFFF;

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Target server address
    pub address: String,

    /// Timeout for connect plus handshake
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// How long `request()` waits for its reply
    #[serde(with = "duration_serde")]
    pub response_timeout: Duration,

    pub udp_enabled: bool,

    /// Width of the id the server sends; must match the server
    pub id_width: IdWidth,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:7777"),
            connection_timeout: timeout::DEFAULT_TIMEOUT,
            response_timeout: timeout::RESPONSE_TIMEOUT,
            udp_enabled: false,
            id_width: IdWidth::Three,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Client address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid client address format: '{}' (expected format: '127.0.0.1:7777')",
                self.address
            ));
        }

        if self.connection_timeout.as_millis() < 100 {
            errors.push("Connection timeout too short (minimum: 100ms)".to_string());
        }

        if self.response_timeout.as_millis() < 100 {
            errors.push("Response timeout too short (minimum: 100ms)".to_string());
        }

        errors
    }
}

/// Codec pipeline selection
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    pub encryption: EncryptionKind,

    /// Password for keyed strategies
    #[serde(default)]
    pub encryption_key: Option<String>,

    pub compression: CompressionKind,

    /// Largest frame accepted from a peer
    pub max_frame_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            encryption: EncryptionKind::None,
            encryption_key: None,
            compression: CompressionKind::None,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_frame_size < crate::protocol::message::HEADER_SIZE {
            errors.push(format!(
                "Max frame size too small: {} (minimum: one header)",
                self.max_frame_size
            ));
        } else if self.max_frame_size > MAX_FRAME_SIZE {
            errors.push(format!(
                "Max frame size too large: {} bytes (the length field caps it at {MAX_FRAME_SIZE})",
                self.max_frame_size
            ));
        }

        if self.encryption.requires_key()
            && self.encryption_key.as_deref().map_or(true, str::is_empty)
        {
            errors.push(format!("Encryption '{}' requires encryption_key", self.encryption));
        }

        if self.encryption == EncryptionKind::None {
            errors.push(
                "WARNING: Encryption is disabled - traffic is readable on the wire".to_string(),
            );
        }

        errors
    }
}

/// Worker queue configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Number of worker queues, each with its own thread
    pub workers: usize,

    #[serde(with = "duration_serde")]
    pub scan_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_SERVER_WORKERS,
            scan_interval: DEFAULT_SCAN_INTERVAL,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.workers == 0 {
            errors.push("Queue workers must be greater than 0".to_string());
        } else if self.workers > 256 {
            errors.push(format!("Too many queue workers: {} (maximum: 256)", self.workers));
        }

        if self.scan_interval.is_zero() {
            errors.push("Scan interval must be greater than 0".to_string());
        } else if self.scan_interval.as_secs() > 1 {
            errors.push("Scan interval too long (maximum: 1s)".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Default level; `RUST_LOG` wins when set
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("gamewire"),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        level.as_str().to_ascii_lowercase().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
