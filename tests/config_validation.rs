//! Integration tests for configuration validation

#![allow(clippy::expect_used, clippy::unwrap_used)]

use gamewire::config::{
    ClientConfig, LoggingConfig, NetworkConfig, QueueConfig, ServerConfig, TransportConfig,
};
use gamewire::protocol::handshake::IdWidth;
use gamewire::protocol::pipeline::CodecPipeline;
use gamewire::utils::compression::CompressionKind;
use gamewire::utils::crypto::EncryptionKind;
use std::time::Duration;
use tracing::Level;

/// Defaults leave encryption off, which validation flags as a warning
fn only_warnings(errors: &[String]) -> bool {
    errors.iter().all(|e| e.starts_with("WARNING"))
}

#[test]
fn test_default_config_validates() {
    let config = NetworkConfig::default();
    let errors = config.validate();
    assert!(
        only_warnings(&errors),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
}

#[test]
fn test_encryption_disabled_warning() {
    let config = NetworkConfig::default();
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Encryption is disabled")));
}

#[test]
fn test_invalid_server_address() {
    let mut config = NetworkConfig::default();
    config.server.address = "invalid_address".to_string();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Invalid server address")));
}

#[test]
fn test_empty_server_address() {
    let mut config = NetworkConfig::default();
    config.server.address = String::new();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("cannot be empty")));
}

#[test]
fn test_udp_needs_room_for_next_port() {
    let mut config = NetworkConfig::default();
    config.server.address = "127.0.0.1:65535".to_string();
    config.server.udp_enabled = true;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("TCP port + 1")));

    config.server.udp_enabled = false;
    assert!(only_warnings(&config.validate()));
}

#[test]
fn test_zero_max_connections() {
    let mut config = NetworkConfig::default();
    config.server.max_connections = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Max connections must be greater than 0")));
}

#[test]
fn test_max_connections_beyond_id_space() {
    let mut config = NetworkConfig::default();
    config.server.max_connections = 0x0100_0000;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("24-bit id space")));
}

#[test]
fn test_handshake_timeout_bounds() {
    let mut config = NetworkConfig::default();
    config.server.handshake_timeout = Duration::from_millis(50);
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Handshake timeout too short")));

    config.server.handshake_timeout = Duration::from_secs(400);
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Handshake timeout too long")));
}

#[test]
fn test_invalid_client_address() {
    let mut config = NetworkConfig::default();
    config.client.address = "not:a:valid:address".to_string();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Invalid client address")));
}

#[test]
fn test_short_response_timeout() {
    let mut config = NetworkConfig::default();
    config.client.response_timeout = Duration::from_millis(10);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Response timeout too short")));
}

#[test]
fn test_frame_size_bounds() {
    let mut config = NetworkConfig::default();
    config.transport.max_frame_size = 4;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Max frame size too small")));

    config.transport.max_frame_size = 70_000;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Max frame size too large")));
}

#[test]
fn test_keyed_encryption_requires_key() {
    let mut config = NetworkConfig::default();
    config.transport.encryption = EncryptionKind::XChaCha20Poly1305;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("requires encryption_key")));
    assert!(CodecPipeline::from_config(&config.transport).is_err());

    config.transport.encryption_key = Some("shared secret".to_string());
    assert!(config.validate().is_empty());
    assert!(CodecPipeline::from_config(&config.transport).is_ok());
}

#[test]
fn test_queue_bounds() {
    let mut config = NetworkConfig::default();
    config.queue.workers = 0;
    config.queue.scan_interval = Duration::ZERO;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Queue workers must be greater than 0")));
    assert!(errors.iter().any(|e| e.contains("Scan interval must be greater than 0")));
}

#[test]
fn test_empty_app_name() {
    let mut config = NetworkConfig::default();
    config.logging.app_name = String::new();

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Application name cannot be empty")));
}

#[test]
fn test_long_app_name() {
    let mut config = NetworkConfig::default();
    config.logging.app_name = "a".repeat(100);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Application name too long")));
}

#[test]
fn test_validate_strict_with_invalid_config() {
    let mut config = NetworkConfig::default();
    config.server.address = String::new();

    let result = config.validate_strict();
    assert!(result.is_err());

    if let Err(e) = result {
        let error_str = e.to_string();
        assert!(error_str.contains("Configuration validation failed"));
    }
}

#[test]
fn test_multiple_validation_errors() {
    let mut config = NetworkConfig::default();

    // Introduce multiple errors
    config.server.address = String::new();
    config.server.max_connections = 0;
    config.client.address = String::new();
    config.transport.max_frame_size = 0;
    config.logging.app_name = String::new();

    let errors = config.validate();

    assert!(
        errors.len() >= 5,
        "Expected at least 5 errors, got {}: {:?}",
        errors.len(),
        errors
    );
}

#[test]
fn test_from_toml_with_partial_sections() {
    let text = r#"
        [transport]
        encryption = "aes256_cbc"
        encryption_key = "hunter2"
        compression = "zstd"
        max_frame_size = 32768

        [queue]
        workers = 8
        scan_interval = 2
    "#;

    let config = NetworkConfig::from_toml(text).expect("valid toml");
    assert_eq!(config.transport.encryption, EncryptionKind::Aes256Cbc);
    assert_eq!(config.transport.compression, CompressionKind::Zstd);
    assert_eq!(config.transport.max_frame_size, 32768);
    assert_eq!(config.queue.workers, 8);
    assert_eq!(config.queue.scan_interval, Duration::from_millis(2));
    // Untouched sections keep their defaults
    assert_eq!(config.server.address, ServerConfig::default().address);
    assert!(config.validate().is_empty());
}

#[test]
fn test_from_toml_rejects_unknown_strategy() {
    let text = r#"
        [transport]
        encryption = "rot13"
        compression = "none"
        max_frame_size = 1024
    "#;
    assert!(NetworkConfig::from_toml(text).is_err());
}

#[test]
fn test_overrides_apply() {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.udp_enabled = true;
        c.client.id_width = IdWidth::Four;
    });
    assert!(config.server.udp_enabled);
    assert_eq!(config.client.id_width, IdWidth::Four);
}

#[test]
fn test_valid_production_config() {
    let config = NetworkConfig {
        server: ServerConfig {
            address: "0.0.0.0:7777".to_string(),
            max_connections: 10_000,
            handshake_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
            udp_enabled: true,
            id_width: IdWidth::Four,
        },
        client: ClientConfig {
            address: "10.0.0.1:7777".to_string(),
            connection_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(30),
            udp_enabled: true,
            id_width: IdWidth::Four,
        },
        transport: TransportConfig {
            encryption: EncryptionKind::XChaCha20Poly1305,
            encryption_key: Some("production-secret".to_string()),
            compression: CompressionKind::Lz4,
            max_frame_size: 65535,
        },
        queue: QueueConfig {
            workers: 16,
            scan_interval: Duration::from_millis(5),
        },
        logging: LoggingConfig {
            app_name: "arena-server".to_string(),
            log_level: Level::INFO,
            json_format: true,
        },
    };

    let errors = config.validate();
    assert!(errors.is_empty(), "Production config should be valid, got: {:?}", errors);
    assert!(config.validate_strict().is_ok());
}
