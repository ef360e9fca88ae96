#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Edge-case tests: boundary conditions, hostile input and error paths

use gamewire::core::codec::MAX_FRAME_SIZE;
use gamewire::core::uint24::UInt24;
use gamewire::error::ProtocolError;
use gamewire::protocol::dispatcher::{Dispatch, Dispatcher};
use gamewire::protocol::message::{Message, MessageKind, HEADER_SIZE};
use gamewire::protocol::pipeline::CodecPipeline;
use gamewire::transport::connection::Connection;
use gamewire::utils::compression::{compress, decompress, CompressionKind};
use gamewire::utils::crypto::EncryptionKind;
use std::sync::Arc;

// ============================================================================
// UINT24 EDGE CASES
// ============================================================================

#[test]
fn test_uint24_bounds() {
    assert_eq!(UInt24::new(0xFF_FFFF).unwrap(), UInt24::MAX);
    assert!(matches!(
        UInt24::new(0x0100_0000),
        Err(ProtocolError::ValueOutOfRange(0x0100_0000))
    ));
    assert_eq!(UInt24::truncating(0x0123_4567).get(), 0x23_4567);
    assert_eq!(UInt24::MAX.wrapping_add(1), UInt24::ZERO);
}

#[test]
fn test_uint24_byte_order() {
    let v = UInt24::new(0x0A0B0C).unwrap();
    assert_eq!(v.to_le_bytes(), [0x0C, 0x0B, 0x0A]);
    assert_eq!(UInt24::from_le_bytes([0x0C, 0x0B, 0x0A]), v);
}

// ============================================================================
// MESSAGE EDGE CASES
// ============================================================================

#[test]
fn test_empty_message_is_just_a_header() {
    let mut msg = Message::new(1);
    let bytes = msg.to_bytes().unwrap();
    assert_eq!(bytes.len(), HEADER_SIZE);
    assert_eq!(bytes[0] as usize, HEADER_SIZE);
    assert!(Message::from_bytes(&bytes).unwrap().is_empty());
}

#[test]
fn test_read_past_end_is_underrun() {
    let mut msg = Message::new(1).with(7u16).unwrap();
    assert!(msg.can_get::<u16>());
    assert!(!msg.can_get::<u32>());
    assert!(matches!(
        msg.get::<u32>(),
        Err(ProtocolError::BufferUnderrun { needed: 4, remaining: 2 })
    ));
    // A failed read leaves the cursor in place
    assert_eq!(msg.get::<u16>().unwrap(), 7);
}

#[test]
fn test_short_input_rejected() {
    for len in 0..HEADER_SIZE {
        let data = vec![len as u8; len];
        assert!(Message::from_bytes(&data).is_err(), "length {len} accepted");
    }
}

#[test]
fn test_declared_length_must_match() {
    let mut msg = Message::new(3).with(1u64).unwrap();
    let mut bytes = msg.to_bytes().unwrap().to_vec();
    bytes.pop();
    assert!(matches!(
        Message::from_bytes(&bytes),
        Err(ProtocolError::LengthMismatch { declared: 18, actual: 17 })
    ));
}

#[test]
fn test_invalid_utf8_string_block() {
    let mut msg = Message::new(1);
    msg.set(vec![0xFFu8, 0xFE, 0xFD]).unwrap();
    let mut back = Message::from_bytes(&msg.to_bytes().unwrap()).unwrap();
    assert!(matches!(back.get::<String>(), Err(ProtocolError::MalformedBlock(_))));
}

#[test]
fn test_oversized_message_rolls_back() {
    let mut msg = Message::new(1);
    let chunk = vec![0xABu8; 60_000];
    msg.set(&chunk).unwrap();
    let before = msg.len();

    assert!(matches!(msg.set(&chunk), Err(ProtocolError::OversizedFrame(_))));
    assert_eq!(msg.len(), before);
    assert!(msg.to_bytes().unwrap().len() <= MAX_FRAME_SIZE);
}

#[test]
fn test_type_id_classification() {
    let classify = |t: u32| Message::with_header(UInt24::ZERO, 0, UInt24::new(t).unwrap()).kind();
    assert_eq!(classify(0), MessageKind::Direct);
    assert_eq!(classify(1), MessageKind::Broadcast);
    assert_eq!(classify(2), MessageKind::Sync);
    assert_eq!(classify(5), MessageKind::Other(5));
    assert_eq!(classify(10), MessageKind::Reply(0));
    assert_eq!(classify(0xFF_FFFF), MessageKind::Reply(0xFF_FFFF - 10));
}

#[test]
fn test_reply_id_out_of_range() {
    let mut msg = Message::new(1);
    assert!(msg.set_reply_id(0xFF_FFFF).is_err());
    assert!(msg.set_reply_id(0xFF_FFFF - 10).is_ok());
}

#[test]
fn test_pack_rejects_mixed_heads() {
    let parts = [Message::new(4), Message::new(5)];
    assert!(matches!(Message::pack(4, &parts), Err(ProtocolError::InvalidPack(_))));
}

#[test]
fn test_unpack_stops_at_garbage_tail() {
    let parts: Vec<Message> = (0..3).map(|i| Message::new(8).with(i as u8).unwrap()).collect();
    let mut packed = Message::pack(8, &parts).unwrap();
    // Two stray bytes cannot hold another entry prefix
    packed.set(0xBEEFu16).unwrap();
    assert_eq!(packed.unpack().len(), 3);
}

// ============================================================================
// PIPELINE EDGE CASES
// ============================================================================

#[test]
fn test_keyed_strategy_without_key() {
    for kind in EncryptionKind::ALL.into_iter().filter(|k| k.requires_key()) {
        assert!(matches!(
            CodecPipeline::new(kind, None, CompressionKind::None),
            Err(ProtocolError::MissingKey(_))
        ));
    }
}

#[test]
fn test_wrong_key_fails_authenticated_decrypt() {
    let sender = CodecPipeline::new(EncryptionKind::XChaCha20Poly1305, Some(b"right"), CompressionKind::None).unwrap();
    let receiver = CodecPipeline::new(EncryptionKind::XChaCha20Poly1305, Some(b"wrong"), CompressionKind::None).unwrap();

    let frame = Message::new(1).with(5u32).unwrap().serialize(&sender).unwrap();
    assert!(matches!(
        Message::from_frame(frame, &receiver),
        Err(ProtocolError::DecryptionFailure)
    ));
}

#[test]
fn test_truncated_pipeline_frame() {
    let pipeline = CodecPipeline::new(EncryptionKind::Xor, Some(b"k"), CompressionKind::Lz4).unwrap();
    let frame = Message::new(1).with("truncate me").unwrap().serialize(&pipeline).unwrap();
    let cut = frame.slice(..frame.len() - 1);
    assert!(matches!(
        Message::from_frame(cut, &pipeline),
        Err(ProtocolError::LengthMismatch { .. })
    ));
}

#[test]
fn test_decompression_bomb_capped() {
    let huge = vec![0u8; 4 * MAX_FRAME_SIZE];
    for kind in [CompressionKind::Lz4, CompressionKind::Zstd] {
        let packed = compress(&huge, &kind).unwrap();
        assert!(matches!(
            decompress(&packed, &kind),
            Err(ProtocolError::DecompressionFailure)
        ));
    }
}

#[test]
fn test_corrupt_compressed_payload() {
    assert!(decompress(&[1, 2], &CompressionKind::Lz4).is_err());
    assert!(decompress(b"definitely not zstd", &CompressionKind::Zstd).is_err());
}

// ============================================================================
// DISPATCHER EDGE CASES
// ============================================================================

#[test]
fn test_handler_error_keeps_connection_open() {
    let (conn, mut rx) = Connection::detached(UInt24::new(1).unwrap(), Arc::new(CodecPipeline::passthrough()));
    let dispatcher = Dispatcher::new()
        .with_head_action(1, "failing", |_, _| {
            Err(ProtocolError::Custom("game rule violated".into()))
        })
        .unwrap();

    assert_eq!(dispatcher.dispatch(Message::new(1), &conn).unwrap(), Dispatch::Handled);
    assert!(!conn.is_closed());
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_handler_may_register_more_actions() {
    let (conn, _rx) = Connection::detached(UInt24::new(1).unwrap(), Arc::new(CodecPipeline::passthrough()));
    let dispatcher = Arc::new(Dispatcher::new());
    let inner = Arc::downgrade(&dispatcher);
    dispatcher
        .add_head_action(1, "bootstrap", move |_, _| {
            if let Some(d) = inner.upgrade() {
                d.add_head_action(2, "late", |_, _| Ok(None))?;
            }
            Ok(None)
        })
        .unwrap();

    dispatcher.dispatch(Message::new(1), &conn).unwrap();
    assert!(dispatcher.has_head_action(2));
    assert_eq!(dispatcher.action_name(2).as_deref(), Some("late"));
}

#[test]
fn test_removed_action_no_longer_handles() {
    let (conn, _rx) = Connection::detached(UInt24::new(1).unwrap(), Arc::new(CodecPipeline::passthrough()));
    let dispatcher = Dispatcher::new().with_head_action(6, "gone", |_, _| Ok(None)).unwrap();
    assert!(dispatcher.remove_head_action(6).unwrap());
    assert!(!dispatcher.remove_head_action(6).unwrap());
    assert_eq!(dispatcher.dispatch(Message::new(6), &conn).unwrap(), Dispatch::NotHandled);
}
