#![no_main]

use gamewire::protocol::handshake::{respond, HandshakeState, IdWidth, ServerHandshake, CHALLENGE_LEN};
use libfuzzer_sys::fuzz_target;
use std::time::Duration;

fuzz_target!(|data: &[u8]| {
    if data.len() < CHALLENGE_LEN {
        return;
    }
    let r1 = i32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let r2 = i32::from_le_bytes([data[4], data[5], data[6], data[7]]);

    let mut server = ServerHandshake::with_challenge(r1, r2, Duration::from_secs(30));
    let challenge = server.challenge();
    assert_eq!(server.validate(respond(challenge)), HandshakeState::Accepted);

    let _ = IdWidth::Three.decode(&data[CHALLENGE_LEN..]);
    let _ = IdWidth::Four.decode(&data[CHALLENGE_LEN..]);
});
