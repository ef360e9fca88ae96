#![no_main]

use gamewire::protocol::message::Message;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Parsing arbitrary bytes must never panic
    if let Ok(mut msg) = Message::from_bytes(data) {
        let _ = msg.kind();
        for entry in msg.unpack() {
            let _ = entry.body().len();
        }
        while msg.remaining() > 0 {
            if msg.get::<String>().is_err() && msg.get::<u8>().is_err() {
                break;
            }
        }
    }
});
