#![no_main]

use gamewire::utils::compression::{compress, decompress, CompressionKind};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    for kind in [CompressionKind::Lz4, CompressionKind::Zstd] {
        if let Ok(compressed) = compress(data, &kind) {
            if let Ok(back) = decompress(&compressed, &kind) {
                assert_eq!(back, data);
            }
        }
        // Malformed input must fail inside the output cap
        let _ = decompress(data, &kind);
    }
});
