use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use gamewire::core::uint24::UInt24;
use gamewire::protocol::message::Message;

#[allow(clippy::unwrap_used)]
fn position_update(n: u32) -> Message {
    let mut msg = Message::with_header(UInt24::truncating(n), 60, UInt24::ZERO);
    msg.set(n).unwrap().set(1.5f32).unwrap().set(-3.25f32).unwrap().set("player").unwrap();
    msg
}

#[allow(clippy::unwrap_used)]
fn bench_message_blocks(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_blocks");

    group.bench_function("build_and_serialize", |b| {
        b.iter_batched(
            || 0u32..64,
            |range| {
                for n in range {
                    let _ = position_update(n).to_bytes().unwrap();
                }
            },
            BatchSize::SmallInput,
        )
    });

    let blob = position_update(7).to_bytes().unwrap();
    group.bench_function("parse_and_read", |b| {
        b.iter(|| {
            let mut msg = Message::from_bytes(&blob).unwrap();
            let _: u32 = msg.get().unwrap();
            let _: f32 = msg.get().unwrap();
            let _: f32 = msg.get().unwrap();
            let _: String = msg.get().unwrap();
        })
    });

    let parts: Vec<Message> = (0..32).map(position_update).collect();
    group.bench_function("pack_32", |b| {
        b.iter(|| {
            let _ = Message::pack(60, &parts).unwrap();
        })
    });

    let packed = Message::pack(60, &parts).unwrap();
    group.bench_function("unpack_32", |b| {
        b.iter(|| {
            assert_eq!(packed.unpack().len(), 32);
        })
    });

    group.finish();
}

criterion_group!(benches, bench_message_blocks);
criterion_main!(benches);
