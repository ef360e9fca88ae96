#![allow(clippy::unwrap_used, clippy::expect_used)]

use gamewire::core::uint24::UInt24;
use gamewire::protocol::message::Message;
use gamewire::protocol::pipeline::CodecPipeline;
use gamewire::protocol::queue::QueueManager;
use gamewire::protocol::reply::ReplyTable;
use gamewire::protocol::router::Role;
use gamewire::transport::connection::Connection;
use gamewire::utils::compression::CompressionKind;
use gamewire::utils::crypto::EncryptionKind;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_serialize_through_shared_pipeline() {
    use tokio::task::JoinSet;

    let iterations = 500usize;
    let payload_sizes = [0usize, 64, 512, 4096, 30_000];
    let pipeline = Arc::new(
        CodecPipeline::new(EncryptionKind::XChaCha20Poly1305, Some(b"shared"), CompressionKind::Lz4).unwrap(),
    );

    let mut tasks = JoinSet::new();
    for &size in &payload_sizes {
        let pipeline = pipeline.clone();
        tasks.spawn(async move {
            for i in 0..iterations {
                let payload = vec![((i + size) & 0xFF) as u8; size];
                let mut msg = Message::new(7).with(i as u32).unwrap().with(&payload).unwrap();
                let frame = msg.serialize(&pipeline).unwrap();

                let mut back = Message::from_frame(frame, &pipeline).unwrap();
                assert_eq!(back.get::<u32>().unwrap(), i as u32);
                assert_eq!(back.get::<Vec<u8>>().unwrap().len(), size);
            }
        });
    }

    while let Some(res) = tasks.join_next().await {
        res.unwrap();
    }
}

#[test]
fn concurrent_register_yields_unique_slots() {
    let table = Arc::new(ReplyTable::new(Role::Client));
    let threads = 8;
    let per_thread = 1_000;

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let table = table.clone();
            thread::spawn(move || {
                (0..per_thread)
                    .map(|_| table.register(Box::new(|_| {})))
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for slot in handle.join().unwrap() {
            assert!(seen.insert(slot), "slot {slot} handed out twice");
        }
    }
    assert_eq!(table.len(), threads * per_thread);
}

#[test]
fn racing_replies_run_callback_at_most_once() {
    let table = Arc::new(ReplyTable::new(Role::Client));
    let hits = Arc::new(AtomicUsize::new(0));
    let rounds = 200;
    let racers = 6;

    for _ in 0..rounds {
        let h = hits.clone();
        let slot = table.register(Box::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        let barrier = Arc::new(Barrier::new(racers));
        let handles: Vec<_> = (0..racers)
            .map(|_| {
                let table = table.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let mut answer = Message::new(1);
                    answer.set_reply_id(slot).unwrap();
                    barrier.wait();
                    table.resolve(answer)
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|resolved| *resolved)
            .count();
        assert_eq!(winners, 1);
    }

    assert_eq!(hits.load(Ordering::SeqCst), rounds);
    assert!(table.is_empty());
}

#[test]
fn concurrent_sends_share_one_connection() {
    let (conn, mut rx) = Connection::detached(UInt24::new(3).unwrap(), Arc::new(CodecPipeline::passthrough()));
    let threads = 4u32;
    let per_thread = 250u32;

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let conn = conn.clone();
            thread::spawn(move || {
                for n in 0..per_thread {
                    let mut msg = Message::new(2).with(t * per_thread + n).unwrap();
                    conn.send(&mut msg).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut values = HashSet::new();
    while let Ok(frame) = rx.try_recv() {
        let mut msg = Message::from_bytes(&frame).unwrap();
        values.insert(msg.get::<u32>().unwrap());
    }
    assert_eq!(values.len(), (threads * per_thread) as usize);
}

#[test]
fn queue_manager_spreads_work_across_workers() {
    let per_thread = Arc::new(Mutex::new(HashSet::new()));
    let handled = Arc::new(AtomicUsize::new(0));
    let sink = per_thread.clone();
    let count = handled.clone();

    let manager = QueueManager::new(
        "spread",
        4,
        Duration::from_millis(1),
        Arc::new(move |_: u32| {
            // Slow enough that queues back up and the scanner moves on
            thread::sleep(Duration::from_micros(200));
            if let Some(name) = thread::current().name() {
                sink.lock().unwrap().insert(name.to_string());
            }
            count.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .unwrap();
    assert_eq!(manager.worker_count(), 4);

    for n in 0..400 {
        manager.push(n).unwrap();
        if n % 25 == 0 {
            thread::sleep(Duration::from_millis(2));
        }
    }
    manager.shutdown();

    assert_eq!(handled.load(Ordering::SeqCst), 400);
    let names = per_thread.lock().unwrap();
    assert!(names.len() > 1, "only {:?} did any work", names);
    assert!(names.iter().all(|n| n.starts_with("spread-worker-")));
}

#[test]
fn rescan_picks_the_emptiest_queue() {
    let gate = Arc::new(Barrier::new(2));
    let release = gate.clone();
    let manager = QueueManager::new(
        "rescan",
        2,
        Duration::from_secs(60),
        Arc::new(move |n: u32| {
            if n == 0 {
                release.wait();
            }
        }),
    )
    .unwrap();

    // Queue 0 blocks on its first item and backs up behind it
    for n in 0..5 {
        manager.push_to(0, n).unwrap();
    }
    assert_eq!(manager.rescan(), 1);
    assert_eq!(manager.push(99).unwrap(), 1);

    gate.wait();
    manager.shutdown();
}

#[test]
fn one_at_a_time_assignment_stays_balanced() {
    const BLOCK: u32 = u32::MAX;

    for workers in [1usize, 2, 3, 5, 8] {
        for assignments in [0u32, 1, 7, 40, 101] {
            let started = Arc::new(Barrier::new(workers + 1));
            let gate = Arc::new(Barrier::new(workers + 1));
            let (s, g) = (started.clone(), gate.clone());
            let manager = QueueManager::new(
                "balance",
                workers,
                Duration::from_secs(60),
                Arc::new(move |n: u32| {
                    if n == BLOCK {
                        s.wait();
                        g.wait();
                    }
                }),
            )
            .unwrap();

            // Park every worker so nothing drains while we assign
            for index in 0..workers {
                manager.push_to(index, BLOCK).unwrap();
            }
            started.wait();

            for n in 0..assignments {
                manager.push(n).unwrap();
                manager.rescan();
            }

            let lengths = manager.queue_lengths();
            let spread = lengths.iter().max().unwrap() - lengths.iter().min().unwrap();
            assert!(spread <= 1, "{workers} queues after {assignments} pushes: {lengths:?}");
            assert_eq!(lengths.iter().sum::<usize>(), assignments as usize);

            gate.wait();
            manager.shutdown();
        }
    }
}
