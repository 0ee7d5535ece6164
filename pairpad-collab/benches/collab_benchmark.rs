use criterion::{criterion_group, criterion_main, Criterion};
use pairpad_collab::awareness::{AwarenessState, AwarenessTable, DEFAULT_HEARTBEAT_TIMEOUT};
use pairpad_collab::broadcast::BroadcastGroup;
use pairpad_collab::document::{ChatMessage, ReplicatedDocument};
use pairpad_collab::protocol::SyncMessage;
use pairpad_collab::storage::{Store, StoreConfig};
use std::hint::black_box;
use std::sync::Arc;
use uuid::Uuid;

fn bench_update_encode(c: &mut Criterion) {
    let conn = Uuid::new_v4();
    let room = Uuid::new_v4();
    let update = vec![0u8; 64];

    c.bench_function("update_encode_64B", |b| {
        b.iter(|| {
            let msg = SyncMessage::update(black_box(conn), black_box(room), black_box(1), black_box(update.clone()));
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let encoded = SyncMessage::update(Uuid::new_v4(), Uuid::new_v4(), 1, vec![0u8; 64])
        .encode()
        .unwrap();

    c.bench_function("update_decode_64B", |b| {
        b.iter(|| {
            black_box(SyncMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_awareness_encode(c: &mut Criterion) {
    let state = AwarenessState::new("Alice", "#ff0000").with_cursor(10, 24);
    let conn = Uuid::new_v4();
    let room = Uuid::new_v4();

    c.bench_function("awareness_encode", |b| {
        b.iter(|| {
            black_box(SyncMessage::awareness(conn, room, 1, black_box(&state)).unwrap().encode().unwrap());
        })
    });
}

fn bench_local_insert(c: &mut Criterion) {
    c.bench_function("local_insert_1000_chars", |b| {
        b.iter(|| {
            let mut doc = ReplicatedDocument::new();
            for i in 0..1000u32 {
                black_box(doc.apply_local_insert(i, "x"));
            }
        })
    });
}

fn bench_merge_remote(c: &mut Criterion) {
    let mut source = ReplicatedDocument::new();
    let ops: Vec<_> = (0..1000u32).map(|i| source.apply_local_insert(i, "y")).collect();

    c.bench_function("merge_1000_remote_ops", |b| {
        b.iter(|| {
            let mut replica = ReplicatedDocument::new();
            for op in &ops {
                replica.merge_remote_operation(op).unwrap();
            }
            black_box(replica.len());
        })
    });
}

fn bench_snapshot(c: &mut Criterion) {
    let mut doc = ReplicatedDocument::with_text(&"fn main() {}\n".repeat(500));
    for i in 0..50 {
        doc.append_chat_message(ChatMessage::new("Alice", "#ff0000", format!("message {i}")))
            .unwrap();
    }

    c.bench_function("snapshot_encode", |b| {
        b.iter(|| black_box(doc.snapshot()))
    });

    let snapshot = doc.snapshot();
    c.bench_function("snapshot_load", |b| {
        b.iter(|| black_box(ReplicatedDocument::from_snapshot(black_box(&snapshot)).unwrap()))
    });
}

fn bench_broadcast_1000_messages(c: &mut Criterion) {
    let group = BroadcastGroup::new(2048);
    let sender = Uuid::new_v4();
    let mut subscribers: Vec<_> = (0..100).map(|_| group.subscribe(Uuid::new_v4())).collect();
    let payload = Arc::new(vec![0u8; 64]);

    c.bench_function("broadcast_1000_msgs_100_subscribers", |b| {
        b.iter(|| {
            for _ in 0..1000 {
                group.broadcast_raw(Some(sender), payload.clone());
            }
            for sub in subscribers.iter_mut() {
                while let Ok(Some(bytes)) = sub.try_recv() {
                    black_box(bytes);
                }
            }
        })
    });
}

fn bench_awareness_sweep(c: &mut Criterion) {
    c.bench_function("awareness_publish_and_sweep_1000", |b| {
        b.iter(|| {
            let mut table = AwarenessTable::new(DEFAULT_HEARTBEAT_TIMEOUT);
            for i in 0..1000u64 {
                table.publish(Uuid::new_v4(), i, AwarenessState::new("peer", "#00ff00"));
            }
            black_box(table.evict_stale());
        })
    });
}

fn bench_save_snapshot(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(StoreConfig::for_testing(dir.path())).unwrap();
    let snapshot = ReplicatedDocument::with_text(&"let x = 1;\n".repeat(200)).snapshot();
    let room = Uuid::new_v4();

    c.bench_function("store_save_snapshot", |b| {
        b.iter(|| black_box(store.save_snapshot(room, black_box(&snapshot)).unwrap()))
    });

    c.bench_function("store_load_snapshot", |b| {
        b.iter(|| black_box(store.load_snapshot(room).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_awareness_encode,
    bench_local_insert,
    bench_merge_remote,
    bench_snapshot,
    bench_broadcast_1000_messages,
    bench_awareness_sweep,
    bench_save_snapshot,
);
criterion_main!(benches);
