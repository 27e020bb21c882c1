use criterion::{black_box, criterion_group, criterion_main, Criterion};
use devcollab_sync::protocol::{MediaFormat, SessionDescription, Signal};
use devcollab_sync::storage::record::{decode_record, encode_record};
use devcollab_sync::{
    AppContext, Connectivity, ConnectivityState, DurableStore, EntityKind, Identity, MemoryStore,
    OfflineWriteQueue, PendingWrite, QueueConfig, RecordingRemote, RocksStore, StoreConfig,
};
use std::sync::Arc;
use uuid::Uuid;

fn offer_signal() -> Signal {
    Signal::Offer {
        session_id: Uuid::new_v4(),
        from: "alice".into(),
        to: "bob".into(),
        description: SessionDescription::new(vec![
            MediaFormat::opus(),
            MediaFormat::vp8(),
            MediaFormat::h264(),
        ]),
    }
}

fn bench_signal_encode(c: &mut Criterion) {
    let signal = offer_signal();
    c.bench_function("signal_offer_encode", |b| {
        b.iter(|| black_box(black_box(&signal).encode().unwrap()))
    });
}

fn bench_signal_decode(c: &mut Criterion) {
    let encoded = offer_signal().encode().unwrap();
    c.bench_function("signal_offer_decode", |b| {
        b.iter(|| black_box(Signal::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_record_encode_1kb(c: &mut Criterion) {
    let write = PendingWrite::new(1, EntityKind::DocumentEdit, "ada", vec![b'x'; 1024]);
    c.bench_function("record_encode_1KB", |b| {
        b.iter(|| black_box(encode_record(black_box(&write)).unwrap()))
    });
}

fn bench_record_decode_1kb(c: &mut Criterion) {
    let write = PendingWrite::new(1, EntityKind::DocumentEdit, "ada", vec![b'x'; 1024]);
    let encoded = encode_record(&write).unwrap();
    c.bench_function("record_decode_1KB", |b| {
        b.iter(|| black_box(decode_record(black_box(&encoded)).unwrap()))
    });
}

fn bench_enqueue_flush_1000_memory(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let connectivity = Connectivity::new(ConnectivityState::Online);

    c.bench_function("enqueue_flush_1000_memory", |b| {
        b.iter(|| {
            rt.block_on(async {
                let queue = OfflineWriteQueue::new(
                    AppContext::new(Identity::new("ada", "Ada")),
                    Arc::new(MemoryStore::new()),
                    RecordingRemote::new(),
                    connectivity.watch(),
                    QueueConfig::default(),
                )
                .unwrap();
                for i in 0..1000u32 {
                    queue
                        .enqueue(EntityKind::Message, i.to_le_bytes().to_vec())
                        .unwrap();
                }
                let report = queue.flush(None).await.unwrap();
                black_box(report.sent());
            });
        })
    });
}

fn bench_rocks_append(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("devcollab_bench_append_{}", Uuid::new_v4()));
    let config = StoreConfig {
        path: dir.clone(),
        sync_writes: false,
        ..StoreConfig::default()
    };
    let store = RocksStore::open(config).unwrap();
    let payload = vec![42u8; 256];

    c.bench_function("rocks_append_256B", |b| {
        let mut id = 0u64;
        b.iter(|| {
            id += 1;
            let write = PendingWrite::new(id, EntityKind::Message, "ada", payload.clone());
            store.append(black_box(&write)).unwrap();
        })
    });

    let _ = std::fs::remove_dir_all(&dir);
}

fn bench_rocks_pending_scan_1000(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("devcollab_bench_scan_{}", Uuid::new_v4()));
    let config = StoreConfig {
        path: dir.clone(),
        sync_writes: false,
        ..StoreConfig::default()
    };
    let store = RocksStore::open(config).unwrap();
    for id in 1..=1000u64 {
        let write = PendingWrite::new(id, EntityKind::ProjectEdit, "ada", vec![7u8; 128]);
        store.append(&write).unwrap();
    }

    c.bench_function("rocks_pending_scan_1000", |b| {
        b.iter(|| black_box(store.pending(EntityKind::ProjectEdit).unwrap().len()))
    });

    let _ = std::fs::remove_dir_all(&dir);
}

criterion_group!(
    benches,
    bench_signal_encode,
    bench_signal_decode,
    bench_record_encode_1kb,
    bench_record_decode_1kb,
    bench_enqueue_flush_1000_memory,
    bench_rocks_append,
    bench_rocks_pending_scan_1000,
);
criterion_main!(benches);
