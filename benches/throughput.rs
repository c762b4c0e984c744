//! Throughput Benchmark for matchdb
//!
//! Measures the storage engine, slot hashing and frame parsing under
//! various workloads.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use matchdb::cluster::{LocalMaster, PeerTable};
use matchdb::node::NodeId;
use matchdb::protocol::{parse_frame, Frame};
use matchdb::routing::{HashKey, SlotRouter};
use matchdb::storage::{Db, Entry};
use std::sync::Arc;
use std::time::Duration;

fn create_db(limit: u64) -> Arc<Db> {
    let router = Arc::new(SlotRouter::new(HashKey::new(1, 2)));
    let id = NodeId::new("127.0.0.1", 8090).unwrap();
    router.assign_all(id.addr());
    Arc::new(Db::new(
        id,
        limit,
        Arc::new(LocalMaster::new(router)),
        Arc::new(PeerTable::new()),
    ))
}

/// Benchmark SET operations
fn bench_set(c: &mut Criterion) {
    let db = create_db(1 << 40);

    let mut group = c.benchmark_group("set");
    group.throughput(Throughput::Elements(1));

    group.bench_function("set_small", |b| {
        let mut i = 0u64;
        b.iter(|| {
            db.set(Entry::new(format!("listing:{}", i), "small_value"))
                .unwrap();
            i += 1;
        });
    });

    group.bench_function("set_medium", |b| {
        let mut i = 0u64;
        let value = bytes::Bytes::from("x".repeat(1024));
        b.iter(|| {
            db.set(Entry::new(format!("listing:{}", i), value.clone()))
                .unwrap();
            i += 1;
        });
    });

    group.bench_function("overwrite_same_id", |b| {
        b.iter(|| {
            db.set(Entry::new("listing:hot", "value")).unwrap();
        });
    });

    group.finish();
}

/// Benchmark GET operations
fn bench_get(c: &mut Criterion) {
    let db = create_db(1 << 40);

    for i in 0..100_000 {
        db.set(Entry::new(format!("listing:{}", i), format!("value:{}", i)))
            .unwrap();
    }

    let mut group = c.benchmark_group("get");
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_existing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            black_box(db.get(&format!("listing:{}", i % 100_000)));
            i += 1;
        });
    });

    group.bench_function("get_missing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            black_box(db.get(&format!("missing:{}", i)));
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark writes against a full table (every write rejected)
fn bench_rejected(c: &mut Criterion) {
    let db = create_db(1024);
    db.set(Entry::new("fill", vec![0u8; 1000])).unwrap();

    let mut group = c.benchmark_group("admission");
    group.throughput(Throughput::Elements(1));

    group.bench_function("rejected_write", |b| {
        b.iter(|| {
            black_box(db.set(Entry::new("big", vec![0u8; 512])).is_err());
        });
    });

    group.finish();
}

/// Benchmark slot hashing
fn bench_slot(c: &mut Criterion) {
    let key = HashKey::from_hex("00112233445566778899aabbccddeeff").unwrap();

    let mut group = c.benchmark_group("routing");
    group.throughput(Throughput::Elements(1));

    group.bench_function("slot_for", |b| {
        let mut i = 0u64;
        b.iter(|| {
            black_box(key.slot_for(format!("listing:{}", i).as_bytes()));
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark frame parsing
fn bench_parse(c: &mut Criterion) {
    let get = Frame::get("listing:123456").serialize();
    let set = Frame::set("listing:123456", "x".repeat(1024)).serialize();

    let mut group = c.benchmark_group("parse");
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_frame", |b| {
        b.iter(|| black_box(parse_frame(&get).unwrap()));
    });

    group.bench_function("set_frame_1kb", |b| {
        b.iter(|| black_box(parse_frame(&set).unwrap()));
    });

    group.finish();
}

/// Benchmark concurrent access
fn bench_concurrent(c: &mut Criterion) {
    use std::thread;

    let mut group = c.benchmark_group("concurrent");
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("4_threads_mixed", |b| {
        b.iter(|| {
            let db = create_db(1 << 40);
            let handles: Vec<_> = (0..4)
                .map(|t| {
                    let db = Arc::clone(&db);
                    thread::spawn(move || {
                        for i in 0..10_000 {
                            let id = format!("listing:{}:{}", t, i);
                            db.set(Entry::new(id.clone(), "value")).unwrap();
                            db.get(&id);
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }

            black_box(db.len());
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_set,
    bench_get,
    bench_rejected,
    bench_slot,
    bench_parse,
    bench_concurrent,
);
criterion_main!(benches);
