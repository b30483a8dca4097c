use criterion::{black_box, criterion_group, criterion_main, Criterion};
use logflux_diskq::options::{DiskQueueOptions, ResolvedOptions};
use logflux_diskq::qdisk::{Qdisk, QDISK_RESERVED_SPACE};
use logflux_diskq::vfs::{FileSystem, MemFileSystem};
use rand::RngCore;
use std::path::Path;
use std::sync::Arc;

fn ring_qdisk(capacity: i64) -> Qdisk {
    let fs: Arc<dyn FileSystem> = Arc::new(MemFileSystem::new());
    let mut qdisk = Qdisk::new(
        fs,
        ResolvedOptions {
            options: DiskQueueOptions {
                capacity_bytes: capacity,
                reliable: true,
                ..Default::default()
            },
            prealloc: false,
            truncate_size_ratio: 1.0,
        },
        *b"LFRQ",
    );
    qdisk.start(Path::new("/bench/ring.rqf")).unwrap();
    qdisk
}

fn record(payload: &[u8]) -> Vec<u8> {
    let mut framed = (payload.len() as u32).to_be_bytes().to_vec();
    framed.extend_from_slice(payload);
    framed
}

fn bench_push_pop_cycle(c: &mut Criterion) {
    let mut rng = rand::thread_rng();
    let mut payload = vec![0u8; 1024];
    rng.fill_bytes(&mut payload);
    let framed = record(&payload);

    c.bench_function("qdisk_push_pop_ack_1k", |b| {
        let mut qdisk = ring_qdisk(QDISK_RESERVED_SPACE + 1024 * 1024);
        b.iter(|| {
            qdisk.push_tail(black_box(&framed)).unwrap();
            black_box(qdisk.pop_head().unwrap());
            qdisk.ack_backlog(1).unwrap();
        });
    });
}

fn bench_backlog_walk(c: &mut Criterion) {
    let payload = vec![b'w'; 256];
    let framed = record(&payload);

    c.bench_function("qdisk_rewind_backlog_64", |b| {
        let mut qdisk = ring_qdisk(QDISK_RESERVED_SPACE + 1024 * 1024);
        for _ in 0..64 {
            qdisk.push_tail(&framed).unwrap();
        }
        for _ in 0..64 {
            qdisk.pop_head().unwrap();
        }
        b.iter(|| {
            qdisk.rewind_backlog(black_box(64)).unwrap();
            for _ in 0..64 {
                qdisk.pop_head().unwrap();
            }
        });
    });
}

criterion_group!(benches, bench_push_pop_cycle, bench_backlog_walk);
criterion_main!(benches);
