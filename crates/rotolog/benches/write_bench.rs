//! Benchmarks for the producer-facing write path.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use rotolog::{Config, Rotation};
use tempfile::TempDir;

/// Benchmark a single producer publishing records (target: well under 1μs,
/// independent of disk speed).
fn bench_write(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let conf = Config {
        max_size_mb: 512,
        ..Config::new(temp_dir.path().join("bench.log"))
    };
    let rotation = Rotation::new(&conf).unwrap();

    let mut group = c.benchmark_group("write_sizes");
    for size in [16, 64, 256, 1024, 4096] {
        let record = vec![0u8; size];
        group.bench_function(format!("{size}B"), |b| {
            b.iter(|| rotation.write(black_box(&record)));
        });
    }
    group.finish();

    rotation.close().unwrap();
}

/// Benchmark the publish path under contention from a second producer.
fn bench_contended_write(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let conf = Config {
        max_size_mb: 512,
        ..Config::new(temp_dir.path().join("bench_contended.log"))
    };
    let rotation = std::sync::Arc::new(Rotation::new(&conf).unwrap());

    let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let background = {
        let rotation = std::sync::Arc::clone(&rotation);
        let stop = std::sync::Arc::clone(&stop);
        std::thread::spawn(move || {
            let record = vec![0u8; 256];
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                rotation.write(&record);
            }
        })
    };

    let record = vec![0u8; 256];
    c.bench_function("write_256B_contended", |b| {
        b.iter(|| rotation.write(black_box(&record)));
    });

    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    background.join().unwrap();
    rotation.close().unwrap();
}

criterion_group!(benches, bench_write, bench_contended_write);
criterion_main!(benches);
