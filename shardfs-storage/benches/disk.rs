//! Benchmarks for the disk store
//!
//! Run with: cargo bench --package shardfs-storage --bench disk

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use shardfs_storage::{sharded_path, DiskStore, StorageConfig};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::runtime::Runtime;

/// Generate test data of specified size
fn generate_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 256) as u8).collect()
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
}

/// Benchmark key -> path derivation
fn bench_sharded_path(c: &mut Criterion) {
    c.bench_function("sharded_path", |b| {
        b.iter(|| sharded_path(black_box("photos/2024/holiday/beach.jpg")))
    });
}

/// Benchmark object writes (directory creation included)
fn bench_write(c: &mut Criterion) {
    let rt = runtime();
    let temp_dir = TempDir::new().unwrap();
    let store = DiskStore::new(StorageConfig::new(temp_dir.path()));

    let mut group = c.benchmark_group("disk_write");

    for size in [
        1024,        // 1 KB
        64 * 1024,   // 64 KB
        1024 * 1024, // 1 MB
    ] {
        let data = generate_data(size);

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(
            BenchmarkId::new("write", format_size(size)),
            &data,
            |b, data| {
                let mut counter = 0u64;
                b.iter(|| {
                    counter += 1;
                    let key = format!("bench-{}", counter);
                    rt.block_on(store.write("bench", &key, black_box(data.as_slice())))
                        .unwrap()
                })
            },
        );
    }

    group.finish();
}

/// Benchmark opening and reading a whole object
fn bench_read(c: &mut Criterion) {
    let rt = runtime();
    let temp_dir = TempDir::new().unwrap();
    let store = DiskStore::new(StorageConfig::new(temp_dir.path()));

    let mut group = c.benchmark_group("disk_read");

    for size in [
        1024,        // 1 KB
        64 * 1024,   // 64 KB
        1024 * 1024, // 1 MB
    ] {
        let key = format!("read-{}", size);
        rt.block_on(store.write("bench", &key, generate_data(size).as_slice()))
            .unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(
            BenchmarkId::new("read", format_size(size)),
            &key,
            |b, key| {
                b.iter(|| {
                    rt.block_on(async {
                        let (size, mut file) = store.read("bench", key).await.unwrap();
                        let mut buf = Vec::with_capacity(size as usize);
                        file.read_to_end(&mut buf).await.unwrap();
                        buf
                    })
                })
            },
        );
    }

    group.finish();
}

/// Format size for display
fn format_size(bytes: usize) -> String {
    if bytes >= 1024 * 1024 {
        format!("{}MB", bytes / (1024 * 1024))
    } else if bytes >= 1024 {
        format!("{}KB", bytes / 1024)
    } else {
        format!("{}B", bytes)
    }
}

criterion_group!(benches, bench_sharded_path, bench_write, bench_read);
criterion_main!(benches);
