//! B+ tree engine benchmarks.
//!
//! Point lookups, batch inserts, cursor scans, commit cost with and without
//! fsync, and a mixed read/write workload.

#![allow(clippy::expect_used, missing_docs)]

use std::hint::black_box;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use inkvault_store::{Database, DatabaseOptions, Error};
use tempfile::TempDir;

const BUCKET: &[u8] = b"bench";

fn key(i: usize) -> Vec<u8> {
    format!("key-{i:08}").into_bytes()
}

fn open(dir: &TempDir, no_sync: bool) -> Database {
    Database::open_with_options(
        dir.path().join("bench.db"),
        DatabaseOptions::builder().no_sync(no_sync).build(),
    )
    .expect("open database")
}

/// Fills the bench bucket with `count` sequential pairs, `batch_size` per commit.
fn populate(db: &Database, count: usize, batch_size: usize) {
    for batch_start in (0..count).step_by(batch_size) {
        let batch_end = (batch_start + batch_size).min(count);
        db.update(|tx| {
            let mut bucket = tx.create_bucket_if_not_exists(BUCKET)?;
            for i in batch_start..batch_end {
                bucket.put(&key(i), format!("value-{i}").as_bytes())?;
            }
            Ok::<_, Error>(())
        })
        .expect("populate");
    }
}

fn bench_point_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/point_lookup");
    group.throughput(Throughput::Elements(1));

    for count in [1_000, 10_000, 100_000] {
        let dir = TempDir::new().expect("create temp dir");
        let db = open(&dir, true);
        populate(&db, count, 1000);

        group.bench_with_input(BenchmarkId::new("hit", format!("{}k", count / 1000)), &count, |b, &count| {
            let mut counter = 0usize;
            b.iter(|| {
                counter = (counter + 7919) % count;
                let tx = db.begin_read().expect("read txn");
                let bucket = tx.bucket(BUCKET).expect("bucket");
                black_box(bucket.get(&key(counter)).expect("get").map(<[u8]>::len))
            });
        });

        group.bench_with_input(BenchmarkId::new("miss", format!("{}k", count / 1000)), &count, |b, _| {
            let tx = db.begin_read().expect("read txn");
            let bucket = tx.bucket(BUCKET).expect("bucket");
            b.iter(|| black_box(bucket.get(b"key-missing").expect("get")));
        });
    }
    group.finish();
}

fn bench_batch_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/batch_insert");

    for batch_size in [10, 100, 1000] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch_size), &batch_size, |b, &batch_size| {
            let dir = TempDir::new().expect("create temp dir");
            let db = open(&dir, true);
            let mut next = 0usize;
            b.iter(|| {
                populate_from(&db, next, batch_size);
                next += batch_size;
            });
        });
    }
    group.finish();
}

fn populate_from(db: &Database, start: usize, count: usize) {
    db.update(|tx| {
        let mut bucket = tx.create_bucket_if_not_exists(BUCKET)?;
        for i in start..start + count {
            bucket.put(&key(i), &[0xAB; 64])?;
        }
        Ok::<_, Error>(())
    })
    .expect("insert batch");
}

fn bench_cursor_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/cursor_scan");

    for count in [1_000, 10_000] {
        let dir = TempDir::new().expect("create temp dir");
        let db = open(&dir, true);
        populate(&db, count, 1000);
        group.throughput(Throughput::Elements(count as u64));

        group.bench_with_input(BenchmarkId::new("forward", count), &count, |b, _| {
            b.iter(|| {
                let tx = db.begin_read().expect("read txn");
                let mut cursor = tx.bucket(BUCKET).expect("bucket").cursor();
                let mut seen = 0usize;
                let mut item = cursor.first().expect("first");
                while let Some((k, _)) = item {
                    seen += k.len();
                    item = cursor.next().expect("next");
                }
                black_box(seen)
            });
        });

        group.bench_with_input(BenchmarkId::new("seek_100", count), &count, |b, &count| {
            let mut start = 0usize;
            b.iter(|| {
                start = (start + 101) % count;
                let tx = db.begin_read().expect("read txn");
                let mut cursor = tx.bucket(BUCKET).expect("bucket").cursor();
                let mut item = cursor.seek(&key(start)).expect("seek");
                for _ in 0..100 {
                    match item {
                        Some(entry) => {
                            black_box(entry);
                            item = cursor.next().expect("next");
                        }
                        None => break,
                    }
                }
            });
        });
    }
    group.finish();
}

fn bench_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/commit");

    for (name, no_sync) in [("fsync", false), ("no_sync", true)] {
        group.bench_function(name, |b| {
            let dir = TempDir::new().expect("create temp dir");
            let db = open(&dir, no_sync);
            populate(&db, 1000, 1000);
            let mut counter = 0usize;
            b.iter(|| {
                counter += 1;
                db.update(|tx| {
                    tx.bucket_mut(BUCKET)?.ok_or(Error::BucketNotFound)?.put(&key(counter % 1000), b"x")
                })
                .expect("commit");
            });
        });
    }
    group.finish();
}

fn bench_mixed_workload(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/mixed_workload");

    let dir = TempDir::new().expect("create temp dir");
    let db = open(&dir, true);
    populate(&db, 10_000, 1000);

    // 90% reads, 10% single-key writes.
    group.bench_function("read_heavy", |b| {
        let mut counter = 0usize;
        b.iter(|| {
            counter += 1;
            if counter % 10 == 0 {
                db.update(|tx| {
                    let mut bucket = tx.bucket_mut(BUCKET)?.ok_or(Error::BucketNotFound)?;
                    bucket.put(&key(counter % 10_000), b"updated")
                })
                .expect("write");
            } else {
                let tx = db.begin_read().expect("read txn");
                let bucket = tx.bucket(BUCKET).expect("bucket");
                black_box(bucket.get(&key(counter % 10_000)).expect("get").is_some());
            }
        });
    });
    group.finish();
}

criterion_group! {
    name = lookup_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(5))
        .sample_size(100);
    targets = bench_point_lookup
}

criterion_group! {
    name = insert_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(5))
        .sample_size(50);
    targets = bench_batch_insert, bench_commit
}

criterion_group! {
    name = scan_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(5))
        .sample_size(50);
    targets = bench_cursor_scan
}

criterion_group! {
    name = mixed_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(20);
    targets = bench_mixed_workload
}

criterion_main!(lookup_benches, insert_benches, scan_benches, mixed_benches);
