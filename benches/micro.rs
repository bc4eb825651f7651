//! Micro-benchmarks for TermStore core operations.
//!
//! Uses Criterion for statistically rigorous measurement with regression
//! detection and HTML reports.
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench micro              # run all micro-benchmarks
//! cargo bench --bench micro -- put       # filter by name
//! ```
//!
//! Reports are generated in `target/criterion/report/index.html`.

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use termstore::{Store, StoreConfig, StreamEvent};

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Default posting value for benchmarks (128 bytes).
const VALUE_128B: &[u8; 128] = &[0xAB; 128];

/// Format a zero-padded value so every put is distinct.
fn make_value(i: u64) -> Vec<u8> {
    format!("doc-{i:012}").into_bytes()
}

/// Open a store with merges effectively disabled, so puts measure the
/// buffer path alone.
fn open_no_merge(dir: &std::path::Path) -> Store {
    Store::start(
        dir.join("idx"),
        StoreConfig {
            merge_interval: Duration::from_secs(3600),
            ..StoreConfig::default()
        },
    )
    .expect("start")
}

/// Open a store with short intervals, pre-populate one bucket, and wait
/// until everything is merged and installed.
fn prepopulate(dir: &std::path::Path, count: u64) -> Store {
    let store = Store::start(
        dir.join("idx"),
        StoreConfig {
            merge_interval: Duration::from_millis(200),
            checkpoint_interval: Duration::from_millis(10),
            ..StoreConfig::default()
        },
    )
    .expect("start");

    for i in 0..count {
        store.put(b"bench", &make_value(i), VALUE_128B).expect("put");
    }

    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let stats = store.stats().expect("stats");
        if stats.buffered_records == 0
            && stats.pending_rawfiles == 0
            && !stats.is_merging
            && stats.merge_count >= 1
        {
            break;
        }
        assert!(Instant::now() < deadline, "prepopulate did not quiesce");
        std::thread::sleep(Duration::from_millis(10));
    }
    store
}

// ================================================================================================
// Write benchmarks
// ================================================================================================

fn bench_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("put");
    group.throughput(Throughput::Elements(1));

    group.bench_function("single_bucket_128b", |b| {
        let dir = TempDir::new().unwrap();
        let store = open_no_merge(dir.path());
        let mut i = 0u64;
        b.iter(|| {
            store
                .put(b"bench", black_box(&make_value(i)), VALUE_128B)
                .expect("put");
            i += 1;
        });
        store.close().expect("close");
    });

    group.finish();
}

// ================================================================================================
// Stream benchmarks
// ================================================================================================

fn bench_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream");
    group.sample_size(20);

    for count in [1_000u64, 10_000] {
        group.throughput(Throughput::Elements(count));
        group.bench_function(format!("bucket_of_{count}"), |b| {
            let dir = TempDir::new().unwrap();
            let store = prepopulate(dir.path(), count);
            b.iter(|| {
                let (sink, results) = mpsc::channel();
                store.stream(b"bench", sink, 1).expect("stream");
                let mut seen = 0u64;
                for message in results {
                    match message.event {
                        StreamEvent::Value { value, .. } => {
                            black_box(value);
                            seen += 1;
                        }
                        StreamEvent::Done => break,
                        StreamEvent::Failed { reason } => panic!("stream failed: {reason}"),
                    }
                }
                assert_eq!(seen, count);
            });
            store.close().expect("close");
        });
    }

    group.finish();
}

criterion_group!(benches, bench_put, bench_stream);
criterion_main!(benches);
