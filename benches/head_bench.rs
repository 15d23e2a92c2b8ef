use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use rayon::prelude::*;
use tempfile::TempDir;
use tshead::{Head, HeadOptions, Labels};

use std::sync::atomic::{AtomicU64, Ordering};

fn labels_a(i: u64) -> Labels {
    let v = i.to_string();
    Labels::from_strings(&["a", v.as_str()]).expect("labels")
}

fn bench_series_create(c: &mut Criterion) {
    let mut group = c.benchmark_group("series_create");

    // One long-lived head, like the go-style b.N loop: every iteration creates a new series.
    let head = Head::new().expect("head init");
    let next = AtomicU64::new(0);
    group.bench_function("sequential", |b| {
        b.iter(|| {
            let i = next.fetch_add(1, Ordering::Relaxed);
            black_box(head.get_or_create(&labels_a(i)).expect("get_or_create"));
        })
    });

    group.throughput(Throughput::Elements(10_000));
    group.bench_function("parallel_10k", |b| {
        b.iter_batched(
            || Head::new().expect("head init"),
            |head| {
                (0..10_000u64).into_par_iter().for_each(|i| {
                    black_box(head.get_or_create(&labels_a(i)).expect("get_or_create"));
                });
                head
            },
            BatchSize::PerIteration,
        )
    });
    group.finish();
}

fn bench_appender_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("appender_commit");
    group.sample_size(10);
    group.throughput(Throughput::Elements(10_000));

    for (name, durable) in [("noop_log", false), ("wal", true)] {
        let dir = TempDir::new().expect("tempdir");
        let head = if durable {
            Head::open(HeadOptions::default(), dir.path()).expect("head open").0
        } else {
            Head::new().expect("head init")
        };
        let batch = AtomicU64::new(0);

        group.bench_function(format!("10k_new_series_{}", name), |b| {
            b.iter(|| {
                let num1 = batch.fetch_add(1, Ordering::Relaxed).to_string();
                let mut app = head.appender();
                for j in 0..10_000i64 {
                    let num2 = j.to_string();
                    let ls = Labels::from_strings(&[
                        "test",
                        "test",
                        "num1",
                        num1.as_str(),
                        "num2",
                        num2.as_str(),
                    ])
                    .expect("labels");
                    app.add(&ls, j, 0.0).expect("add");
                }
                black_box(app.commit().expect("commit"));
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_series_create, bench_appender_commit);
criterion_main!(benches);
