//! Benchmarks for shadowheap.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use shadowheap::diagnostics::suppress_diagnostics;
use shadowheap::{AccessMode, GuardedHeap, HeapConfig, HeapId, StackCapture};

fn heap(config: HeapConfig) -> GuardedHeap {
    suppress_diagnostics(true);
    GuardedHeap::new(config).expect("heap")
}

fn bench_allocate_free(c: &mut Criterion) {
    let heap = heap(HeapConfig::default().with_max_stack_frames(16));

    let mut group = c.benchmark_group("allocate_free");

    for size in [16usize, 256, 4096] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let ptr = heap.allocate(black_box(size), 0);
                heap.free(ptr).unwrap();
            })
        });
    }

    group.finish();
}

fn bench_stack_capture(c: &mut Criterion) {
    let heap = heap(HeapConfig::minimal());
    let stack = StackCapture::from_frames(vec![0x1000, 0x2000, 0x3000]);

    let mut group = c.benchmark_group("stack_capture");

    group.bench_function("captured", |b| {
        b.iter(|| {
            let ptr = heap.allocate_in(HeapId::PROCESS, 64, 0, None);
            heap.free(ptr).unwrap();
        })
    });

    group.bench_function("provided", |b| {
        b.iter(|| {
            let ptr = heap.allocate_in(HeapId::PROCESS, 64, 0, Some(stack.clone()));
            heap.free_in(HeapId::PROCESS, ptr, Some(stack.clone())).unwrap();
        })
    });

    group.finish();
}

fn bench_shadow_queries(c: &mut Criterion) {
    let heap = heap(HeapConfig::minimal());
    let ptr = heap.allocate(1024, 0) as usize;

    let mut group = c.benchmark_group("shadow");

    group.bench_function("is_range_accessible_1kb", |b| {
        b.iter(|| black_box(heap.shadow().is_range_accessible(black_box(ptr), 1024)))
    });

    group.bench_function("classify_overflow", |b| {
        b.iter(|| black_box(heap.classify_access(black_box(ptr + 1024), AccessMode::Read, 1)))
    });

    group.finish();
}

fn bench_quarantine_churn(c: &mut Criterion) {
    let heap = heap(
        HeapConfig::minimal()
            .with_quarantine_size(64 * 1024)
            .with_quarantine_block_size(64 * 1024)
            .with_max_stack_frames(8),
    );

    c.bench_function("quarantine_churn_100x", |b| {
        b.iter(|| {
            for i in 0..100 {
                let ptr = heap.allocate(64 + i, 0);
                heap.free(ptr).unwrap();
            }
        })
    });
}

criterion_group!(
    benches,
    bench_allocate_free,
    bench_stack_capture,
    bench_shadow_queries,
    bench_quarantine_churn
);
criterion_main!(benches);
