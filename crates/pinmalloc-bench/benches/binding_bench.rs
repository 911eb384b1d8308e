//! Thread-slot binding benchmarks.

use std::alloc::{GlobalAlloc, Layout};
use std::thread;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use pinmalloc_core::{PinMalloc, thread_alloc};

fn bench_bound_fast_path(c: &mut Criterion) {
    let sizes: &[usize] = &[16, 64, 256, 1024, 4096, 32768];
    let mut group = c.benchmark_group("bound_alloc_free");

    for &size in sizes {
        group.bench_with_input(BenchmarkId::new("pinmalloc", size), &size, |b, &sz| {
            let layout = Layout::from_size_align(sz, 8).unwrap();
            b.iter(|| unsafe {
                let p = PinMalloc.alloc(layout);
                criterion::black_box(p);
                PinMalloc.dealloc(p, layout);
            });
        });
    }
    group.finish();
}

fn bench_slot_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("slot_lookup");
    let _ = thread_alloc();
    group.bench_function("thread_alloc_bound", |b| {
        b.iter(|| criterion::black_box(thread_alloc().as_ptr()));
    });
    group.finish();
}

fn bench_first_bind(c: &mut Criterion) {
    let mut group = c.benchmark_group("first_bind");
    group.sample_size(20);

    // Spawn cost dominates; compare against a thread that never binds.
    group.bench_function("spawn_idle", |b| {
        b.iter(|| thread::spawn(|| ()).join().unwrap());
    });
    group.bench_function("spawn_bind_exit", |b| {
        b.iter(|| {
            thread::spawn(|| criterion::black_box(thread_alloc().id()))
                .join()
                .unwrap()
        });
    });
    group.finish();
}

criterion_group!(benches, bench_bound_fast_path, bench_slot_lookup, bench_first_bind);
criterion_main!(benches);
