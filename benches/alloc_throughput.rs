use std::hint::black_box;
use std::ptr::NonNull;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use jalloc::{Allocator, AllocatorConfig};

const OPS: u64 = 100_000;
const BATCH: usize = 64;

/// Allocate and immediately free; every iteration after the first is a fast-list hit.
fn jalloc_alloc_free(alloc: &Allocator, size: usize) {
    for _ in 0..OPS {
        let ptr = alloc.allocate(size, 16).unwrap();
        black_box(ptr);
        // Safety: freshly allocated with the same size and alignment.
        unsafe { alloc.deallocate(ptr, size, 16) };
    }
}

fn libc_malloc_free(size: usize) {
    for _ in 0..OPS {
        // Safety: malloc/free pair.
        unsafe {
            let ptr = libc::malloc(size);
            black_box(ptr);
            libc::free(ptr);
        }
    }
}

/// Hold `BATCH` blocks live before freeing them, so bins see some churn.
fn jalloc_batched(alloc: &Allocator, size: usize) {
    let mut live: Vec<NonNull<u8>> = Vec::with_capacity(BATCH);
    for _ in 0..OPS / BATCH as u64 {
        live.extend((0..BATCH).map(|_| alloc.allocate(size, 16).unwrap()));
        for ptr in live.drain(..) {
            // Safety: allocated above with the same size and alignment.
            unsafe { alloc.deallocate(black_box(ptr), size, 16) };
        }
    }
}

fn benchmark_alloc_throughput(c: &mut Criterion) {
    let alloc = Allocator::new().unwrap();
    let bounded = Allocator::with_config(AllocatorConfig {
        fast_list_limit: Some(8),
        ..Default::default()
    })
    .unwrap();

    let mut group = c.benchmark_group("alloc_throughput");
    for size in [16, 64, 256, 1024, 4096] {
        group.throughput(Throughput::Elements(OPS));

        group.bench_with_input(BenchmarkId::new("jalloc", size), &size, |b, &size| {
            b.iter(|| jalloc_alloc_free(&alloc, size))
        });
        group.bench_with_input(BenchmarkId::new("jalloc_batched", size), &size, |b, &size| {
            b.iter(|| jalloc_batched(&alloc, size))
        });
        group.bench_with_input(BenchmarkId::new("jalloc_bounded_fast_list", size), &size, |b, &size| {
            b.iter(|| jalloc_batched(&bounded, size))
        });
        group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
            b.iter(|| libc_malloc_free(size))
        });
    }
    group.finish();
}

fn benchmark_large_path(c: &mut Criterion) {
    let alloc = Allocator::new().unwrap();
    let mut group = c.benchmark_group("large_path");
    for size in [16 << 20, 32 << 20] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("jalloc", size), &size, |b, &size| {
            b.iter(|| {
                let ptr = alloc.allocate(size, 64).unwrap();
                // Safety: freshly allocated with the same size and alignment.
                unsafe { alloc.deallocate(black_box(ptr), size, 64) };
            })
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_alloc_throughput, benchmark_large_path);
criterion_main!(benches);
