use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

const OPS: u64 = 10_000;

/// Paired allocate/deallocate cycles through the pool.
fn pool_cycle(size: usize) {
    for _ in 0..OPS {
        let block = tierloc::allocate(size).unwrap();
        black_box(block);
        unsafe { tierloc::deallocate(block, size) };
    }
}

/// The same cycles through the system allocator.
fn system_cycle(size: usize) {
    let layout = std::alloc::Layout::from_size_align(size, std::mem::size_of::<usize>()).unwrap();
    for _ in 0..OPS {
        unsafe {
            let block = std::alloc::alloc(layout);
            black_box(block);
            std::alloc::dealloc(block, layout);
        }
    }
}

fn alloc_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_throughput");

    for size in [16, 64, 256, 1024, 4096] {
        group.throughput(Throughput::Elements(OPS));

        group.bench_with_input(BenchmarkId::new("tierloc", size), &size, |b, &size| {
            b.iter(|| pool_cycle(size))
        });

        group.bench_with_input(BenchmarkId::new("system", size), &size, |b, &size| {
            b.iter(|| system_cycle(size))
        });
    }

    group.finish();
}

criterion_group!(benches, alloc_throughput);
criterion_main!(benches);
