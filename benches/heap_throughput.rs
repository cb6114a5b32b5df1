use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;

use pantheros_heap::mm::config::MAX_HEAP_SIZE;
use pantheros_heap::{Heap, HeapConfig, OomPolicy, Region};

const OPS: u64 = 10_000;

fn leaked_region() -> Region<'static> {
    let words: &'static mut [u64] = Box::leak(vec![0u64; MAX_HEAP_SIZE / 8].into_boxed_slice());
    // SAFETY: The words are leaked, so the bytes stay valid and unaliased.
    let bytes = unsafe { std::slice::from_raw_parts_mut(words.as_mut_ptr().cast::<u8>(), MAX_HEAP_SIZE) };
    Region::new(bytes)
}

/// Allocate and immediately free one block, `OPS` times.
fn alloc_free(heap: &Heap<'static>, size: usize) {
    for _ in 0..OPS {
        let ptr = heap.allocate(size, OomPolicy::Abort).unwrap();
        black_box(ptr);
        heap.deallocate(ptr);
    }
}

/// Keep 64 blocks live and free them in reverse order, stressing coalescing
/// in the variable bin.
fn alloc_batch(heap: &Heap<'static>, size: usize) {
    let mut live = Vec::with_capacity(64);
    for _ in 0..OPS / 64 {
        for _ in 0..64 {
            live.push(heap.allocate(size, OomPolicy::Abort).unwrap());
        }
        while let Some(ptr) = live.pop() {
            heap.deallocate(ptr);
        }
    }
}

fn benchmark_heap_throughput(c: &mut Criterion) {
    let heap: Heap<'static> = Heap::init(leaked_region(), &HeapConfig::DEFAULT).unwrap();
    let mut group = c.benchmark_group("heap_throughput");

    for size in [16, 64, 256, 1024, 4096] {
        group.throughput(Throughput::Elements(OPS));

        group.bench_with_input(BenchmarkId::new("alloc_free", size), &size, |b, &size| {
            b.iter(|| alloc_free(&heap, size))
        });

        group.bench_with_input(BenchmarkId::new("alloc_batch", size), &size, |b, &size| {
            b.iter(|| alloc_batch(&heap, size))
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_heap_throughput);
criterion_main!(benches);
