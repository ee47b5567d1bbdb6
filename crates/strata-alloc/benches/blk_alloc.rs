//! Allocation throughput for both allocator variants.

use criterion::{criterion_group, criterion_main, Criterion};
use strata_alloc::{AllocConfig, AllocHints, Allocator, BlockAllocator};
use strata_types::{BlockSize, ChunkId};

fn cfg(total: u32) -> AllocConfig {
    AllocConfig::new(BlockSize::new(8192).unwrap(), total, ChunkId(0))
}

fn bench_fixed_cycle(c: &mut Criterion) {
    let alloc = Allocator::fixed(cfg(4096));
    let hints = AllocHints::default();
    c.bench_function("fixed_alloc_free_cycle", |b| {
        b.iter(|| {
            let bid = alloc.alloc(1, &hints).unwrap();
            alloc.free(bid);
        });
    });
}

fn bench_var_size_cycle(c: &mut Criterion) {
    let alloc = Allocator::var_size(cfg(4096));
    let hints = AllocHints::default();
    c.bench_function("var_size_alloc_free_cycle_8blk", |b| {
        b.iter(|| {
            let bid = alloc.alloc(8, &hints).unwrap();
            alloc.free(bid);
        });
    });
}

fn bench_var_size_fragmented(c: &mut Criterion) {
    let alloc = Allocator::var_size(cfg(4096));
    let hints = AllocHints::default();
    // Interleave allocs and frees so the sweep starts from a partially
    // used bitmap rather than an empty one.
    let mut pins = Vec::new();
    for i in 0..128 {
        let bid = alloc.alloc(8, &hints).unwrap();
        if i % 2 == 0 {
            pins.push(bid);
        } else {
            alloc.free(bid);
        }
    }
    c.bench_function("var_size_alloc_free_fragmented", |b| {
        b.iter(|| {
            if let Ok(bid) = alloc.alloc(8, &hints) {
                alloc.free(bid);
            }
        });
    });
    drop(pins);
}

criterion_group!(
    benches,
    bench_fixed_cycle,
    bench_var_size_cycle,
    bench_var_size_fragmented
);
criterion_main!(benches);
