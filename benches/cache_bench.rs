//! Benchmarks for the paged KV cache hot paths.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use llm_paging::cache::allocator::BlockAllocator;
use llm_paging::cache::table::BlockTable;

fn bench_translation(c: &mut Criterion) {
    let mut alloc = BlockAllocator::new(10_000 * 32, 32);
    let mut table = BlockTable::new(32);
    for _ in 0..10_000 {
        table.append_block(1, alloc.allocate().unwrap());
    }

    c.bench_function("logical_to_physical_10k_blocks", |b| {
        b.iter(|| {
            for pos in (0..320_000).step_by(100) {
                black_box(table.logical_to_physical(1, black_box(pos)).unwrap());
            }
        })
    });
}

fn bench_alloc_free_churn(c: &mut Criterion) {
    c.bench_function("alloc_free_churn_1k", |b| {
        let mut alloc = BlockAllocator::new(1024 * 32, 32);
        b.iter(|| {
            let mut held = Vec::with_capacity(1024);
            for _ in 0..1024 {
                held.push(alloc.allocate().unwrap());
            }
            for id in held {
                alloc.free(black_box(id)).unwrap();
            }
        })
    });
}

fn bench_context_shift(c: &mut Criterion) {
    c.bench_function("remove_blocks_range_middle", |b| {
        b.iter_with_setup(
            || {
                let mut alloc = BlockAllocator::new(256 * 32, 32);
                let mut table = BlockTable::new(32);
                for _ in 0..256 {
                    table.append_block(1, alloc.allocate().unwrap());
                }
                (alloc, table)
            },
            |(mut alloc, mut table)| {
                table
                    .remove_blocks_range(1, 32 * 32, 224 * 32, &mut alloc)
                    .unwrap();
                black_box(table.num_blocks_for(1));
            },
        )
    });
}

criterion_group!(
    benches,
    bench_translation,
    bench_alloc_free_churn,
    bench_context_shift,
);
criterion_main!(benches);
