//! Basic benchmarks for the `media_pool` package.

#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;
use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};
use media_pool::{
    BufferFactory, BufferPool, DisposalQueuePool, LinkSlot, PoolConfig, TimelineFence,
};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

const ITEM_SIZE: usize = 1920 * 1080 * 3 / 2;

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("mp_pool");

    let pool = BufferPool::new(BufferFactory::new());
    pool.configure(
        PoolConfig::builder()
            .item_size(ITEM_SIZE)
            .min_items(4)
            .max_items(8)
            .build()
            .unwrap(),
    )
    .unwrap();
    pool.set_active(true).unwrap();

    group.bench_function("acquire_release", |b| {
        b.iter(|| {
            let buffer = pool.acquire().unwrap();
            black_box(buffer.size());
            buffer.release()
        });
    });

    group.bench_function("acquire_release_four", |b| {
        b.iter(|| {
            let buffers: Vec<_> = (0..4).map(|_| pool.acquire().unwrap()).collect();
            drop(black_box(buffers));
        });
    });

    group.finish();

    let mut group = c.benchmark_group("mp_disposal");

    let disposal = DisposalQueuePool::new();
    let timeline = TimelineFence::new();
    let mut value = 0_u64;

    group.bench_function("submit_signal", |b| {
        b.iter(|| {
            value = value.wrapping_add(1);

            let mut queue = disposal.acquire_queue();
            queue.push_drop(black_box(vec![0_u8; 64]));
            queue.submit(&timeline.at(value));
            timeline.signal(value);
        });
    });

    group.finish();

    let mut group = c.benchmark_group("mp_link");

    let slot = LinkSlot::new();
    slot.attach(Arc::new(42_u64));

    group.bench_function("lock_for_read", |b| {
        b.iter(|| {
            let guard = slot.lock_for_read().unwrap();
            black_box(*guard);
        });
    });

    group.finish();
}
