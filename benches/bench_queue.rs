//! Hot-path benchmarks for the per-peer priority queue.
//!
//! Measures the producer and consumer paths in isolation and under the
//! mixed-priority traffic the drain loop sees in practice. No mocks: this is
//! the exact queue every send crosses.
//!
//! ## Run
//! ```bash
//! cargo bench --bench bench_queue
//! # Save a named baseline for regression comparison:
//! cargo bench --bench bench_queue -- --save-baseline v0_1_0
//! ```

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use peertalk::queue::{Priority, PriorityQueue};
use peertalk::MAX_MESSAGE_SIZE;

fn bench_push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_push_pop");
    for payload_len in [16usize, 256, 1024] {
        let payload = vec![0xA5u8; payload_len];
        group.throughput(Throughput::Bytes(payload_len as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(payload_len),
            &payload,
            |b, payload| {
                let queue = PriorityQueue::new(128).unwrap();
                let mut out = [0u8; MAX_MESSAGE_SIZE];
                b.iter(|| {
                    queue.push(payload, Priority::Normal, 0).unwrap();
                    queue.pop(&mut out).unwrap()
                });
            },
        );
    }
    group.finish();
}

fn bench_isr_push(c: &mut Criterion) {
    c.bench_function("queue_push_isr", |b| {
        let queue = PriorityQueue::new(128).unwrap();
        let payload = [0u8; 64];
        let mut out = [0u8; MAX_MESSAGE_SIZE];
        b.iter(|| {
            queue.push_isr(&payload).unwrap();
            queue.pop(&mut out).unwrap()
        });
    });
}

fn bench_mixed_priorities(c: &mut Criterion) {
    c.bench_function("queue_mixed_priority_burst", |b| {
        let queue = PriorityQueue::new(128).unwrap();
        let payload = [0u8; 64];
        let mut out = [0u8; MAX_MESSAGE_SIZE];
        let priorities =
            [Priority::Low, Priority::Normal, Priority::High, Priority::Critical, Priority::Normal];
        b.iter(|| {
            for priority in priorities {
                queue.push(&payload, priority, 0).unwrap();
            }
            while queue.pop(&mut out).is_some() {}
        });
    });
}

fn bench_coalescing(c: &mut Criterion) {
    c.bench_function("queue_coalesce_same_key", |b| {
        let queue = PriorityQueue::new(128).unwrap();
        let payload = [0u8; 128];
        // One pinned message; every further push overwrites it in place.
        queue.push(&payload, Priority::Normal, 42).unwrap();
        b.iter(|| queue.push(&payload, Priority::Normal, 42).unwrap());
    });
}

criterion_group!(
    benches,
    bench_push_pop,
    bench_isr_push,
    bench_mixed_priorities,
    bench_coalescing
);
criterion_main!(benches);
