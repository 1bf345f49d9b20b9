// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 ringbus contributors
//
// Ring buffer throughput benchmarks.
//
// Run with:
//   cargo bench --bench throughput
//
// Groups:
//   rb_write_read — chunk_write immediately drained by chunk_read
//   rb_batch      — fill the ring with a burst, then drain it
//
// Each group walks the message-size ladder the IPC layer cares about:
// a bare header, a small request, a page, and a bulk frame.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ringbus::{RbFlags, RingBuffer};

const SIZES: &[(&str, usize)] = &[
    ("header_8", 8),
    ("small_64", 64),
    ("page_4096", 4096),
    ("bulk_65536", 65536),
];

static COUNTER: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

fn bench_ring(size: usize) -> RingBuffer {
    let n = COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let name = format!("ringbus_bench_{}_{n}", std::process::id());
    RingBuffer::create(&name, size, RbFlags::SHARED_PROCESS).expect("create bench ring")
}

fn bench_write_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("rb_write_read");

    for &(label, size) in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &sz| {
            let mut rb = bench_ring(sz * 4 + 4096);
            let payload = vec![0xA5u8; sz];
            let mut out = vec![0u8; sz];
            b.iter(|| {
                rb.chunk_write(black_box(&payload)).expect("write");
                let n = rb.chunk_read(&mut out, 0).expect("read");
                black_box(n)
            });
        });
    }

    group.finish();
}

fn bench_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("rb_batch");

    for &(label, size) in SIZES {
        // Whole burst per iteration.
        const BURST: usize = 16;
        group.throughput(Throughput::Bytes((size * BURST) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &sz| {
            let mut rb = bench_ring((sz + 64) * (BURST + 1));
            let payload = vec![0x5Au8; sz];
            let mut out = vec![0u8; sz];
            b.iter(|| {
                for _ in 0..BURST {
                    rb.chunk_write(&payload).expect("write");
                }
                for _ in 0..BURST {
                    rb.chunk_read(&mut out, 0).expect("read");
                }
                black_box(&out);
            });
        });
    }

    group.finish();
}

fn bench_peek_reclaim(c: &mut Criterion) {
    let mut group = c.benchmark_group("rb_peek_reclaim");

    for &(label, size) in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &sz| {
            let mut rb = bench_ring(sz * 4 + 4096);
            let payload = vec![0x3Cu8; sz];
            b.iter(|| {
                rb.chunk_write(&payload).expect("write");
                let len = {
                    let chunk = rb.chunk_peek(0).expect("peek");
                    black_box(chunk.len())
                };
                rb.chunk_reclaim().expect("reclaim");
                len
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_write_read, bench_batch, bench_peek_reclaim);
criterion_main!(benches);
