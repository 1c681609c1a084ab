//! Throughput benchmarks for skein channels against crossbeam-channel.

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use skein_channel::{ChannelBuilder, OverflowPolicy, SelectAction, channel, select};
use std::thread;

const MESSAGES: u64 = 100_000;
const CAPACITY: usize = 1024;

// ============================================================================
// Uncontended send + receive
// ============================================================================

fn bench_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("round_trip");

    group.bench_function("skein_bounded", |b| {
        let ch = channel::<u64>(CAPACITY, OverflowPolicy::Block);
        b.iter(|| {
            ch.send(black_box(42)).unwrap();
            black_box(ch.receive().unwrap())
        });
    });

    group.bench_function("skein_displace_full", |b| {
        let ch = channel::<u64>(4, OverflowPolicy::Displace);
        for i in 0..4 {
            ch.send(i).unwrap();
        }
        b.iter(|| ch.send(black_box(42)).unwrap());
    });

    group.bench_function("crossbeam_bounded", |b| {
        let (tx, rx) = crossbeam_channel::bounded::<u64>(CAPACITY);
        b.iter(|| {
            tx.send(black_box(42)).unwrap();
            black_box(rx.recv().unwrap())
        });
    });

    group.finish();
}

// ============================================================================
// One producer, one consumer
// ============================================================================

fn bench_spsc_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("spsc_throughput");
    group.throughput(Throughput::Elements(MESSAGES));

    group.bench_function("skein_spsc", |b| {
        b.iter(|| {
            let ch = ChannelBuilder::new()
                .capacity(CAPACITY)
                .single_producer(true)
                .single_consumer(true)
                .build::<u64>();
            let tx = ch.clone();
            let producer = thread::spawn(move || {
                for i in 0..MESSAGES {
                    tx.send(i).unwrap();
                }
            });
            let mut sum = 0u64;
            for _ in 0..MESSAGES {
                sum = sum.wrapping_add(ch.receive().unwrap());
            }
            producer.join().unwrap();
            black_box(sum)
        });
    });

    group.bench_function("crossbeam_bounded", |b| {
        b.iter(|| {
            let (tx, rx) = crossbeam_channel::bounded::<u64>(CAPACITY);
            let producer = thread::spawn(move || {
                for i in 0..MESSAGES {
                    tx.send(i).unwrap();
                }
            });
            let mut sum = 0u64;
            for _ in 0..MESSAGES {
                sum = sum.wrapping_add(rx.recv().unwrap());
            }
            producer.join().unwrap();
            black_box(sum)
        });
    });

    group.finish();
}

// ============================================================================
// Select over several channels
// ============================================================================

fn bench_select(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_ready");

    group.bench_function("skein_4way", |b| {
        let channels: Vec<_> = (0..4)
            .map(|_| channel::<u64>(CAPACITY, OverflowPolicy::Block))
            .collect();
        let mut actions: Vec<_> = channels.iter().map(SelectAction::receive).collect();
        b.iter(|| {
            channels[3].send(black_box(7)).unwrap();
            black_box(select(&mut actions).unwrap().index())
        });
    });

    group.bench_function("crossbeam_4way", |b| {
        let channels: Vec<_> = (0..4)
            .map(|_| crossbeam_channel::bounded::<u64>(CAPACITY))
            .collect();
        b.iter(|| {
            channels[3].0.send(black_box(7)).unwrap();
            let mut sel = crossbeam_channel::Select::new();
            for (_, rx) in &channels {
                sel.recv(rx);
            }
            let op = sel.select();
            let index = op.index();
            black_box(op.recv(&channels[index].1).unwrap())
        });
    });

    group.finish();
}

criterion_group!(benches, bench_round_trip, bench_spsc_throughput, bench_select);
criterion_main!(benches);
