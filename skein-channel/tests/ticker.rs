//! Ticker broadcast and receive-side combinators across strands.

use skein_channel::{OverflowPolicy, ReceivePort, RecvError, channel, ticker};
use skein_strand::{StrandBuilder, sleep};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

fn builder(fiber: bool) -> StrandBuilder {
    if fiber {
        StrandBuilder::new().fiber()
    } else {
        StrandBuilder::new()
    }
}

// ============================================================================
// Ticker
// ============================================================================

#[test]
fn multiple_consumers_always_ascending() {
    const MESSAGES: u64 = 2000;

    let tick = ticker::<u64>(10);
    let checked = Arc::new(AtomicUsize::new(0));

    let consumer_body = |consumer: skein_channel::TickerConsumer<u64>,
                         checked: Arc<AtomicUsize>| {
        move || {
            let mut prev_index = None;
            let mut prev_msg = None;
            for msg in consumer.messages() {
                let index = consumer.last_index_read();
                assert!(index > prev_index, "index went back: {index:?} after {prev_index:?}");
                assert!(Some(msg) > prev_msg, "message went back: {msg} after {prev_msg:?}");
                // Messages are their positions
                assert_eq!(index, Some(msg));
                prev_index = index;
                prev_msg = Some(msg);
            }
            checked.fetch_add(1, Ordering::Relaxed);
        }
    };

    let first = builder(true)
        .spawn(consumer_body(tick.subscribe(), Arc::clone(&checked)))
        .unwrap();
    let second = builder(false)
        .spawn(consumer_body(tick.subscribe(), Arc::clone(&checked)))
        .unwrap();

    let producer = {
        let tick = tick.clone();
        builder(true)
            .spawn(move || {
                for i in 0..MESSAGES {
                    tick.send(i).unwrap();
                    if i % 100 == 0 {
                        sleep(Duration::from_millis(1)).unwrap();
                    }
                }
                tick.close();
            })
            .unwrap()
    };

    // Joins partway through the stream
    thread::sleep(Duration::from_millis(5));
    let late = builder(true)
        .spawn(consumer_body(tick.subscribe(), Arc::clone(&checked)))
        .unwrap();

    producer.join().unwrap();
    for consumer in [first, second, late] {
        consumer.join().unwrap();
    }
    assert_eq!(checked.load(Ordering::Relaxed), 3);
    assert_eq!(tick.sent(), MESSAGES);
}

#[test]
fn slow_consumer_sees_the_tail_of_the_stream() {
    let tick = ticker::<u32>(5);
    let fast = tick.subscribe();
    let slow = tick.subscribe();

    for i in 0..20 {
        tick.send(i).unwrap();
        assert_eq!(fast.try_receive().unwrap(), i);
    }
    tick.close();

    assert_eq!(slow.messages().collect::<Vec<_>>(), [15, 16, 17, 18, 19]);
    assert!(matches!(fast.receive(), Err(RecvError::Closed)));
}

#[test]
fn ticker_consumers_compose_with_combinators() {
    let tick = ticker::<u32>(16);
    let squares = tick.subscribe().filter(|v| v % 3 == 0).map(|v| v * v);

    for i in 0..10 {
        tick.send(i).unwrap();
    }
    tick.close();
    assert_eq!(squares.messages().collect::<Vec<_>>(), [0, 9, 36, 81]);
}

// ============================================================================
// Combinators over channels
// ============================================================================

#[test]
fn mapped_channel_across_strand_kinds() {
    for fiber in [false, true] {
        let ch = channel::<u32>(4, OverflowPolicy::Block);
        let plus_ten = ch.clone().map(|v| v + 10);
        let out = channel::<u32>(16, OverflowPolicy::Block);

        let receiver = {
            let out = out.clone();
            builder(fiber)
                .spawn(move || {
                    for v in plus_ten.messages() {
                        out.send(v).unwrap();
                    }
                    out.close();
                })
                .unwrap()
        };

        for i in 1..=5 {
            ch.send(i).unwrap();
        }
        ch.close();
        receiver.join().unwrap();
        assert_eq!(out.iter().collect::<Vec<_>>(), [11, 12, 13, 14, 15]);
    }
}

#[test]
fn take_limits_a_shared_channel() {
    let ch = channel::<u32>(8, OverflowPolicy::Block);
    let first_three = ch.clone().take(3);

    let producer = {
        let ch = ch.clone();
        builder(true)
            .spawn(move || {
                for i in 0..5 {
                    ch.send(i).unwrap();
                    sleep(Duration::from_millis(2)).unwrap();
                }
            })
            .unwrap()
    };

    assert_eq!(first_three.messages().collect::<Vec<_>>(), [0, 1, 2]);
    producer.join().unwrap();
    assert_eq!(ch.iter().take(2).collect::<Vec<_>>(), [3, 4]);
}
