//! Cross-module strand behavior: failure dispatch, registry, park/unpark
//! between strands of both kinds.

use skein_strand::{
    ConditionSynchronizer, FiberScheduler, Strand, StrandBuilder, StrandError, StrandState,
    clear_default_uncaught_exception_handler, park, registry, set_default_uncaught_exception_handler,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}

// ============================================================================
// Uncaught failure dispatch
// ============================================================================

#[test]
fn uncaught_failure_dispatch() {
    let reported = Arc::new(Mutex::new(Vec::<String>::new()));
    {
        let reported = Arc::clone(&reported);
        set_default_uncaught_exception_handler(move |strand, failure| {
            let msg = failure.cause().panic_message().unwrap_or("").to_string();
            reported.lock().unwrap().push(format!("{}:{msg}", strand.name()));
        });
    }

    // Nobody joins: the default handler sees it.
    let lonely = StrandBuilder::new()
        .name("lonely")
        .spawn(|| panic!("unjoined"))
        .unwrap();
    wait_for(|| lonely.is_terminated());
    wait_for(|| !reported.lock().unwrap().is_empty());
    assert_eq!(*reported.lock().unwrap(), vec!["lonely:unjoined".to_string()]);

    // A joiner is already waiting: the failure is consumed by it.
    let release = Arc::new(AtomicBool::new(false));
    let gate = Arc::new(ConditionSynchronizer::new("gate"));
    let joined = {
        let (release, gate) = (Arc::clone(&release), Arc::clone(&gate));
        StrandBuilder::new()
            .name("joined")
            .spawn(move || {
                gate.wait_until(|| release.load(Ordering::SeqCst), None).unwrap();
                panic!("consumed");
            })
            .unwrap()
    };

    let joiner = {
        let joined = joined.clone();
        StrandBuilder::new()
            .fiber()
            .spawn(move || {
                assert!(matches!(joined.join(), Err(StrandError::Failed(_))));
            })
            .unwrap()
    };
    wait_for(|| joiner.is_parked());

    release.store(true, Ordering::SeqCst);
    gate.signal_all();
    joiner.join().unwrap();
    assert!(matches!(joined.join(), Err(StrandError::Failed(_))));
    assert_eq!(reported.lock().unwrap().len(), 1);

    // A per-strand handler takes precedence.
    let own = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&own);
    let handled = StrandBuilder::new()
        .uncaught_exception_handler(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .spawn(|| panic!("own handler"))
        .unwrap();
    wait_for(|| handled.is_terminated());
    wait_for(|| own.load(Ordering::SeqCst) == 1);
    assert_eq!(reported.lock().unwrap().len(), 1);

    clear_default_uncaught_exception_handler();
}

// ============================================================================
// Registry
// ============================================================================

#[test]
fn registry_tracks_started_strands() {
    let release = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&release);

    let strand = StrandBuilder::new()
        .fiber()
        .build(move || {
            while !flag.load(Ordering::SeqCst) {
                park("registry test");
            }
        })
        .unwrap();

    assert!(Strand::of(strand.id()).is_none(), "unstarted strands are not registered");
    strand.start().unwrap();
    assert_eq!(Strand::of(strand.id()), Some(strand.clone()));
    assert!(registry::live_strands() >= 1);

    release.store(true, Ordering::SeqCst);
    strand.unpark();
    strand.join().unwrap();
    assert!(Strand::of(strand.id()).is_none());
    assert_eq!(strand.state(), StrandState::Terminated);
}

// ============================================================================
// Park / unpark across kinds
// ============================================================================

#[test]
fn ping_pong_between_fiber_and_thread() {
    const ROUNDS: usize = 1_000;

    let scheduler = FiberScheduler::builder().name("ping").build();
    let turn = Arc::new(AtomicUsize::new(0));
    let peers: Arc<Mutex<Option<Strand>>> = Arc::new(Mutex::new(None));

    let fiber = {
        let (turn, peers) = (Arc::clone(&turn), Arc::clone(&peers));
        StrandBuilder::new()
            .scheduler(&scheduler)
            .build(move || {
                for i in 0..ROUNDS {
                    while turn.load(Ordering::SeqCst) != 2 * i {
                        park("ping");
                    }
                    turn.store(2 * i + 1, Ordering::SeqCst);
                    if let Some(peer) = peers.lock().unwrap().as_ref() {
                        peer.unpark();
                    }
                }
            })
            .unwrap()
    };

    let thread_strand = {
        let (turn, fiber) = (Arc::clone(&turn), fiber.clone());
        StrandBuilder::new()
            .build(move || {
                for i in 0..ROUNDS {
                    while turn.load(Ordering::SeqCst) != 2 * i + 1 {
                        park("pong");
                    }
                    turn.store(2 * i + 2, Ordering::SeqCst);
                    fiber.unpark();
                }
            })
            .unwrap()
    };

    *peers.lock().unwrap() = Some(thread_strand.clone());
    thread_strand.start().unwrap();
    fiber.start().unwrap();

    fiber.join_timeout(Duration::from_secs(30)).unwrap();
    thread_strand.join_timeout(Duration::from_secs(30)).unwrap();
    assert_eq!(turn.load(Ordering::SeqCst), 2 * ROUNDS);
}

#[test]
fn many_fibers_join_in_any_order() {
    let fibers: Vec<_> = (0..64)
        .map(|i| {
            StrandBuilder::new()
                .fiber()
                .name(format!("f{i}"))
                .spawn(move || {
                    skein_strand::sleep(Duration::from_millis((i % 8) as u64)).unwrap();
                })
                .unwrap()
        })
        .collect();

    for f in fibers.iter().rev() {
        f.join().unwrap();
    }
    assert!(fibers.iter().all(Strand::is_terminated));
}
