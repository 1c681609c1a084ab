//! Pipeline transfers across channel configurations.

use skein_channel::{ChannelBuilder, OverflowPolicy, Pipeline, RecvError};
use skein_strand::{FiberScheduler, StrandBuilder};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

struct Config {
    capacity: Option<usize>,
    policy: OverflowPolicy,
    single_consumer: bool,
    parallelism: usize,
}

fn configs() -> Vec<Config> {
    let shapes = [
        (Some(5), OverflowPolicy::Throw, true),
        (Some(5), OverflowPolicy::Throw, false),
        (Some(5), OverflowPolicy::Block, true),
        (Some(5), OverflowPolicy::Block, false),
        (Some(1), OverflowPolicy::Block, false),
        (None, OverflowPolicy::Throw, true),
        (Some(5), OverflowPolicy::Displace, true),
    ];
    [0, 2]
        .into_iter()
        .flat_map(|parallelism| {
            shapes
                .iter()
                .map(move |&(capacity, policy, single_consumer)| Config {
                    capacity,
                    policy,
                    single_consumer,
                    parallelism,
                })
        })
        .collect()
}

impl Config {
    fn builder(&self) -> ChannelBuilder {
        let builder = ChannelBuilder::new()
            .policy(self.policy)
            .single_consumer(self.single_consumer);
        match self.capacity {
            Some(capacity) => builder.capacity(capacity),
            None => builder.unbounded(),
        }
    }
}

#[test]
fn pipeline_transfers_across_configurations() {
    for config in configs() {
        let input = config.builder().build::<u32>();
        let output = config.builder().build::<u32>();

        let pipeline = Arc::new(
            Pipeline::new(input.clone(), output.clone(), |n, out| {
                out.send(n + 1).unwrap();
                out.close();
            })
            .parallelism(config.parallelism),
        );

        let runner = {
            let pipeline = Arc::clone(&pipeline);
            StrandBuilder::new()
                .fiber()
                .name("pipeline")
                .spawn(move || assert_eq!(pipeline.run().unwrap(), 4))
                .unwrap()
        };

        let receiver = {
            let output = output.clone();
            StrandBuilder::new()
                .fiber()
                .name("receiver")
                .spawn(move || {
                    let got: BTreeSet<u32> = (0..4).map(|_| output.receive().unwrap()).collect();
                    assert_eq!(got, BTreeSet::from([2, 3, 4, 5]));
                })
                .unwrap()
        };

        // the receiver is the consumer of `output`; only the sends happen here
        for i in 1..=4 {
            input.send(i).unwrap();
        }
        input.close();

        runner.join_timeout(Duration::from_secs(10)).unwrap();
        receiver.join_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(pipeline.transferred(), 4);
        assert!(output.is_closed());
    }
}

#[test]
fn parallel_pipeline_on_custom_scheduler() {
    let scheduler = FiberScheduler::builder().name("pipeline-workers").build();
    let input = skein_channel::unbounded::<u64>();
    let output = skein_channel::unbounded::<u64>();
    for i in 0..1_000 {
        input.send(i).unwrap();
    }
    input.close();

    let pipeline = Pipeline::new(input, output.clone(), |n, out| {
        out.send(n).unwrap();
        out.send(n * n).unwrap();
    })
    .parallelism(8)
    .strand_factory(scheduler.clone());

    assert_eq!(pipeline.run().unwrap(), 2_000);

    let got: Vec<u64> = output.iter().collect();
    let expected: Vec<u64> = (0..1_000).flat_map(|n| [n, n * n]).collect();
    assert_eq!(got, expected);
    assert!(matches!(output.receive(), Err(RecvError::Closed)));
    assert!(scheduler.carriers() >= 1);
}
