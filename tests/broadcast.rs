use std::collections::HashMap;
use std::time::Duration;

use futures::future;
use futures::{Future, Stream};
use tokio::runtime::Runtime;
use tokio::timer::Timeout;

use abcast::{AtomicBroadcast, Bincode, Config, ServerId, ShardId};

type System = AtomicBroadcast<Bincode<String>>;

/// Boots one server per ID in `shards`, all inside the given runtime.
fn boot(shards: HashMap<ShardId, Vec<ServerId>>, port: usize, runtime: &mut Runtime) -> Vec<System> {
    let ids = {
        let mut ids = shards.values().flatten().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    };
    runtime
        .block_on(future::lazy(move || {
            let systems = ids
                .into_iter()
                .map(|id| {
                    Config::new(id, shards.clone())
                        .with_port(port)
                        .with_timeout(Duration::from_secs(1))
                        .run(Bincode::<String>::default())
                })
                .collect::<Vec<_>>();
            Ok::<_, ()>(systems)
        }))
        .unwrap()
}

fn next(runtime: &mut Runtime, system: &mut System) -> (usize, String) {
    let delivery = system.delivery();
    let (head, _) = runtime
        .block_on(Timeout::new(
            delivery.into_future().map_err(|_| ()),
            Duration::from_secs(20),
        ))
        .expect("delivery timed out");
    let ordered = head.expect("delivery stream ended");
    (ordered.sequence, ordered.message)
}

#[test]
fn single_shard_delivers_everywhere() {
    let shards = vec![(1, vec![0, 1, 2])].into_iter().collect::<HashMap<_, _>>();
    let mut runtime = Runtime::new().unwrap();
    let mut systems = boot(shards, 29500, &mut runtime);

    // Submitting through a follower exercises the remote propose path.
    let send = systems[1].send(&String::from("hello"), &[1]);
    runtime
        .block_on(Timeout::new(send, Duration::from_secs(20)))
        .expect("send timed out");

    for system in &mut systems {
        assert_eq!(next(&mut runtime, system), (1, String::from("hello")));
    }
    runtime.shutdown_now().wait().ok();
}

#[test]
fn multiple_shards_deliver_independently() {
    let shards = vec![(1, vec![0, 1, 2]), (2, vec![3, 4, 5])]
        .into_iter()
        .collect::<HashMap<_, _>>();
    let mut runtime = Runtime::new().unwrap();
    let mut systems = boot(shards, 29600, &mut runtime);

    let send = systems[0].send(&String::from("both"), &[1, 2]);
    runtime
        .block_on(Timeout::new(send, Duration::from_secs(20)))
        .expect("send timed out");

    for system in &mut systems {
        assert_eq!(next(&mut runtime, system), (1, String::from("both")));
    }
    runtime.shutdown_now().wait().ok();
}
