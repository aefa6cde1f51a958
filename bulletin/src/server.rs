use std::collections::HashMap;

use futures::future;
use log::info;
use structopt::StructOpt;
use tokio::net::tcp::TcpListener;
use tokio::prelude::*;

#[derive(StructOpt)]
#[structopt(name = "bulletin-server")]
struct Opt {
    /// Unique server ID
    #[structopt(short = "i", long = "id")]
    id: usize,

    /// Port to listen on for client posts
    #[structopt(short = "p", long = "port")]
    port: usize,

    /// Number of shards
    #[structopt(short = "s", long = "shards", default_value = "1")]
    shards: usize,

    /// Servers per shard
    #[structopt(short = "m", long = "members", default_value = "3")]
    members: usize,

    /// Timeout between servers (in milliseconds)
    #[structopt(short = "t", long = "timeout", default_value = "1000")]
    timeout: u64,
}

fn logger() {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!("[{}][{}] {}", record.level(), record.target(), message))
        })
        .level(log::LevelFilter::Info)
        .chain(std::io::stderr())
        .apply()
        .expect("failed to initialize logger");
}

/// Shard `s` (1-based) owns servers `(s - 1) * members` up to
/// `s * members`; every server derives the same map from the same flags.
fn shards(count: usize, members: usize) -> HashMap<abcast::ShardId, Vec<abcast::ServerId>> {
    (1..=count)
        .map(|shard| (shard, ((shard - 1) * members..shard * members).collect()))
        .collect()
}

fn main() {
    let opt = Opt::from_args();
    logger();

    let config = abcast::Config::new(opt.id, shards(opt.shards, opt.members))
        .with_timeout(std::time::Duration::from_millis(opt.timeout));

    tokio::run(future::lazy(move || {
        let mut system = config.run(abcast::Bincode::<bulletin::Note>::default());
        info!("server {} running", system.id());

        tokio::spawn(system.delivery().for_each(|ordered| {
            println!("{:>4} | {}", ordered.sequence, ordered.message);
            Ok(())
        }));

        let shard = opt.id / opt.members + 1;
        tokio::spawn(system.oracle(shard).watch().for_each(|leader| {
            info!("shard leader changed to {}", leader);
            Ok(())
        }));

        let addr = format!("127.0.0.1:{}", opt.port)
            .parse()
            .expect("invalid client port");
        let listener = TcpListener::bind(&addr).expect("failed to bind client port");
        listener
            .incoming()
            .map_err(|err| eprintln!("failed to accept client: {}", err))
            .for_each(move |stream| {
                let (rx, _tx) = abcast::socket::split::<bulletin::Post, ()>(stream);
                let system = system.clone();
                tokio::spawn(rx.for_each(move |post| {
                    tokio::spawn(system.send(&post.note, &post.shards));
                    Ok(())
                }));
                Ok(())
            })
    }));
}
