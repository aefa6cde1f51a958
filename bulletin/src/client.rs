use std::io::BufRead;

use futures::future;
use futures::sync::mpsc;
use structopt::StructOpt;
use tokio::prelude::*;

#[derive(StructOpt)]
#[structopt(name = "bulletin-client")]
struct Opt {
    /// Name to sign posts with
    #[structopt(short = "a", long = "author")]
    author: String,

    /// Client port of the server to post through
    #[structopt(short = "s", long = "server")]
    server: usize,

    /// Shards whose boards should carry the posts
    #[structopt(short = "d", long = "shards")]
    shards: Vec<usize>,
}

fn main() {
    let opt = Opt::from_args();

    tokio::run(future::lazy(move || {
        let addr = format!("127.0.0.1:{}", opt.server)
            .parse()
            .expect("invalid server port");

        tokio::net::tcp::TcpStream::connect(&addr)
            .map_err(|err| eprintln!("failed to connect: {}", err))
            .and_then(move |stream| {
                let (_rx, tx) = abcast::socket::split::<(), bulletin::Post>(stream);

                // Stdin is read on its own thread so the reactor never
                // blocks on the terminal.
                let (line_tx, line_rx) = mpsc::unbounded();
                std::thread::spawn(move || {
                    let stdin = std::io::stdin();
                    for line in stdin.lock().lines().filter_map(Result::ok) {
                        if line_tx.unbounded_send(line).is_err() {
                            break;
                        }
                    }
                });

                let author = opt.author;
                let shards = opt.shards;
                line_rx
                    .map(move |body| bulletin::Post {
                        note: bulletin::Note {
                            author: author.clone(),
                            body,
                        },
                        shards: shards.clone(),
                    })
                    .forward(tx)
                    .map(|_| ())
            })
    }));
}
