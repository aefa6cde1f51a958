//! # Summary
//!
//! This module abstracts over connections between servers (and between
//! demo clients and servers).
//!
//! Uses `tokio-serde-bincode` to wrap `tokio`'s length-delimited codec,
//! which in turn wraps an asynchronous TCP stream, so Rust structs can be
//! written and read over the network with minimal boilerplate.

use futures::{sink, stream};
use tokio::codec::{length_delimited, FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio::prelude::*;
use tokio::{io, net};
use tokio_serde_bincode::{ReadBincode, WriteBincode};

type ReadTcp = io::ReadHalf<net::TcpStream>;
type WriteTcp = io::WriteHalf<net::TcpStream>;

/// Receiving half of a connection. Expects length-delimited,
/// bincode-encoded data of type `R`.
pub struct Rx<R>(
    ReadBincode<stream::FromErr<FramedRead<ReadTcp, LengthDelimitedCodec>, bincode::Error>, R>,
);

/// Transmitting half of a connection. Sends length-delimited,
/// bincode-encoded data of type `T`.
pub struct Tx<T>(
    WriteBincode<sink::SinkFromErr<FramedWrite<WriteTcp, LengthDelimitedCodec>, bincode::Error>, T>,
);

/// Splits a TCP stream into framed receiving and transmitting halves.
pub fn split<R, T>(stream: net::TcpStream) -> (Rx<R>, Tx<T>)
where R: serde::de::DeserializeOwned,
      T: serde::Serialize,
{
    let (rx, tx) = stream.split();
    let rx = length_delimited::Builder::new()
        .new_read(rx)
        .from_err::<bincode::Error>();
    let tx = length_delimited::Builder::new()
        .new_write(tx)
        .sink_from_err::<bincode::Error>();
    (Rx(ReadBincode::new(rx)), Tx(WriteBincode::new(tx)))
}

impl<R: serde::de::DeserializeOwned> Stream for Rx<R> {
    type Item = R;
    type Error = ();

    // A frame that cannot be decoded poisons the whole connection; the
    // peer task ends and quorum waiters see the missing votes as failures.
    fn poll(&mut self) -> Result<Async<Option<Self::Item>>, Self::Error> {
        self.0.poll().map_err(|err| {
            trace!("closing connection on malformed frame: {}", err);
        })
    }
}

impl<T: serde::Serialize> Sink for Tx<T> {
    type SinkItem = T;
    type SinkError = ();

    #[inline]
    fn start_send(&mut self, item: Self::SinkItem) -> Result<AsyncSink<Self::SinkItem>, Self::SinkError> {
        self.0.start_send(item).map_err(|_| ())
    }

    #[inline]
    fn poll_complete(&mut self) -> Result<Async<()>, Self::SinkError> {
        self.0.poll_complete().map_err(|_| ())
    }
}
