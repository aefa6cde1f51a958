//! # Summary
//!
//! This module defines the codec boundary between application messages and
//! the opaque byte payloads carried through consensus. The codec must be
//! bijective: a payload produced by `encode` always decodes back to the
//! original message.

use std::marker;

/// Translates application messages to and from opaque byte payloads.
pub trait Codec: Clone + Send + 'static {
    type Message: Send + 'static;
    type Error: std::fmt::Display;

    fn encode(&self, message: &Self::Message) -> Vec<u8>;
    fn decode(&self, bytes: &[u8]) -> Result<Self::Message, Self::Error>;
}

/// Standard codec for any serde-serializable message type, matching the
/// wire format used between servers.
#[derive(Derivative)]
#[derivative(Clone(bound = ""), Default(bound = ""), Debug(bound = ""))]
pub struct Bincode<M>(marker::PhantomData<M>);

impl<M> Codec for Bincode<M>
where M: serde::Serialize
    + serde::de::DeserializeOwned
    + Send
    + 'static
{
    type Message = M;
    type Error = bincode::Error;

    fn encode(&self, message: &M) -> Vec<u8> {
        bincode::serialize(message)
            .expect("[INTERNAL ERROR]: failed to serialize message")
    }

    fn decode(&self, bytes: &[u8]) -> Result<M, Self::Error> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let codec = Bincode::<String>::default();
        let message = String::from("over the wire");
        let decoded = codec.decode(&codec.encode(&message)).unwrap();
        assert_eq!(message, decoded);
    }
}
