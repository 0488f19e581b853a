//! Encoding of protocol messages to and from byte buffers.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

/// An object that can encode a particular type to, and decode it from, a
/// `Vec<u8>`. Transports move pure bytes; this is the boundary where typed
/// messages become frames.
pub trait Coder {
    type Type;

    /// Consume an instance of the encodable type and convert it to bytes.
    fn encode(&self, inst: Self::Type) -> Vec<u8>;

    /// Consume a buffer of bytes and decode it to the decodable type.
    fn decode(&self, data: Vec<u8>) -> Self::Type;
}

/// CBOR implementation of [`Coder`] over any serde-able type.
pub struct CborCoder<T> {
    phantom: PhantomData<T>,
}

impl<T> CborCoder<T> {
    pub fn new() -> Self {
        Self {
            phantom: PhantomData,
        }
    }
}

impl<T> Default for CborCoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Coder for CborCoder<T>
where
    T: Serialize + DeserializeOwned,
{
    type Type = T;

    fn encode(&self, inst: Self::Type) -> Vec<u8> {
        let mut buffer = Vec::new();
        ciborium::ser::into_writer(&inst, &mut buffer).expect("message encodes to CBOR");
        buffer
    }

    fn decode(&self, data: Vec<u8>) -> Self::Type {
        ciborium::de::from_reader(data.as_slice()).expect("frame decodes from CBOR")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Msg, SolutionData};

    #[test]
    fn messages_round_trip() {
        let coder = CborCoder::<Msg>::new();
        let msg = Msg::Solutions {
            dest_chunk: 3,
            data: vec![SolutionData {
                dest_point: 7,
                value: 2.5,
                source_chunk: 1,
                source_tet: 4,
            }],
        };
        let bytes = coder.encode(msg);
        match coder.decode(bytes) {
            Msg::Solutions { dest_chunk, data } => {
                assert_eq!(dest_chunk, 3);
                assert_eq!(data[0].value, 2.5);
                assert_eq!(data[0].source_tet, 4);
            }
            other => panic!("decoded the wrong variant: {:?}", other),
        }
    }
}
