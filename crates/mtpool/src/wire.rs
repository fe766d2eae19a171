//! Wire-format seams between the pool and the MTProto codec.
//!
//! The pool never inspects payloads. Requests and responses cross
//! [`invoke_raw`](crate::Dc::invoke_raw) as opaque encode/decode capabilities
//! implemented by the surrounding client; connections consume them when
//! framing the RPC.

use crate::BoxError;

/// Serializes a request into its wire representation.
pub trait Encode: Send + Sync {
    fn encode_to(&self, buf: &mut Vec<u8>);
}

/// Fills a response object from its wire representation.
pub trait Decode: Send {
    fn decode_from(&mut self, buf: &[u8]) -> Result<(), BoxError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo(&'static str);

    impl Encode for Echo {
        fn encode_to(&self, buf: &mut Vec<u8>) {
            buf.extend_from_slice(self.0.as_bytes());
        }
    }

    #[derive(Default)]
    struct Sink(Vec<u8>);

    impl Decode for Sink {
        fn decode_from(&mut self, buf: &[u8]) -> Result<(), BoxError> {
            self.0 = buf.to_vec();
            Ok(())
        }
    }

    #[test]
    fn payloads_pass_through_untouched() {
        let mut buf = Vec::new();
        Echo("ping").encode_to(&mut buf);

        let mut sink = Sink::default();
        sink.decode_from(&buf).unwrap();
        assert_eq!(sink.0, b"ping");
    }
}
