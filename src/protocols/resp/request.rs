//! Pipelined command requests.
//!
//! A `Request` holds one or more commands already encoded as RESP arrays of
//! bulk strings, ready to be written to the store in a single write. The
//! store answers every command with exactly one reply, in order.

use super::parser::Frame;
use bytes::{Bytes, BytesMut};

/// One or more encoded commands.
#[derive(Debug, Default, Clone)]
pub struct Request {
    payload: BytesMut,
    commands: usize,
}

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command with its arguments.
    pub fn push<I, A>(&mut self, command: &str, args: I) -> &mut Self
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        let mut parts = vec![Frame::bulk(Bytes::copy_from_slice(command.as_bytes()))];
        parts.extend(
            args.into_iter()
                .map(|arg| Frame::bulk(Bytes::copy_from_slice(arg.as_ref()))),
        );
        Frame::array(parts).encode_into(&mut self.payload);
        self.commands += 1;
        self
    }

    /// Number of replies the store will send for this request.
    pub fn expected_replies(&self) -> usize {
        self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.payload
    }

    /// Consume the request, returning the encoded bytes.
    pub fn into_bytes(self) -> Bytes {
        self.payload.freeze()
    }
}
