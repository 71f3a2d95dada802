//! RESP (Redis Serialization Protocol) implementation.
//!
//! Client side of RESP2 and RESP3: frame parsing for store replies and
//! request encoding for pipelined commands.

pub mod parser;
pub mod request;

pub use parser::{parse, Frame, ParseResult};
pub use request::Request;
