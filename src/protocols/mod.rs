//! Protocol implementations.
//!
//! - `echo`: client-facing passthrough served by the listener
//! - `resp`: Redis RESP codec used by the store client

pub mod echo;
pub mod resp;
