//! Echo protocol implementation.
//!
//! Raw byte passthrough with a store probe per chunk:
//! - Client sends any bytes
//! - Each chunk delivered by one socket read is sent to the store as
//!   `PING <chunk>`
//! - The same chunk is written back, whatever the store answered
//!
//! There is no framing. A chunk is whatever one read returned, so the
//! client sees its bytes back in order but not necessarily with the same
//! segmentation it used to send them.
//!
//! ## Ordering
//!
//! Probes are issued in arrival order and may be in flight concurrently
//! (bounded by `pipeline_depth`). Write-backs are released strictly in
//! arrival order, even if a later probe finishes first.
//!
//! ## Store failures
//!
//! A failed or slow probe never holds back the echo beyond the probe
//! timeout, and is never reported to the client.

pub mod handler;

pub use handler::{handle_connection, EchoStats, EchoStatsSnapshot, SessionError, SessionOptions};
