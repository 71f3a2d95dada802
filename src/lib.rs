//! echo-over-redis: a TCP echo server with a store round trip per chunk
//!
//! Every chunk a client sends is forwarded to a Redis store as a probe
//! (`PING <chunk>`) and then written back to the client unchanged. The
//! echo never depends on the store being healthy; probe outcomes are only
//! logged and counted.
//!
//! Components:
//! - `store`: single shared store connection behind a request queue, with
//!   handshake, health checks and reconnection
//! - `server`: TCP listener spawning one echo session per connection
//! - `protocols::echo`: the per-connection probe-then-echo pipeline
//! - `protocols::resp`: RESP2/RESP3 codec used to talk to the store
//! - `config`: configuration via CLI arguments or TOML file

pub mod config;
pub mod protocols;
pub mod server;
pub mod store;

pub use config::{Config, ReplyMode, ServerConfig, StoreConfig};
pub use server::Server;
pub use store::{StoreClient, StoreError};
