//! Client for the backing key-value store.
//!
//! A single worker task owns the store connection. `StoreClient` handles
//! are cheap clones that queue probe commands for the worker over a bounded
//! channel; replies come back on per-request oneshot channels. Issue order
//! is the order commands hit the wire, and the store replies in that order.

mod connection;
mod worker;

pub use connection::RespConnection;

use crate::config::StoreConfig;
use crate::protocols::resp::{Frame, Request};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Store client errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("not connected to the store")]
    NotConnected,

    #[error("failed to connect to the store: {0}")]
    Connect(String),

    #[error("store handshake failed: {0}")]
    Handshake(String),

    #[error("store connection lost: {0}")]
    ConnectionLost(String),

    #[error("store protocol error: {0}")]
    Protocol(String),

    #[error("store replied with an error: {0}")]
    Server(String),

    #[error("store did not answer in time")]
    Timeout,

    #[error("payload of {size} bytes exceeds the store limit of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("store client shut down")]
    Closed,
}

/// A command queued for the worker.
pub(crate) struct Command {
    pub(crate) request: Bytes,
    pub(crate) reply: oneshot::Sender<Result<Frame, StoreError>>,
}

/// Store client counters
///
/// Every issued probe ends up counted once in `succeeded` or `failed`; a
/// probe dropped before its reply arrived counts as failed.
#[derive(Debug, Default)]
pub(crate) struct StoreStats {
    issued: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    connects: AtomicU64,
}

/// Point-in-time copy of the store client counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStatsSnapshot {
    pub issued: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub connects: u64,
}

impl StoreStats {
    fn record(&self, result: &Result<Bytes, StoreError>) {
        match result {
            Ok(_) => self.succeeded.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.failed.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub(crate) fn record_connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StoreStatsSnapshot {
        StoreStatsSnapshot {
            issued: self.issued.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
        }
    }
}

/// Handle to the store worker.
#[derive(Clone)]
pub struct StoreClient {
    commands: mpsc::Sender<Command>,
    probe_command: Arc<str>,
    probe_timeout: Duration,
    max_payload: usize,
    stats: Arc<StoreStats>,
}

impl StoreClient {
    /// Spawn the store worker on the current runtime and return a handle.
    ///
    /// Returns immediately; the worker connects in the background and
    /// probes fail with `NotConnected` until it succeeds.
    pub fn start(config: StoreConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_depth);
        let stats = Arc::new(StoreStats::default());

        let client = StoreClient {
            commands: tx,
            probe_command: Arc::from(config.probe_command.as_str()),
            probe_timeout: config.probe_timeout,
            max_payload: config.max_payload,
            stats: Arc::clone(&stats),
        };

        tokio::spawn(worker::run(config, rx, stats));
        client
    }

    /// Queue one probe for `payload`.
    ///
    /// Probes issued one after another from the same task are written to
    /// the store in that order. The probe timeout runs from this call, so
    /// waiting on several pending probes in turn never stretches it.
    pub async fn issue(&self, payload: Bytes) -> Result<PendingProbe, StoreError> {
        self.stats.issued.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + self.probe_timeout;

        match self.enqueue(payload, deadline).await {
            Ok(reply) => Ok(PendingProbe {
                reply,
                deadline,
                settled: false,
                stats: Arc::clone(&self.stats),
            }),
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    async fn enqueue(
        &self,
        payload: Bytes,
        deadline: Instant,
    ) -> Result<oneshot::Receiver<Result<Frame, StoreError>>, StoreError> {
        if payload.len() > self.max_payload {
            return Err(StoreError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload,
            });
        }

        let mut request = Request::new();
        request.push(&self.probe_command, [&payload]);

        let (tx, rx) = oneshot::channel();
        let command = Command {
            request: request.into_bytes(),
            reply: tx,
        };

        match tokio::time::timeout_at(deadline, self.commands.send(command)).await {
            Ok(Ok(())) => Ok(rx),
            Ok(Err(_)) => Err(StoreError::Closed),
            Err(_) => Err(StoreError::Timeout),
        }
    }

    /// Send `payload` to the store and wait for its acknowledgment.
    pub async fn probe(&self, payload: Bytes) -> Result<Bytes, StoreError> {
        self.issue(payload).await?.wait().await
    }

    pub fn stats(&self) -> StoreStatsSnapshot {
        self.stats.snapshot()
    }
}

/// A probe written (or about to be written) to the store.
#[must_use = "a pending probe does nothing unless waited on"]
pub struct PendingProbe {
    reply: oneshot::Receiver<Result<Frame, StoreError>>,
    deadline: Instant,
    settled: bool,
    stats: Arc<StoreStats>,
}

impl PendingProbe {
    /// Wait for the store's reply, at most until the probe timeout that
    /// started when the probe was issued.
    pub async fn wait(mut self) -> Result<Bytes, StoreError> {
        let result = match tokio::time::timeout_at(self.deadline, &mut self.reply).await {
            Ok(Ok(reply)) => reply.and_then(reply_payload),
            Ok(Err(_)) => Err(StoreError::Closed),
            Err(_) => Err(StoreError::Timeout),
        };
        self.settled = true;
        self.stats.record(&result);
        result
    }
}

#[cfg(test)]
impl PendingProbe {
    /// A probe answered through `reply` rather than by the worker.
    pub(crate) fn detached(
        reply: oneshot::Receiver<Result<Frame, StoreError>>,
        timeout: Duration,
    ) -> Self {
        PendingProbe {
            reply,
            deadline: Instant::now() + timeout,
            settled: false,
            stats: Arc::new(StoreStats::default()),
        }
    }
}

impl Drop for PendingProbe {
    fn drop(&mut self) {
        if !self.settled {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Extract the acknowledgment bytes from a probe reply.
fn reply_payload(frame: Frame) -> Result<Bytes, StoreError> {
    if let Some(msg) = frame.as_error() {
        return Err(StoreError::Server(msg));
    }

    match frame {
        Frame::Bulk(Some(data)) => Ok(data),
        Frame::Simple(s) => Ok(Bytes::from(s)),
        Frame::Verbatim { data, .. } => Ok(data),
        other => Err(StoreError::Protocol(format!(
            "unexpected probe reply: {other:?}"
        ))),
    }
}
