//! Echo session handler for the Tokio runtime.

use crate::config::ReplyMode;
use crate::store::{PendingProbe, StoreClient, StoreError};
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// Errors that end a single session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to read from client: {0}")]
    Read(#[source] std::io::Error),

    #[error("failed to write to client: {0}")]
    Write(#[source] std::io::Error),
}

/// Per-session settings
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Chunks that may wait on their probe before reading pauses
    pub pipeline_depth: usize,
    pub reply: ReplyMode,
}

/// Counters shared by every session of a listener
#[derive(Debug, Default)]
pub struct EchoStats {
    chunks: AtomicU64,
    bytes: AtomicU64,
    probe_failures: AtomicU64,
}

/// Point-in-time copy of the echo counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EchoStatsSnapshot {
    pub chunks: u64,
    pub bytes: u64,
    pub probe_failures: u64,
}

impl EchoStats {
    pub fn snapshot(&self) -> EchoStatsSnapshot {
        EchoStatsSnapshot {
            chunks: self.chunks.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            probe_failures: self.probe_failures.load(Ordering::Relaxed),
        }
    }
}

/// A chunk whose probe has been issued, waiting for its write-back.
struct InFlight {
    seq: u64,
    chunk: Bytes,
    probe: Result<PendingProbe, StoreError>,
}

/// Handle an echo connection.
///
/// Every chunk read from `stream` is sent to the store as one probe and then
/// written back unchanged, whatever the probe outcome. The reader keeps
/// issuing probes while earlier ones are in flight; write-backs leave in the
/// order the chunks arrived.
pub async fn handle_connection<S>(
    stream: S,
    store: StoreClient,
    options: SessionOptions,
    stats: Arc<EchoStats>,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Send,
{
    let (reader, writer) = tokio::io::split(stream);
    let (tx, rx) = mpsc::channel(options.pipeline_depth);

    let reading = read_chunks(reader, &store, tx);
    let writing = write_back(writer, rx, options.reply, &stats);
    tokio::pin!(reading);
    tokio::pin!(writing);

    tokio::select! {
        read_result = &mut reading => {
            // Reader is done and has dropped its sender; drain what is queued
            let write_result = writing.await;
            read_result.and(write_result)
        }
        // Writer only ends first when the client stopped accepting data
        write_result = &mut writing => write_result,
    }
}

/// Read chunks and issue one probe per chunk, in arrival order.
async fn read_chunks<S>(
    mut reader: ReadHalf<S>,
    store: &StoreClient,
    tx: mpsc::Sender<InFlight>,
) -> Result<(), SessionError>
where
    S: AsyncRead,
{
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);
    let mut seq = 0u64;

    loop {
        buffer.reserve(BUFFER_SIZE);
        let n = reader.read_buf(&mut buffer).await.map_err(SessionError::Read)?;
        if n == 0 {
            trace!("Connection closed by client");
            return Ok(());
        }

        let chunk = buffer.split().freeze();
        trace!(seq, len = chunk.len(), "Chunk received");

        let probe = store.issue(chunk.clone()).await;
        if tx.send(InFlight { seq, chunk, probe }).await.is_err() {
            // Writer is gone; it reports why
            return Ok(());
        }
        seq += 1;
    }
}

/// Wait for each probe in order and write its chunk back.
async fn write_back<S>(
    mut writer: WriteHalf<S>,
    mut rx: mpsc::Receiver<InFlight>,
    reply: ReplyMode,
    stats: &EchoStats,
) -> Result<(), SessionError>
where
    S: AsyncWrite,
{
    while let Some(InFlight { seq, chunk, probe }) = rx.recv().await {
        let outcome = match probe {
            Ok(pending) => pending.wait().await,
            Err(e) => Err(e),
        };

        let response = match outcome {
            Ok(ack) => {
                trace!(seq, ack_len = ack.len(), "Probe acknowledged");
                match reply {
                    ReplyMode::Chunk => chunk,
                    ReplyMode::Store => ack,
                }
            }
            Err(e) => {
                stats.probe_failures.fetch_add(1, Ordering::Relaxed);
                match e {
                    StoreError::NotConnected | StoreError::Closed => {
                        debug!(seq, error = %e, "Probe failed")
                    }
                    _ => warn!(seq, error = %e, "Probe failed"),
                }
                chunk
            }
        };

        writer
            .write_all(&response)
            .await
            .map_err(SessionError::Write)?;
        writer.flush().await.map_err(SessionError::Write)?;

        stats.chunks.fetch_add(1, Ordering::Relaxed);
        stats.bytes.fetch_add(response.len() as u64, Ordering::Relaxed);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::protocols::resp::Frame;
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::sync::oneshot;

    /// A store client whose store never answers the connect handshake.
    fn offline_store() -> StoreClient {
        StoreClient::start(StoreConfig {
            address: "127.0.0.1:1".to_string(),
            probe_timeout: Duration::from_millis(200),
            reconnect_wait: None,
            ..StoreConfig::default()
        })
    }

    fn options(reply: ReplyMode) -> SessionOptions {
        SessionOptions {
            pipeline_depth: 4,
            reply,
        }
    }

    #[tokio::test]
    async fn test_echo_without_store() {
        let (mut client, server) = duplex(1024);
        let stats = Arc::new(EchoStats::default());
        let session = tokio::spawn(handle_connection(
            server,
            offline_store(),
            options(ReplyMode::Chunk),
            Arc::clone(&stats),
        ));

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        drop(client);
        session.await.unwrap().unwrap();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.chunks, 1);
        assert_eq!(snapshot.bytes, 5);
        assert_eq!(snapshot.probe_failures, 1);
    }

    #[tokio::test]
    async fn test_store_mode_falls_back_to_chunk() {
        let (mut client, server) = duplex(1024);
        let session = tokio::spawn(handle_connection(
            server,
            offline_store(),
            options(ReplyMode::Store),
            Arc::new(EchoStats::default()),
        ));

        client.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"x");

        drop(client);
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_late_probe_holds_back_later_chunks() {
        let (mut client, server) = duplex(1024);
        let (_server_read, server_write) = tokio::io::split(server);
        let stats = EchoStats::default();

        let (reply_tx, reply_rx) = oneshot::channel();
        let (tx, rx) = mpsc::channel(4);
        tx.send(InFlight {
            seq: 0,
            chunk: Bytes::from_static(b"first"),
            probe: Ok(PendingProbe::detached(reply_rx, Duration::from_secs(1))),
        })
        .await
        .unwrap();
        tx.send(InFlight {
            seq: 1,
            chunk: Bytes::from_static(b"second"),
            probe: Err(StoreError::NotConnected),
        })
        .await
        .unwrap();
        drop(tx);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = reply_tx.send(Ok(Frame::bulk(Bytes::from_static(b"first"))));
        });

        let writing = write_back(server_write, rx, ReplyMode::Chunk, &stats);
        let reading = async {
            let mut buf = [0u8; 11];
            client.read_exact(&mut buf).await.unwrap();
            buf
        };
        let (written, echoed) = tokio::join!(writing, reading);

        written.unwrap();
        assert_eq!(&echoed, b"firstsecond");
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.chunks, 2);
        assert_eq!(snapshot.probe_failures, 1);
    }

    #[tokio::test]
    async fn test_client_half_close_drains_pending_chunks() {
        let (client, server) = duplex(1024);
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let session = tokio::spawn(handle_connection(
            server,
            offline_store(),
            options(ReplyMode::Chunk),
            Arc::new(EchoStats::default()),
        ));

        client_write.write_all(b"abc").await.unwrap();
        client_write.shutdown().await.unwrap();

        let mut echoed = Vec::new();
        client_read.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"abc");
        session.await.unwrap().unwrap();
    }
}
