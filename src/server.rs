//! TCP listener for echo connections.
//!
//! Accepts incoming connections and runs one echo session per connection,
//! all sharing a single store client.

use crate::config::ServerConfig;
use crate::protocols::echo::{self, EchoStats, EchoStatsSnapshot, SessionOptions};
use crate::store::StoreClient;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, Instrument};

/// Listener counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub accepted: u64,
    pub active: u64,
    pub echo: EchoStatsSnapshot,
}

/// Server instance
pub struct Server {
    config: ServerConfig,
    store: StoreClient,
    connection_limit: Arc<Semaphore>,
    accepted: AtomicU64,
    echo_stats: Arc<EchoStats>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: ServerConfig, store: StoreClient) -> Self {
        let connection_limit = Arc::new(Semaphore::new(config.max_connections));

        Server {
            config,
            store,
            connection_limit,
            accepted: AtomicU64::new(0),
            echo_stats: Arc::new(EchoStats::default()),
        }
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        let listener = TcpListener::bind(&self.config.listen).await?;
        info!(address = %listener.local_addr()?, "Server listening");
        Ok(listener)
    }

    /// Bind and accept connections until `shutdown` completes.
    pub async fn run<F>(&self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await;
        Ok(())
    }

    /// Accept connections on `listener` until `shutdown` completes.
    ///
    /// Sessions already running are left to finish on their own.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                permit = self.connection_limit.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
                _ = &mut shutdown => break,
            };

            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = &mut shutdown => break,
            };

            match accepted {
                Ok((stream, peer)) => {
                    self.accepted.fetch_add(1, Ordering::Relaxed);
                    debug!(peer = %peer, "New connection");

                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }

                    let store = self.store.clone();
                    let stats = Arc::clone(&self.echo_stats);
                    let options = SessionOptions {
                        pipeline_depth: self.config.pipeline_depth,
                        reply: self.config.reply,
                    };

                    tokio::spawn(
                        async move {
                            let result =
                                echo::handle_connection(stream, store, options, stats).await;
                            if let Err(e) = result {
                                debug!(error = %e, "Connection error");
                            }
                            debug!("Connection closed");
                            drop(permit);
                        }
                        .instrument(tracing::debug_span!("session", peer = %peer)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }

        info!("Listener shutting down");
    }

    /// Snapshot of the listener counters.
    pub fn stats(&self) -> ServerStats {
        let accepted = self.accepted.load(Ordering::Relaxed);
        let available = self.connection_limit.available_permits() as u64;
        ServerStats {
            accepted,
            active: (self.config.max_connections as u64).saturating_sub(available),
            echo: self.echo_stats.snapshot(),
        }
    }

    pub fn store(&self) -> &StoreClient {
        &self.store
    }
}
