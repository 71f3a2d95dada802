//! echo-over-redis server binary.

use echo_over_redis::{Config, Server, StoreClient};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.server.listen,
        store = %config.store.address,
        reply = ?config.server.reply,
        workers = config.workers.unwrap_or(1),
        pipeline_depth = config.server.pipeline_depth,
        "Starting echo-over-redis"
    );

    let runtime = match config.workers {
        Some(workers) if workers > 1 => {
            info!(workers, "Using multi-threaded runtime");
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(workers)
                .enable_all()
                .build()?
        }
        _ => {
            info!("Using single-threaded runtime");
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?
        }
    };

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let store = StoreClient::start(config.store);
    let server = Server::new(config.server, store);

    server.run(shutdown_signal()).await?;

    let stats = server.stats();
    let store_stats = server.store().stats();
    info!(
        accepted = stats.accepted,
        active = stats.active,
        chunks = stats.echo.chunks,
        bytes = stats.echo.bytes,
        probe_failures = stats.echo.probe_failures,
        probes_issued = store_stats.issued,
        probes_succeeded = store_stats.succeeded,
        store_connects = store_stats.connects,
        "Shutdown complete"
    );
    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
