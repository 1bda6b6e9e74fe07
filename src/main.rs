//! Image Cache maintenance daemon
//!
//! Opens the cache namespace described by the environment, keeps it within
//! its limits and shuts down cleanly.

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use image_cache::{spawn_maintenance_tasks, BytesCodec, CacheConfig, ImageCache};

/// Main entry point for the maintenance daemon.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Open the cache (replays and reconciles the disk index)
/// 4. Report disk usage from a full rescan and run an initial prune
/// 5. Start background memory trim and disk prune tasks
/// 6. Handle graceful shutdown on SIGINT/SIGTERM, flushing queued disk work
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "image_cache=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting image cache maintenance daemon");

    let config = CacheConfig::from_env();
    info!(
        "Configuration loaded: root={}, max_disk_size={:?}, max_disk_age={:?}, read_only_paths={}",
        config.disk_root().display(),
        config.max_disk_size,
        config.max_disk_age,
        config.read_only_paths.len()
    );

    let cache = ImageCache::open(config, BytesCodec).context("failed to open image cache")?;

    let usage = cache
        .calculate_size_async()
        .wait()
        .await
        .context("failed to scan disk cache")?;
    info!(
        "Disk usage: {} files, {} bytes (index: {} records, {} bytes)",
        usage.file_count,
        usage.total_size,
        cache.disk_count(),
        cache.disk_size()
    );

    let report = cache
        .prune_disk_async()
        .wait()
        .await
        .context("initial disk prune failed")?;
    info!(
        "Initial prune: {} expired, {} trimmed",
        report.expired, report.trimmed
    );

    let tasks = spawn_maintenance_tasks(&cache);
    info!("Maintenance tasks started");

    shutdown_signal().await;

    tasks.abort();
    warn!("Maintenance tasks aborted");

    cache
        .flush()
        .wait()
        .await
        .context("failed to flush pending disk work")?;
    info!("Shutdown complete");
    Ok(())
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
