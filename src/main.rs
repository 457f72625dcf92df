use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::info;

use holdtree::config::Config;
use holdtree::engine::ReservationEngine;
use holdtree::store::RedisStore;
use holdtree::watcher::ExpiryWatcher;
use holdtree::worker::ReleaseWorker;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    holdtree::observability::init(config.metrics_port)?;

    let store = Arc::new(RedisStore::connect(&config.redis_url).await?);
    if config.configure_notifications {
        store.enable_expiry_events().await?;
        info!("enabled keyspace expiry notifications");
    }

    let engine = ReservationEngine::new(store.clone(), config.keyspace.clone(), config.engine.clone());
    let (tasks, queue) = mpsc::channel(config.task_queue);

    info!("holdtree worker started");
    info!("  reservation prefix: {}", config.keyspace.reservation_prefix());
    info!("  release concurrency: {}", config.release_concurrency);
    info!("  task queue: {}", config.task_queue);
    info!("  child write policy: {:?}", config.engine.child_write_policy);
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let watcher = tokio::spawn(ExpiryWatcher::new(store, config.keyspace.clone(), tasks).run());
    let mut worker = tokio::spawn(ReleaseWorker::new(engine, queue, config.release_concurrency).run());

    // Stop on SIGTERM/ctrl-c, or if the worker dies on its own.
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let shutdown = async {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.ok();
        }
    };

    tokio::select! {
        _ = shutdown => info!("shutdown signal received, stopping expiry watcher"),
        result = &mut worker => {
            tracing::error!("release worker exited unexpectedly: {result:?}");
            watcher.abort();
            return Ok(());
        }
    }

    // Dropping the watcher drops the queue's only sender; the worker then
    // finishes what is queued and in flight.
    watcher.abort();
    info!("draining release queue...");
    match tokio::time::timeout(DRAIN_TIMEOUT, worker).await {
        Ok(_) => info!("release queue drained"),
        Err(_) => tracing::warn!("drain timeout, releases still in flight are left to the next worker"),
    }

    info!("holdtree stopped");
    Ok(())
}
