//! sked scheduler
//!
//! Runs the scheduling loop against an in-memory cluster, committing
//! placements through the API dispatcher and optimistic cache.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sked_id::ObjectKey;
use sked_scheduler::{
    api_cache::{CacheView, CacheViewConfig},
    api_calls::RelevanceTable,
    binder::Binder,
    cache::Cache,
    client::{ApiClient, InMemoryClient},
    config,
    dispatcher::Dispatcher,
    framework::Handle,
    model::ObjectState,
    scheduler::SchedulerWorker,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to SKED_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting sked scheduler");
    info!(
        bind_mode = %config.bind_mode,
        workers = config.dispatcher.workers,
        queue_capacity = config.dispatcher.queue_capacity,
        assume_ttl_secs = config.assume_ttl.as_secs(),
        "Configuration loaded"
    );

    let client: Arc<dyn ApiClient> = Arc::new(demo_cluster(config.demo_nodes, config.demo_pods));

    // Cancelled at shutdown to stop the cache sweep
    let ctx = CancellationToken::new();

    let dispatcher = config.bind_mode.is_async().then(|| {
        let dispatcher = Dispatcher::with_config(
            Arc::clone(&client),
            RelevanceTable::standard(),
            config.dispatcher.clone(),
        );
        dispatcher.run();
        dispatcher
    });

    let cache = Cache::new(&ctx, config.assume_ttl, dispatcher.clone());
    let view = CacheView::new(CacheViewConfig::default(), cache);
    let handle = Handle::new(Arc::clone(&client)).with_api_cacher(view.clone());

    let binder = Binder::new(handle, config.bind_mode)?;

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = SchedulerWorker::new(Arc::clone(&client), view, binder, config.schedule_interval);
    let worker_handle = tokio::spawn(async move {
        worker.run(shutdown_rx).await;
    });

    // Wait for shutdown signal (Ctrl+C)
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Received shutdown signal");

    // Signal shutdown to the worker
    let _ = shutdown_tx.send(true);

    let shutdown_timeout = Duration::from_secs(10);
    if let Err(e) = tokio::time::timeout(shutdown_timeout, worker_handle).await {
        warn!(error = %e, "Scheduler worker did not shut down in time");
    }

    if let Some(dispatcher) = dispatcher {
        let report = dispatcher.close().await;
        info!(
            drained = report.drained,
            dropped = report.dropped,
            "API dispatcher closed"
        );
    }
    ctx.cancel();

    info!("Scheduler shutdown complete");
    Ok(())
}

/// Nodes `node-0..` and unbound pods `default/pod-0..`.
fn demo_cluster(nodes: usize, pods: usize) -> InMemoryClient {
    let nodes = (0..nodes).map(|i| {
        let name = format!("node-{i}");
        ObjectState::new(ObjectKey::node(&name), format!("{name}-uid"))
    });
    let pods = (0..pods).map(|i| {
        let name = format!("pod-{i}");
        ObjectState::new(ObjectKey::pod("default", &name), format!("{name}-uid"))
            .with_label("app", "demo")
    });
    InMemoryClient::with_objects(nodes.chain(pods))
}
