//! Process wiring: backends, worker pools, background loops, shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use mailpipe_chain::ChainAnalyzer;
use mailpipe_core::config::Config;
use mailpipe_core::metrics::MetricsHub;
use mailpipe_ingest::IngestPort;
use mailpipe_llm::providers::OllamaProvider;
use mailpipe_llm::LlmAdapter;
use mailpipe_queue::{JobQueue, QueueSettings, RedisQueue};
use mailpipe_rules::{RuleEngine, RulesConfig};
use mailpipe_store::Store;
use mailpipe_workers::pool::maintenance_loop;
use mailpipe_workers::{WorkerDeps, WorkerPool};

use crate::router::build_router;
use crate::state::AppState;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("store unavailable: {0}")]
    Store(String),
    #[error("queue unavailable: {0}")]
    Queue(String),
    #[error("{0}")]
    Other(String),
}

/// Shared backends assembled once per process.
pub struct Backends {
    pub store: Arc<Store>,
    pub queue: Arc<JobQueue>,
    pub chains: Arc<ChainAnalyzer>,
    pub metrics: Arc<MetricsHub>,
}

/// Connect the store and queue; both are required for any mode of operation.
pub async fn connect_backends(config: &Config) -> Result<Backends, ServeError> {
    let metrics = Arc::new(MetricsHub::new());

    let store = Arc::new(
        Store::connect(&config.store)
            .await
            .map_err(|e| ServeError::Store(e.to_string()))?,
    );

    let redis = RedisQueue::connect(&config.queue.url)
        .await
        .map_err(|e| ServeError::Queue(e.to_string()))?;
    let queue = Arc::new(JobQueue::new(
        Arc::new(redis),
        QueueSettings::from(&config.queue),
        metrics.clone(),
    ));
    queue
        .recover_on_startup()
        .await
        .map_err(|e| ServeError::Queue(e.to_string()))?;

    let chains = Arc::new(ChainAnalyzer::new(store.clone(), config.thresholds.clone()));

    Ok(Backends { store, queue, chains, metrics })
}

pub fn build_adapter(config: &Config, metrics: Arc<MetricsHub>) -> Arc<LlmAdapter> {
    let provider = Arc::new(OllamaProvider::new(config.llm.runtime_url.clone()));
    Arc::new(LlmAdapter::from_config(provider, &config.llm, metrics))
}

/// Run the server until a shutdown signal arrives.
pub async fn serve(config: Config) -> Result<(), ServeError> {
    config.log_summary();

    let backends = connect_backends(&config).await?;
    let adapter = build_adapter(&config, backends.metrics.clone());
    if !adapter.ping().await {
        warn!("LLM runtime unreachable at startup; phase1 continues, phases 2/3 degrade");
    }

    let rules = Arc::new(RuleEngine::new(RulesConfig {
        customer_domains: config.triage.customer_domains.clone(),
    }));

    let deps = Arc::new(WorkerDeps {
        store: backends.store.clone(),
        queue: backends.queue.clone(),
        chains: backends.chains.clone(),
        adapter: adapter.clone(),
        rules,
        metrics: backends.metrics.clone(),
        workers: config.workers.clone(),
        thresholds: config.thresholds.clone(),
        queue_cfg: config.queue.clone(),
    });

    let cancel = CancellationToken::new();
    let pool = WorkerPool::spawn(deps, cancel.child_token());
    let maintenance = tokio::spawn(maintenance_loop(
        backends.queue.clone(),
        MAINTENANCE_INTERVAL,
        cancel.child_token(),
    ));

    let ingest = IngestPort::new(
        backends.store.clone(),
        backends.queue.clone(),
        backends.chains.clone(),
        backends.metrics.clone(),
    );

    let state = Arc::new(AppState {
        store: backends.store,
        queue: backends.queue,
        chains: backends.chains,
        adapter,
        ingest,
        metrics: backends.metrics,
        started_at: Instant::now(),
        config: config.clone(),
    });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ServeError::Other(format!("bind {}: {}", addr, e)))?;
    info!(addr = %addr, "mailpipe serving");

    let shutdown = cancel.clone();
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown.cancel();
        })
        .await
        .map_err(|e| ServeError::Other(e.to_string()))?;

    // HTTP is down; drain the workers within the configured window.
    pool.shutdown().await;
    maintenance.abort();
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install ctrl-c handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}
