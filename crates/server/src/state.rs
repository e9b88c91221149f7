use std::sync::Arc;
use std::time::{Duration, Instant};

use mailpipe_chain::ChainAnalyzer;
use mailpipe_core::config::Config;
use mailpipe_core::metrics::{HealthReport, MetricsHub};
use mailpipe_ingest::IngestPort;
use mailpipe_llm::LlmAdapter;
use mailpipe_queue::JobQueue;
use mailpipe_store::Store;

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

pub struct AppState {
    pub config: Config,
    pub store: Arc<Store>,
    pub queue: Arc<JobQueue>,
    pub chains: Arc<ChainAnalyzer>,
    pub adapter: Arc<LlmAdapter>,
    pub ingest: IngestPort,
    pub metrics: Arc<MetricsHub>,
    pub started_at: Instant,
}

impl AppState {
    /// Compound health probe: store, queue backend, LLM runtime.
    pub async fn health(&self) -> HealthReport {
        let store_ok = tokio::time::timeout(PROBE_TIMEOUT, self.store.ping())
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);
        let queue_ok = tokio::time::timeout(PROBE_TIMEOUT, self.queue.ping())
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);
        let llm_ok = tokio::time::timeout(PROBE_TIMEOUT, self.adapter.ping())
            .await
            .unwrap_or(false);
        HealthReport::evaluate(store_ok, queue_ok, llm_ok)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
