//! Pipeline metrics hub.
//!
//! Lock-free atomic counters where eventual visibility is acceptable for
//! dashboard/status reads. All counters live here; other components update
//! through the shared handle. Rendered as Prometheus text exposition.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::job::Phase;

// ── Histograms ──────────────────────────────────────────────────────

/// Fixed-bucket histogram. Buckets are cumulative upper bounds; one extra
/// slot counts +Inf observations.
pub struct Histogram {
    bounds: &'static [f64],
    buckets: Vec<AtomicU64>,
    sum_micro: AtomicU64,
    count: AtomicU64,
}

/// Millisecond duration buckets shared by phase/queue-wait histograms.
pub const DURATION_MS_BOUNDS: &[f64] = &[
    50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0, 30_000.0, 60_000.0, 180_000.0,
];

/// Completeness-score buckets.
pub const SCORE_BOUNDS: &[f64] = &[0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0];

impl Histogram {
    pub fn new(bounds: &'static [f64]) -> Self {
        let buckets = (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            buckets,
            sum_micro: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        let idx = self
            .bounds
            .iter()
            .position(|b| value <= *b)
            .unwrap_or(self.bounds.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        // Store the sum with 1e-6 resolution to keep an integer atomic.
        self.sum_micro
            .fetch_add((value * 1_000_000.0).max(0.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_duration_ms(&self, d: Duration) {
        self.observe(d.as_secs_f64() * 1_000.0);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn render(&self, out: &mut String, name: &str, labels: &str) {
        let mut cumulative = 0u64;
        for (i, bound) in self.bounds.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            push_bucket_line(out, name, labels, &format_bound(*bound), cumulative);
        }
        cumulative += self.buckets[self.bounds.len()].load(Ordering::Relaxed);
        push_bucket_line(out, name, labels, "+Inf", cumulative);
        let sum = self.sum_micro.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        if labels.is_empty() {
            out.push_str(&format!("{name}_sum {sum}\n"));
            out.push_str(&format!("{name}_count {}\n", self.count()));
        } else {
            out.push_str(&format!("{name}_sum{{{labels}}} {sum}\n"));
            out.push_str(&format!("{name}_count{{{labels}}} {}\n", self.count()));
        }
    }
}

fn push_bucket_line(out: &mut String, name: &str, labels: &str, le: &str, value: u64) {
    if labels.is_empty() {
        out.push_str(&format!("{name}_bucket{{le=\"{le}\"}} {value}\n"));
    } else {
        out.push_str(&format!("{name}_bucket{{{labels},le=\"{le}\"}} {value}\n"));
    }
}

fn format_bound(b: f64) -> String {
    if b == b.trunc() {
        format!("{}", b as u64)
    } else {
        format!("{}", b)
    }
}

// ── Model tiers ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    MidTier,
    HighTier,
}

impl ModelTier {
    pub const ALL: [ModelTier; 2] = [ModelTier::MidTier, ModelTier::HighTier];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::MidTier => "mid_tier",
            ModelTier::HighTier => "high_tier",
        }
    }

    fn index(&self) -> usize {
        match self {
            ModelTier::MidTier => 0,
            ModelTier::HighTier => 1,
        }
    }
}

/// Circuit breaker state reported as a gauge (0 closed, 1 open, 2 half-open).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerGauge {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

// ── Hub ─────────────────────────────────────────────────────────────

fn phase_idx(phase: Phase) -> usize {
    (phase.number() - 1) as usize
}

pub struct MetricsHub {
    // Counters
    pub emails_ingested: AtomicU64,
    pub ingest_duplicates: AtomicU64,
    pub ingest_rejected: AtomicU64,
    phase_completions: [AtomicU64; 3],
    phase_failures: [AtomicU64; 3],
    phase_fallbacks: [AtomicU64; 3],
    llm_calls: [AtomicU64; 2],
    llm_retries: [AtomicU64; 2],
    pub salvage_attempts: AtomicU64,
    pub validator_rejections: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub jobs_dead_lettered: AtomicU64,

    // Gauges
    workers_active: [AtomicU64; 3],
    queue_depth: [AtomicU64; 3],
    pub dls_depth: AtomicU64,
    breaker_state: [AtomicU64; 2],

    // Histograms
    phase_duration_ms: [Histogram; 3],
    pub queue_wait_ms: Histogram,
    pub chain_completeness: Histogram,
}

impl MetricsHub {
    pub fn new() -> Self {
        Self {
            emails_ingested: AtomicU64::new(0),
            ingest_duplicates: AtomicU64::new(0),
            ingest_rejected: AtomicU64::new(0),
            phase_completions: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
            phase_failures: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
            phase_fallbacks: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
            llm_calls: [AtomicU64::new(0), AtomicU64::new(0)],
            llm_retries: [AtomicU64::new(0), AtomicU64::new(0)],
            salvage_attempts: AtomicU64::new(0),
            validator_rejections: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            jobs_dead_lettered: AtomicU64::new(0),
            workers_active: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
            queue_depth: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
            dls_depth: AtomicU64::new(0),
            breaker_state: [AtomicU64::new(0), AtomicU64::new(0)],
            phase_duration_ms: [
                Histogram::new(DURATION_MS_BOUNDS),
                Histogram::new(DURATION_MS_BOUNDS),
                Histogram::new(DURATION_MS_BOUNDS),
            ],
            queue_wait_ms: Histogram::new(DURATION_MS_BOUNDS),
            chain_completeness: Histogram::new(SCORE_BOUNDS),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn phase_completed(&self, phase: Phase) {
        self.phase_completions[phase_idx(phase)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn phase_failed(&self, phase: Phase) {
        self.phase_failures[phase_idx(phase)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn phase_fallback(&self, phase: Phase) {
        self.phase_fallbacks[phase_idx(phase)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn phase_duration(&self, phase: Phase, d: Duration) {
        self.phase_duration_ms[phase_idx(phase)].observe_duration_ms(d);
    }

    pub fn llm_call(&self, tier: ModelTier) {
        self.llm_calls[tier.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn llm_retry(&self, tier: ModelTier) {
        self.llm_retries[tier.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_started(&self, phase: Phase) {
        self.workers_active[phase_idx(phase)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_stopped(&self, phase: Phase) {
        self.workers_active[phase_idx(phase)].fetch_sub(1, Ordering::Relaxed);
    }

    pub fn workers_active(&self, phase: Phase) -> u64 {
        self.workers_active[phase_idx(phase)].load(Ordering::Relaxed)
    }

    pub fn set_queue_depth(&self, phase: Phase, depth: u64) {
        self.queue_depth[phase_idx(phase)].store(depth, Ordering::Relaxed);
    }

    pub fn queue_depth(&self, phase: Phase) -> u64 {
        self.queue_depth[phase_idx(phase)].load(Ordering::Relaxed)
    }

    pub fn set_breaker_state(&self, tier: ModelTier, state: BreakerGauge) {
        self.breaker_state[tier.index()].store(state as u64, Ordering::Relaxed);
    }

    pub fn phase_completions(&self, phase: Phase) -> u64 {
        self.phase_completions[phase_idx(phase)].load(Ordering::Relaxed)
    }

    pub fn phase_failures(&self, phase: Phase) -> u64 {
        self.phase_failures[phase_idx(phase)].load(Ordering::Relaxed)
    }

    /// Render the Prometheus text exposition.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::with_capacity(8 * 1024);
        let c = |v: &AtomicU64| v.load(Ordering::Relaxed);

        out.push_str("# TYPE mailpipe_emails_ingested_total counter\n");
        out.push_str(&format!(
            "mailpipe_emails_ingested_total {}\n",
            c(&self.emails_ingested)
        ));
        out.push_str("# TYPE mailpipe_ingest_duplicates_total counter\n");
        out.push_str(&format!(
            "mailpipe_ingest_duplicates_total {}\n",
            c(&self.ingest_duplicates)
        ));
        out.push_str("# TYPE mailpipe_ingest_rejected_total counter\n");
        out.push_str(&format!(
            "mailpipe_ingest_rejected_total {}\n",
            c(&self.ingest_rejected)
        ));

        out.push_str("# TYPE mailpipe_phase_completions_total counter\n");
        out.push_str("# TYPE mailpipe_phase_failures_total counter\n");
        out.push_str("# TYPE mailpipe_phase_fallbacks_total counter\n");
        for phase in Phase::ALL {
            let i = phase_idx(phase);
            out.push_str(&format!(
                "mailpipe_phase_completions_total{{phase=\"{}\"}} {}\n",
                phase,
                c(&self.phase_completions[i])
            ));
            out.push_str(&format!(
                "mailpipe_phase_failures_total{{phase=\"{}\"}} {}\n",
                phase,
                c(&self.phase_failures[i])
            ));
            out.push_str(&format!(
                "mailpipe_phase_fallbacks_total{{phase=\"{}\"}} {}\n",
                phase,
                c(&self.phase_fallbacks[i])
            ));
        }

        out.push_str("# TYPE mailpipe_llm_calls_total counter\n");
        out.push_str("# TYPE mailpipe_llm_retries_total counter\n");
        out.push_str("# TYPE mailpipe_llm_breaker_state gauge\n");
        for tier in ModelTier::ALL {
            let i = tier.index();
            out.push_str(&format!(
                "mailpipe_llm_calls_total{{model=\"{}\"}} {}\n",
                tier.as_str(),
                c(&self.llm_calls[i])
            ));
            out.push_str(&format!(
                "mailpipe_llm_retries_total{{model=\"{}\"}} {}\n",
                tier.as_str(),
                c(&self.llm_retries[i])
            ));
            out.push_str(&format!(
                "mailpipe_llm_breaker_state{{model=\"{}\"}} {}\n",
                tier.as_str(),
                c(&self.breaker_state[i])
            ));
        }

        out.push_str("# TYPE mailpipe_salvage_attempts_total counter\n");
        out.push_str(&format!(
            "mailpipe_salvage_attempts_total {}\n",
            c(&self.salvage_attempts)
        ));
        out.push_str("# TYPE mailpipe_validator_rejections_total counter\n");
        out.push_str(&format!(
            "mailpipe_validator_rejections_total {}\n",
            c(&self.validator_rejections)
        ));
        out.push_str("# TYPE mailpipe_llm_cache_hits_total counter\n");
        out.push_str(&format!("mailpipe_llm_cache_hits_total {}\n", c(&self.cache_hits)));
        out.push_str("# TYPE mailpipe_llm_cache_misses_total counter\n");
        out.push_str(&format!(
            "mailpipe_llm_cache_misses_total {}\n",
            c(&self.cache_misses)
        ));
        out.push_str("# TYPE mailpipe_jobs_dead_lettered_total counter\n");
        out.push_str(&format!(
            "mailpipe_jobs_dead_lettered_total {}\n",
            c(&self.jobs_dead_lettered)
        ));

        out.push_str("# TYPE mailpipe_workers_active gauge\n");
        out.push_str("# TYPE mailpipe_queue_depth gauge\n");
        for phase in Phase::ALL {
            let i = phase_idx(phase);
            out.push_str(&format!(
                "mailpipe_workers_active{{phase=\"{}\"}} {}\n",
                phase,
                c(&self.workers_active[i])
            ));
            out.push_str(&format!(
                "mailpipe_queue_depth{{stream=\"{}\"}} {}\n",
                phase,
                c(&self.queue_depth[i])
            ));
        }
        out.push_str("# TYPE mailpipe_dls_depth gauge\n");
        out.push_str(&format!("mailpipe_dls_depth {}\n", c(&self.dls_depth)));

        out.push_str("# TYPE mailpipe_phase_duration_ms histogram\n");
        for phase in Phase::ALL {
            self.phase_duration_ms[phase_idx(phase)].render(
                &mut out,
                "mailpipe_phase_duration_ms",
                &format!("phase=\"{}\"", phase),
            );
        }
        out.push_str("# TYPE mailpipe_queue_wait_ms histogram\n");
        self.queue_wait_ms.render(&mut out, "mailpipe_queue_wait_ms", "");
        out.push_str("# TYPE mailpipe_chain_completeness histogram\n");
        self.chain_completeness
            .render(&mut out, "mailpipe_chain_completeness", "");

        out
    }
}

impl Default for MetricsHub {
    fn default() -> Self {
        Self::new()
    }
}

// ── Health ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Compound health probe result. `healthy` iff all three checks pass;
/// `degraded` when only the LLM runtime is down (Phase 1 still works).
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HealthReport {
    pub store: bool,
    pub queue: bool,
    pub llm: bool,
    pub status: HealthState,
}

impl HealthReport {
    pub fn evaluate(store: bool, queue: bool, llm: bool) -> Self {
        let status = if store && queue && llm {
            HealthState::Healthy
        } else if store && queue {
            HealthState::Degraded
        } else {
            HealthState::Unhealthy
        };
        Self { store, queue, llm, status }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_are_cumulative() {
        let h = Histogram::new(DURATION_MS_BOUNDS);
        h.observe(40.0);
        h.observe(70.0);
        h.observe(999_999.0);
        assert_eq!(h.count(), 3);

        let mut out = String::new();
        h.render(&mut out, "x", "");
        assert!(out.contains("x_bucket{le=\"50\"} 1"));
        assert!(out.contains("x_bucket{le=\"100\"} 2"));
        assert!(out.contains("x_bucket{le=\"+Inf\"} 3"));
        assert!(out.contains("x_count 3"));
    }

    #[test]
    fn render_contains_all_metric_families() {
        let hub = MetricsHub::new();
        hub.emails_ingested.fetch_add(5, Ordering::Relaxed);
        hub.phase_completed(Phase::Phase1);
        hub.llm_call(ModelTier::MidTier);
        hub.set_queue_depth(Phase::Phase2, 42);
        hub.set_breaker_state(ModelTier::HighTier, BreakerGauge::Open);

        let text = hub.render_prometheus();
        assert!(text.contains("mailpipe_emails_ingested_total 5"));
        assert!(text.contains("mailpipe_phase_completions_total{phase=\"phase1\"} 1"));
        assert!(text.contains("mailpipe_llm_calls_total{model=\"mid_tier\"} 1"));
        assert!(text.contains("mailpipe_queue_depth{stream=\"phase2\"} 42"));
        assert!(text.contains("mailpipe_llm_breaker_state{model=\"high_tier\"} 1"));
    }

    #[test]
    fn health_degraded_only_when_llm_down() {
        assert_eq!(HealthReport::evaluate(true, true, true).status, HealthState::Healthy);
        assert_eq!(HealthReport::evaluate(true, true, false).status, HealthState::Degraded);
        assert_eq!(HealthReport::evaluate(false, true, true).status, HealthState::Unhealthy);
        assert_eq!(HealthReport::evaluate(true, false, false).status, HealthState::Unhealthy);
    }

    #[test]
    fn worker_gauge_up_down() {
        let hub = MetricsHub::new();
        hub.worker_started(Phase::Phase3);
        hub.worker_started(Phase::Phase3);
        hub.worker_stopped(Phase::Phase3);
        assert_eq!(hub.workers_active(Phase::Phase3), 1);
    }
}
