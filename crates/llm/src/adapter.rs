//! The adapter every analyzer calls.
//!
//! Wraps the provider with per-tier concurrency limits, rate buckets,
//! circuit breakers, bounded retries, the salvage chain, and the caller's
//! quality gate. Constructed once at process start and shared.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use mailpipe_core::config::LlmConfig;
use mailpipe_core::metrics::{MetricsHub, ModelTier};
use mailpipe_core::OpCtx;

use crate::breaker::CircuitBreaker;
use crate::cache::{CachedCompletion, ResponseCache};
use crate::error::LlmError;
use crate::limiter::TokenBucket;
use crate::provider::{CompletionParams, LlmProvider, Message};
use crate::salvage;

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_secs(1);
const JITTER_MAX_MS: u64 = 250;

/// Quality gate supplied by the caller: rejects structurally valid JSON that
/// does not meet the phase's schema requirements.
pub type Validator = dyn Fn(&Value) -> Result<(), String> + Send + Sync;

struct TierRuntime {
    model: String,
    timeout: Duration,
    semaphore: Semaphore,
    bucket: TokenBucket,
    breaker: CircuitBreaker,
}

impl TierRuntime {
    fn new(model: String, timeout: Duration, concurrency: u32, rate_per_min: u32) -> Self {
        Self {
            model,
            timeout,
            semaphore: Semaphore::new(concurrency.max(1) as usize),
            bucket: TokenBucket::per_minute(rate_per_min),
            breaker: CircuitBreaker::default(),
        }
    }
}

pub struct LlmAdapter {
    provider: Arc<dyn LlmProvider>,
    mid: TierRuntime,
    high: TierRuntime,
    cache: Option<ResponseCache>,
    metrics: Arc<MetricsHub>,
    temperature: f64,
}

#[derive(Debug, Clone)]
pub struct LlmOutcome {
    pub content: String,
    pub tokens: u64,
    pub duration: Duration,
    pub model: String,
    pub from_cache: bool,
}

#[derive(Debug, Clone)]
pub struct JsonOutcome {
    pub value: Value,
    pub tokens: u64,
    pub duration: Duration,
    pub model: String,
    pub salvage_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct JsonRequest {
    pub system: String,
    pub user: String,
    pub stop: Vec<String>,
}

impl LlmAdapter {
    pub fn from_config(
        provider: Arc<dyn LlmProvider>,
        cfg: &LlmConfig,
        metrics: Arc<MetricsHub>,
    ) -> Self {
        Self {
            provider,
            mid: TierRuntime::new(
                cfg.mid_model.clone(),
                Duration::from_secs(cfg.mid_timeout_secs),
                cfg.mid_concurrency,
                cfg.mid_rate_per_min,
            ),
            high: TierRuntime::new(
                cfg.high_model.clone(),
                Duration::from_secs(cfg.high_timeout_secs),
                cfg.high_concurrency,
                cfg.high_rate_per_min,
            ),
            cache: cfg
                .cache_enabled
                .then(|| ResponseCache::new(Duration::from_secs(cfg.cache_ttl_secs))),
            metrics,
            temperature: cfg.temperature,
        }
    }

    fn tier(&self, tier: ModelTier) -> &TierRuntime {
        match tier {
            ModelTier::MidTier => &self.mid,
            ModelTier::HighTier => &self.high,
        }
    }

    pub fn model_name(&self, tier: ModelTier) -> &str {
        &self.tier(tier).model
    }

    /// Whether the tier's breaker currently fails fast. Workers pause their
    /// phase while this holds.
    pub fn circuit_open(&self, tier: ModelTier) -> bool {
        self.tier(tier).breaker.is_open()
    }

    pub async fn ping(&self) -> bool {
        self.provider.ping().await.is_ok()
    }

    /// Single-shot completion with timeout, rate limiting, bounded retries
    /// on transient errors, and circuit breaking.
    pub async fn complete_text(
        &self,
        ctx: &OpCtx,
        tier: ModelTier,
        messages: &[Message],
        stop: &[String],
    ) -> Result<LlmOutcome, LlmError> {
        let rt = self.tier(tier);

        if let Err(retry_in) = rt.breaker.check() {
            return Err(LlmError::CircuitOpen { model: rt.model.clone(), retry_in });
        }
        self.metrics.set_breaker_state(tier, rt.breaker.gauge());

        let cache_key = self
            .cache
            .as_ref()
            .map(|_| ResponseCache::key(&rt.model, messages));
        if let (Some(cache), Some(key)) = (self.cache.as_ref(), cache_key.as_deref()) {
            if let Some(hit) = cache.get(key) {
                self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(LlmOutcome {
                    content: hit.content,
                    tokens: hit.tokens,
                    duration: Duration::ZERO,
                    model: rt.model.clone(),
                    from_cache: true,
                });
            }
            self.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);
        }

        let params = CompletionParams {
            temperature: self.temperature,
            stop: stop.to_vec(),
            max_tokens: 4096,
        };

        rt.bucket.acquire().await;
        let _permit = rt
            .semaphore
            .acquire()
            .await
            .map_err(|_| LlmError::Cancelled)?;

        let start = Instant::now();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if ctx.is_cancelled() {
                return Err(LlmError::Cancelled);
            }

            self.metrics.llm_call(tier);
            let result = tokio::select! {
                _ = ctx.cancel.cancelled() => Err(LlmError::Cancelled),
                res = tokio::time::timeout(
                    rt.timeout,
                    self.provider.complete(&rt.model, messages, &params),
                ) => match res {
                    Ok(inner) => inner,
                    Err(_) => Err(LlmError::Timeout(rt.timeout)),
                },
            };

            match result {
                Ok(completion) => {
                    rt.breaker.on_success();
                    self.metrics.set_breaker_state(tier, rt.breaker.gauge());
                    let tokens = completion.total_tokens();
                    if let (Some(cache), Some(key)) = (self.cache.as_ref(), cache_key.clone()) {
                        cache.put(
                            key,
                            CachedCompletion { content: completion.content.clone(), tokens },
                        );
                    }
                    return Ok(LlmOutcome {
                        content: completion.content,
                        tokens,
                        duration: start.elapsed(),
                        model: rt.model.clone(),
                        from_cache: false,
                    });
                }
                Err(LlmError::Cancelled) => return Err(LlmError::Cancelled),
                Err(err) if err.is_transient() => {
                    rt.breaker.on_failure();
                    self.metrics.set_breaker_state(tier, rt.breaker.gauge());
                    warn!(
                        model = %rt.model,
                        attempt,
                        error = %err,
                        "transient LLM failure"
                    );
                    if attempt >= MAX_ATTEMPTS {
                        return Err(err);
                    }
                    self.metrics.llm_retry(tier);
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=JITTER_MAX_MS));
                    let backoff = RETRY_BASE * 2u32.pow(attempt - 1) + jitter;
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => return Err(LlmError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                // Validation-class error: no retry, no breaker hit.
                Err(err) => return Err(err),
            }
        }
    }

    /// Completion with JSON salvage and the caller's quality gate.
    ///
    /// On a salvage failure or validator rejection, retries once with a
    /// tightened JSON-only prompt, then surfaces the error so the caller can
    /// fall back.
    pub async fn complete_json(
        &self,
        ctx: &OpCtx,
        tier: ModelTier,
        request: &JsonRequest,
        validator: &Validator,
    ) -> Result<JsonOutcome, LlmError> {
        let mut tokens = 0u64;
        let mut duration = Duration::ZERO;
        let mut salvage_attempts = 0u32;
        let mut last_err = LlmError::ResponseShape("no attempt made".to_string());

        for strict in [false, true] {
            let messages = build_messages(request, strict);
            let outcome = self
                .complete_text(ctx, tier, &messages, &request.stop)
                .await?;
            tokens += outcome.tokens;
            duration += outcome.duration;

            match salvage::salvage_json(&outcome.content) {
                Ok(salvaged) => {
                    if salvaged.attempts > 0 {
                        self.metrics
                            .salvage_attempts
                            .fetch_add(salvaged.attempts as u64, Ordering::Relaxed);
                    }
                    salvage_attempts += salvaged.attempts;
                    match validator(&salvaged.value) {
                        Ok(()) => {
                            return Ok(JsonOutcome {
                                value: salvaged.value,
                                tokens,
                                duration,
                                model: outcome.model,
                                salvage_attempts,
                            });
                        }
                        Err(reason) => {
                            self.metrics
                                .validator_rejections
                                .fetch_add(1, Ordering::Relaxed);
                            debug!(model = %outcome.model, strict, %reason, "validator rejected response");
                            last_err = LlmError::Validator(reason);
                        }
                    }
                }
                Err(reason) => {
                    debug!(model = %outcome.model, strict, %reason, "unsalvageable response");
                    last_err = LlmError::ResponseShape(reason);
                }
            }
        }

        Err(last_err)
    }

    /// Breaker gauges for the metrics refresher.
    pub fn breaker_gauge(&self, tier: ModelTier) -> mailpipe_core::metrics::BreakerGauge {
        self.tier(tier).breaker.gauge()
    }
}

fn build_messages(request: &JsonRequest, strict: bool) -> Vec<Message> {
    let mut system = request.system.clone();
    if strict {
        system.push_str(
            "\n\nIMPORTANT: Respond with ONLY a valid JSON object. \
             No prose, no markdown fences, double-quoted keys, no trailing commas.",
        );
    }
    vec![Message::system(system), Message::user(request.user.clone())]
}

// ── Tests ───────────────────────────────────────────────────────────
