//! Per-model circuit breaker.
//!
//! Opens after a run of consecutive transient failures, fails fast while
//! open, and half-opens after the cooldown to let a single probe through.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use mailpipe_core::metrics::BreakerGauge;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: State,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            inner: Mutex::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Check whether a call may proceed. While open, returns the remaining
    /// cooldown. After the cooldown, the breaker half-opens and admits the
    /// caller as a probe.
    pub fn check(&self) -> Result<(), Duration> {
        let mut inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            State::Closed | State::HalfOpen => Ok(()),
            State::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.cooldown {
                    inner.state = State::HalfOpen;
                    Ok(())
                } else {
                    Err(self.cooldown - elapsed)
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        inner.state = State::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        inner.consecutive_failures += 1;
        // A failed half-open probe reopens immediately.
        if inner.state == State::HalfOpen || inner.consecutive_failures >= self.threshold {
            inner.state = State::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().expect("breaker lock").state == State::Open
    }

    pub fn gauge(&self) -> BreakerGauge {
        match self.inner.lock().expect("breaker lock").state {
            State::Closed => BreakerGauge::Closed,
            State::Open => BreakerGauge::Open,
            State::HalfOpen => BreakerGauge::HalfOpen,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_COOLDOWN)
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let b = CircuitBreaker::new(5, Duration::from_secs(60));
        for _ in 0..4 {
            b.on_failure();
            assert!(b.check().is_ok());
        }
        b.on_failure();
        assert!(b.is_open());
        let remaining = b.check().unwrap_err();
        assert!(remaining <= Duration::from_secs(60));
    }

    #[test]
    fn success_resets_the_failure_run() {
        let b = CircuitBreaker::new(5, Duration::from_secs(60));
        for _ in 0..4 {
            b.on_failure();
        }
        b.on_success();
        for _ in 0..4 {
            b.on_failure();
        }
        assert!(b.check().is_ok());
    }

    #[test]
    fn half_opens_after_cooldown_then_closes_on_success() {
        let b = CircuitBreaker::new(1, Duration::from_millis(0));
        b.on_failure();
        // Zero cooldown: next check transitions to half-open.
        assert!(b.check().is_ok());
        assert_eq!(b.gauge(), BreakerGauge::HalfOpen);
        b.on_success();
        assert_eq!(b.gauge(), BreakerGauge::Closed);
    }

    #[test]
    fn failed_probe_reopens() {
        let b = CircuitBreaker::new(1, Duration::from_millis(0));
        b.on_failure();
        assert!(b.check().is_ok()); // half-open probe admitted
        b.on_failure();
        assert!(b.is_open());
    }
}
