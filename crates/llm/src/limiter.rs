//! Token-bucket rate limiter.

use std::sync::Mutex;
use std::time::{Duration, Instant};

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Simple token bucket: `rate_per_min` tokens refill per minute, burst up to
/// one minute's worth. `acquire` waits until a token is available.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn per_minute(rate_per_min: u32) -> Self {
        let capacity = rate_per_min.max(1) as f64;
        Self {
            capacity,
            refill_per_sec: capacity / 60.0,
            state: Mutex::new(BucketState { tokens: capacity, last_refill: Instant::now() }),
        }
    }

    /// Take one token, sleeping until the bucket refills if necessary.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().expect("bucket lock");
                let elapsed = state.last_refill.elapsed().as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                state.last_refill = Instant::now();
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.refill_per_sec)
            };
            tokio::time::sleep(wait.min(Duration::from_secs(5))).await;
        }
    }

    /// Non-blocking variant used by tests.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().expect("bucket lock");
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = Instant::now();
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_up_to_capacity_then_blocks() {
        let bucket = TokenBucket::per_minute(3);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[tokio::test]
    async fn acquire_waits_for_refill() {
        // 6000/min = 100/sec: drained bucket refills within tens of millis.
        let bucket = TokenBucket::per_minute(6000);
        while bucket.try_acquire() {}
        let start = Instant::now();
        bucket.acquire().await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
