//! Token bucket rate limiter for capping outgoing request rate.
//!
//! One bucket is created per run when the spec carries a
//! `requests_per_second` cap. Tokens refill continuously at the configured
//! rate up to the burst capacity; each request consumes one token, waiting
//! when the bucket is empty.

use std::time::Instant;

use tokio::sync::Mutex;
use tokio::time::{self, Duration};

/// Per-run rate gate. The `Unlimited` variant admits immediately and is
/// used when the spec sets no rate cap.
#[derive(Debug)]
pub enum RateLimiter {
    TokenBucket(TokenBucket),
    Unlimited,
}

impl RateLimiter {
    /// A limiter admitting `rate` requests per second with the default
    /// burst of `floor(rate)` tokens.
    pub fn capped(rate: f64) -> Self {
        RateLimiter::TokenBucket(TokenBucket::new(rate, None))
    }

    /// A limiter that never blocks.
    pub fn unlimited() -> Self {
        RateLimiter::Unlimited
    }

    /// Wait until a request may be dispatched.
    pub async fn acquire(&self) {
        match self {
            RateLimiter::TokenBucket(bucket) => bucket.acquire().await,
            RateLimiter::Unlimited => {}
        }
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_update: Instant,
}

/// Token bucket with continuous refill. The bucket starts full, so the
/// first `burst` acquires complete without waiting.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a bucket refilling at `rate` tokens per second. `burst`
    /// defaults to `floor(rate)`.
    pub fn new(rate: f64, burst: Option<u64>) -> Self {
        let burst = burst.map(|b| b as f64).unwrap_or_else(|| rate.floor());
        Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_update: Instant::now(),
            }),
        }
    }

    /// Consume one token, sleeping until one is available.
    ///
    /// The refill computation and the wait estimate run under the bucket
    /// lock; the sleep itself does not hold it, so concurrent acquirers
    /// interleave on a consistent schedule.
    pub async fn acquire(&self) {
        loop {
            let wait_secs = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_update).as_secs_f64();
                state.last_update = now;

                state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }

                (1.0 - state.tokens) / self.rate
            };

            time::sleep(Duration::from_secs_f64(wait_secs)).await;
        }
    }

    /// Refill the bucket to full.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.tokens = self.burst;
        state.last_update = Instant::now();
    }
}
