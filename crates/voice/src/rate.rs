//! Request/token rate limiting for the AI back end.
//!
//! Sliding one-minute windows over request count and token usage. The
//! limiter sleeps the caller until capacity frees up — jobs are delayed,
//! never dropped.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

const WINDOW: Duration = Duration::from_secs(60);

/// Per-model limits. The large profile matches a hosted frontier model;
/// the conservative one suits small local back ends.
#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    pub requests_per_minute: u32,
    pub tokens_per_minute: u64,
    pub max_context_tokens: u64,
}

impl RateLimits {
    pub fn hosted() -> Self {
        Self {
            requests_per_minute: 480,
            tokens_per_minute: 2_000_000,
            max_context_tokens: 256_000,
        }
    }

    pub fn conservative() -> Self {
        Self {
            requests_per_minute: 30,
            tokens_per_minute: 100_000,
            max_context_tokens: 4_000,
        }
    }
}

struct Inner {
    requests: VecDeque<Instant>,
    tokens: VecDeque<(Instant, u64)>,
}

pub struct RateLimiter {
    limits: RateLimits,
    inner: Mutex<Inner>,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            inner: Mutex::new(Inner {
                requests: VecDeque::new(),
                tokens: VecDeque::new(),
            }),
        }
    }

    pub fn limits(&self) -> RateLimits {
        self.limits
    }

    /// Wait until a request spending `estimated_tokens` fits both windows,
    /// then record it.
    pub async fn acquire(&self, estimated_tokens: u64) {
        loop {
            let wait = {
                let mut inner = self.inner.lock().await;
                let now = Instant::now();
                Self::prune(&mut inner, now);

                let token_sum: u64 = inner.tokens.iter().map(|(_, t)| t).sum();
                let requests_ok = (inner.requests.len() as u32) < self.limits.requests_per_minute;
                // A single job above the whole budget must still run once
                // the window is empty, or it would wait forever.
                let tokens_ok = token_sum + estimated_tokens <= self.limits.tokens_per_minute
                    || (token_sum == 0 && estimated_tokens > self.limits.tokens_per_minute);

                if requests_ok && tokens_ok {
                    inner.requests.push_back(now);
                    inner.tokens.push_back((now, estimated_tokens));
                    return;
                }

                // Sleep until the oldest entry of the saturated window ages out.
                let oldest = if !requests_ok {
                    inner.requests.front().copied()
                } else {
                    inner.tokens.front().map(|(t, _)| *t)
                };
                oldest
                    .map(|t| (t + WINDOW).saturating_duration_since(now))
                    .unwrap_or(Duration::from_millis(100))
            };

            warn!(wait_ms = wait.as_millis() as u64, "rate limit reached, waiting");
            tokio::time::sleep(wait.max(Duration::from_millis(10))).await;
        }
    }

    /// Record actual token usage reported by the back end (replaces the
    /// estimate's accounting going forward).
    pub async fn record_usage(&self, tokens: u64) {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner.tokens.push_back((now, tokens));
        Self::prune(&mut inner, now);
    }

    fn prune(inner: &mut Inner, now: Instant) {
        while inner
            .requests
            .front()
            .map(|t| now.duration_since(*t) > WINDOW)
            .unwrap_or(false)
        {
            inner.requests.pop_front();
        }
        while inner
            .tokens
            .front()
            .map(|(t, _)| now.duration_since(*t) > WINDOW)
            .unwrap_or(false)
        {
            inner.tokens.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn under_limit_is_immediate() {
        let limiter = RateLimiter::new(RateLimits {
            requests_per_minute: 10,
            tokens_per_minute: 1000,
            max_context_tokens: 1000,
        });
        let start = std::time::Instant::now();
        for _ in 0..10 {
            limiter.acquire(10).await;
        }
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn request_limit_sleeps_until_window_frees() {
        let limiter = RateLimiter::new(RateLimits {
            requests_per_minute: 2,
            tokens_per_minute: 1_000_000,
            max_context_tokens: 1000,
        });

        limiter.acquire(1).await;
        limiter.acquire(1).await;

        // Third acquire must wait out the window; with paused time the
        // sleep is auto-advanced, so just verify it completes and that
        // virtual time moved past the window.
        let before = Instant::now();
        limiter.acquire(1).await;
        assert!(before.elapsed() >= Duration::from_secs(59));
    }

    #[tokio::test(start_paused = true)]
    async fn token_limit_enforced() {
        let limiter = RateLimiter::new(RateLimits {
            requests_per_minute: 100,
            tokens_per_minute: 100,
            max_context_tokens: 1000,
        });

        limiter.acquire(80).await;
        let before = Instant::now();
        limiter.acquire(50).await;
        assert!(before.elapsed() >= Duration::from_secs(59));
    }

    #[test]
    fn profiles_match_backends() {
        let hosted = RateLimits::hosted();
        assert_eq!(hosted.requests_per_minute, 480);
        assert_eq!(hosted.tokens_per_minute, 2_000_000);
        assert_eq!(hosted.max_context_tokens, 256_000);

        let small = RateLimits::conservative();
        assert_eq!(small.requests_per_minute, 30);
        assert_eq!(small.tokens_per_minute, 100_000);
        assert_eq!(small.max_context_tokens, 4_000);
    }
}
