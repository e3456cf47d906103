//! Per-instance circuit breaker.
//!
//! `closed → open` once consecutive failures reach the threshold, `open →
//! half_open` after the recovery timeout, then one probe request decides:
//! success closes the breaker, failure reopens it. Transitions for a single
//! instance are serialized by the registry lock.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreaker {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub last_failure_at: f64,
    pub next_attempt_at: f64,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            last_failure_at: 0.0,
            next_attempt_at: 0.0,
        }
    }

    /// Record a failed request. Returns `true` when this failure tripped the
    /// breaker open.
    pub fn record_failure(&mut self, now: f64, threshold: u32, recovery_timeout: f64) -> bool {
        self.consecutive_failures += 1;
        self.last_failure_at = now;

        match self.state {
            BreakerState::Closed if self.consecutive_failures >= threshold => {
                self.state = BreakerState::Open;
                self.next_attempt_at = now + recovery_timeout;
                true
            }
            // The half-open probe failed: straight back to open.
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open;
                self.next_attempt_at = now + recovery_timeout;
                true
            }
            _ => false,
        }
    }

    /// Record a successful request. Returns `true` when this closed a
    /// half-open breaker.
    pub fn record_success(&mut self) -> bool {
        self.consecutive_failures = 0;
        if self.state == BreakerState::HalfOpen {
            self.state = BreakerState::Closed;
            true
        } else {
            false
        }
    }

    /// Move `open → half_open` once the recovery deadline has passed.
    /// Returns `true` on transition.
    pub fn try_half_open(&mut self, now: f64) -> bool {
        if self.state == BreakerState::Open && now >= self.next_attempt_at {
            self.state = BreakerState::HalfOpen;
            true
        } else {
            false
        }
    }

    /// Whether the instance may receive traffic in this state.
    pub fn allows_traffic(&self) -> bool {
        self.state != BreakerState::Open
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}
