//! Bounded security event log.

use std::collections::VecDeque;

use serde::Serialize;
use serde_json::Value;
use tracing::info;

use alicia_core::epoch_secs;

/// Ring capacity: the last 1000 events are queryable.
const EVENT_LOG_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct SecurityEvent {
    pub event_type: String,
    pub timestamp: f64,
    pub details: Value,
}

/// Fixed-capacity event ring; oldest entries are evicted first.
pub struct SecurityEventLog {
    buf: VecDeque<SecurityEvent>,
    capacity: usize,
}

impl SecurityEventLog {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_LOG_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, event_type: &str, details: Value) {
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(SecurityEvent {
            event_type: event_type.to_string(),
            timestamp: epoch_secs(),
            details,
        });
        info!(event = %event_type, "security event");
    }

    /// The most recent `limit` events, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<SecurityEvent> {
        let skip = self.buf.len().saturating_sub(limit);
        self.buf.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl Default for SecurityEventLog {
    fn default() -> Self {
        Self::new()
    }
}
