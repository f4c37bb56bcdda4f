// Delivery statistics shared between the facade, the delivery worker and
// the config poller. All counters are plain atomics.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ClientStats {
    events_submitted: AtomicU64,
    events_dropped: AtomicU64,
    events_delivered: AtomicU64,
    events_failed: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    bytes_sent: AtomicU64,
    consecutive_errors: AtomicU32,
    config_polls: AtomicU64,
    config_errors: AtomicU64,
}

/// Point-in-time copy of [`ClientStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub events_submitted: u64,
    pub events_dropped: u64,
    pub events_delivered: u64,
    pub events_failed: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub bytes_sent: u64,
    pub consecutive_errors: u32,
    pub config_polls: u64,
    pub config_errors: u64,
}

impl ClientStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_submitted(&self) {
        self.events_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request(&self, success: bool, events: usize, bytes: usize, consecutive_errors: u32) {
        if success {
            self.requests_succeeded.fetch_add(1, Ordering::Relaxed);
            self.events_delivered.fetch_add(events as u64, Ordering::Relaxed);
        } else {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
            self.events_failed.fetch_add(events as u64, Ordering::Relaxed);
        }
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.consecutive_errors.store(consecutive_errors, Ordering::Relaxed);
    }

    pub fn record_event_failed(&self) {
        self.events_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_config_poll(&self, failed: bool) {
        self.config_polls.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.config_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_submitted: self.events_submitted.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            events_failed: self.events_failed.load(Ordering::Relaxed),
            requests_succeeded: self.requests_succeeded.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            consecutive_errors: self.consecutive_errors.load(Ordering::Relaxed),
            config_polls: self.config_polls.load(Ordering::Relaxed),
            config_errors: self.config_errors.load(Ordering::Relaxed),
        }
    }
}
