//! Broker statistics.
//!
//! Counters are plain atomics updated from the broker's tasks; readers take
//! a [`StatsSnapshot`] instead of touching shared mutable state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

/// Live counters for one broker.
#[derive(Debug)]
pub struct BrokerStats {
    events_ingested: AtomicU64,
    events_matched: AtomicU64,
    notifications_sent: AtomicU64,
    notifications_dropped_overflow: AtomicU64,
    decode_errors: AtomicU64,
    peers_up: AtomicU64,
    peers_down: AtomicU64,
    active_subscriptions: AtomicU64,
    started: Instant,
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub events_ingested: u64,
    pub events_matched: u64,
    pub notifications_sent: u64,
    pub notifications_dropped_overflow: u64,
    pub decode_errors: u64,
    pub peers_up: u64,
    pub peers_down: u64,
    pub uptime_ms: u64,
}

impl Default for BrokerStats {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerStats {
    /// Creates zeroed counters with the uptime clock started now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            events_ingested: AtomicU64::new(0),
            events_matched: AtomicU64::new(0),
            notifications_sent: AtomicU64::new(0),
            notifications_dropped_overflow: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            peers_up: AtomicU64::new(0),
            peers_down: AtomicU64::new(0),
            active_subscriptions: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn incr_events_ingested(&self) {
        self.events_ingested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_events_matched(&self) {
        self.events_matched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_notifications_sent(&self) {
        self.notifications_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_notifications_dropped_overflow(&self) {
        self.notifications_dropped_overflow
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_decode_errors(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Records current peer link gauges.
    pub fn set_peer_gauges(&self, up: u64, down: u64) {
        self.peers_up.store(up, Ordering::Relaxed);
        self.peers_down.store(down, Ordering::Relaxed);
    }

    /// Events ingested so far; reported in heartbeats.
    #[must_use]
    pub fn events_ingested(&self) -> u64 {
        self.events_ingested.load(Ordering::Relaxed)
    }

    /// Records the current count of locally homed subscriptions.
    pub fn set_active_subscriptions(&self, count: u64) {
        self.active_subscriptions.store(count, Ordering::Relaxed);
    }

    /// Locally homed subscriptions; reported in heartbeats.
    #[must_use]
    pub fn active_subscriptions(&self) -> u64 {
        self.active_subscriptions.load(Ordering::Relaxed)
    }

    /// Takes a consistent-enough snapshot for operators and tests.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_ingested: self.events_ingested.load(Ordering::Relaxed),
            events_matched: self.events_matched.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            notifications_dropped_overflow: self
                .notifications_dropped_overflow
                .load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            peers_up: self.peers_up.load(Ordering::Relaxed),
            peers_down: self.peers_down.load(Ordering::Relaxed),
            uptime_ms: self.started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64,
        }
    }
}
