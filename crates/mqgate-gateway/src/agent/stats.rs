//! Per-connection counters and heartbeat throttle.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;

/// Counters shared by the receive loop and dispatch workers.
pub struct AgentStats {
    received: AtomicU64,
    sent: AtomicU64,
    last_heartbeat: Mutex<Instant>,
    connected_at: OnceLock<DateTime<Utc>>,
}

impl AgentStats {
    /// Fresh counters; the heartbeat clock starts now.
    pub fn new() -> Self {
        Self {
            received: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            last_heartbeat: Mutex::new(Instant::now()),
            connected_at: OnceLock::new(),
        }
    }

    /// Count one inbound PUBLISH.
    pub fn record_received(&self) {
        let _ = self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one outbound message.
    pub fn record_sent(&self) {
        let _ = self.sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Inbound PUBLISH count.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Outbound message count.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Record the handshake time. Later calls are ignored.
    pub fn mark_connected(&self) {
        let _ = self.connected_at.set(Utc::now());
    }

    /// When the handshake completed.
    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.connected_at.get().copied()
    }

    /// Claim the heartbeat slot if `interval` has elapsed since the last
    /// claim. Check and update happen under one lock, so concurrent
    /// callers inside one interval get exactly one `true`.
    pub fn try_claim_heartbeat(&self, now: Instant, interval: Duration) -> bool {
        let mut last = self.last_heartbeat.lock();
        if now >= *last + interval {
            *last = now;
            true
        } else {
            false
        }
    }
}

impl Default for AgentStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn heartbeat_claimed_once_per_interval() {
        let stats = AgentStats::new();
        let interval = Duration::from_secs(60);

        assert!(!stats.try_claim_heartbeat(Instant::now(), interval));

        tokio::time::advance(Duration::from_secs(61)).await;
        let now = Instant::now();
        assert!(stats.try_claim_heartbeat(now, interval));
        assert!(!stats.try_claim_heartbeat(now, interval));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!stats.try_claim_heartbeat(Instant::now(), interval));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(stats.try_claim_heartbeat(Instant::now(), interval));
    }

    #[test]
    fn counters_and_connect_time() {
        let stats = AgentStats::new();
        stats.record_received();
        stats.record_received();
        stats.record_sent();
        assert_eq!(stats.received(), 2);
        assert_eq!(stats.sent(), 1);

        assert!(stats.connected_at().is_none());
        stats.mark_connected();
        let first = stats.connected_at();
        stats.mark_connected();
        assert_eq!(stats.connected_at(), first);
    }
}
