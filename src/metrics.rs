//! Booster metrics collection.
//!
//! Aggregate counters only; nothing here identifies a proxied target.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters shared by the orchestrator, the connections and the proxy.
#[derive(Debug)]
pub struct Metrics {
    start_time: Instant,
    /// Booster sockets ever opened, accepted or dialed, registered or not
    total_connections: AtomicU64,
    /// Booster connections currently open
    active_connections: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    heartbeats_received: AtomicU64,
    /// SOCKS5 requests dispatched
    socks_requests: AtomicU64,
    /// Dials routed through a peer proxy
    chained_dials: AtomicU64,
    /// Dials that went direct
    direct_dials: AtomicU64,
    /// Peers evicted after a failed chained dial
    evictions: AtomicU64,
}

impl Metrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            heartbeats_received: AtomicU64::new(0),
            socks_requests: AtomicU64::new(0),
            chained_dials: AtomicU64::new(0),
            direct_dials: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Increment total and active connections.
    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement active connections. Callers guarantee one call per connection.
    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn packet_sent(&self) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_received(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heartbeat_received(&self) {
        self.heartbeats_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn socks_request(&self) {
        self.socks_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chained_dial(&self) {
        self.chained_dials.fetch_add(1, Ordering::Relaxed);
    }

    pub fn direct_dial(&self) {
        self.direct_dials.fetch_add(1, Ordering::Relaxed);
    }

    pub fn eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            total_connections: self.total_connections(),
            active_connections: self.active_connections(),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            heartbeats_received: self.heartbeats_received.load(Ordering::Relaxed),
            socks_requests: self.socks_requests.load(Ordering::Relaxed),
            chained_dials: self.chained_dials.load(Ordering::Relaxed),
            direct_dials: self.direct_dials.load(Ordering::Relaxed),
            evictions: self.evictions(),
        }
    }

    /// Format metrics as a simple text report.
    pub fn format_report(&self) -> String {
        let s = self.snapshot();

        format!(
            r#"Booster Metrics
===============
Uptime: {} seconds

Peers:
  Total:      {}
  Active:     {}
  Heartbeats: {}

Packets:
  Sent:     {}
  Received: {}

Proxy:
  Requests:  {}
  Chained:   {}
  Direct:    {}
  Evictions: {}
"#,
            s.uptime_secs,
            s.total_connections,
            s.active_connections,
            s.heartbeats_received,
            s.packets_sent,
            s.packets_received,
            s.socks_requests,
            s.chained_dials,
            s.direct_dials,
            s.evictions,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of all metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub total_connections: u64,
    pub active_connections: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub heartbeats_received: u64,
    pub socks_requests: u64,
    pub chained_dials: u64,
    pub direct_dials: u64,
    pub evictions: u64,
}

impl MetricsSnapshot {
    /// Share of outbound dials that were chained through a peer.
    pub fn chain_rate(&self) -> f64 {
        let total = self.chained_dials + self.direct_dials;
        if total == 0 {
            0.0
        } else {
            self.chained_dials as f64 / total as f64
        }
    }
}
