//! Aggregate server statistics.
//!
//! Counters are plain atomics updated with relaxed ordering so the I/O path
//! never blocks on accounting. The owning context hands a reference to every
//! backend; there is no process-wide state.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

/// Counters shared by the listener, the connection handlers and the
/// periodic reporter.
#[derive(Debug, Default)]
pub struct Stats {
    active: AtomicU64,
    peak_active: AtomicU64,
    total_connections: AtomicU64,
    total_requests: AtomicU64,
    total_bytes_sent: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub active: u64,
    pub peak_active: u64,
    pub total_connections: u64,
    pub total_requests: u64,
    pub total_bytes_sent: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connection was admitted (pool slot acquired or queue pop).
    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        let active = self.active.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_active.fetch_max(active, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    /// A request produced a response (success or error).
    pub fn request_served(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_sent(&self, n: u64) {
        self.total_bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            active: self.active.load(Ordering::Relaxed),
            peak_active: self.peak_active.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_bytes_sent: self.total_bytes_sent.load(Ordering::Relaxed),
        }
    }

    /// Emits the periodic statistics line.
    pub fn report(&self) {
        let s = self.snapshot();
        info!(
            active = s.active,
            peak = s.peak_active,
            connections = s.total_connections,
            requests = s.total_requests,
            bytes_sent = s.total_bytes_sent,
            "server stats"
        );
    }
}
