//! Counters for the board engine
//!
//! Updated with relaxed atomics from any task; read through
//! [`ServiceStats::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Live counters shared by the service, history manager and sessions
#[derive(Debug)]
pub struct ServiceStats {
    started_at: Instant,
    entries_added: AtomicU64,
    entries_removed: AtomicU64,
    entries_evicted: AtomicU64,
    payloads_deleted: AtomicU64,
    payload_cleanup_failures: AtomicU64,
    bus_publish_failures: AtomicU64,
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    sessions_dropped: AtomicU64,
    events_forwarded: AtomicU64,
}

impl ServiceStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            entries_added: AtomicU64::new(0),
            entries_removed: AtomicU64::new(0),
            entries_evicted: AtomicU64::new(0),
            payloads_deleted: AtomicU64::new(0),
            payload_cleanup_failures: AtomicU64::new(0),
            bus_publish_failures: AtomicU64::new(0),
            sessions_opened: AtomicU64::new(0),
            sessions_closed: AtomicU64::new(0),
            sessions_dropped: AtomicU64::new(0),
            events_forwarded: AtomicU64::new(0),
        }
    }

    pub(crate) fn entry_added(&self) {
        self.entries_added.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn entry_removed(&self) {
        self.entries_removed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn entries_evicted(&self, n: usize) {
        self.entries_evicted.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn payload_deleted(&self) {
        self.payloads_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn payload_cleanup_failed(&self) {
        self.payload_cleanup_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn bus_publish_failed(&self) {
        self.bus_publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// `dropped` marks sessions closed for falling behind
    pub(crate) fn session_closed(&self, dropped: bool) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
        if dropped {
            self.sessions_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn event_forwarded(&self) {
        self.events_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        let opened = self.sessions_opened.load(Ordering::Relaxed);
        let closed = self.sessions_closed.load(Ordering::Relaxed);

        StatsSnapshot {
            uptime: self.started_at.elapsed(),
            entries_added: self.entries_added.load(Ordering::Relaxed),
            entries_removed: self.entries_removed.load(Ordering::Relaxed),
            entries_evicted: self.entries_evicted.load(Ordering::Relaxed),
            payloads_deleted: self.payloads_deleted.load(Ordering::Relaxed),
            payload_cleanup_failures: self.payload_cleanup_failures.load(Ordering::Relaxed),
            bus_publish_failures: self.bus_publish_failures.load(Ordering::Relaxed),
            sessions_opened: opened,
            active_sessions: opened.saturating_sub(closed),
            sessions_dropped: self.sessions_dropped.load(Ordering::Relaxed),
            events_forwarded: self.events_forwarded.load(Ordering::Relaxed),
        }
    }
}

impl Default for ServiceStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy of the service counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub uptime: Duration,
    pub entries_added: u64,
    pub entries_removed: u64,
    pub entries_evicted: u64,
    pub payloads_deleted: u64,
    pub payload_cleanup_failures: u64,
    pub bus_publish_failures: u64,
    pub sessions_opened: u64,
    pub active_sessions: u64,
    /// Sessions closed because their viewer could not keep up
    pub sessions_dropped: u64,
    pub events_forwarded: u64,
}
