use crate::handle::death_row::ReclaimStats;
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionMetrics {
    pub native_calls: u64,
    /// Calls refused at the entry gate by the unhandled-error sentinel.
    pub blocked_calls: u64,
    pub handles_wrapped: u64,
    pub reclaim_released: u64,
    pub reclaim_dropped: u64,
    pub scopes_ended: u64,
    pub deferred_pins: u64,
    pub plan_cache_hits: u64,
    pub plan_cache_misses: u64,
    pub plan_cache_evictions: u64,
    pub cursor_fetches: u64,
    pub errors_captured: u64,
    /// Reclaim requests pushed after the session shut down.
    pub dropped_after_close: u64,
}

#[derive(Debug, Default)]
pub(crate) struct MetricsRecorder {
    native_calls: AtomicU64,
    blocked_calls: AtomicU64,
    handles_wrapped: AtomicU64,
    reclaim_released: AtomicU64,
    reclaim_dropped: AtomicU64,
    scopes_ended: AtomicU64,
    deferred_pins: AtomicU64,
    cursor_fetches: AtomicU64,
}

impl MetricsRecorder {
    pub(crate) fn native_call(&self) {
        self.native_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn blocked_call(&self) {
        self.blocked_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn handle_wrapped(&self) {
        self.handles_wrapped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn cursor_fetch(&self) {
        self.cursor_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reclaimed(&self, stats: ReclaimStats) {
        if stats.is_empty() {
            return;
        }
        self.reclaim_released
            .fetch_add(stats.released as u64, Ordering::Relaxed);
        self.reclaim_dropped
            .fetch_add(stats.dropped as u64, Ordering::Relaxed);
        self.scopes_ended
            .fetch_add(stats.scopes_ended as u64, Ordering::Relaxed);
    }

    /// A teardown that freed `scopes` immediately and deferred `pins`.
    pub(crate) fn teardown(&self, scopes: usize, pins: usize) {
        self.scopes_ended
            .fetch_add(scopes as u64, Ordering::Relaxed);
        self.deferred_pins.fetch_add(pins as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> SessionMetrics {
        SessionMetrics {
            native_calls: self.native_calls.load(Ordering::Relaxed),
            blocked_calls: self.blocked_calls.load(Ordering::Relaxed),
            handles_wrapped: self.handles_wrapped.load(Ordering::Relaxed),
            reclaim_released: self.reclaim_released.load(Ordering::Relaxed),
            reclaim_dropped: self.reclaim_dropped.load(Ordering::Relaxed),
            scopes_ended: self.scopes_ended.load(Ordering::Relaxed),
            deferred_pins: self.deferred_pins.load(Ordering::Relaxed),
            cursor_fetches: self.cursor_fetches.load(Ordering::Relaxed),
            ..SessionMetrics::default()
        }
    }
}
