//! Global atomic counters for the masher.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single `info!` event.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters.
pub struct Metrics {
    pushes_started: AtomicU64,
    pushes_completed: AtomicU64,
    pushes_failed: AtomicU64,
    compose_retries: AtomicU64,
    lock_conflicts: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            pushes_started: AtomicU64::new(0),
            pushes_completed: AtomicU64::new(0),
            pushes_failed: AtomicU64::new(0),
            compose_retries: AtomicU64::new(0),
            lock_conflicts: AtomicU64::new(0),
        }
    }

    pub fn inc_pushes_started(&self) {
        self.pushes_started.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "pushes_started", "counter incremented");
    }

    pub fn inc_pushes_completed(&self) {
        self.pushes_completed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "pushes_completed", "counter incremented");
    }

    pub fn inc_pushes_failed(&self) {
        self.pushes_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "pushes_failed", "counter incremented");
    }

    pub fn inc_compose_retries(&self) {
        self.compose_retries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "compose_retries", "counter incremented");
    }

    pub fn inc_lock_conflicts(&self) {
        self.lock_conflicts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "lock_conflicts", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            pushes_started = self.pushes_started(),
            pushes_completed = self.pushes_completed(),
            pushes_failed = self.pushes_failed(),
            compose_retries = self.compose_retries(),
            lock_conflicts = self.lock_conflicts(),
        );
    }

    pub fn pushes_started(&self) -> u64 {
        self.pushes_started.load(Ordering::Relaxed)
    }

    pub fn pushes_completed(&self) -> u64 {
        self.pushes_completed.load(Ordering::Relaxed)
    }

    pub fn pushes_failed(&self) -> u64 {
        self.pushes_failed.load(Ordering::Relaxed)
    }

    pub fn compose_retries(&self) -> u64 {
        self.compose_retries.load(Ordering::Relaxed)
    }

    pub fn lock_conflicts(&self) -> u64 {
        self.lock_conflicts.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.pushes_started.store(0, Ordering::Relaxed);
        self.pushes_completed.store(0, Ordering::Relaxed);
        self.pushes_failed.store(0, Ordering::Relaxed);
        self.compose_retries.store(0, Ordering::Relaxed);
        self.lock_conflicts.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_pushes_started();
        m.inc_pushes_started();
        m.inc_pushes_failed();
        m.inc_lock_conflicts();
        assert_eq!(m.pushes_started(), 2);
        assert_eq!(m.pushes_failed(), 1);
        assert_eq!(m.pushes_completed(), 0);
        assert_eq!(m.lock_conflicts(), 1);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_pushes_completed();
        m.inc_compose_retries();
        m.reset();
        assert_eq!(m.pushes_completed(), 0);
        assert_eq!(m.compose_retries(), 0);
    }
}
