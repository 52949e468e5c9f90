//! Structured observability hooks for the push lifecycle.
//!
//! - `push_span` / `PushSpan` tagging every log line with the push id
//! - `emit_*` functions for lifecycle events consumed by log aggregation

use tracing::{info, warn};

/// Span for one push. Async code attaches it with
/// `tracing::Instrument::instrument`; entered guards must not be held across
/// an `.await` in spawned tasks.
pub fn push_span(push_id: &str, repo: &str) -> tracing::Span {
    tracing::info_span!("masher.push", push_id = %push_id, repo = %repo)
}

/// RAII guard that enters a push-scoped tracing span.
///
/// ```ignore
/// let _span = PushSpan::enter("5f0c...", "f17-updates");
/// ```
pub struct PushSpan {
    _span: tracing::span::EnteredSpan,
}

impl PushSpan {
    pub fn enter(push_id: &str, repo: &str) -> Self {
        Self {
            _span: push_span(push_id, repo).entered(),
        }
    }
}

pub fn emit_push_started(push_id: &str, repo: &str, updates: usize) {
    info!(event = "push.started", push_id = %push_id, repo = %repo, updates = updates);
}

/// Emit event: a phase transition was durably recorded.
pub fn emit_phase_completed(push_id: &str, phase: &str, attempts: u32, duration_ms: u64) {
    info!(
        event = "push.phase_completed",
        push_id = %push_id,
        phase = %phase,
        attempts = attempts,
        duration_ms = duration_ms,
    );
}

pub fn emit_push_failed(push_id: &str, phase: &str, reason: &str) {
    warn!(event = "push.failed", push_id = %push_id, phase = %phase, reason = %reason);
}

/// Emit event: push reached a terminal state.
pub fn emit_push_finished(push_id: &str, completed: bool, caveats: usize, duration_ms: u64) {
    info!(
        event = "push.finished",
        push_id = %push_id,
        completed = completed,
        caveats = caveats,
        duration_ms = duration_ms,
    );
}

pub fn emit_lock_conflict(repo: &str, push_id: &str, holder: &str) {
    warn!(event = "lock.conflict", repo = %repo, push_id = %push_id, holder = %holder);
}

pub fn emit_forced_unlock(repo: &str, holder: &str, operator: &str) {
    warn!(event = "lock.forced_unlock", repo = %repo, holder = %holder, operator = %operator);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_span_create() {
        let _span = PushSpan::enter("test-push-id", "f17-updates");
        emit_push_started("test-push-id", "f17-updates", 2);
    }
}
