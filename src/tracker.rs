//! Tracking of host-async operations issued from guest code.
//!
//! One [`OperationTracker`] exists per run, owned by the execution context
//! and passed by handle into each capability, never a process-wide
//! singleton. It decides when the guest's outstanding host-async work has
//! truly settled, including continuations that register new operations
//! after earlier ones complete.
//!
//! Stopping the instant the live set first becomes empty would truncate
//! execution: a continuation that parses a response body right after a
//! fetch resolves has not yet had a scheduling tick in which to register
//! its own operation. The tracker therefore only reports drained after a
//! fixed number of consecutive rounds in which nothing was pending and no
//! interpreter job ran.

use std::collections::HashMap;

/// What kind of host work a pending handle refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    Fetch { url: String },
    Sleep { timer_id: u64, delay_ms: u64 },
}

/// Default number of consecutive empty rounds before the drain loop stops.
pub const DEFAULT_SETTLE_GRACE_ROUNDS: u32 = 5;

/// Live set of pending host operations plus the settle counter.
#[derive(Debug)]
pub struct OperationTracker {
    pending: HashMap<String, OperationKind>,
    issued: u64,
    settled: u64,
    empty_rounds: u32,
    grace_rounds: u32,
    next_timer_id: u64,
}

impl OperationTracker {
    #[must_use]
    pub fn new(grace_rounds: u32) -> Self {
        Self {
            pending: HashMap::new(),
            issued: 0,
            settled: 0,
            empty_rounds: 0,
            grace_rounds: grace_rounds.max(1),
            next_timer_id: 1,
        }
    }

    /// Allocate a unique timer id for a guest `setTimeout`.
    pub fn allocate_timer_id(&mut self) -> u64 {
        let id = self.next_timer_id;
        self.next_timer_id = self.next_timer_id.saturating_add(1);
        id
    }

    /// Add a handle when the guest issues an operation.
    pub fn register(&mut self, call_id: impl Into<String>, kind: OperationKind) {
        let call_id = call_id.into();
        self.issued += 1;
        tracing::trace!(
            event = "tracker.register",
            call_id = %call_id,
            pending = self.pending.len() + 1,
            "Registered pending operation"
        );
        self.pending.insert(call_id, kind);
    }

    /// Remove a handle when its operation settles (success or failure).
    pub fn settle(&mut self, call_id: &str) -> Option<OperationKind> {
        let kind = self.pending.remove(call_id);
        if kind.is_some() {
            self.settled += 1;
            tracing::trace!(
                event = "tracker.settle",
                call_id = %call_id,
                remaining = self.pending.len(),
                "Operation settled"
            );
        } else {
            tracing::warn!(
                event = "tracker.settle_unknown",
                call_id = %call_id,
                "Settlement for unknown operation"
            );
        }
        kind
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    /// Something happened this round (operations in flight, jobs ran, or the
    /// test chain is still moving): restart the grace countdown.
    pub fn mark_progress(&mut self) {
        self.empty_rounds = 0;
    }

    /// Nothing was pending this round; returns the consecutive-empty count.
    pub fn mark_empty_round(&mut self) -> u32 {
        self.empty_rounds = self.empty_rounds.saturating_add(1);
        self.empty_rounds
    }

    /// Whether enough consecutive empty rounds have elapsed to stop.
    #[must_use]
    pub fn drained(&self) -> bool {
        self.pending.is_empty() && self.empty_rounds >= self.grace_rounds
    }

    #[must_use]
    pub fn issued(&self) -> u64 {
        self.issued
    }

    #[must_use]
    pub fn settled(&self) -> u64 {
        self.settled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetch(url: &str) -> OperationKind {
        OperationKind::Fetch {
            url: url.to_string(),
        }
    }

    #[test]
    fn register_and_settle_maintain_live_set() {
        let mut tracker = OperationTracker::new(DEFAULT_SETTLE_GRACE_ROUNDS);
        tracker.register("call-1", fetch("https://a"));
        tracker.register("call-2", fetch("https://b"));
        assert_eq!(tracker.pending_count(), 2);

        assert!(tracker.settle("call-1").is_some());
        assert!(tracker.settle("call-1").is_none());
        assert_eq!(tracker.pending_count(), 1);
        assert_eq!(tracker.issued(), 2);
        assert_eq!(tracker.settled(), 1);
    }

    #[test]
    fn not_drained_while_operations_pending() {
        let mut tracker = OperationTracker::new(2);
        tracker.register("call-1", fetch("https://a"));
        for _ in 0..10 {
            tracker.mark_empty_round();
        }
        assert!(!tracker.drained());
        tracker.settle("call-1");
        assert!(tracker.drained());
    }

    #[test]
    fn drains_only_after_consecutive_empty_rounds() {
        let mut tracker = OperationTracker::new(3);
        assert!(!tracker.drained());
        tracker.mark_empty_round();
        tracker.mark_empty_round();
        assert!(!tracker.drained());
        tracker.mark_empty_round();
        assert!(tracker.drained());
    }

    #[test]
    fn progress_resets_the_countdown() {
        let mut tracker = OperationTracker::new(2);
        tracker.mark_empty_round();
        // A late continuation registered a new operation.
        tracker.register("call-1", fetch("https://a"));
        tracker.mark_progress();
        tracker.settle("call-1");
        tracker.mark_empty_round();
        assert!(!tracker.drained());
        tracker.mark_empty_round();
        assert!(tracker.drained());
    }

    #[test]
    fn grace_rounds_floor_at_one() {
        let mut tracker = OperationTracker::new(0);
        tracker.mark_empty_round();
        assert!(tracker.drained());
    }
}
