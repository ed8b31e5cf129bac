//! Monotonic event ordering guard.
//!
//! The guard never blocks waiting for a missing event: a conversational UI
//! must stay live, so events ahead of the expected sequence are applied
//! immediately and the gap is only reported for audit. Stale or duplicate
//! events are dropped.

use tracing::warn;

/// Outcome of observing one incoming sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceDecision {
    /// Event should be applied; sequence advanced without a gap.
    Apply,
    /// Event should be applied even though earlier events are missing.
    ApplyWithGap {
        /// First sequence number that was skipped.
        expected: u64,
        /// Sequence number that actually arrived.
        got: u64,
    },
    /// Duplicate or stale event; must be dropped.
    Stale,
    /// `seq == 0` diagnostic event; bypasses ordering entirely.
    Unordered,
}

impl SequenceDecision {
    /// Whether the event should be handed to the state machine.
    pub fn should_apply(&self) -> bool {
        !matches!(self, SequenceDecision::Stale)
    }
}

/// Tracks the last applied sequence number for one connection.
#[derive(Debug, Default)]
pub struct SequenceGuard {
    last_applied: u64,
    gaps: u64,
    dropped_stale: u64,
}

impl SequenceGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe an incoming sequence number and decide what to do with the
    /// event carrying it.
    pub fn observe(&mut self, seq: u64) -> SequenceDecision {
        if seq == 0 {
            return SequenceDecision::Unordered;
        }

        if seq <= self.last_applied {
            self.dropped_stale += 1;
            return SequenceDecision::Stale;
        }

        let expected = self.last_applied + 1;
        self.last_applied = seq;

        if seq > expected {
            self.gaps += 1;
            warn!(expected, got = seq, "sequence gap detected");
            return SequenceDecision::ApplyWithGap { expected, got: seq };
        }

        SequenceDecision::Apply
    }

    /// Forget all ordering state, used when a reconnect starts a fresh
    /// numbered stream.
    pub fn reset(&mut self) {
        self.last_applied = 0;
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    /// Number of gaps reported so far.
    pub fn gaps(&self) -> u64 {
        self.gaps
    }

    /// Number of stale events dropped so far.
    pub fn dropped_stale(&self) -> u64 {
        self.dropped_stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_events_apply() {
        let mut guard = SequenceGuard::new();
        assert_eq!(guard.observe(1), SequenceDecision::Apply);
        assert_eq!(guard.observe(2), SequenceDecision::Apply);
        assert_eq!(guard.last_applied(), 2);
        assert_eq!(guard.gaps(), 0);
    }

    #[test]
    fn test_gap_then_stale_sequence() {
        // The canonical [1, 2, 4, 3, 5] scenario: 1, 2, 4, 5 applied, 3 is
        // dropped as stale after 4, exactly one gap reported.
        let mut guard = SequenceGuard::new();
        assert_eq!(guard.observe(1), SequenceDecision::Apply);
        assert_eq!(guard.observe(2), SequenceDecision::Apply);
        assert_eq!(
            guard.observe(4),
            SequenceDecision::ApplyWithGap {
                expected: 3,
                got: 4
            }
        );
        assert_eq!(guard.observe(3), SequenceDecision::Stale);
        assert_eq!(guard.observe(5), SequenceDecision::Apply);

        assert_eq!(guard.gaps(), 1);
        assert_eq!(guard.dropped_stale(), 1);
        assert_eq!(guard.last_applied(), 5);
    }

    #[test]
    fn test_duplicate_is_stale() {
        let mut guard = SequenceGuard::new();
        assert_eq!(guard.observe(1), SequenceDecision::Apply);
        assert_eq!(guard.observe(1), SequenceDecision::Stale);
        assert!(!guard.observe(1).should_apply());
    }

    #[test]
    fn test_zero_bypasses_ordering() {
        let mut guard = SequenceGuard::new();
        assert_eq!(guard.observe(5), SequenceDecision::ApplyWithGap { expected: 1, got: 5 });
        assert_eq!(guard.observe(0), SequenceDecision::Unordered);
        assert!(guard.observe(0).should_apply());
        // Unordered events never advance the cursor.
        assert_eq!(guard.last_applied(), 5);
    }

    #[test]
    fn test_reset_restarts_numbering() {
        let mut guard = SequenceGuard::new();
        guard.observe(7);
        guard.reset();
        assert_eq!(guard.observe(1), SequenceDecision::Apply);
    }
}
