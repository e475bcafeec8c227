use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pending,
    Backup,
    Fetch,
    Extract,
    Install,
    Cleanup,
    Done,
    Failed,
    Cancelled,
}

impl Phase {
    fn ordinal(self) -> u8 {
        match self {
            Phase::Pending => 0,
            Phase::Backup => 1,
            Phase::Fetch => 2,
            Phase::Extract => 3,
            Phase::Install => 4,
            Phase::Cleanup => 5,
            Phase::Done | Phase::Failed | Phase::Cancelled => 6,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Failed | Phase::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Pending => "pending",
            Phase::Backup => "backup",
            Phase::Fetch => "fetch",
            Phase::Extract => "extract",
            Phase::Install => "install",
            Phase::Cleanup => "cleanup",
            Phase::Done => "done",
            Phase::Failed => "failed",
            Phase::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current phase of one run. Only forward moves are accepted; Cleanup may be
/// entered from any non-terminal phase, and exactly one terminal phase follows it.
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    current: Phase,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self {
            current: Phase::Pending,
        }
    }

    pub fn current(&self) -> Phase {
        self.current
    }

    pub fn advance(&mut self, next: Phase) -> bool {
        if self.current.is_terminal() || next.ordinal() <= self.current.ordinal() {
            tracing::error!(from = %self.current, to = %next, "Rejected phase regression");
            return false;
        }
        self.current = next;
        true
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_are_accepted() {
        let mut tracker = PhaseTracker::new();
        for phase in [
            Phase::Backup,
            Phase::Fetch,
            Phase::Extract,
            Phase::Install,
            Phase::Cleanup,
            Phase::Done,
        ] {
            assert!(tracker.advance(phase));
            assert_eq!(tracker.current(), phase);
        }
    }

    #[test]
    fn phases_are_never_revisited() {
        let mut tracker = PhaseTracker::new();
        assert!(tracker.advance(Phase::Fetch));
        assert!(!tracker.advance(Phase::Backup));
        assert!(!tracker.advance(Phase::Fetch));
        assert_eq!(tracker.current(), Phase::Fetch);
    }

    #[test]
    fn cleanup_can_follow_any_failed_phase_and_terminal_is_final() {
        let mut tracker = PhaseTracker::new();
        assert!(tracker.advance(Phase::Backup));
        assert!(tracker.advance(Phase::Cleanup));
        assert!(tracker.advance(Phase::Failed));
        assert!(!tracker.advance(Phase::Done));
        assert_eq!(tracker.current(), Phase::Failed);
    }
}
