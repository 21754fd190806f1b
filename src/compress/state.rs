use super::CancellationFlag;
use crate::error::RunError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Idle,
    Discovering,
    Running,
    Uploading,
    Done,
    Canceled,
    Failed,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Done | RunPhase::Canceled | RunPhase::Failed)
    }

    /// Allowed edges of the run state machine.
    pub fn can_transition_to(&self, next: RunPhase) -> bool {
        use RunPhase::*;
        matches!(
            (self, next),
            (Idle, Discovering)
                // Rejected before discovery (no source directory given).
                | (Idle, Failed)
                // Nothing found, or the source directory is unusable.
                | (Discovering, Done)
                | (Discovering, Failed)
                | (Discovering, Running)
                | (Running, Uploading)
                | (Running, Done)
                | (Running, Canceled)
                | (Running, Failed)
                | (Uploading, Done)
                | (Uploading, Failed)
        )
    }
}

/// Read-only snapshot handed to observers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunState {
    pub total_discovered: usize,
    pub dispatched: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub canceled: bool,
    pub phase: RunPhase,
}

/// Live run state. The phase is only advanced by the scheduler; workers
/// bump the counters.
#[derive(Debug, Clone)]
pub struct RunTracker {
    phase: Arc<RwLock<RunPhase>>,
    total_discovered: Arc<AtomicUsize>,
    dispatched: Arc<AtomicUsize>,
    succeeded: Arc<AtomicUsize>,
    failed: Arc<AtomicUsize>,
    canceled: Arc<AtomicBool>,
}

impl Default for RunTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RunTracker {
    pub fn new() -> Self {
        Self {
            phase: Arc::new(RwLock::new(RunPhase::Idle)),
            total_discovered: Arc::new(AtomicUsize::new(0)),
            dispatched: Arc::new(AtomicUsize::new(0)),
            succeeded: Arc::new(AtomicUsize::new(0)),
            failed: Arc::new(AtomicUsize::new(0)),
            canceled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn phase(&self) -> RunPhase {
        *self.phase.read()
    }

    pub fn transition(&self, next: RunPhase) -> Result<(), RunError> {
        let mut phase = self.phase.write();
        Self::advance(&mut phase, next)
    }

    /// Leave `Running` for `Canceled` if `cancel` is raised, otherwise for
    /// `next`. The flag is read under the phase lock, so a cancel that
    /// goes through [`RunTracker::while_phase`] is either seen here or
    /// refused.
    pub fn settle(&self, cancel: &CancellationFlag, next: RunPhase) -> Result<RunPhase, RunError> {
        let mut phase = self.phase.write();
        let next = if cancel.is_canceled() { RunPhase::Canceled } else { next };
        Self::advance(&mut phase, next)?;
        Ok(next)
    }

    fn advance(phase: &mut RunPhase, next: RunPhase) -> Result<(), RunError> {
        if !phase.can_transition_to(next) {
            return Err(RunError::InvalidTransition { from: *phase, to: next });
        }
        tracing::debug!("Run phase {:?} -> {:?}", *phase, next);
        *phase = next;
        Ok(())
    }

    /// Run `f` only if `allowed` accepts the current phase. The phase
    /// cannot move until `f` returns. Returns whether `f` ran.
    pub fn while_phase(&self, allowed: impl Fn(RunPhase) -> bool, f: impl FnOnce()) -> bool {
        let phase = self.phase.read();
        if !allowed(*phase) {
            return false;
        }
        f();
        true
    }

    pub fn set_total(&self, total: usize) {
        self.total_discovered.store(total, Ordering::SeqCst);
    }

    pub fn record_dispatch(&self) -> usize {
        self.dispatched.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn record_outcome(&self, success: bool) {
        if success {
            self.succeeded.fetch_add(1, Ordering::SeqCst);
        } else {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn mark_canceled(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> RunState {
        let succeeded = self.succeeded.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        RunState {
            total_discovered: self.total_discovered.load(Ordering::SeqCst),
            dispatched: self.dispatched.load(Ordering::SeqCst),
            processed: succeeded + failed,
            succeeded,
            failed,
            canceled: self.canceled.load(Ordering::SeqCst),
            phase: self.phase(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL: [RunPhase; 7] = [
        RunPhase::Idle,
        RunPhase::Discovering,
        RunPhase::Running,
        RunPhase::Uploading,
        RunPhase::Done,
        RunPhase::Canceled,
        RunPhase::Failed,
    ];

    fn rank(phase: RunPhase) -> u8 {
        match phase {
            RunPhase::Idle => 0,
            RunPhase::Discovering => 1,
            RunPhase::Running => 2,
            RunPhase::Uploading => 3,
            RunPhase::Done | RunPhase::Canceled | RunPhase::Failed => 4,
        }
    }

    #[test]
    fn test_happy_path_with_upload() {
        let tracker = RunTracker::new();
        for next in [RunPhase::Discovering, RunPhase::Running, RunPhase::Uploading, RunPhase::Done] {
            tracker.transition(next).unwrap();
        }
        assert_eq!(tracker.phase(), RunPhase::Done);
    }

    #[test]
    fn test_cancel_only_from_running() {
        let tracker = RunTracker::new();
        assert!(tracker.transition(RunPhase::Canceled).is_err());
        tracker.transition(RunPhase::Discovering).unwrap();
        tracker.transition(RunPhase::Running).unwrap();
        tracker.transition(RunPhase::Canceled).unwrap();
        assert!(tracker.transition(RunPhase::Uploading).is_err());
    }

    #[test]
    fn test_rejected_start_is_terminal() {
        let tracker = RunTracker::new();
        tracker.transition(RunPhase::Failed).unwrap();
        assert!(tracker.phase().is_terminal());
        assert!(tracker.transition(RunPhase::Discovering).is_err());
    }

    #[test]
    fn test_while_phase_checks_current_phase() {
        let tracker = RunTracker::new();
        let running = |p: RunPhase| p == RunPhase::Running;

        let mut calls = 0;
        assert!(!tracker.while_phase(running, || calls += 1));
        tracker.transition(RunPhase::Discovering).unwrap();
        tracker.transition(RunPhase::Running).unwrap();
        assert!(tracker.while_phase(running, || calls += 1));
        tracker.transition(RunPhase::Uploading).unwrap();
        assert!(!tracker.while_phase(running, || calls += 1));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_settle_prefers_cancel() {
        let running = || {
            let tracker = RunTracker::new();
            tracker.transition(RunPhase::Discovering).unwrap();
            tracker.transition(RunPhase::Running).unwrap();
            tracker
        };
        let flag = CancellationFlag::new();

        let tracker = running();
        assert_eq!(tracker.settle(&flag, RunPhase::Uploading).unwrap(), RunPhase::Uploading);

        flag.cancel();
        let tracker = running();
        assert_eq!(tracker.settle(&flag, RunPhase::Uploading).unwrap(), RunPhase::Canceled);
        assert_eq!(tracker.phase(), RunPhase::Canceled);
    }

    #[test]
    fn test_terminal_phases_have_no_exits() {
        for terminal in ALL.iter().filter(|p| p.is_terminal()) {
            for next in ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_snapshot_counts() {
        let tracker = RunTracker::new();
        tracker.set_total(3);
        tracker.record_dispatch();
        tracker.record_dispatch();
        tracker.record_outcome(true);
        tracker.record_outcome(false);
        tracker.mark_canceled();

        let state = tracker.snapshot();
        assert_eq!(state.total_discovered, 3);
        assert_eq!(state.dispatched, 2);
        assert_eq!(state.processed, 2);
        assert_eq!(state.succeeded, 1);
        assert_eq!(state.failed, 1);
        assert!(state.canceled);
        assert_eq!(state.phase, RunPhase::Idle);
    }

    proptest! {
        #[test]
        fn prop_transitions_are_monotonic(steps in proptest::collection::vec(0usize..7, 0..20)) {
            let tracker = RunTracker::new();
            let mut last = rank(tracker.phase());
            for step in steps {
                let _ = tracker.transition(ALL[step]);
                let now = rank(tracker.phase());
                prop_assert!(now >= last);
                last = now;
            }
        }
    }
}
