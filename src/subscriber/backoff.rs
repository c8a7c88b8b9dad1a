//! Per-subscription backoff state machine

use std::time::{Duration, Instant};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BackoffState {
    Normal,
    Backoff,
    Testing,
}

/// Tracks a subscription's Normal/Backoff/Test transitions
///
/// Entered on handler failure; the `Backoff` state holds RDY=0 on every
/// connection for `duration`, then moves to `Testing` (RDY=1 on exactly one
/// connection). A success in `Testing` returns to `Normal`; a failure
/// doubles `duration` (capped) and re-enters `Backoff`.
#[derive(Debug)]
pub(crate) struct Backoff {
    state: BackoffState,
    duration: Duration,
    entered_at: Instant,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        Self {
            state: BackoffState::Normal,
            duration: INITIAL_BACKOFF,
            entered_at: Instant::now(),
        }
    }

    pub(crate) fn state(&self) -> BackoffState {
        self.state
    }

    /// The handler failed: enter or deepen backoff
    pub(crate) fn on_handler_failure(&mut self) {
        self.duration = match self.state {
            BackoffState::Normal => INITIAL_BACKOFF,
            BackoffState::Backoff | BackoffState::Testing => {
                (self.duration * 2).min(MAX_BACKOFF)
            }
        };
        self.state = BackoffState::Backoff;
        self.entered_at = Instant::now();
    }

    /// The handler succeeded: exit `Testing` to `Normal` and reset the duration
    pub(crate) fn on_handler_success(&mut self) {
        if self.state == BackoffState::Testing {
            self.state = BackoffState::Normal;
        }
        self.duration = INITIAL_BACKOFF;
    }

    /// `true` once `duration` has elapsed since entering `Backoff`
    pub(crate) fn ready_to_test(&self) -> bool {
        self.state == BackoffState::Backoff && self.entered_at.elapsed() >= self.duration
    }

    /// Move from `Backoff` into `Testing`
    pub(crate) fn begin_test(&mut self) {
        self.state = BackoffState::Testing;
    }
}

#[cfg(test)]
mod tests {
    use super::{Backoff, BackoffState};

    #[test]
    fn starts_normal() {
        assert_eq!(BackoffState::Normal, Backoff::new().state());
    }

    #[test]
    fn failure_enters_backoff_then_success_in_test_returns_to_normal() {
        let mut backoff = Backoff::new();
        backoff.on_handler_failure();
        assert_eq!(BackoffState::Backoff, backoff.state());

        backoff.begin_test();
        assert_eq!(BackoffState::Testing, backoff.state());

        backoff.on_handler_success();
        assert_eq!(BackoffState::Normal, backoff.state());
    }

    #[test]
    fn repeated_failure_in_test_doubles_duration() {
        let mut backoff = Backoff::new();
        backoff.on_handler_failure();
        let first = backoff.duration;

        backoff.begin_test();
        backoff.on_handler_failure();
        assert_eq!(first * 2, backoff.duration);
        assert_eq!(BackoffState::Backoff, backoff.state());
    }

    #[test]
    fn success_while_normal_does_not_change_state() {
        let mut backoff = Backoff::new();
        backoff.on_handler_success();
        assert_eq!(BackoffState::Normal, backoff.state());
    }
}
