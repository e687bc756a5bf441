//! Controller lifecycle state.

use strum_macros::{AsRefStr, Display};

/// Lifecycle of a [`Controller`](super::Controller).
///
/// Transitions only move forward:
/// `NotStarted -> Started -> StopRequested -> Done`, plus
/// `NotStarted -> Done` when stopped before starting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
pub enum ControllerState {
    NotStarted,
    Started,
    StopRequested,
    Done,
}

impl ControllerState {
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::NotStarted, Self::Started)
                | (Self::NotStarted, Self::Done)
                | (Self::Started, Self::StopRequested)
                | (Self::StopRequested, Self::Done)
        )
    }

    /// Move to `next`.
    ///
    /// # Panics
    /// Panics on an illegal transition; callers must never attempt one.
    pub fn transition(&mut self, next: Self) {
        assert!(
            self.can_transition_to(next),
            "illegal controller state transition: {self} -> {next}"
        );
        tracing::debug!(from = %self, to = %next, "Controller state changed");
        *self = next;
    }
}
