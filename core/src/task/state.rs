//! Task state machine (spec §4.3).

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum State {
    New,
    Submitted,
    Running,
    Stopped,
    Unknown,
    Terminating,
    Terminated,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Terminated)
    }

    /// Non-terminal states in which the Engine still holds a known resource
    /// assignment for the task and should keep polling it.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            State::Submitted | State::Running | State::Stopped | State::Unknown | State::Terminating
        )
    }

    /// Whether `to` is a permitted transition from `self` (§4.3). `Unknown`
    /// is reachable from, and returns to, every observable state; every
    /// other edge is listed explicitly.
    pub fn can_transition_to(self, to: State) -> bool {
        use State::*;
        if self == Terminated {
            return false;
        }
        match (self, to) {
            (_, Unknown) if self != New => true,
            (Unknown, prior) if prior != Unknown => true,
            (New, Submitted) | (New, Terminated) | (New, New) => true,
            // `Submitted -> Terminating` is cancellation of a queued-but-
            // not-yet-running task (§4.4 "Cancellation"): not a normal
            // progression edge, but a valid external-intervention one.
            (Submitted, Running) | (Submitted, Terminated) | (Submitted, Terminating) => true,
            (Running, Terminating) | (Running, Stopped) | (Running, Terminated) => true,
            (Stopped, Running) => true,
            (Terminating, Terminated) => true,
            _ => false,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::New => "new",
            State::Submitted => "submitted",
            State::Running => "running",
            State::Stopped => "stopped",
            State::Unknown => "unknown",
            State::Terminating => "terminating",
            State::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use State::*;

    #[test]
    fn forward_progression_is_allowed() {
        assert!(New.can_transition_to(Submitted));
        assert!(Submitted.can_transition_to(Running));
        assert!(Running.can_transition_to(Terminating));
        assert!(Terminating.can_transition_to(Terminated));
    }

    #[test]
    fn unknown_is_reachable_and_recoverable_from_any_observable_state() {
        for s in [Submitted, Running, Stopped, Terminating] {
            assert!(s.can_transition_to(Unknown));
            assert!(Unknown.can_transition_to(s));
        }
    }

    #[test]
    fn terminated_is_absorbing() {
        assert!(!Terminated.can_transition_to(New));
        assert!(!Terminated.can_transition_to(Unknown));
    }

    #[test]
    fn no_forward_skip() {
        assert!(!New.can_transition_to(Running));
        assert!(!New.can_transition_to(Terminating));
    }

    #[test]
    fn submitted_can_be_cancelled_before_running() {
        // Cancellation of a queued-but-not-yet-running task (§4.4): not a
        // normal progression edge, but a valid external-intervention one.
        assert!(Submitted.can_transition_to(Terminating));
    }

    #[test]
    fn stopped_only_returns_via_external_intervention_not_skip() {
        assert!(Stopped.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Terminating));
    }
}
