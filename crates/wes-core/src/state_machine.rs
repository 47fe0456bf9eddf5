// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run state transition table.
//!
//! | From | Allowed next |
//! |------|--------------|
//! | UNKNOWN | QUEUED, INITIALIZING, RUNNING, SYSTEM_ERROR |
//! | QUEUED | INITIALIZING, RUNNING, CANCELED, SYSTEM_ERROR |
//! | INITIALIZING | RUNNING, CANCELED, EXECUTOR_ERROR, SYSTEM_ERROR |
//! | RUNNING | COMPLETE, EXECUTOR_ERROR, CANCELED, SYSTEM_ERROR, PAUSED |
//! | PAUSED | RUNNING, CANCELED, SYSTEM_ERROR |
//! | CANCELING | CANCELED, SYSTEM_ERROR |
//!
//! Terminal states and PREEMPTED have no outgoing edges. Both the monitor and
//! the callback handler go through [`is_valid_transition`].

use crate::model::RunState;

/// States reachable from `from` in one step.
pub fn allowed_transitions(from: RunState) -> &'static [RunState] {
    use RunState::*;

    match from {
        Unknown => &[Queued, Initializing, Running, SystemError],
        Queued => &[Initializing, Running, Canceled, SystemError],
        Initializing => &[Running, Canceled, ExecutorError, SystemError],
        Running => &[Complete, ExecutorError, Canceled, SystemError, Paused],
        Paused => &[Running, Canceled, SystemError],
        Canceling => &[Canceled, SystemError],
        Complete | ExecutorError | SystemError | Canceled | Preempted => &[],
    }
}

/// Whether a run may move from `from` to `to`.
pub fn is_valid_transition(from: RunState, to: RunState) -> bool {
    allowed_transitions(from).contains(&to)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_escape_from_terminal_states() {
        for terminal in RunState::TERMINAL {
            for next in RunState::ALL {
                assert!(
                    !is_valid_transition(terminal, next),
                    "{terminal} -> {next} must be illegal"
                );
            }
        }
    }

    #[test]
    fn test_preempted_has_no_edges() {
        assert!(allowed_transitions(RunState::Preempted).is_empty());
    }

    #[test]
    fn test_self_transitions_are_illegal() {
        for state in RunState::ALL {
            assert!(!is_valid_transition(state, state));
        }
    }

    #[test]
    fn test_happy_path() {
        assert!(is_valid_transition(RunState::Queued, RunState::Initializing));
        assert!(is_valid_transition(RunState::Initializing, RunState::Running));
        assert!(is_valid_transition(RunState::Running, RunState::Complete));
    }

    #[test]
    fn test_cancel_edges() {
        assert!(is_valid_transition(RunState::Canceling, RunState::Canceled));
        assert!(is_valid_transition(RunState::Queued, RunState::Canceled));
        assert!(!is_valid_transition(RunState::Canceling, RunState::Running));
        assert!(!is_valid_transition(RunState::Canceling, RunState::Complete));
    }

    #[test]
    fn test_initializing_cannot_complete_directly() {
        assert!(!is_valid_transition(
            RunState::Initializing,
            RunState::Complete
        ));
        assert!(!is_valid_transition(RunState::Queued, RunState::Complete));
    }

    #[test]
    fn test_paused_round_trip() {
        assert!(is_valid_transition(RunState::Running, RunState::Paused));
        assert!(is_valid_transition(RunState::Paused, RunState::Running));
        assert!(!is_valid_transition(RunState::Paused, RunState::Complete));
    }

    #[test]
    fn test_nothing_enters_canceling_through_the_table() {
        for state in RunState::ALL {
            assert!(!is_valid_transition(state, RunState::Canceling));
        }
    }
}
