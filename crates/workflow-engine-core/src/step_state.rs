// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Step lifecycle state machine, tracked independently of `StepResult` so that
//! schedulers can query "where is this step right now" without reconstructing
//! a result record.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum StepState {
    Pending,
    Ready,
    Running,
    Retrying,
    Success,
    Failed,
    Skipped,
    Cancelled,
}

impl StepState {
    fn allowed_transitions(self) -> &'static [StepState] {
        use StepState::*;
        match self {
            Pending => &[Ready, Skipped],
            Ready => &[Running, Cancelled],
            Running => &[Success, Failed, Retrying, Skipped, Cancelled],
            Retrying => &[Running, Failed, Cancelled],
            Success | Failed | Skipped | Cancelled => &[],
        }
    }

    pub fn is_terminal(self) -> bool {
        self.allowed_transitions().is_empty()
    }
}

/// Tracks the current `StepState` per step name and enforces the allowed
/// transition table.
#[derive(Debug, Default)]
pub struct StepStateManager {
    states: HashMap<String, StepState>,
}

/// Error returned when an invalid state transition is attempted.
#[derive(Debug, thiserror::Error)]
#[error("cannot transition step '{step_name}' from {from:?} to {to:?}")]
pub struct InvalidTransition {
    pub step_name: String,
    pub from: StepState,
    pub to: StepState,
}

impl StepStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_state(&self, step_name: &str) -> StepState {
        self.states
            .get(step_name)
            .copied()
            .unwrap_or(StepState::Pending)
    }

    /// Sets the state unconditionally, bypassing the transition table.
    pub fn set_state(&mut self, step_name: &str, new_state: StepState) {
        self.states.insert(step_name.to_string(), new_state);
    }

    pub fn can_transition(&self, current: StepState, new_state: StepState) -> bool {
        current.allowed_transitions().contains(&new_state)
    }

    pub fn transition(
        &mut self,
        step_name: &str,
        new_state: StepState,
    ) -> Result<StepState, InvalidTransition> {
        let current = self.get_state(step_name);
        if !self.can_transition(current, new_state) {
            return Err(InvalidTransition {
                step_name: step_name.to_string(),
                from: current,
                to: new_state,
            });
        }
        self.states.insert(step_name.to_string(), new_state);
        Ok(new_state)
    }

    pub fn reset(&mut self, step_name: &str) {
        self.states.remove(step_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state_is_pending() {
        let mgr = StepStateManager::new();
        assert_eq!(mgr.get_state("a"), StepState::Pending);
    }

    #[test]
    fn valid_transition_chain_succeeds() {
        let mut mgr = StepStateManager::new();
        mgr.transition("a", StepState::Ready).unwrap();
        mgr.transition("a", StepState::Running).unwrap();
        mgr.transition("a", StepState::Success).unwrap();
        assert_eq!(mgr.get_state("a"), StepState::Success);
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let mut mgr = StepStateManager::new();
        let err = mgr.transition("a", StepState::Success).unwrap_err();
        assert_eq!(err.from, StepState::Pending);
        assert_eq!(err.to, StepState::Success);
    }

    #[test]
    fn terminal_states_have_no_outgoing_transitions() {
        assert!(StepState::Success.is_terminal());
        assert!(StepState::Failed.is_terminal());
        assert!(StepState::Skipped.is_terminal());
        assert!(StepState::Cancelled.is_terminal());
        assert!(!StepState::Running.is_terminal());
    }

    #[test]
    fn reset_returns_to_pending() {
        let mut mgr = StepStateManager::new();
        mgr.transition("a", StepState::Ready).unwrap();
        mgr.reset("a");
        assert_eq!(mgr.get_state("a"), StepState::Pending);
    }
}
