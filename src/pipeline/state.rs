//! Pipeline states and the declarative transition table.

use serde::{Deserialize, Serialize};

/// Workflow phase of one project's pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineState {
    Idle,
    Planning,
    ReadyForDev,
    Implementing,
    InQa,
    ReadyForDeploy,
    Deploying,
    Completed,
    Failed,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipelineState::Idle => "idle",
            PipelineState::Planning => "planning",
            PipelineState::ReadyForDev => "ready-for-dev",
            PipelineState::Implementing => "implementing",
            PipelineState::InQa => "in-qa",
            PipelineState::ReadyForDeploy => "ready-for-deploy",
            PipelineState::Deploying => "deploying",
            PipelineState::Completed => "completed",
            PipelineState::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Failed)
    }

    /// The agent that drives the pipeline forward from this state, if any.
    pub fn driving_agent(&self) -> Option<crate::supervisor::AgentType> {
        use crate::supervisor::AgentType;
        match self {
            PipelineState::Planning => Some(AgentType::Planner),
            PipelineState::ReadyForDev | PipelineState::Implementing => Some(AgentType::Dev),
            PipelineState::InQa => Some(AgentType::Qa),
            PipelineState::ReadyForDeploy | PipelineState::Deploying => Some(AgentType::Devops),
            PipelineState::Idle | PipelineState::Completed | PipelineState::Failed => None,
        }
    }
}

/// Allowed (from, to) pairs. `Failed` is additionally reachable from any
/// state when an executor surfaces a fatal error.
pub const TRANSITION_TABLE: &[(PipelineState, PipelineState)] = &[
    (PipelineState::Idle, PipelineState::Planning),
    (PipelineState::Planning, PipelineState::ReadyForDev),
    (PipelineState::ReadyForDev, PipelineState::Implementing),
    (PipelineState::Implementing, PipelineState::InQa),
    (PipelineState::InQa, PipelineState::ReadyForDeploy),
    (PipelineState::InQa, PipelineState::Implementing),
    (PipelineState::ReadyForDeploy, PipelineState::Deploying),
    (PipelineState::Deploying, PipelineState::Completed),
];

/// Check whether a transition is legal.
pub fn transition_allowed(from: PipelineState, to: PipelineState) -> bool {
    if to == PipelineState::Failed {
        // Fatal errors can surface from any non-terminal state.
        return !from.is_terminal();
    }
    TRANSITION_TABLE.contains(&(from, to))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_sequence_is_fully_allowed() {
        let path = [
            PipelineState::Idle,
            PipelineState::Planning,
            PipelineState::ReadyForDev,
            PipelineState::Implementing,
            PipelineState::InQa,
            PipelineState::ReadyForDeploy,
            PipelineState::Deploying,
            PipelineState::Completed,
        ];
        for pair in path.windows(2) {
            assert!(
                transition_allowed(pair[0], pair[1]),
                "expected {} -> {} to be allowed",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn qa_rework_loop_is_allowed() {
        assert!(transition_allowed(
            PipelineState::InQa,
            PipelineState::Implementing
        ));
    }

    #[test]
    fn failed_is_reachable_from_any_non_terminal_state() {
        for state in [
            PipelineState::Idle,
            PipelineState::Planning,
            PipelineState::ReadyForDev,
            PipelineState::Implementing,
            PipelineState::InQa,
            PipelineState::ReadyForDeploy,
            PipelineState::Deploying,
        ] {
            assert!(transition_allowed(state, PipelineState::Failed));
        }
    }

    #[test]
    fn terminal_states_admit_no_transitions() {
        assert!(!transition_allowed(
            PipelineState::Completed,
            PipelineState::Planning
        ));
        assert!(!transition_allowed(
            PipelineState::Failed,
            PipelineState::Failed
        ));
        assert!(!transition_allowed(
            PipelineState::Completed,
            PipelineState::Failed
        ));
    }

    #[test]
    fn skipping_phases_is_rejected() {
        assert!(!transition_allowed(
            PipelineState::Idle,
            PipelineState::Implementing
        ));
        assert!(!transition_allowed(
            PipelineState::Implementing,
            PipelineState::Deploying
        ));
        assert!(!transition_allowed(
            PipelineState::InQa,
            PipelineState::Deploying
        ));
    }
}
