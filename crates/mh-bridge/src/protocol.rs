use serde::{Deserialize, Serialize};

use mh_core::types::{FileOp, StepKind, TokenUsage, WorkflowState};

// ---------------------------------------------------------------------------
// ConductorEvent
// ---------------------------------------------------------------------------

/// Progress events fanned out on the event bus while the conductor works.
///
/// Delivery is best-effort; the source of truth is always on-disk state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
#[serde(rename_all = "snake_case")]
pub enum ConductorEvent {
    /// The workflow state machine moved.
    StateChanged {
        from: WorkflowState,
        to: WorkflowState,
    },
    /// A human-readable progress message with a 0-100 percentage.
    Progress { message: String, percent: u8 },
    /// The agent created, modified, or deleted a working-tree file.
    FileChanged { path: String, op: FileOp },
    /// A checkpoint commit was recorded on the task branch.
    Checkpoint {
        number: u32,
        id: String,
        message: String,
    },
    /// A chunk of agent output.
    AgentMessage { step: StepKind, text: String },
    /// The task branch was created.
    BranchCreated { branch: String },
    /// Token usage reported by the agent for a step.
    TokenUsage { step: StepKind, usage: TokenUsage },
    /// An operation failed.
    Error { operation: String, message: String },
}

/// Discriminant used for type-filtered subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StateChanged,
    Progress,
    FileChanged,
    Checkpoint,
    AgentMessage,
    BranchCreated,
    TokenUsage,
    Error,
}

impl ConductorEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ConductorEvent::StateChanged { .. } => EventKind::StateChanged,
            ConductorEvent::Progress { .. } => EventKind::Progress,
            ConductorEvent::FileChanged { .. } => EventKind::FileChanged,
            ConductorEvent::Checkpoint { .. } => EventKind::Checkpoint,
            ConductorEvent::AgentMessage { .. } => EventKind::AgentMessage,
            ConductorEvent::BranchCreated { .. } => EventKind::BranchCreated,
            ConductorEvent::TokenUsage { .. } => EventKind::TokenUsage,
            ConductorEvent::Error { .. } => EventKind::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_envelope_shape() {
        let ev = ConductorEvent::StateChanged {
            from: WorkflowState::Idle,
            to: WorkflowState::Planning,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "state_changed");
        assert_eq!(json["payload"]["from"], "idle");
        assert_eq!(json["payload"]["to"], "planning");
    }

    #[test]
    fn kind_matches_variant() {
        let ev = ConductorEvent::FileChanged {
            path: "src/main.rs".into(),
            op: FileOp::Modify,
        };
        assert_eq!(ev.kind(), EventKind::FileChanged);
    }
}
