use mh_core::types::WorkflowState;

// ---------------------------------------------------------------------------
// WorkflowEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowEvent {
    Plan,
    PlanDone,
    Implement,
    ImplementDone,
    Review,
    ReviewDone,
    Dialogue,
    DialogueDone,
    Checkpoint,
    CheckpointDone,
    Undo,
    UndoDone,
    Redo,
    RedoDone,
    QuestionRaised,
    Answered,
    Finish,
    Fail,
}

impl std::fmt::Display for WorkflowEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            WorkflowEvent::Plan => "plan",
            WorkflowEvent::PlanDone => "plan_done",
            WorkflowEvent::Implement => "implement",
            WorkflowEvent::ImplementDone => "implement_done",
            WorkflowEvent::Review => "review",
            WorkflowEvent::ReviewDone => "review_done",
            WorkflowEvent::Dialogue => "dialogue",
            WorkflowEvent::DialogueDone => "dialogue_done",
            WorkflowEvent::Checkpoint => "checkpoint",
            WorkflowEvent::CheckpointDone => "checkpoint_done",
            WorkflowEvent::Undo => "undo",
            WorkflowEvent::UndoDone => "undo_done",
            WorkflowEvent::Redo => "redo",
            WorkflowEvent::RedoDone => "redo_done",
            WorkflowEvent::QuestionRaised => "question_raised",
            WorkflowEvent::Answered => "answered",
            WorkflowEvent::Finish => "finish",
            WorkflowEvent::Fail => "fail",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
#[error("invalid transition: cannot apply {event} in state {state}")]
pub struct InvalidTransition {
    pub state: WorkflowState,
    pub event: WorkflowEvent,
}

// ---------------------------------------------------------------------------
// Pure transition function
// ---------------------------------------------------------------------------

/// The transition table, minus the `waiting` resume which needs the
/// remembered prior state. `idle` is the hub every step returns to;
/// `done`/`failed` are terminal.
fn next_state(state: WorkflowState, event: WorkflowEvent) -> Option<WorkflowState> {
    use WorkflowEvent as E;
    use WorkflowState as S;
    let next = match (state, event) {
        (S::Idle, E::Plan) => S::Planning,
        (S::Planning, E::PlanDone) => S::Idle,
        (S::Idle, E::Implement) => S::Implementing,
        (S::Implementing, E::ImplementDone) => S::Idle,
        (S::Idle, E::Review) => S::Reviewing,
        (S::Reviewing, E::ReviewDone) => S::Idle,
        (S::Idle, E::Dialogue) => S::Dialogue,
        (S::Dialogue, E::DialogueDone) => S::Idle,
        (S::Idle, E::Checkpoint) => S::Checkpointing,
        (S::Checkpointing, E::CheckpointDone) => S::Idle,
        (S::Idle, E::Undo) => S::Reverting,
        (S::Reverting, E::UndoDone) => S::Idle,
        (S::Idle, E::Redo) => S::Restoring,
        (S::Restoring, E::RedoDone) => S::Idle,
        (S::Idle, E::Finish) => S::Done,
        (S::Planning | S::Implementing | S::Reviewing | S::Dialogue, E::QuestionRaised) => {
            S::Waiting
        }
        (s, E::Fail) if !s.is_terminal() => S::Failed,
        _ => return None,
    };
    Some(next)
}

// ---------------------------------------------------------------------------
// WorkflowMachine
// ---------------------------------------------------------------------------

/// Holds the current workflow state and validates every event against the
/// closed transition table. `waiting` remembers the interrupted state so an
/// answer resumes exactly where the question was raised.
#[derive(Debug, Clone)]
pub struct WorkflowMachine {
    current: WorkflowState,
    waiting_from: Option<WorkflowState>,
}

impl WorkflowMachine {
    /// A machine for a freshly started task.
    pub fn new() -> Self {
        Self::at(WorkflowState::Idle)
    }

    /// Resume a machine at a persisted state.
    pub fn at(state: WorkflowState) -> Self {
        Self {
            current: state,
            waiting_from: None,
        }
    }

    /// Resume a machine in `waiting`, remembering the interrupted state.
    pub fn waiting_from(prior: WorkflowState) -> Self {
        Self {
            current: WorkflowState::Waiting,
            waiting_from: Some(prior),
        }
    }

    pub fn state(&self) -> WorkflowState {
        self.current
    }

    /// Apply an event, returning the new state.
    pub fn transition(&mut self, event: WorkflowEvent) -> Result<WorkflowState, InvalidTransition> {
        let next = match (self.current, event) {
            (WorkflowState::Waiting, WorkflowEvent::Answered) => {
                self.waiting_from.take().unwrap_or(WorkflowState::Idle)
            }
            (state, event) => {
                let next = next_state(state, event).ok_or(InvalidTransition { state, event })?;
                if next == WorkflowState::Waiting {
                    self.waiting_from = Some(state);
                }
                next
            }
        };
        tracing::debug!(from = %self.current, event = %event, to = %next, "workflow transition");
        self.current = next;
        Ok(next)
    }

    /// Returns `true` if `event` is valid in the current state.
    pub fn can_transition(&self, event: WorkflowEvent) -> bool {
        matches!(
            (self.current, event),
            (WorkflowState::Waiting, WorkflowEvent::Answered)
        ) || next_state(self.current, event).is_some()
    }
}

impl Default for WorkflowMachine {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
