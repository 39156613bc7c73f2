use mh_agents::AgentError;
use mh_core::store::StoreError;
use mh_providers::ProviderError;
use mh_vcs::VcsError;

use crate::state::InvalidTransition;

// ---------------------------------------------------------------------------
// ConductorError
// ---------------------------------------------------------------------------

/// The conductor's error taxonomy. Every variant maps onto a process exit
/// code: invalid input and illegal transitions exit 2, cancellation exits
/// 130, everything else exits 1.
#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    #[error("{0}")]
    UserInput(String),

    #[error("{source}{}", suggestion_suffix(.suggestion))]
    InvalidTransition {
        #[source]
        source: InvalidTransition,
        suggestion: Option<String>,
    },

    #[error("{0}")]
    NotFound(String),

    #[error("a task is already active: {0}")]
    TaskAlreadyActive(String),

    #[error("another operation is in progress")]
    OperationInProgress,

    #[error("provider: {0}")]
    Provider(#[from] ProviderError),

    #[error("agent: {0}")]
    Agent(#[from] AgentError),

    #[error("vcs: {0}")]
    Vcs(#[from] VcsError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("quality gate failed")]
    QualityFailed { output: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("fatal: {0}")]
    Fatal(String),
}

fn suggestion_suffix(suggestion: &Option<String>) -> String {
    match suggestion {
        Some(s) => format!(" ({s})"),
        None => String::new(),
    }
}

impl ConductorError {
    pub fn invalid_transition(source: InvalidTransition, suggestion: impl Into<String>) -> Self {
        Self::InvalidTransition {
            source,
            suggestion: Some(suggestion.into()),
        }
    }

    /// The process exit code this error maps to.
    pub fn exit_code(&self) -> i32 {
        match self {
            ConductorError::UserInput(_) | ConductorError::InvalidTransition { .. } => 2,
            ConductorError::Provider(ProviderError::UnknownScheme(_)) => 2,
            ConductorError::Cancelled => 130,
            _ => 1,
        }
    }
}

impl From<InvalidTransition> for ConductorError {
    fn from(source: InvalidTransition) -> Self {
        Self::InvalidTransition {
            source,
            suggestion: None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ConductorError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
