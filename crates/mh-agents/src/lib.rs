//! Agent adapters and the runner that drives them.
//!
//! An agent is an external AI coding tool run as a child process speaking a
//! JSON-lines event protocol on stdout. This crate holds the adapter trait,
//! the alias/registry machinery, agent-selection priority, the streaming
//! runner (with de-duplication, dry-run filtering, auto-answers, and
//! graceful cancellation), and the working-tree watcher.

pub mod agent;
pub mod alias;
pub mod dedup;
pub mod events;
pub mod registry;
pub mod runner;
pub mod selection;
pub mod watcher;

pub use agent::{Agent, AgentCommand, AgentMetadata, CommandAgent};
pub use alias::AliasAgent;
pub use events::AgentEvent;
pub use registry::AgentRegistry;
pub use runner::{AgentQuestion, AgentRun, AgentRunner, InvocationSpec, RunOutcome};
pub use selection::{resolve_agent, AgentSelection};
pub use watcher::WorkTreeWatcher;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent not found: `{0}`")]
    AgentNotFound(String),
    #[error("duplicate agent name: `{0}`")]
    DuplicateAgent(String),
    #[error("agent unavailable: {0}")]
    Unavailable(String),
    #[error("no registered agent is available")]
    NoAgentAvailable,
    #[error("failed to spawn agent: {0}")]
    Spawn(String),
    #[error("agent runner error: {0}")]
    Internal(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
