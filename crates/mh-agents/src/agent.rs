use std::collections::BTreeMap;
use std::path::Path;

use mh_core::types::StepKind;

use crate::AgentError;

// ---------------------------------------------------------------------------
// AgentCommand / AgentMetadata
// ---------------------------------------------------------------------------

/// The command line an agent invocation resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct AgentMetadata {
    pub description: String,
    /// Whether the adapter emits incremental events (vs one final blob).
    pub streaming: bool,
}

// ---------------------------------------------------------------------------
// Agent trait
// ---------------------------------------------------------------------------

/// An adapter that runs an external AI coding tool as a child process.
///
/// Implementations are cheap, stateless descriptors: the heavy lifting
/// (spawning, streaming, cancellation) lives in the
/// [`runner`](crate::runner). `available` is a probe used both for
/// diagnostics and for auto-detection when no agent is configured.
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn metadata(&self) -> AgentMetadata {
        AgentMetadata::default()
    }

    /// Probe whether this agent can run on this machine.
    fn available(&self) -> Result<(), AgentError>;

    /// The command to execute for a given step.
    fn command(&self, step: StepKind) -> AgentCommand;
}

// ---------------------------------------------------------------------------
// CommandAgent
// ---------------------------------------------------------------------------

/// A generic agent backed by an executable on `PATH`.
///
/// Carries base arguments for every step plus optional per-step extras, the
/// way workspace config declares agents.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    name: String,
    program: String,
    description: String,
    base_args: Vec<String>,
    env: BTreeMap<String, String>,
    step_args: BTreeMap<String, Vec<String>>,
}

impl CommandAgent {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            description: String::new(),
            base_args: Vec::new(),
            env: BTreeMap::new(),
            step_args: BTreeMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.base_args = args;
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_step_args(mut self, step: StepKind, args: Vec<String>) -> Self {
        self.step_args.insert(step.as_str().to_string(), args);
        self
    }
}

impl Agent for CommandAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn metadata(&self) -> AgentMetadata {
        AgentMetadata {
            description: self.description.clone(),
            streaming: true,
        }
    }

    fn available(&self) -> Result<(), AgentError> {
        if find_on_path(&self.program).is_some() {
            Ok(())
        } else {
            Err(AgentError::Unavailable(format!(
                "`{}` not found on PATH",
                self.program
            )))
        }
    }

    fn command(&self, step: StepKind) -> AgentCommand {
        let mut args = self.base_args.clone();
        if let Some(extra) = self.step_args.get(step.as_str()) {
            args.extend(extra.iter().cloned());
        }
        AgentCommand {
            program: self.program.clone(),
            args,
            env: self.env.clone(),
        }
    }
}

/// Locate an executable on `PATH`.
pub fn find_on_path(program: &str) -> Option<std::path::PathBuf> {
    if program.contains('/') {
        let p = Path::new(program);
        return p.is_file().then(|| p.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_merges_step_args() {
        let agent = CommandAgent::new("claude", "claude")
            .with_args(vec!["--print".into()])
            .with_step_args(StepKind::Planning, vec!["--mode".into(), "plan".into()]);

        let plan = agent.command(StepKind::Planning);
        assert_eq!(plan.args, vec!["--print", "--mode", "plan"]);

        let implement = agent.command(StepKind::Implementing);
        assert_eq!(implement.args, vec!["--print"]);
    }

    #[test]
    fn availability_probe_finds_sh() {
        // `sh` exists on every unix box this suite runs on.
        let agent = CommandAgent::new("shell", "sh");
        assert!(agent.available().is_ok());
    }

    #[test]
    fn availability_probe_fails_for_nonsense() {
        let agent = CommandAgent::new("ghost", "definitely-not-a-real-binary-9f8e7d");
        assert!(matches!(
            agent.available(),
            Err(AgentError::Unavailable(_))
        ));
    }

    #[test]
    fn find_on_path_with_explicit_path() {
        assert!(find_on_path("/bin/sh").is_some() || find_on_path("/usr/bin/sh").is_some());
        assert!(find_on_path("/no/such/binary").is_none());
    }
}
