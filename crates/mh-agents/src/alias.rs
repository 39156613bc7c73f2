use std::collections::BTreeMap;
use std::sync::Arc;

use mh_core::types::StepKind;

use crate::agent::{Agent, AgentCommand, AgentMetadata};
use crate::AgentError;

// ---------------------------------------------------------------------------
// AliasAgent
// ---------------------------------------------------------------------------

/// An agent alias: delegates to a base agent with overridden environment
/// and extra arguments. Composition, not inheritance — the alias graph is
/// validated for cycles at config load time, so chains here are finite.
pub struct AliasAgent {
    name: String,
    description: String,
    base: Arc<dyn Agent>,
    env: BTreeMap<String, String>,
    extra_args: Vec<String>,
}

impl AliasAgent {
    pub fn new(name: impl Into<String>, base: Arc<dyn Agent>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            base,
            env: BTreeMap::new(),
            extra_args: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }
}

impl Agent for AliasAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn metadata(&self) -> AgentMetadata {
        let mut meta = self.base.metadata();
        if !self.description.is_empty() {
            meta.description = self.description.clone();
        }
        meta
    }

    fn available(&self) -> Result<(), AgentError> {
        self.base.available()
    }

    fn command(&self, step: StepKind) -> AgentCommand {
        let mut cmd = self.base.command(step);
        cmd.args.extend(self.extra_args.iter().cloned());
        // Alias env wins over the base's on key collision.
        for (k, v) in &self.env {
            cmd.env.insert(k.clone(), v.clone());
        }
        cmd
    }
}
