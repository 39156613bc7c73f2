use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use mh_core::config::WorkspaceConfig;

use crate::agent::Agent;
use crate::alias::AliasAgent;
use crate::AgentError;

// ---------------------------------------------------------------------------
// AgentRegistry
// ---------------------------------------------------------------------------

type AgentCtor = Box<dyn Fn() -> Arc<dyn Agent> + Send + Sync>;

/// Lookup table from canonical agent name to constructor closure.
///
/// Registration order matters: auto-detection walks it and picks the first
/// agent whose availability probe succeeds. Aliases from workspace config
/// register as lightweight wrappers delegating to their base.
#[derive(Default)]
pub struct AgentRegistry {
    order: Vec<String>,
    ctors: HashMap<String, AgentCtor>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor under a canonical name. Duplicate names are
    /// rejected.
    pub fn register<F>(&mut self, name: impl Into<String>, ctor: F) -> Result<(), AgentError>
    where
        F: Fn() -> Arc<dyn Agent> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.ctors.contains_key(&name) {
            return Err(AgentError::DuplicateAgent(name));
        }
        debug!(name = %name, "registered agent");
        self.order.push(name.clone());
        self.ctors.insert(name, Box::new(ctor));
        Ok(())
    }

    /// Instantiate an agent by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Agent>, AgentError> {
        self.ctors
            .get(name)
            .map(|ctor| ctor())
            .ok_or_else(|| AgentError::AgentNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ctors.contains_key(name)
    }

    /// Registered names in registration order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// First registered agent whose availability probe succeeds.
    pub fn first_available(&self) -> Option<Arc<dyn Agent>> {
        for name in &self.order {
            if let Ok(agent) = self.get(name) {
                if agent.available().is_ok() {
                    return Some(agent);
                }
            }
        }
        None
    }

    /// Register the aliases declared in workspace config. The config has
    /// already been cycle-checked; an alias whose base resolves to nothing
    /// is an error.
    pub fn register_config_aliases(&mut self, config: &WorkspaceConfig) -> Result<(), AgentError> {
        // Resolve in dependency order: an alias may extend another alias.
        let mut pending: Vec<&String> = config.agents.keys().collect();
        while !pending.is_empty() {
            let before = pending.len();
            pending.retain(|name| {
                let alias = &config.agents[name.as_str()];
                if !self.contains(&alias.extends) {
                    return true; // base not registered yet
                }
                let base_name = alias.extends.clone();
                let env = alias.env.clone();
                let args = alias.args.clone();
                let description = alias.description.clone().unwrap_or_default();
                let alias_name = (*name).clone();

                // The ctor re-resolves the base each time so aliases stay in
                // sync with their base registration.
                let base_ctor: Arc<dyn Agent> = match self.get(&base_name) {
                    Ok(agent) => agent,
                    Err(_) => return true,
                };
                let result = self.register(alias_name.clone(), move || {
                    Arc::new(
                        AliasAgent::new(alias_name.clone(), base_ctor.clone())
                            .with_description(description.clone())
                            .with_env(env.clone())
                            .with_extra_args(args.clone()),
                    )
                });
                result.is_err()
            });
            if pending.len() == before {
                // Remaining aliases extend unknown bases.
                let missing = pending
                    .iter()
                    .map(|n| config.agents[n.as_str()].extends.clone())
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(AgentError::AgentNotFound(missing));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::CommandAgent;

    fn registry_with_claude() -> AgentRegistry {
        let mut reg = AgentRegistry::new();
        reg.register("claude", || Arc::new(CommandAgent::new("claude", "claude")))
            .unwrap();
        reg
    }

    #[test]
    fn register_and_get() {
        let reg = registry_with_claude();
        let agent = reg.get("claude").unwrap();
        assert_eq!(agent.name(), "claude");
        assert_eq!(reg.names(), &["claude".to_string()]);
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut reg = registry_with_claude();
        let err = reg
            .register("claude", || Arc::new(CommandAgent::new("claude", "claude")))
            .unwrap_err();
        assert!(matches!(err, AgentError::DuplicateAgent(_)));
    }

    #[test]
    fn unknown_agent_not_found() {
        let reg = registry_with_claude();
        assert!(matches!(
            reg.get("ghost"),
            Err(AgentError::AgentNotFound(_))
        ));
    }

    #[test]
    fn first_available_respects_order() {
        let mut reg = AgentRegistry::new();
        reg.register("ghost", || {
            Arc::new(CommandAgent::new("ghost", "definitely-not-a-real-binary-1b2c"))
        })
        .unwrap();
        reg.register("shell", || Arc::new(CommandAgent::new("shell", "sh")))
            .unwrap();

        let found = reg.first_available().expect("sh exists");
        assert_eq!(found.name(), "shell");
    }

    #[test]
    fn config_aliases_register_and_chain() {
        let yaml = r#"
agents:
  fast:
    extends: claude
    args: ["--fast"]
  faster:
    extends: fast
    args: ["--skip-checks"]
"#;
        let config: WorkspaceConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        let mut reg = registry_with_claude();
        reg.register_config_aliases(&config).unwrap();

        let faster = reg.get("faster").unwrap();
        let cmd = faster.command(mh_core::types::StepKind::Planning);
        assert_eq!(cmd.args, vec!["--fast", "--skip-checks"]);
    }

    #[test]
    fn alias_with_unknown_base_fails() {
        let yaml = "agents:\n  orphan:\n    extends: nobody\n";
        let config: WorkspaceConfig = serde_yaml::from_str(yaml).unwrap();
        let mut reg = registry_with_claude();
        assert!(matches!(
            reg.register_config_aliases(&config),
            Err(AgentError::AgentNotFound(_))
        ));
    }
}
