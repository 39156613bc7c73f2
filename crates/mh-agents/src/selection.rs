use mh_core::config::WorkspaceConfig;
use mh_core::types::{AgentChoiceSource, StepKind, TaskAgent, WorkUnitAgent};

use crate::registry::AgentRegistry;
use crate::AgentError;

// ---------------------------------------------------------------------------
// Agent selection
// ---------------------------------------------------------------------------

/// Every source that may name an agent for a step.
#[derive(Debug, Clone, Copy, Default)]
pub struct AgentSelection<'a> {
    /// CLI per-step override for this step.
    pub cli_step: Option<&'a str>,
    /// CLI global override.
    pub cli_global: Option<&'a str>,
    /// Task-source frontmatter agent configuration.
    pub work_unit: Option<&'a WorkUnitAgent>,
    /// Workspace configuration.
    pub config: Option<&'a WorkspaceConfig>,
}

/// Resolve which agent runs a step. The highest-priority source that names
/// an agent wins:
///
/// 1. CLI per-step override
/// 2. CLI global override
/// 3. Frontmatter per-step override
/// 4. Frontmatter default
/// 5. Workspace config per-step
/// 6. Workspace config default
/// 7. First registered agent whose availability probe succeeds
pub fn resolve_agent(
    step: StepKind,
    selection: &AgentSelection<'_>,
    registry: &AgentRegistry,
) -> Result<TaskAgent, AgentError> {
    let step_name = step.as_str();

    let named = [
        (selection.cli_step, AgentChoiceSource::CliStep),
        (selection.cli_global, AgentChoiceSource::CliGlobal),
        (
            selection
                .work_unit
                .and_then(|wu| wu.steps.get(step_name))
                .and_then(|s| s.agent.as_deref()),
            AgentChoiceSource::FrontmatterStep,
        ),
        (
            selection.work_unit.and_then(|wu| wu.name.as_deref()),
            AgentChoiceSource::FrontmatterDefault,
        ),
        (
            selection.config.and_then(|c| c.step_agent(step_name)),
            AgentChoiceSource::ConfigStep,
        ),
        (
            selection.config.and_then(|c| c.agent.default.as_deref()),
            AgentChoiceSource::ConfigDefault,
        ),
    ];

    for (name, source) in named {
        if let Some(name) = name {
            if !registry.contains(name) {
                return Err(AgentError::AgentNotFound(name.to_string()));
            }
            return Ok(TaskAgent {
                name: name.to_string(),
                source,
            });
        }
    }

    registry
        .first_available()
        .map(|agent| TaskAgent {
            name: agent.name().to_string(),
            source: AgentChoiceSource::AutoDetected,
        })
        .ok_or(AgentError::NoAgentAvailable)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
