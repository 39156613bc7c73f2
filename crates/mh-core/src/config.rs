use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("agent alias cycle: {0}")]
    AliasCycle(String),
}

// ---------------------------------------------------------------------------
// WorkspaceConfig
// ---------------------------------------------------------------------------

/// Workspace configuration loaded from `.mehrhof/config.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    /// User-defined agent aliases.
    #[serde(default)]
    pub agents: BTreeMap<String, AgentAlias>,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
    /// When true, `finish` removes the task's work directory on success.
    #[serde(default)]
    pub cleanup_on_finish: bool,
}

impl WorkspaceConfig {
    /// Load from a `config.yaml` path, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: WorkspaceConfig =
            serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Reject alias graphs that loop (`a extends b`, `b extends a`).
    pub fn validate(&self) -> Result<(), ConfigError> {
        for start in self.agents.keys() {
            let mut seen = vec![start.as_str()];
            let mut current = start.as_str();
            while let Some(alias) = self.agents.get(current) {
                let base = alias.extends.as_str();
                if seen.contains(&base) {
                    return Err(ConfigError::AliasCycle(format!(
                        "{} -> {}",
                        seen.join(" -> "),
                        base
                    )));
                }
                seen.push(base);
                current = base;
            }
        }
        Ok(())
    }

    /// The configured agent name for a step, if any.
    pub fn step_agent(&self, step: &str) -> Option<&str> {
        self.agent
            .steps
            .get(step)
            .and_then(|s| s.name.as_deref())
    }
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Default agent name for every step.
    #[serde(default)]
    pub default: Option<String>,
    /// Per-step overrides keyed by step name (`planning`, `implementing`, ...).
    #[serde(default)]
    pub steps: BTreeMap<String, StepAgentConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepAgentConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub args: Vec<String>,
}

/// A user-defined alias delegating to a base agent with overridden
/// environment and arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentAlias {
    pub extends: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    /// Provider used when a reference carries no scheme prefix.
    #[serde(default)]
    pub default: Option<String>,
    /// Provider-specific configuration blocks, keyed by provider name.
    #[serde(flatten)]
    pub settings: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_commit_prefix")]
    pub commit_prefix: String,
    #[serde(default = "default_branch_pattern")]
    pub branch_pattern: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            commit_prefix: default_commit_prefix(),
            branch_pattern: default_branch_pattern(),
        }
    }
}

fn default_commit_prefix() -> String {
    "[{key}]".into()
}
fn default_branch_pattern() -> String {
    "{type}/{key}--{slug}".into()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginsConfig {
    #[serde(default)]
    pub enabled: Vec<String>,
}

// ---------------------------------------------------------------------------
// Template rendering
// ---------------------------------------------------------------------------

/// Substitute `{key}`, `{type}` and `{slug}` in a `commit_prefix` or
/// `branch_pattern` template. Missing values render as empty strings and
/// leftover separators collapse.
pub fn render_template(template: &str, key: &str, task_type: &str, slug: &str) -> String {
    let rendered = template
        .replace("{key}", key)
        .replace("{type}", task_type)
        .replace("{slug}", slug);

    // A missing `{type}` must not leave a branch starting with `/`, and a
    // missing `{slug}` must not leave a trailing `--`.
    let rendered = rendered.trim_start_matches('/');
    rendered.trim_end_matches('-').to_string()
}

// ---------------------------------------------------------------------------
// Settings (per-user state)
// ---------------------------------------------------------------------------

/// Per-user state (`.mehrhof/settings.json`), kept out of version control
/// by the workspace gitignore.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserSettings {
    #[serde(default)]
    pub last_update_check: Option<chrono::DateTime<chrono::Utc>>,
}

impl UserSettings {
    pub fn load(path: impl AsRef<Path>) -> Self {
        std::fs::read_to_string(path.as_ref())
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }
        let json =
            serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| ConfigError::Io(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
