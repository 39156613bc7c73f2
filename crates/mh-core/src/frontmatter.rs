use std::collections::BTreeMap;

use serde::Deserialize;

use crate::types::{Priority, WorkUnitAgent, WorkUnitStepAgent};

// ---------------------------------------------------------------------------
// Frontmatter
// ---------------------------------------------------------------------------

/// YAML frontmatter of a markdown task file. Unknown keys are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Frontmatter {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub labels: Vec<String>,
    /// External key override, e.g. `FEAT-123`.
    #[serde(default)]
    pub key: Option<String>,
    /// Task type override, e.g. `feature`.
    #[serde(default, rename = "type")]
    pub task_type: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub agent_env: BTreeMap<String, String>,
    #[serde(default)]
    pub agent_args: Vec<String>,
    #[serde(default)]
    pub agent_steps: BTreeMap<String, FrontmatterStepAgent>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FrontmatterStepAgent {
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Frontmatter {
    /// Collapse frontmatter agent keys into the work-unit agent config.
    pub fn agent_config(&self) -> WorkUnitAgent {
        WorkUnitAgent {
            name: self.agent.clone(),
            env: self.agent_env.clone(),
            args: self.agent_args.clone(),
            steps: self
                .agent_steps
                .iter()
                .map(|(step, sa)| {
                    (
                        step.clone(),
                        WorkUnitStepAgent {
                            agent: sa.agent.clone(),
                            env: sa.env.clone(),
                            args: sa.args.clone(),
                        },
                    )
                })
                .collect(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrontmatterError {
    #[error("unterminated frontmatter block (missing closing `---`)")]
    Unterminated,
    #[error("invalid frontmatter yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Split a markdown document into its optional `---`-delimited YAML
/// frontmatter and the remaining body.
///
/// A document without a leading `---` line has no frontmatter; the whole
/// input is the body.
pub fn parse(input: &str) -> Result<(Frontmatter, &str), FrontmatterError> {
    let rest = match input.strip_prefix("---") {
        Some(rest) if rest.starts_with('\n') || rest.starts_with("\r\n") => rest,
        _ => return Ok((Frontmatter::default(), input)),
    };

    // Find the closing delimiter on its own line.
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" && offset > 0 {
            let yaml = &rest[..offset];
            let body = &rest[offset + line.len()..];
            let fm: Frontmatter = serde_yaml::from_str(yaml)?;
            return Ok((fm, body));
        }
        offset += line.len();
    }
    Err(FrontmatterError::Unterminated)
}

/// The first `# ` heading of a markdown body, used as a title fallback.
pub fn first_heading(body: &str) -> Option<&str> {
    body.lines()
        .map(str::trim_end)
        .find_map(|l| l.strip_prefix("# "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_frontmatter_returns_whole_body() {
        let (fm, body) = parse("# Just a title\n\nbody\n").unwrap();
        assert!(fm.title.is_none());
        assert_eq!(body, "# Just a title\n\nbody\n");
    }

    #[test]
    fn parses_scalar_keys() {
        let doc = "---\nkey: FEAT-1\ntype: feature\npriority: high\n---\n# Add greeting\n";
        let (fm, body) = parse(doc).unwrap();
        assert_eq!(fm.key.as_deref(), Some("FEAT-1"));
        assert_eq!(fm.task_type.as_deref(), Some("feature"));
        assert_eq!(fm.priority, Some(Priority::High));
        assert_eq!(body, "# Add greeting\n");
    }

    #[test]
    fn parses_agent_steps() {
        let doc = "---\n\
            agent: claude\n\
            agent_env:\n  RUST_LOG: debug\n\
            agent_args: [\"--fast\"]\n\
            agent_steps:\n  planning:\n    agent: codex\n    args: [\"-p\"]\n\
            ---\nbody";
        let (fm, _) = parse(doc).unwrap();
        let cfg = fm.agent_config();
        assert_eq!(cfg.name.as_deref(), Some("claude"));
        assert_eq!(cfg.env["RUST_LOG"], "debug");
        assert_eq!(cfg.args, vec!["--fast"]);
        assert_eq!(cfg.steps["planning"].agent.as_deref(), Some("codex"));
        assert_eq!(cfg.steps["planning"].args, vec!["-p"]);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let doc = "---\ntitle: T\nfrobnicate: yes\n---\nbody";
        let (fm, _) = parse(doc).unwrap();
        assert_eq!(fm.title.as_deref(), Some("T"));
    }

    #[test]
    fn urgent_priority_alias() {
        let doc = "---\npriority: urgent\n---\nbody";
        let (fm, _) = parse(doc).unwrap();
        assert_eq!(fm.priority, Some(Priority::Critical));
    }

    #[test]
    fn unterminated_block_is_an_error() {
        let doc = "---\ntitle: T\nbody without closing";
        assert!(matches!(parse(doc), Err(FrontmatterError::Unterminated)));
    }

    #[test]
    fn first_heading_finds_title() {
        assert_eq!(first_heading("\n\n# Add greeting\ntext"), Some("Add greeting"));
        assert_eq!(first_heading("## minor\ntext"), None);
        assert_eq!(first_heading(""), None);
    }
}
