use std::path::Path;

use async_trait::async_trait;

use mh_core::frontmatter;
use mh_core::types::{Priority, WorkUnit};

use crate::provider::{Provider, ProviderCapabilities};
use crate::ProviderError;

// ---------------------------------------------------------------------------
// FileProvider
// ---------------------------------------------------------------------------

/// Reads one markdown task file, honoring its YAML frontmatter.
pub struct FileProvider;

#[async_trait]
impl Provider for FileProvider {
    fn name(&self) -> &str {
        "file"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::read_only()
    }

    async fn fetch(&self, reference: &str) -> Result<WorkUnit, ProviderError> {
        let path = Path::new(reference);
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            ProviderError::Fetch(format!("cannot read task file `{reference}`: {e}"))
        })?;
        work_unit_from_markdown(path, &content)
    }
}

/// Build a work unit from a markdown document. The title falls back from
/// frontmatter to the first `# ` heading to the file stem.
pub(crate) fn work_unit_from_markdown(
    path: &Path,
    content: &str,
) -> Result<WorkUnit, ProviderError> {
    let (fm, body) = frontmatter::parse(content)
        .map_err(|e| ProviderError::Fetch(format!("{}: {e}", path.display())))?;

    let title = fm
        .title
        .clone()
        .or_else(|| frontmatter::first_heading(body).map(String::from))
        .or_else(|| {
            path.file_stem()
                .map(|s| s.to_string_lossy().replace(['-', '_'], " "))
        })
        .unwrap_or_else(|| "untitled task".to_string());

    let body_text = if body.trim().is_empty() {
        fm.description.clone().unwrap_or_default()
    } else {
        body.to_string()
    };

    Ok(WorkUnit {
        source_id: path.display().to_string(),
        title,
        body: body_text,
        labels: fm.labels.clone(),
        priority: fm.priority.unwrap_or(Priority::Normal),
        external_key: fm.key.clone(),
        task_type: fm.task_type.clone(),
        slug: fm.slug.clone(),
        agent: fm.agent_config(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
