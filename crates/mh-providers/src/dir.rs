use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use mh_core::types::WorkUnit;

use crate::file::work_unit_from_markdown;
use crate::provider::{Provider, ProviderCapabilities};
use crate::ProviderError;

// ---------------------------------------------------------------------------
// DirProvider
// ---------------------------------------------------------------------------

/// Treats a directory of markdown files as a task queue: lists `*.md`
/// non-recursively, sorted by name, and picks the first.
pub struct DirProvider;

impl DirProvider {
    /// The markdown files in `dir`, sorted by file name.
    pub async fn list(&self, dir: &Path) -> Result<Vec<PathBuf>, ProviderError> {
        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(dir).await.map_err(|e| {
            ProviderError::Fetch(format!("cannot read task directory `{}`: {e}", dir.display()))
        })?;
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| ProviderError::Fetch(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("md") && path.is_file() {
                entries.push(path);
            }
        }
        entries.sort();
        Ok(entries)
    }
}

#[async_trait]
impl Provider for DirProvider {
    fn name(&self) -> &str {
        "dir"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            read: true,
            list: true,
            ..Default::default()
        }
    }

    async fn fetch(&self, reference: &str) -> Result<WorkUnit, ProviderError> {
        let dir = Path::new(reference);
        let files = self.list(dir).await?;
        let first = files.first().ok_or_else(|| {
            ProviderError::Fetch(format!("no task files in `{}`", dir.display()))
        })?;
        debug!(file = %first.display(), "picked first task file from directory");
        let content = tokio::fs::read_to_string(first)
            .await
            .map_err(|e| ProviderError::Fetch(format!("{}: {e}", first.display())))?;
        work_unit_from_markdown(first, &content)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
