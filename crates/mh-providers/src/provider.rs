use async_trait::async_trait;

use mh_core::types::WorkUnit;

use crate::ProviderError;

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// What a provider can do. `Start` needs `read` (and `list` for directory
/// sources); `Finish` in PR mode needs `pr`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderCapabilities {
    pub read: bool,
    pub list: bool,
    pub write: bool,
    pub pr: bool,
}

impl ProviderCapabilities {
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// PullRequestSpec
// ---------------------------------------------------------------------------

/// What `Finish` hands a PR-capable provider.
#[derive(Debug, Clone)]
pub struct PullRequestSpec {
    pub branch: String,
    pub base: String,
    pub title: String,
    pub body: String,
    pub draft: bool,
}

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

/// An adapter that produces a [`WorkUnit`] from an external reference
/// (local file, directory, issue tracker).
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> ProviderCapabilities;

    /// Fetch the work unit behind `reference` (the part after the scheme
    /// prefix).
    async fn fetch(&self, reference: &str) -> Result<WorkUnit, ProviderError>;

    /// Create a pull request for a finished task. Only meaningful when
    /// [`ProviderCapabilities::pr`] is set; the default refuses.
    async fn create_pr(&self, _spec: &PullRequestSpec) -> Result<String, ProviderError> {
        Err(ProviderError::Unsupported(format!(
            "provider `{}` cannot create pull requests",
            self.name()
        )))
    }
}
