//! Task providers: adapters that turn an external reference into a work
//! unit. `file:` and `dir:` ship in-tree; issue-tracker providers register
//! through the same capability-typed interface.

pub mod dir;
pub mod file;
pub mod github;
pub mod provider;
pub mod registry;

pub use dir::DirProvider;
pub use file::FileProvider;
pub use github::GithubProvider;
pub use provider::{Provider, ProviderCapabilities, PullRequestSpec};
pub use registry::{split_reference, ProviderRegistry};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("unknown reference scheme: `{0}`")]
    UnknownScheme(String),
    #[error("duplicate provider scheme: `{0}`")]
    DuplicateProvider(String),
    #[error("provider fetch failed: {0}")]
    Fetch(String),
    #[error("{0}")]
    Unsupported(String),
}
