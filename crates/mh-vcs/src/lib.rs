//! Version-control adapter: branches, worktrees, checkpoints, squash merge.
//!
//! Read-only queries use libgit2 in-process; mutations shell out to the
//! `git` binary through a mockable runner. Checkpoint commits are the unit
//! of undo/redo for a task.

pub mod repo;
pub mod runner;
pub mod vcs;

pub use repo::RepoReader;
pub use runner::{GitOutput, GitRunner, RealGitRunner};
pub use vcs::{CheckpointInfo, GitVcs, SquashOutcome};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    #[error("git command failed: {0}")]
    GitCommand(String),
    #[error("branch already exists: `{0}`")]
    BranchConflict(String),
    #[error("worktree missing: {0}")]
    WorktreeMissing(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<git2::Error> for VcsError {
    fn from(e: git2::Error) -> Self {
        VcsError::GitCommand(e.message().to_string())
    }
}
