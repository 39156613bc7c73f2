use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::repo::RepoReader;
use crate::runner::{GitRunner, RealGitRunner};
use crate::VcsError;

pub type Result<T> = std::result::Result<T, VcsError>;

// ---------------------------------------------------------------------------
// CheckpointInfo / SquashOutcome
// ---------------------------------------------------------------------------

/// A checkpoint commit as seen in branch history, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub number: u32,
    pub id: String,
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Outcome of a squash merge into the target branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SquashOutcome {
    /// Squash commit created with this id.
    Merged(String),
    /// The task branch introduced no changes relative to the target.
    NothingToMerge,
}

// ---------------------------------------------------------------------------
// GitVcs
// ---------------------------------------------------------------------------

/// The conductor's view of version control.
///
/// Reads go through libgit2 ([`RepoReader`]); writes shell out to the `git`
/// binary through a mockable [`GitRunner`]. All operations run against a
/// fixed working directory (the task's checkout — main repo or worktree).
pub struct GitVcs {
    workdir: PathBuf,
    runner: Box<dyn GitRunner>,
}

impl GitVcs {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            runner: Box::new(RealGitRunner),
        }
    }

    /// Build with a custom runner (for testing).
    pub fn with_runner(workdir: impl Into<PathBuf>, runner: Box<dyn GitRunner>) -> Self {
        Self {
            workdir: workdir.into(),
            runner,
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// A `GitVcs` over a different working directory, sharing no state.
    pub fn at(&self, workdir: impl Into<PathBuf>) -> Self {
        Self::new(workdir)
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let out = self
            .runner
            .run_git(&self.workdir, args)
            .map_err(VcsError::GitCommand)?;
        if out.success {
            Ok(out.stdout)
        } else {
            Err(VcsError::GitCommand(format!(
                "git {}: {}",
                args.join(" "),
                out.stderr.trim()
            )))
        }
    }

    // -- Reads --

    pub fn current_branch(&self) -> Result<String> {
        RepoReader::current_branch(&self.workdir)
    }

    pub fn root(&self) -> Result<PathBuf> {
        RepoReader::root(&self.workdir)
    }

    pub fn is_worktree(&self) -> Result<bool> {
        RepoReader::is_worktree(&self.workdir)
    }

    pub fn main_worktree_path(&self) -> Result<PathBuf> {
        RepoReader::main_worktree_path(&self.workdir)
    }

    pub fn head_id(&self) -> Result<String> {
        RepoReader::head_id(&self.workdir)
    }

    pub fn is_dirty(&self) -> Result<bool> {
        RepoReader::is_dirty(&self.workdir)
    }

    /// Checkpoint commits reachable first-parent from HEAD whose summary
    /// starts with `prefix`, numbered from the oldest.
    pub fn list_checkpoints(&self, prefix: &str) -> Result<Vec<CheckpointInfo>> {
        let repo = git2::Repository::discover(&self.workdir)?;
        let mut walk = repo.revwalk()?;
        walk.push_head()?;
        walk.simplify_first_parent()?;

        let mut found = Vec::new();
        for oid in walk {
            let oid = oid?;
            let commit = repo.find_commit(oid)?;
            let summary = commit.summary().unwrap_or("");
            if summary.starts_with(prefix) {
                let when = chrono::DateTime::from_timestamp(commit.time().seconds(), 0)
                    .unwrap_or_else(chrono::Utc::now);
                found.push((oid.to_string(), summary.to_string(), when));
            }
        }
        // Revwalk yields newest first; number from the oldest.
        found.reverse();
        Ok(found
            .into_iter()
            .enumerate()
            .map(|(i, (id, message, timestamp))| CheckpointInfo {
                number: (i + 1) as u32,
                id,
                message,
                timestamp,
            })
            .collect())
    }

    // -- Writes --

    /// Create `name` off `base`. Fails with [`VcsError::BranchConflict`]
    /// when the branch already exists.
    pub fn create_branch(&self, name: &str, base: &str) -> Result<()> {
        if RepoReader::branch_exists(&self.workdir, name)? {
            return Err(VcsError::BranchConflict(name.to_string()));
        }
        info!(branch = %name, base = %base, "creating branch");
        self.run(&["branch", name, base])?;
        Ok(())
    }

    pub fn checkout(&self, name: &str) -> Result<()> {
        self.run(&["checkout", name])?;
        Ok(())
    }

    pub fn delete_branch(&self, name: &str) -> Result<()> {
        info!(branch = %name, "deleting branch");
        self.run(&["branch", "-D", name])?;
        Ok(())
    }

    /// Add a linked worktree at `path` checked out to `branch`.
    pub fn add_worktree(&self, path: &Path, branch: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let path_str = path.to_str().ok_or_else(|| {
            VcsError::GitCommand(format!("non-utf8 worktree path: {}", path.display()))
        })?;
        info!(path = %path.display(), branch = %branch, "adding worktree");
        self.run(&["worktree", "add", path_str, branch])?;
        Ok(())
    }

    /// Remove the linked worktree at `path`. A path that is already gone is
    /// a [`VcsError::WorktreeMissing`] — the adapter never silently
    /// recreates or ignores a vanished worktree.
    pub fn remove_worktree(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(VcsError::WorktreeMissing(path.display().to_string()));
        }
        let path_str = path.to_str().ok_or_else(|| {
            VcsError::GitCommand(format!("non-utf8 worktree path: {}", path.display()))
        })?;
        info!(path = %path.display(), "removing worktree");
        self.run(&["worktree", "remove", "--force", path_str])?;
        Ok(())
    }

    /// Verify a worktree path recorded in a task is still present.
    pub fn require_worktree(&self, path: &Path) -> Result<()> {
        if path.is_dir() {
            Ok(())
        } else {
            Err(VcsError::WorktreeMissing(path.display().to_string()))
        }
    }

    /// Stage everything and record a checkpoint commit. Returns the commit
    /// id. The commit is created even when the tree is unchanged so every
    /// step boundary has a checkpoint to undo to.
    pub fn commit(&self, message: &str) -> Result<String> {
        self.run(&["add", "-A"])?;
        self.run(&["commit", "--allow-empty", "-m", message])?;
        let id = self.head_id()?;
        debug!(id = %id, message = %message, "checkpoint commit");
        Ok(id)
    }

    /// Hard-reset the working tree to a checkpoint commit.
    pub fn reset_to(&self, id: &str) -> Result<()> {
        info!(id = %id, "resetting working tree");
        self.run(&["reset", "--hard", id])?;
        Ok(())
    }

    /// Squash-merge `branch` into `target`: check out the target, squash,
    /// commit with `message`, optionally delete the task branch and push.
    pub fn squash_merge(
        &self,
        branch: &str,
        target: &str,
        message: &str,
        delete_branch: bool,
        push: bool,
    ) -> Result<SquashOutcome> {
        self.checkout(target)?;
        self.run(&["merge", "--squash", branch])?;

        let outcome = match self.run(&["commit", "-m", message]) {
            Ok(_) => SquashOutcome::Merged(self.head_id()?),
            Err(VcsError::GitCommand(msg)) if msg.contains("nothing to commit") => {
                info!(branch = %branch, "nothing to merge");
                SquashOutcome::NothingToMerge
            }
            Err(e) => return Err(e),
        };

        if delete_branch {
            self.delete_branch(branch)?;
        }
        if push {
            self.push(target)?;
        }
        Ok(outcome)
    }

    pub fn push(&self, branch: &str) -> Result<()> {
        info!(branch = %branch, "pushing branch");
        self.run(&["push", "-u", "origin", branch])?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::test_support::RecordingRunner;
    use crate::runner::GitOutput;
    use std::sync::Arc;

    struct SharedRunner(Arc<RecordingRunner>);

    impl GitRunner for SharedRunner {
        fn run_git(&self, dir: &Path, args: &[&str]) -> std::result::Result<GitOutput, String> {
            self.0.run_git(dir, args)
        }
    }

    fn vcs_with(recorder: Arc<RecordingRunner>) -> GitVcs {
        GitVcs::with_runner("/tmp/repo", Box::new(SharedRunner(recorder)))
    }

    #[test]
    fn delete_branch_issues_force_delete() {
        let rec = Arc::new(RecordingRunner::new());
        let vcs = vcs_with(rec.clone());
        vcs.delete_branch("feature/x").unwrap();
        assert_eq!(rec.recorded(), vec![vec!["branch", "-D", "feature/x"]]);
    }

    #[test]
    fn reset_issues_hard_reset() {
        let rec = Arc::new(RecordingRunner::new());
        let vcs = vcs_with(rec.clone());
        vcs.reset_to("abc123").unwrap();
        assert_eq!(rec.recorded(), vec![vec!["reset", "--hard", "abc123"]]);
    }

    #[test]
    fn push_sets_upstream() {
        let rec = Arc::new(RecordingRunner::new());
        let vcs = vcs_with(rec.clone());
        vcs.push("feature/x").unwrap();
        assert_eq!(
            rec.recorded(),
            vec![vec!["push", "-u", "origin", "feature/x"]]
        );
    }

    #[test]
    fn failed_command_surfaces_stderr() {
        let rec = Arc::new(
            RecordingRunner::new()
                .respond_with(vec![GitOutput::err("fatal: branch not found")]),
        );
        let vcs = vcs_with(rec);
        let err = vcs.delete_branch("ghost").unwrap_err();
        match err {
            VcsError::GitCommand(msg) => assert!(msg.contains("branch not found")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn remove_missing_worktree_is_an_error() {
        let rec = Arc::new(RecordingRunner::new());
        let vcs = vcs_with(rec.clone());
        let err = vcs
            .remove_worktree(Path::new("/definitely/not/here"))
            .unwrap_err();
        assert!(matches!(err, VcsError::WorktreeMissing(_)));
        // No git command was issued for the vanished path.
        assert!(rec.recorded().is_empty());
    }

    #[test]
    fn require_worktree_checks_presence() {
        let dir = tempfile::tempdir().unwrap();
        let rec = Arc::new(RecordingRunner::new());
        let vcs = vcs_with(rec);
        vcs.require_worktree(dir.path()).unwrap();
        assert!(matches!(
            vcs.require_worktree(Path::new("/gone")),
            Err(VcsError::WorktreeMissing(_))
        ));
    }

    #[test]
    fn squash_merge_nothing_to_merge() {
        let rec = Arc::new(RecordingRunner::new().respond_with(vec![
            GitOutput::ok(""), // checkout
            GitOutput::ok(""), // merge --squash
            GitOutput::err("nothing to commit, working tree clean"),
        ]));
        let vcs = vcs_with(rec.clone());
        let outcome = vcs
            .squash_merge("feature/x", "main", "[K-1] finish", false, false)
            .unwrap();
        assert_eq!(outcome, SquashOutcome::NothingToMerge);
        let calls = rec.recorded();
        assert_eq!(calls[0], vec!["checkout", "main"]);
        assert_eq!(calls[1], vec!["merge", "--squash", "feature/x"]);
    }
}
