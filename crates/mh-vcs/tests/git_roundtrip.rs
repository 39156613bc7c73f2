//! End-to-end checks against a real `git` binary. Each test creates a
//! scratch repository and exercises the write path the conductor relies on:
//! branch + checkpoint + reset, and the worktree lifecycle.

use std::path::Path;
use std::process::Command;

use mh_vcs::{GitVcs, SquashOutcome, VcsError};

/// Skip-guard: the suite is a no-op on machines without `git`.
fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn init_repo(dir: &Path) {
    let run = |args: &[&str]| {
        let out = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .expect("run git");
        assert!(
            out.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&out.stderr)
        );
    };
    run(&["init", "-b", "main"]);
    run(&["config", "user.name", "test"]);
    run(&["config", "user.email", "test@example.com"]);
    std::fs::write(dir.join("README.md"), "# repo\n").unwrap();
    run(&["add", "-A"]);
    run(&["commit", "-m", "initial"]);
}

#[test]
fn checkpoint_commit_and_reset() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    let vcs = GitVcs::new(dir.path());

    vcs.create_branch("feature/FEAT-1--greet", "main").unwrap();
    vcs.checkout("feature/FEAT-1--greet").unwrap();

    let cp1 = vcs.commit("[FEAT-1] register task").unwrap();
    std::fs::write(dir.path().join("greeting.txt"), "hello\n").unwrap();
    let cp2 = vcs.commit("[FEAT-1] implement").unwrap();
    assert_ne!(cp1, cp2);

    // Undo to the first checkpoint removes the file; redo restores it.
    vcs.reset_to(&cp1).unwrap();
    assert!(!dir.path().join("greeting.txt").exists());
    vcs.reset_to(&cp2).unwrap();
    assert!(dir.path().join("greeting.txt").exists());

    let checkpoints = vcs.list_checkpoints("[FEAT-1]").unwrap();
    assert_eq!(checkpoints.len(), 2);
    assert_eq!(checkpoints[0].number, 1);
    assert_eq!(checkpoints[0].id, cp1);
    assert_eq!(checkpoints[1].id, cp2);
}

#[test]
fn duplicate_branch_is_a_conflict() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    let vcs = GitVcs::new(dir.path());

    vcs.create_branch("feature/x", "main").unwrap();
    let err = vcs.create_branch("feature/x", "main").unwrap_err();
    assert!(matches!(err, VcsError::BranchConflict(_)));
}

#[test]
fn worktree_lifecycle() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    let vcs = GitVcs::new(dir.path());

    vcs.create_branch("feature/wt", "main").unwrap();
    let wt_path = dir.path().join(".mehrhof").join("work").join("t_0000wt");
    vcs.add_worktree(&wt_path, "feature/wt").unwrap();
    assert!(wt_path.join("README.md").exists());

    let wt_vcs = GitVcs::new(&wt_path);
    assert!(wt_vcs.is_worktree().unwrap());
    assert_eq!(wt_vcs.current_branch().unwrap(), "feature/wt");
    assert_eq!(
        wt_vcs.main_worktree_path().unwrap().canonicalize().unwrap(),
        dir.path().canonicalize().unwrap()
    );

    vcs.remove_worktree(&wt_path).unwrap();
    assert!(!wt_path.exists());
}

#[test]
fn squash_merge_into_main() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    let vcs = GitVcs::new(dir.path());

    vcs.create_branch("feature/sq", "main").unwrap();
    vcs.checkout("feature/sq").unwrap();
    std::fs::write(dir.path().join("greeting.txt"), "hello\n").unwrap();
    vcs.commit("[SQ-1] implement").unwrap();

    let outcome = vcs
        .squash_merge("feature/sq", "main", "[SQ-1] finish", true, false)
        .unwrap();
    assert!(matches!(outcome, SquashOutcome::Merged(_)));
    assert_eq!(vcs.current_branch().unwrap(), "main");
    assert!(dir.path().join("greeting.txt").exists());
    // Task branch deleted.
    let exists = mh_vcs::RepoReader::branch_exists(dir.path(), "feature/sq").unwrap();
    assert!(!exists);
}
