use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

use mh_bridge::CancelToken;

use crate::error::{ConductorError, Result};

// ---------------------------------------------------------------------------
// QualityResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityResult {
    /// Whether the quality command exists and was executed.
    pub ran: bool,
    pub passed: bool,
    /// The user declined to proceed after the command modified files.
    pub user_aborted: bool,
    /// Combined stdout/stderr, fed back to the agent on failure.
    pub output: String,
}

impl QualityResult {
    pub fn skipped() -> Self {
        Self {
            ran: false,
            passed: false,
            user_aborted: false,
            output: String::new(),
        }
    }

    /// Whether this result gates a `finish`: only an explicit failure does.
    pub fn blocks_finish(&self) -> bool {
        (self.ran && !self.passed) || self.user_aborted
    }
}

// ---------------------------------------------------------------------------
// Confirmation hook
// ---------------------------------------------------------------------------

/// How the conductor asks "the quality command changed files — continue?".
pub trait ConfirmPrompt: Send + Sync {
    fn confirm(&self, message: &str) -> bool;
}

/// Reads a y/N line from stdin.
pub struct StdinConfirm;

impl ConfirmPrompt for StdinConfirm {
    fn confirm(&self, message: &str) -> bool {
        eprint!("{message} [y/N] ");
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_err() {
            return false;
        }
        matches!(line.trim(), "y" | "Y" | "yes")
    }
}

/// Always proceeds; used in auto mode where no user is present.
pub struct AutoConfirm;

impl ConfirmPrompt for AutoConfirm {
    fn confirm(&self, _message: &str) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// QualityGate
// ---------------------------------------------------------------------------

/// Runs the externally defined quality command, by default the make target
/// named `quality`. A missing target reports `ran = false` rather than
/// failing — quality is opt-in per repository.
pub struct QualityGate {
    pub target: String,
    /// Optional upper bound on the run (used when `finish` bounds it).
    pub timeout: Option<Duration>,
}

impl QualityGate {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Execute the quality command in `workdir`, honoring cancellation.
    pub async fn run(&self, workdir: &Path, cancel: &CancelToken) -> Result<QualityResult> {
        info!(target = %self.target, "running quality command");

        let spawned = tokio::process::Command::new("make")
            .arg(&self.target)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                // No `make` on this machine: quality simply did not run.
                warn!(error = %e, "quality command unavailable");
                return Ok(QualityResult::skipped());
            }
        };

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let collect = async {
            let mut out = String::new();
            if let Some(pipe) = stdout.as_mut() {
                let _ = pipe.read_to_string(&mut out).await;
            }
            if let Some(pipe) = stderr.as_mut() {
                let _ = pipe.read_to_string(&mut out).await;
            }
            let status = child.wait().await;
            (out, status)
        };

        let deadline = async {
            match self.timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };

        // The child is killed on drop, so bailing out of either arm below
        // reaps it.
        let (output, status) = tokio::select! {
            result = collect => result,
            _ = cancel.cancelled() => return Err(ConductorError::Cancelled),
            _ = deadline => {
                warn!(target = %self.target, "quality command hit its time bound");
                return Ok(QualityResult {
                    ran: true,
                    passed: false,
                    user_aborted: false,
                    output: "quality command timed out".into(),
                });
            }
        };

        let status = status.map_err(|e| ConductorError::Fatal(format!("quality wait: {e}")))?;

        // `make` without a matching target exits 2 and names the target.
        if !status.success() && output.contains("No rule to make target") {
            info!(target = %self.target, "no quality target defined");
            return Ok(QualityResult::skipped());
        }

        Ok(QualityResult {
            ran: true,
            passed: status.success(),
            user_aborted: false,
            output,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn makefile(dir: &Path, body: &str) {
        std::fs::write(dir.join("Makefile"), body).unwrap();
    }

    #[tokio::test]
    async fn passing_target_reports_passed() {
        let dir = tempfile::tempdir().unwrap();
        makefile(dir.path(), "quality:\n\t@echo all good\n");
        let result = QualityGate::new("quality")
            .run(dir.path(), &CancelToken::new())
            .await
            .unwrap();
        assert!(result.ran);
        assert!(result.passed);
        assert!(result.output.contains("all good"));
        assert!(!result.blocks_finish());
    }

    #[tokio::test]
    async fn failing_target_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        makefile(
            dir.path(),
            "quality:\n\t@echo lint: 3 problems\n\t@exit 1\n",
        );
        let result = QualityGate::new("quality")
            .run(dir.path(), &CancelToken::new())
            .await
            .unwrap();
        assert!(result.ran);
        assert!(!result.passed);
        assert!(result.output.contains("3 problems"));
        assert!(result.blocks_finish());
    }

    #[tokio::test]
    async fn missing_target_means_not_ran() {
        let dir = tempfile::tempdir().unwrap();
        makefile(dir.path(), "other:\n\t@true\n");
        let result = QualityGate::new("quality")
            .run(dir.path(), &CancelToken::new())
            .await
            .unwrap();
        assert!(!result.ran);
        assert!(!result.blocks_finish());
    }

    #[tokio::test]
    async fn missing_makefile_means_not_ran() {
        let dir = tempfile::tempdir().unwrap();
        let result = QualityGate::new("quality")
            .run(dir.path(), &CancelToken::new())
            .await
            .unwrap();
        assert!(!result.ran);
    }

    #[test]
    fn auto_confirm_always_proceeds() {
        assert!(AutoConfirm.confirm("continue?"));
    }
}
