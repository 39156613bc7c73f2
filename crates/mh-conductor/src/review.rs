use std::path::Path;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tracing::info;

use mh_bridge::CancelToken;

use crate::error::{ConductorError, Result};

// ---------------------------------------------------------------------------
// ReviewVerdict
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewVerdict {
    /// The tool ran and flagged nothing.
    Complete,
    /// The tool's output mentions findings.
    Issues,
    /// The tool itself failed.
    Error,
}

/// Words whose presence in review output means findings were raised.
const ISSUE_KEYWORDS: &[&str] = &["error", "warning", "issue", "must", "should", "recommend"];

/// Lexical classification of review-tool output. Lossy on purpose: external
/// reviewers print prose, not structured findings.
pub fn classify_review_output(output: &str) -> ReviewVerdict {
    let lower = output.to_lowercase();
    if ISSUE_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        ReviewVerdict::Issues
    } else {
        ReviewVerdict::Complete
    }
}

// ---------------------------------------------------------------------------
// ReviewTool
// ---------------------------------------------------------------------------

/// An external review command, `coderabbit review` by default.
pub struct ReviewTool {
    pub command: Vec<String>,
}

impl Default for ReviewTool {
    fn default() -> Self {
        Self {
            command: vec!["coderabbit".into(), "review".into()],
        }
    }
}

impl ReviewTool {
    pub fn from_command_line(command: &str) -> Self {
        Self {
            command: command.split_whitespace().map(String::from).collect(),
        }
    }

    /// Run the tool in `workdir`; returns the verdict and the raw output.
    /// The review never modifies code — only the artifact file does.
    pub async fn run(
        &self,
        workdir: &Path,
        cancel: &CancelToken,
    ) -> Result<(ReviewVerdict, String)> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(ConductorError::UserInput("empty review command".into()));
        };
        info!(program = %program, "running review tool");

        let spawned = tokio::process::Command::new(program)
            .args(args)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                return Ok((
                    ReviewVerdict::Error,
                    format!("review tool `{program}` failed to start: {e}"),
                ));
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

        let (output, status) = tokio::select! {
            result = collect => result,
            _ = cancel.cancelled() => return Err(ConductorError::Cancelled),
        };

        let status = status.map_err(|e| ConductorError::Fatal(format!("review wait: {e}")))?;
        if !status.success() {
            return Ok((ReviewVerdict::Error, output));
        }
        Ok((classify_review_output(&output), output))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_output_is_complete() {
        assert_eq!(
            classify_review_output("Looks great. Nothing to add."),
            ReviewVerdict::Complete
        );
        assert_eq!(classify_review_output(""), ReviewVerdict::Complete);
    }

    #[test]
    fn keywords_mean_issues() {
        for text in [
            "ERROR: unused variable",
            "A warning was emitted by the linter",
            "There is an issue with the null check",
            "You must handle the empty case",
            "This should be renamed",
            "I recommend extracting a helper",
        ] {
            assert_eq!(classify_review_output(text), ReviewVerdict::Issues, "{text}");
        }
    }

    #[test]
    fn keyword_scan_is_case_insensitive() {
        assert_eq!(
            classify_review_output("WARNING in module"),
            ReviewVerdict::Issues
        );
        assert_eq!(
            classify_review_output("ReCoMmEnD changing this"),
            ReviewVerdict::Issues
        );
    }

    #[tokio::test]
    async fn missing_tool_is_an_error_verdict() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ReviewTool::from_command_line("definitely-not-a-review-tool-3c4d");
        let (verdict, output) = tool.run(dir.path(), &CancelToken::new()).await.unwrap();
        assert_eq!(verdict, ReviewVerdict::Error);
        assert!(output.contains("failed to start"));
    }

    #[tokio::test]
    async fn scripted_tool_classifies() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ReviewTool {
            command: vec!["sh".into(), "-c".into(), "echo you should rename this".into()],
        };
        let (verdict, output) = tool.run(dir.path(), &CancelToken::new()).await.unwrap();
        assert_eq!(verdict, ReviewVerdict::Issues);
        assert!(output.contains("rename"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ReviewTool {
            command: vec!["sh".into(), "-c".into(), "echo broken >&2; exit 1".into()],
        };
        let (verdict, _) = tool.run(dir.path(), &CancelToken::new()).await.unwrap();
        assert_eq!(verdict, ReviewVerdict::Error);
    }
}
