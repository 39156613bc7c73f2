use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use mh_core::types::{Priority, WorkUnit, WorkUnitAgent};

use crate::provider::{Provider, ProviderCapabilities, PullRequestSpec};
use crate::ProviderError;

// ---------------------------------------------------------------------------
// GhRunner trait (for testability)
// ---------------------------------------------------------------------------

/// Abstraction over the `gh` CLI so the provider can be tested without a
/// network or an installed binary.
pub trait GhRunner: Send + Sync {
    fn run_gh(&self, args: &[&str]) -> Result<String, String>;
}

/// Real runner that shells out to `gh`.
pub struct RealGhRunner;

impl GhRunner for RealGhRunner {
    fn run_gh(&self, args: &[&str]) -> Result<String, String> {
        let output = std::process::Command::new("gh")
            .args(args)
            .output()
            .map_err(|e| format!("gh: {e}"))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// GithubProvider
// ---------------------------------------------------------------------------

/// Reads issues and opens pull requests through the `gh` CLI.
///
/// References take the form `github:123` (issue in the current repository)
/// or `github:owner/repo#123`.
pub struct GithubProvider {
    runner: Box<dyn GhRunner>,
}

impl GithubProvider {
    pub fn new() -> Self {
        Self {
            runner: Box::new(RealGhRunner),
        }
    }

    pub fn with_runner(runner: Box<dyn GhRunner>) -> Self {
        Self { runner }
    }
}

impl Default for GithubProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct IssueView {
    number: u64,
    title: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    labels: Vec<IssueLabel>,
}

#[derive(Debug, Deserialize)]
struct IssueLabel {
    name: String,
}

/// `owner/repo#123` → (`Some("owner/repo")`, `"123"`); `123` → (None, ..).
fn split_issue_reference(reference: &str) -> (Option<&str>, &str) {
    match reference.split_once('#') {
        Some((repo, number)) if !repo.is_empty() => (Some(repo), number),
        _ => (None, reference),
    }
}

/// Derive an external key like `GH-123` from an issue number.
fn external_key(number: u64) -> String {
    format!("GH-{number}")
}

#[async_trait]
impl Provider for GithubProvider {
    fn name(&self) -> &str {
        "github"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            read: true,
            list: false,
            write: false,
            pr: true,
        }
    }

    async fn fetch(&self, reference: &str) -> Result<WorkUnit, ProviderError> {
        let (repo, number) = split_issue_reference(reference);
        if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit()) {
            return Err(ProviderError::Fetch(format!(
                "invalid github issue reference `{reference}` (expected `123` or `owner/repo#123`)"
            )));
        }

        let mut args = vec!["issue", "view", number, "--json", "number,title,body,labels"];
        if let Some(repo) = repo {
            args.extend(["--repo", repo]);
        }
        let json = self
            .runner
            .run_gh(&args)
            .map_err(ProviderError::Fetch)?;
        let issue: IssueView = serde_json::from_str(&json)
            .map_err(|e| ProviderError::Fetch(format!("unexpected gh output: {e}")))?;

        info!(issue = issue.number, title = %issue.title, "fetched github issue");
        Ok(WorkUnit {
            source_id: reference.to_string(),
            title: issue.title,
            body: issue.body,
            labels: issue.labels.into_iter().map(|l| l.name).collect(),
            priority: Priority::Normal,
            external_key: Some(external_key(issue.number)),
            task_type: None,
            slug: None,
            agent: WorkUnitAgent::default(),
        })
    }

    async fn create_pr(&self, spec: &PullRequestSpec) -> Result<String, ProviderError> {
        let mut args = vec![
            "pr",
            "create",
            "--head",
            spec.branch.as_str(),
            "--base",
            spec.base.as_str(),
            "--title",
            spec.title.as_str(),
            "--body",
            spec.body.as_str(),
        ];
        if spec.draft {
            args.push("--draft");
        }
        let url = self
            .runner
            .run_gh(&args)
            .map_err(ProviderError::Fetch)?
            .trim()
            .to_string();
        info!(url = %url, "created pull request");
        Ok(url)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeGh {
        calls: Mutex<Vec<Vec<String>>>,
        response: Result<String, String>,
    }

    impl FakeGh {
        fn ok(response: &str) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                response: Ok(response.to_string()),
            }
        }

        fn err(message: &str) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                response: Err(message.to_string()),
            }
        }
    }

    impl GhRunner for std::sync::Arc<FakeGh> {
        fn run_gh(&self, args: &[&str]) -> Result<String, String> {
            self.calls
                .lock()
                .unwrap()
                .push(args.iter().map(|s| s.to_string()).collect());
            self.response.clone()
        }
    }

    #[test]
    fn reference_splitting() {
        assert_eq!(split_issue_reference("123"), (None, "123"));
        assert_eq!(
            split_issue_reference("acme/widgets#7"),
            (Some("acme/widgets"), "7")
        );
        assert_eq!(split_issue_reference("#9"), (None, "#9"));
    }

    #[tokio::test]
    async fn fetch_parses_issue_json() {
        let fake = std::sync::Arc::new(FakeGh::ok(
            r#"{"number":42,"title":"Add greeting","body":"Please greet.","labels":[{"name":"feature"}]}"#,
        ));
        let provider = GithubProvider::with_runner(Box::new(fake.clone()));

        let unit = provider.fetch("acme/widgets#42").await.unwrap();
        assert_eq!(unit.title, "Add greeting");
        assert_eq!(unit.external_key.as_deref(), Some("GH-42"));
        assert_eq!(unit.labels, vec!["feature"]);

        let calls = fake.calls.lock().unwrap();
        assert_eq!(calls[0][..2], ["issue".to_string(), "view".to_string()]);
        assert!(calls[0].contains(&"--repo".to_string()));
        assert!(calls[0].contains(&"acme/widgets".to_string()));
    }

    #[tokio::test]
    async fn fetch_rejects_non_numeric_reference() {
        let fake = std::sync::Arc::new(FakeGh::ok("{}"));
        let provider = GithubProvider::with_runner(Box::new(fake));
        let err = provider.fetch("not-a-number").await.unwrap_err();
        assert!(matches!(err, ProviderError::Fetch(_)));
    }

    #[tokio::test]
    async fn fetch_surfaces_gh_errors() {
        let fake = std::sync::Arc::new(FakeGh::err("gh: Not Found"));
        let provider = GithubProvider::with_runner(Box::new(fake));
        let err = provider.fetch("7").await.unwrap_err();
        match err {
            ProviderError::Fetch(msg) => assert!(msg.contains("Not Found")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_pr_passes_flags() {
        let fake = std::sync::Arc::new(FakeGh::ok("https://github.com/acme/widgets/pull/8\n"));
        let provider = GithubProvider::with_runner(Box::new(fake.clone()));

        let url = provider
            .create_pr(&PullRequestSpec {
                branch: "feature/GH-42--greet".into(),
                base: "main".into(),
                title: "Add greeting".into(),
                body: "closes #42".into(),
                draft: true,
            })
            .await
            .unwrap();
        assert_eq!(url, "https://github.com/acme/widgets/pull/8");

        let calls = fake.calls.lock().unwrap();
        assert!(calls[0].contains(&"--draft".to_string()));
        assert!(calls[0].contains(&"feature/GH-42--greet".to_string()));
    }

    #[test]
    fn declares_pr_capability() {
        let caps = GithubProvider::new().capabilities();
        assert!(caps.read && caps.pr);
        assert!(!caps.write);
    }
}
