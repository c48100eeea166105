//! Issue tracker and notification gateway - `gh` CLI wrapper
//!
//! Fetches issue metadata, opens pull requests, and posts notifications.
//! Like the VCS gateway, every operation captures stderr and reports
//! failure as data rather than unwinding.

use crate::session::IssueRef;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// Result of opening a pull request.
#[derive(Debug, Clone)]
pub struct PrResult {
    pub success: bool,
    pub url: Option<String>,
    pub error: Option<String>,
}

/// Result of fetching an issue.
#[derive(Debug, Clone)]
pub enum IssueFetch {
    Found(IssueRef),
    Failed { stderr: String },
}

#[derive(Debug, Clone, serde::Deserialize)]
struct GhIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: String,
}

/// Gateway bound to one GitHub repository.
#[derive(Debug, Clone)]
pub struct GithubGateway {
    owner: String,
    repo: String,
    /// Optional external command receiving one message argument.
    notify_command: Option<Vec<String>>,
}

impl GithubGateway {
    pub fn new(
        owner: impl Into<String>,
        repo: impl Into<String>,
        notify_command: Option<Vec<String>>,
    ) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            notify_command,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    fn repo_arg(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    /// Whether the `gh` CLI is installed.
    pub async fn is_available() -> bool {
        Command::new("gh")
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Fetch one issue. No explicit timeout; `gh`'s own default applies.
    pub async fn fetch_issue(&self, number: u64) -> IssueFetch {
        let output = Command::new("gh")
            .args([
                "issue",
                "view",
                &number.to_string(),
                "--repo",
                &self.repo_arg(),
                "--json",
                "number,title,body",
            ])
            .stdin(Stdio::null())
            .output()
            .await;

        let output = match output {
            Ok(o) => o,
            Err(e) => {
                return IssueFetch::Failed {
                    stderr: format!("failed to run gh: {}", e),
                }
            }
        };

        if !output.status.success() {
            return IssueFetch::Failed {
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            };
        }

        match serde_json::from_slice::<GhIssue>(&output.stdout) {
            Ok(issue) => IssueFetch::Found(IssueRef {
                number: issue.number,
                title: issue.title,
                body: issue.body,
            }),
            Err(e) => IssueFetch::Failed {
                stderr: format!("unparseable issue payload: {}", e),
            },
        }
    }

    /// Open a pull request for `branch` from inside the worktree.
    pub async fn create_pull_request(
        &self,
        worktree: &Path,
        branch: &str,
        title: &str,
        body: &str,
    ) -> PrResult {
        let output = Command::new("gh")
            .args([
                "pr",
                "create",
                "--repo",
                &self.repo_arg(),
                "--head",
                branch,
                "--title",
                title,
                "--body",
                body,
            ])
            .current_dir(worktree)
            .stdin(Stdio::null())
            .output()
            .await;

        let output = match output {
            Ok(o) => o,
            Err(e) => {
                return PrResult {
                    success: false,
                    url: None,
                    error: Some(format!("failed to run gh: {}", e)),
                }
            }
        };

        if output.status.success() {
            // gh prints the new PR URL on stdout.
            let url = String::from_utf8_lossy(&output.stdout)
                .lines()
                .rev()
                .find(|l| l.contains("/pull/"))
                .map(|l| l.trim().to_string());
            PrResult {
                success: true,
                url,
                error: None,
            }
        } else {
            PrResult {
                success: false,
                url: None,
                error: Some(String::from_utf8_lossy(&output.stderr).trim().to_string()),
            }
        }
    }

    /// Post a notification through the configured channel command.
    /// Best-effort: failures are logged, never surfaced.
    pub async fn post_notification(&self, message: &str) {
        let Some(command) = &self.notify_command else {
            tracing::debug!(message, "no notify command configured, dropping notification");
            return;
        };
        let Some((program, args)) = command.split_first() else {
            return;
        };
        let result = Command::new(program)
            .args(args)
            .arg(message)
            .stdin(Stdio::null())
            .output()
            .await;
        match result {
            Ok(out) if out.status.success() => {}
            Ok(out) => {
                tracing::warn!(
                    status = %out.status,
                    stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                    "notification command failed"
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to run notification command");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_payload_parses() {
        let json = r#"{"number": 42, "title": "Add X", "body": "Please add X."}"#;
        let issue: GhIssue = serde_json::from_str(json).unwrap();
        assert_eq!(issue.number, 42);
        assert_eq!(issue.title, "Add X");
    }

    #[test]
    fn issue_payload_tolerates_missing_body() {
        let json = r#"{"number": 7, "title": "No body"}"#;
        let issue: GhIssue = serde_json::from_str(json).unwrap();
        assert_eq!(issue.body, "");
    }

    #[tokio::test]
    async fn notification_without_command_is_a_noop() {
        let gateway = GithubGateway::new("acme", "demo", None);
        gateway.post_notification("hello").await;
    }
}
