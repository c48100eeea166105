//! VCS gateway - subprocess wrapper around the `git` CLI
//!
//! Provisions and removes isolated worktrees, inspects diff status, and
//! deletes branches. Every operation returns a structured result with
//! captured stderr; none of them raise on a failed git invocation, and
//! none retry.

use crate::Result;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Output of one git invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Success/failure of a gateway operation.
#[derive(Debug, Clone)]
pub struct GitOpResult {
    pub success: bool,
    pub error: Option<String>,
}

impl GitOpResult {
    fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Result of removing a working copy. "Already absent" is a success.
#[derive(Debug, Clone)]
pub struct RemoveResult {
    pub success: bool,
    pub error: Option<String>,
    pub not_found: bool,
}

/// Cumulative diff of a working copy against its base reference.
#[derive(Debug, Clone, Default)]
pub struct DiffStatus {
    pub files_changed: usize,
    pub insertions: usize,
    pub deletions: usize,
    pub last_commit_message: Option<String>,
    pub changed_files: Vec<String>,
}

/// Deletion safety check: work that would be lost with the worktree.
#[derive(Debug, Clone, Copy, Default)]
pub struct PendingCounts {
    pub uncommitted_files: usize,
    pub unpushed_commits: usize,
}

/// Gateway bound to one repository's main checkout.
#[derive(Debug, Clone)]
pub struct GitGateway {
    repo_root: PathBuf,
}

impl GitGateway {
    pub fn new(repo_root: impl AsRef<Path>) -> Self {
        Self {
            repo_root: repo_root.as_ref().to_path_buf(),
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Run git with the given args in `cwd`, capturing output. A failed
    /// process spawn is reported the same way as a non-zero exit.
    async fn run(&self, cwd: &Path, args: &[&str]) -> GitOutput {
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .env_remove("GIT_DIR")
            .env_remove("GIT_WORK_TREE")
            .stdin(Stdio::null())
            .output()
            .await;

        match output {
            Ok(out) => GitOutput {
                success: out.status.success(),
                stdout: String::from_utf8_lossy(&out.stdout).to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            },
            Err(e) => GitOutput {
                success: false,
                stdout: String::new(),
                stderr: format!("failed to run git: {}", e),
            },
        }
    }

    /// Provision an isolated worktree at `path`, creating `branch` off
    /// `base_ref`. Fails if `path` already exists.
    pub async fn create_working_copy(
        &self,
        path: &Path,
        branch: &str,
        base_ref: &str,
    ) -> GitOpResult {
        if path.exists() {
            return GitOpResult::fail(format!("path already exists: {}", path.display()));
        }
        let path_str = path.display().to_string();
        let out = self
            .run(
                &self.repo_root,
                &["worktree", "add", "-b", branch, &path_str, base_ref],
            )
            .await;
        if out.success {
            return GitOpResult::ok();
        }
        // A branch left over from an earlier session for the same issue
        // is reused rather than treated as fatal.
        if out.stderr.contains("already exists") {
            let retry = self
                .run(&self.repo_root, &["worktree", "add", &path_str, branch])
                .await;
            if retry.success {
                return GitOpResult::ok();
            }
            return GitOpResult::fail(retry.stderr);
        }
        GitOpResult::fail(out.stderr)
    }

    /// Remove a worktree and its tracking metadata. An already-absent
    /// worktree counts as success with `not_found` set.
    pub async fn remove_working_copy(&self, path: &Path) -> RemoveResult {
        if !path.exists() {
            // Prune any stale bookkeeping the old worktree left behind.
            let _ = self.run(&self.repo_root, &["worktree", "prune"]).await;
            return RemoveResult {
                success: true,
                error: None,
                not_found: true,
            };
        }

        let path_str = path.display().to_string();
        let out = self
            .run(
                &self.repo_root,
                &["worktree", "remove", "--force", &path_str],
            )
            .await;
        if !out.success {
            return RemoveResult {
                success: false,
                error: Some(out.stderr),
                not_found: false,
            };
        }

        // In case the removal left remnants (untracked files).
        if path.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(path).await {
                return RemoveResult {
                    success: false,
                    error: Some(format!("failed to remove directory: {}", e)),
                    not_found: false,
                };
            }
        }
        RemoveResult {
            success: true,
            error: None,
            not_found: false,
        }
    }

    /// Delete a local branch. "Does not exist" is silently ignored.
    pub async fn delete_local_branch(&self, name: &str, force: bool) -> GitOpResult {
        let flag = if force { "-D" } else { "-d" };
        let out = self.run(&self.repo_root, &["branch", flag, name]).await;
        if out.success || out.stderr.contains("not found") {
            GitOpResult::ok()
        } else {
            GitOpResult::fail(out.stderr)
        }
    }

    /// Delete a remote branch. "Does not exist" is silently ignored.
    pub async fn delete_remote_branch(&self, name: &str) -> GitOpResult {
        let refspec = format!(":{}", name);
        let out = self
            .run(&self.repo_root, &["push", "origin", &refspec])
            .await;
        if out.success
            || out.stderr.contains("remote ref does not exist")
            || out.stderr.contains("unable to delete")
        {
            GitOpResult::ok()
        } else {
            GitOpResult::fail(out.stderr)
        }
    }

    /// Cumulative diff of the worktree at `path` against `base_ref`,
    /// including uncommitted changes.
    pub async fn diff_status(&self, path: &Path, base_ref: &str) -> DiffStatus {
        let mut status = DiffStatus::default();

        let numstat = self.run(path, &["diff", "--numstat", base_ref]).await;
        if numstat.success {
            for line in numstat.stdout.lines() {
                let mut parts = line.split('\t');
                let ins = parts.next().unwrap_or("0");
                let del = parts.next().unwrap_or("0");
                let file = parts.next().unwrap_or("");
                if file.is_empty() {
                    continue;
                }
                // Binary files report "-" for both counts.
                status.insertions += ins.parse::<usize>().unwrap_or(0);
                status.deletions += del.parse::<usize>().unwrap_or(0);
                status.files_changed += 1;
                status.changed_files.push(file.to_string());
            }
        }

        let last = self.run(path, &["log", "-1", "--format=%s"]).await;
        if last.success {
            let subject = last.stdout.trim();
            if !subject.is_empty() {
                status.last_commit_message = Some(subject.to_string());
            }
        }

        status
    }

    /// Count uncommitted files and unpushed commits in a worktree.
    /// A branch with no upstream reports zero unpushed commits.
    pub async fn uncommitted_and_unpushed_counts(&self, path: &Path) -> PendingCounts {
        let mut counts = PendingCounts::default();

        let porcelain = self.run(path, &["status", "--porcelain"]).await;
        if porcelain.success {
            counts.uncommitted_files =
                porcelain.stdout.lines().filter(|l| !l.is_empty()).count();
        }

        let ahead = self
            .run(path, &["rev-list", "--count", "@{u}..HEAD"])
            .await;
        if ahead.success {
            counts.unpushed_commits = ahead.stdout.trim().parse().unwrap_or(0);
        }

        counts
    }

    /// Stage everything in the worktree.
    pub async fn stage_all(&self, path: &Path) -> GitOpResult {
        let out = self.run(path, &["add", "-A"]).await;
        if out.success {
            GitOpResult::ok()
        } else {
            GitOpResult::fail(out.stderr)
        }
    }

    /// Whether anything is staged for commit.
    pub async fn has_staged_changes(&self, path: &Path) -> bool {
        // `diff --cached --quiet` exits 1 when there are staged changes.
        let out = self.run(path, &["diff", "--cached", "--quiet"]).await;
        !out.success
    }

    pub async fn commit(&self, path: &Path, message: &str) -> GitOpResult {
        let out = self.run(path, &["commit", "-m", message]).await;
        if out.success {
            GitOpResult::ok()
        } else {
            GitOpResult::fail(out.stderr)
        }
    }

    pub async fn push(&self, path: &Path, branch: &str) -> GitOpResult {
        let out = self
            .run(path, &["push", "-u", "origin", branch])
            .await;
        if out.success {
            GitOpResult::ok()
        } else {
            GitOpResult::fail(out.stderr)
        }
    }

    /// URL of the `origin` remote, if configured.
    pub async fn origin_url(&self) -> Option<String> {
        let out = self
            .run(&self.repo_root, &["remote", "get-url", "origin"])
            .await;
        if out.success {
            let url = out.stdout.trim().to_string();
            if url.is_empty() {
                None
            } else {
                Some(url)
            }
        } else {
            None
        }
    }

    /// Whether `path` is a git-managed directory (repository or worktree).
    pub fn is_working_copy(path: &Path) -> bool {
        git2::Repository::open(path).is_ok()
    }

    /// Ascend from `start` to the enclosing repository's working directory.
    pub fn find_repository_root(start: &Path) -> Option<PathBuf> {
        let repo = git2::Repository::discover(start).ok()?;
        repo.workdir().map(|p| p.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    /// Throwaway repository with one commit on `main`.
    fn init_repo(dir: &Path) {
        let run = |args: &[&str]| {
            let status = StdCommand::new("git")
                .args(args)
                .current_dir(dir)
                .env("GIT_AUTHOR_NAME", "test")
                .env("GIT_AUTHOR_EMAIL", "test@example.com")
                .env("GIT_COMMITTER_NAME", "test")
                .env("GIT_COMMITTER_EMAIL", "test@example.com")
                .output()
                .expect("git should run");
            assert!(status.status.success(), "git {:?} failed", args);
        };
        run(&["init", "-b", "main"]);
        run(&["config", "user.name", "test"]);
        run(&["config", "user.email", "test@example.com"]);
        std::fs::write(dir.join("README.md"), "# test\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "initial commit"]);
    }

    #[tokio::test]
    async fn create_and_remove_working_copy() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        std::fs::create_dir(&repo).unwrap();
        init_repo(&repo);

        let gateway = GitGateway::new(&repo);
        let wt = tmp.path().join("repo-issue-1");

        let created = gateway.create_working_copy(&wt, "issue-1", "main").await;
        assert!(created.success, "create failed: {:?}", created.error);
        assert!(wt.join("README.md").exists());
        assert!(GitGateway::is_working_copy(&wt));

        let removed = gateway.remove_working_copy(&wt).await;
        assert!(removed.success);
        assert!(!removed.not_found);
        assert!(!wt.exists());
    }

    #[tokio::test]
    async fn create_refuses_existing_path() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        std::fs::create_dir(&repo).unwrap();
        init_repo(&repo);

        let gateway = GitGateway::new(&repo);
        let wt = tmp.path().join("taken");
        std::fs::create_dir(&wt).unwrap();

        let result = gateway.create_working_copy(&wt, "issue-2", "main").await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("already exists"));
    }

    #[tokio::test]
    async fn remove_missing_working_copy_is_not_found_success() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        std::fs::create_dir(&repo).unwrap();
        init_repo(&repo);

        let gateway = GitGateway::new(&repo);
        let result = gateway
            .remove_working_copy(&tmp.path().join("never-existed"))
            .await;
        assert!(result.success);
        assert!(result.not_found);
    }

    #[tokio::test]
    async fn diff_status_counts_changes() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        std::fs::create_dir(&repo).unwrap();
        init_repo(&repo);

        let gateway = GitGateway::new(&repo);
        let wt = tmp.path().join("repo-issue-3");
        let created = gateway.create_working_copy(&wt, "issue-3", "main").await;
        assert!(created.success);

        std::fs::write(wt.join("new.txt"), "one\ntwo\n").unwrap();
        let add = gateway.stage_all(&wt).await;
        assert!(add.success);
        assert!(gateway.has_staged_changes(&wt).await);
        let commit = gateway.commit(&wt, "add new file").await;
        assert!(commit.success, "commit failed: {:?}", commit.error);

        let diff = gateway.diff_status(&wt, "main").await;
        assert_eq!(diff.files_changed, 1);
        assert_eq!(diff.insertions, 2);
        assert_eq!(diff.changed_files, vec!["new.txt".to_string()]);
        assert_eq!(diff.last_commit_message.as_deref(), Some("add new file"));

        // Everything is committed; no upstream means nothing counts as
        // unpushed.
        let pending = gateway.uncommitted_and_unpushed_counts(&wt).await;
        assert_eq!(pending.uncommitted_files, 0);
        assert_eq!(pending.unpushed_commits, 0);

        std::fs::write(wt.join("dirty.txt"), "wip\n").unwrap();
        let pending = gateway.uncommitted_and_unpushed_counts(&wt).await;
        assert_eq!(pending.uncommitted_files, 1);
    }

    #[tokio::test]
    async fn delete_missing_local_branch_is_silent() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        std::fs::create_dir(&repo).unwrap();
        init_repo(&repo);

        let gateway = GitGateway::new(&repo);
        let result = gateway.delete_local_branch("no-such-branch", true).await;
        assert!(result.success);
    }

    #[test]
    fn find_repository_root_ascends() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        std::fs::create_dir_all(repo.join("deep/nested")).unwrap();
        init_repo(&repo);

        let root = GitGateway::find_repository_root(&repo.join("deep/nested"))
            .expect("should find root");
        assert_eq!(root.canonicalize().unwrap(), repo.canonicalize().unwrap());
        assert!(GitGateway::find_repository_root(tmp.path()).is_none());
    }
}
