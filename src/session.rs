//! Session records and the status state machine
//!
//! A session is the lifecycle of one worker on one issue within one
//! repository. The durable record lives in the session store; the files
//! under the worktree's `.claude/` directory carry the per-spawn metadata
//! the worker itself reads and writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Reserved subdirectory inside each worktree for orchestration files.
pub const WORKTREE_META_DIR: &str = ".claude";

/// Marker file the worker writes just before exiting.
pub const WORKER_STATUS_FILE: &str = ".worker-status";

/// Reference to the tracked issue a session is working on.
///
/// Fetched once at spawn time and immutable for the session's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRef {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
}

/// How a session is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Operator drives the worker by hand.
    Manual,
    /// The iterative controller drives bounded re-spawn cycles.
    Autonomous,
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionMode::Manual => write!(f, "manual"),
            SessionMode::Autonomous => write!(f, "autonomous"),
        }
    }
}

/// Session lifecycle status.
///
/// ```text
/// spawned:   registered → working
/// pause:     working ⇄ paused
/// stall:     working → stuck → (restart) → working
/// shipping:  working → shipping → reviews_in_progress → pr_ready → complete
/// delete:    any non-terminal → cancelled → deleting → (gone)
/// failure:   deleting → deletion_failed → retry | rollback
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Registered,
    Planning,
    PlanningComplete,
    Working,
    Shipping,
    ReviewsInProgress,
    PrReady,
    Complete,
    Stuck,
    Paused,
    Cancelled,
    Deleting,
    DeletionFailed,
}

impl SessionStatus {
    /// Terminal statuses: the record is preserved but the session is over.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Complete | SessionStatus::Cancelled)
    }

    /// Active statuses: a worker may be (or should be) running.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionStatus::Registered
                | SessionStatus::Planning
                | SessionStatus::PlanningComplete
                | SessionStatus::Working
                | SessionStatus::Shipping
                | SessionStatus::ReviewsInProgress
                | SessionStatus::PrReady
                | SessionStatus::Stuck
                | SessionStatus::Paused
        )
    }

    /// Deletion-in-progress statuses. Sessions here cannot be restarted,
    /// paused, or forwarded to.
    pub fn is_deletion_in_progress(self) -> bool {
        matches!(self, SessionStatus::Deleting | SessionStatus::DeletionFailed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Registered => "registered",
            SessionStatus::Planning => "planning",
            SessionStatus::PlanningComplete => "planning_complete",
            SessionStatus::Working => "working",
            SessionStatus::Shipping => "shipping",
            SessionStatus::ReviewsInProgress => "reviews_in_progress",
            SessionStatus::PrReady => "pr_ready",
            SessionStatus::Complete => "complete",
            SessionStatus::Stuck => "stuck",
            SessionStatus::Paused => "paused",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Deleting => "deleting",
            SessionStatus::DeletionFailed => "deletion_failed",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Durable per-session record, one JSON file per session in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Derived from the primary issue number.
    pub session_id: String,
    pub repo_id: String,
    pub issue: IssueRef,
    pub branch_name: String,
    pub worktree_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawn_id: Option<String>,
    pub started_at: DateTime<Utc>,
    /// Bumped by every state-changing operation, not only worker pings.
    pub last_heartbeat: DateTime<Utc>,
    pub status: SessionStatus,
    pub mode: SessionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stuck_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarded_message: Option<String>,
    /// Status before entering `deleting`, kept for rollback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<SessionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_error: Option<String>,
}

impl SessionRecord {
    pub fn new(
        repo_id: impl Into<String>,
        issue: IssueRef,
        branch_name: impl Into<String>,
        worktree_path: PathBuf,
        mode: SessionMode,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: issue.number.to_string(),
            repo_id: repo_id.into(),
            issue,
            branch_name: branch_name.into(),
            worktree_path,
            pr_url: None,
            spawn_id: None,
            started_at: now,
            last_heartbeat: now,
            status: SessionStatus::Registered,
            mode,
            stuck_reason: None,
            forwarded_message: None,
            previous_status: None,
            deletion_error: None,
        }
    }

    /// Pull request number parsed from a trailing `/pull/N` in the URL.
    pub fn pr_number(&self) -> Option<u64> {
        let url = self.pr_url.as_deref()?;
        let tail = url.trim_end_matches('/').rsplit('/').next()?;
        let n: u64 = tail.parse().ok()?;
        url.trim_end_matches('/')
            .strip_suffix(tail)
            .filter(|rest| rest.ends_with("/pull/"))
            .map(|_| n)
    }
}

/// Static per-session metadata written into the worktree at spawn.
///
/// Written once, never rewritten. The worker reads this to learn its own
/// identity and the commands it should invoke to heartbeat and update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: String,
    pub repo_id: String,
    pub issue_number: u64,
    pub branch_name: String,
    pub worktree_path: PathBuf,
    pub github_owner: String,
    pub github_repo: String,
    pub heartbeat_command: String,
    pub update_command: String,
}

/// Mutable per-worktree state written by the orchestrator, read by the
/// worker. The worker must tolerate this file being missing or mid-write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDynamicState {
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarded_message: Option<String>,
    pub last_updated: DateTime<Utc>,
}

/// Metadata for the current spawn, written under `.claude/` before the
/// spawner reports success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnInfo {
    pub spawn_id: String,
    pub spawned_at: DateTime<Utc>,
    /// Always length one today; kept as a list for file-format stability.
    pub issue_numbers: Vec<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
}

/// Marker the worker leaves in `.claude/.worker-status` just before exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMarker {
    /// The whole task is done; ship it.
    Complete,
    /// One sub-task finished; spawn the next iteration.
    TaskDone,
}

impl WorkerMarker {
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim() {
            "complete" => Some(WorkerMarker::Complete),
            "task_done" => Some(WorkerMarker::TaskDone),
            _ => None,
        }
    }
}
