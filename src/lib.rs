//! Atelier: a local control plane for coding agents
//!
//! Like a painter's atelier - one master coordinating many apprentices,
//! each working a separate canvas. Atelier assigns one worker per issue,
//! gives it an isolated git worktree, tracks its lifecycle on disk, and
//! optionally drives it through a bounded improvement loop with review
//! gating before a pull request goes out.

pub mod cli;
pub mod config;
pub mod git;
pub mod github;
pub mod manager;
pub mod orchestrator;
pub mod prompt;
pub mod protocol;
pub mod ralph;
pub mod session;
pub mod spawner;
pub mod store;
pub mod watcher;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AtelierError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Git operation failed: {0}")]
    Git(String),

    #[error("Filesystem watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Spawner error: {0}")]
    Spawner(String),

    #[error("Unknown repository: {0}")]
    RepoNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Issue already has an active session: {session_id}")]
    IssueAlreadyActive { session_id: String },

    #[error("Failed to fetch issue #{issue}: {stderr}")]
    IssueFetchFailed { issue: u64, stderr: String },

    #[error("Spawner '{name}' is not available on this host")]
    SpawnerUnavailable { name: String },

    #[error("Orphan worktree at {}: no session record references it", path.display())]
    OrphanDetected {
        path: PathBuf,
        session_id: Option<String>,
    },

    #[error("Working copy missing: {}", path.display())]
    WorkingCopyMissing { path: PathBuf },

    #[error("Prompt file missing: {}", path.display())]
    PromptMissing { path: PathBuf },

    #[error("Session {0} is not in deletion_failed state")]
    NotInDeletionFailedState(String),

    #[error("Iteration loop for {0} is not waiting")]
    LoopNotWaiting(String),
}

pub type Result<T> = std::result::Result<T, AtelierError>;
