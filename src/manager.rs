//! Session manager - per-repository session lifecycle
//!
//! The one owner of a repository's session records. Spawns workers into
//! fresh worktrees, applies status transitions, forwards operator
//! messages, and runs the safe-deletion protocol. Operations on the same
//! session serialise behind a per-session lock; operations on different
//! sessions run in parallel.

use crate::config::{Config, RepoConfig};
use crate::git::{DiffStatus, GitGateway, RemoveResult};
use crate::github::{GithubGateway, IssueFetch};
use crate::prompt::{self, PromptInputs};
use crate::session::{
    IssueRef, SessionContext, SessionDynamicState, SessionMode, SessionRecord, SessionStatus,
    WORKTREE_META_DIR,
};
use crate::spawner::{SpawnRequest, WorkerSpawner, WorkerStatus};
use crate::store::{self, SessionStore};
use crate::{AtelierError, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// Grace period between persisting `cancelled` and removing the
/// worktree, giving a watcher-driven worker time to exit.
const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Name of the plan file seeded from the issue body.
pub const PLAN_FILE: &str = "IMPLEMENTATION_PLAN.md";

/// Prompt file inside the worktree's reserved directory.
pub const PROMPT_FILE: &str = "session-prompt.md";

/// Options for spawning a session.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub mode: Option<SessionMode>,
    pub additional_prompt_sections: Vec<String>,
}

/// Options for status updates.
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub reason: Option<String>,
    pub pr_url: Option<String>,
}

/// What to delete beyond the worktree folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeletionMode {
    #[default]
    FolderOnly,
    WithLocalBranch,
    Everything,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    pub keep_working_copy: bool,
    pub force: bool,
    pub deletion_mode: DeletionMode,
}

/// Result of the safe-deletion protocol; failures are data, not errors.
#[derive(Debug, Clone)]
pub struct DeleteResult {
    pub success: bool,
    /// A deletion was already underway and `force` was not set.
    pub in_progress: bool,
    pub worktree_removed: bool,
    pub record_removed: bool,
    pub error: Option<String>,
    /// Set when worktree removal failed: the path now needs manual care.
    pub orphaned_worktree_path: Option<PathBuf>,
}

/// Result of reclaiming an orphan worktree.
#[derive(Debug, Clone)]
pub struct CleanupResult {
    pub success: bool,
    pub error: Option<String>,
    pub not_found: bool,
}

#[derive(Debug, Clone)]
pub struct HeartbeatResult {
    pub recorded: bool,
    pub has_message: bool,
}

/// A record plus observability flags for listings.
#[derive(Debug, Clone)]
pub struct SessionListing {
    pub record: SessionRecord,
    pub worktree_missing: bool,
    /// Legacy field, always empty; sessions are never auto-deleted.
    pub cleanup_info: Vec<String>,
}

/// Session change emitted to subscribers.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub repo_id: String,
    pub kind: SessionEventKind,
    pub session_id: String,
    pub record: Option<SessionRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEventKind {
    Added,
    Updated,
    Removed,
}

/// Per-repository session orchestrator.
pub struct SessionManager {
    repo: RepoConfig,
    store: SessionStore,
    git: GitGateway,
    github: GithubGateway,
    spawner: Arc<dyn WorkerSpawner>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    events: broadcast::Sender<SessionEvent>,
    stale_after: Duration,
    cancel_grace: Duration,
}

impl SessionManager {
    pub fn new(
        repo: RepoConfig,
        base_dir: &Path,
        spawner: Arc<dyn WorkerSpawner>,
        config: &Config,
    ) -> Result<Self> {
        let store = SessionStore::open(base_dir, &repo.id)?;
        let git = GitGateway::new(&repo.root);
        let github = GithubGateway::new(
            repo.github_owner.clone(),
            repo.github_repo.clone(),
            config.notify_command.clone(),
        );
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            repo,
            store,
            git,
            github,
            spawner,
            locks: Mutex::new(HashMap::new()),
            events,
            stale_after: Duration::from_secs(config.stale_after_secs),
            cancel_grace: DEFAULT_CANCEL_GRACE,
        })
    }

    /// Shorten the cancellation grace period (tests).
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn repo(&self) -> &RepoConfig {
        &self.repo
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn git(&self) -> &GitGateway {
        &self.git
    }

    pub fn github(&self) -> &GithubGateway {
        &self.github
    }

    pub fn spawner(&self) -> &Arc<dyn WorkerSpawner> {
        &self.spawner
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, kind: SessionEventKind, session_id: &str, record: Option<&SessionRecord>) {
        let _ = self.events.send(SessionEvent {
            repo_id: self.repo.id.clone(),
            kind,
            session_id: session_id.to_string(),
            record: record.cloned(),
        });
    }

    /// The per-session mutex, created on first use.
    fn session_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Branch name for an issue.
    pub fn branch_name(issue_number: u64) -> String {
        format!("issue-{}", issue_number)
    }

    /// Worktree path: `<prefix><branch>`, beside the repository root.
    pub fn worktree_path(&self, issue_number: u64) -> PathBuf {
        let name = format!("{}{}", self.repo.prefix(), Self::branch_name(issue_number));
        match self.repo.root.parent() {
            Some(parent) => parent.join(name),
            None => self.repo.root.join(name),
        }
    }

    fn prompt_path(worktree: &Path) -> PathBuf {
        worktree.join(WORKTREE_META_DIR).join(PROMPT_FILE)
    }

    /// Spawn a session for an issue, fetching it from the tracker first.
    /// Cheap rejections come before the fetch; the checks are repeated
    /// under the session lock in `spawn_with_issue`.
    pub async fn spawn(&self, issue_number: u64, options: SpawnOptions) -> Result<SessionRecord> {
        for existing in self.store.list_all()? {
            if existing.issue.number == issue_number && !existing.status.is_terminal() {
                return Err(AtelierError::IssueAlreadyActive {
                    session_id: existing.session_id,
                });
            }
        }
        if !self.spawner.available().await {
            return Err(AtelierError::SpawnerUnavailable {
                name: self.spawner.name().to_string(),
            });
        }

        let issue = match self.github.fetch_issue(issue_number).await {
            IssueFetch::Found(issue) => issue,
            IssueFetch::Failed { stderr } => {
                return Err(AtelierError::IssueFetchFailed {
                    issue: issue_number,
                    stderr,
                })
            }
        };
        self.spawn_with_issue(issue, options).await
    }

    /// Spawn a session for an already-fetched issue.
    pub async fn spawn_with_issue(
        &self,
        issue: IssueRef,
        options: SpawnOptions,
    ) -> Result<SessionRecord> {
        let session_id = issue.number.to_string();
        let lock = self.session_lock(&session_id);
        let guard = lock.lock().await;

        // One non-terminal session per issue number.
        for existing in self.store.list_all()? {
            if existing.issue.number == issue.number && !existing.status.is_terminal() {
                return Err(AtelierError::IssueAlreadyActive {
                    session_id: existing.session_id,
                });
            }
        }
        // A finished record with the same id gets garbage-collected now.
        if let Some(old) = self.store.load(&session_id) {
            if old.status.is_terminal() {
                self.store.delete(&session_id)?;
                self.emit(SessionEventKind::Removed, &session_id, None);
            }
        }

        if !self.spawner.available().await {
            return Err(AtelierError::SpawnerUnavailable {
                name: self.spawner.name().to_string(),
            });
        }

        let branch = Self::branch_name(issue.number);
        let worktree = self.worktree_path(issue.number);

        // A pre-existing worktree nobody owns must be reconciled by the
        // caller; never silently reclaim it.
        if worktree.exists() && GitGateway::is_working_copy(&worktree) {
            let referenced = self
                .store
                .list_all()?
                .iter()
                .any(|r| r.worktree_path == worktree);
            if !referenced {
                let recovered = store::read_session_context(&worktree).map(|ctx| ctx.session_id);
                return Err(AtelierError::OrphanDetected {
                    path: worktree,
                    session_id: recovered,
                });
            }
        }

        let created = self
            .git
            .create_working_copy(&worktree, &branch, &self.repo.base_branch)
            .await;
        if !created.success {
            return Err(AtelierError::Git(
                created.error.unwrap_or_else(|| "worktree creation failed".to_string()),
            ));
        }

        let mode = options.mode.unwrap_or(self.repo.default_mode);
        let record = SessionRecord::new(&self.repo.id, issue.clone(), &branch, worktree.clone(), mode);

        if let Err(e) = self.seed_worktree(&record, &options.additional_prompt_sections) {
            let _ = self.git.remove_working_copy(&worktree).await;
            return Err(e);
        }

        // Claim the slot before spawning so a concurrent spawn for the
        // same issue sees it.
        self.store.save(&record)?;
        self.emit(SessionEventKind::Added, &session_id, Some(&record));

        let request = self.spawn_request(&record, None);
        // Spawning can take seconds; do not hold the session lock.
        drop(guard);
        let outcome = self.spawner.spawn(request).await;
        let _guard = lock.lock().await;

        if !outcome.success {
            // Roll back: no record survives a failed spawn.
            self.store.delete(&session_id)?;
            self.emit(SessionEventKind::Removed, &session_id, None);
            let _ = self.git.remove_working_copy(&worktree).await;
            return Err(AtelierError::Spawner(
                outcome.error.unwrap_or_else(|| "spawn failed".to_string()),
            ));
        }

        let mut record = self.store.load(&session_id).unwrap_or(record);
        record.spawn_id = outcome.spawn_id;
        record.status = SessionStatus::Working;
        record.last_heartbeat = Utc::now();
        self.store.save(&record)?;
        self.emit(SessionEventKind::Updated, &session_id, Some(&record));

        tracing::info!(
            repo_id = %self.repo.id,
            session_id = %session_id,
            branch = %record.branch_name,
            "session spawned"
        );
        Ok(record)
    }

    /// Write the plan, prompt, context, and initial dynamic state into a
    /// fresh worktree.
    fn seed_worktree(&self, record: &SessionRecord, extra_sections: &[String]) -> Result<()> {
        let worktree = &record.worktree_path;
        std::fs::write(
            worktree.join(PLAN_FILE),
            if record.issue.body.is_empty() {
                format!("# {}\n", record.issue.title)
            } else {
                record.issue.body.clone()
            },
        )?;

        let body = prompt::render(&PromptInputs {
            owner: &self.repo.github_owner,
            repo: &self.repo.github_repo,
            issue: &record.issue,
            branch_name: &record.branch_name,
            worktree_path: worktree,
            mode: record.mode,
            additional_sections: extra_sections,
        });
        let prompt_path = Self::prompt_path(worktree);
        std::fs::create_dir_all(prompt_path.parent().unwrap_or(worktree))?;
        std::fs::write(&prompt_path, &body)?;

        store::write_session_context(
            worktree,
            &SessionContext {
                session_id: record.session_id.clone(),
                repo_id: self.repo.id.clone(),
                issue_number: record.issue.number,
                branch_name: record.branch_name.clone(),
                worktree_path: worktree.clone(),
                github_owner: self.repo.github_owner.clone(),
                github_repo: self.repo.github_repo.clone(),
                heartbeat_command: format!("atelier heartbeat {}", record.session_id),
                update_command: format!("atelier ack {}", record.session_id),
            },
        )?;

        store::write_session_state(
            worktree,
            &SessionDynamicState {
                status: record.status,
                forwarded_message: None,
                last_updated: Utc::now(),
            },
        )?;
        Ok(())
    }

    fn spawn_request(&self, record: &SessionRecord, iteration: Option<u32>) -> SpawnRequest {
        let prompt_path = Self::prompt_path(&record.worktree_path);
        let prompt_content = std::fs::read_to_string(&prompt_path).unwrap_or_default();
        SpawnRequest {
            session_id: record.session_id.clone(),
            issue: record.issue.clone(),
            working_directory: record.worktree_path.clone(),
            prompt_file_path: prompt_path,
            prompt_content,
            github_owner: self.repo.github_owner.clone(),
            github_repo: self.repo.github_repo.clone(),
            iteration,
            use_pty: false,
        }
    }

    /// Re-spawn the worker for an existing session.
    pub async fn restart(&self, session_id: &str, iteration: Option<u32>) -> Result<SessionRecord> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let mut record = self
            .store
            .load(session_id)
            .ok_or_else(|| AtelierError::SessionNotFound(session_id.to_string()))?;
        if record.status.is_terminal() || record.status.is_deletion_in_progress() {
            return Err(AtelierError::InvalidState(format!(
                "{} is {} and cannot be restarted",
                session_id, record.status
            )));
        }
        if !record.worktree_path.exists() {
            return Err(AtelierError::WorkingCopyMissing {
                path: record.worktree_path.clone(),
            });
        }
        let prompt_path = Self::prompt_path(&record.worktree_path);
        if !prompt_path.exists() {
            return Err(AtelierError::PromptMissing { path: prompt_path });
        }

        let outcome = self.spawner.spawn(self.spawn_request(&record, iteration)).await;
        if !outcome.success {
            return Err(AtelierError::Spawner(
                outcome.error.unwrap_or_else(|| "spawn failed".to_string()),
            ));
        }

        record.spawn_id = outcome.spawn_id;
        record.status = SessionStatus::Working;
        record.stuck_reason = None;
        record.last_heartbeat = Utc::now();
        self.store.save(&record)?;
        self.emit(SessionEventKind::Updated, session_id, Some(&record));

        tracing::info!(
            repo_id = %self.repo.id,
            session_id,
            iteration = ?iteration,
            "session restarted"
        );
        Ok(record)
    }

    pub fn list(&self) -> Result<Vec<SessionRecord>> {
        self.store.list_all()
    }

    pub fn list_running(&self) -> Result<Vec<SessionRecord>> {
        Ok(self
            .store
            .list_all()?
            .into_iter()
            .filter(|r| r.status.is_active())
            .collect())
    }

    /// Listings with the worktree-missing flag. Sessions are never
    /// auto-deleted; `cleanup_info` is retained for compatibility only.
    pub fn list_with_cleanup_info(&self) -> Result<Vec<SessionListing>> {
        Ok(self
            .store
            .list_all()?
            .into_iter()
            .map(|record| SessionListing {
                worktree_missing: !record.worktree_path.exists(),
                cleanup_info: Vec::new(),
                record,
            })
            .collect())
    }

    pub fn get(&self, session_id: &str) -> Option<SessionRecord> {
        self.store.load(session_id)
    }

    pub fn get_by_pull_request(&self, pr_number: u64) -> Result<Option<SessionRecord>> {
        Ok(self
            .store
            .list_all()?
            .into_iter()
            .find(|r| r.pr_number() == Some(pr_number)))
    }

    /// Apply a status change. `stuck_reason` is set only when the new
    /// status is `stuck`.
    pub async fn update(
        &self,
        session_id: &str,
        new_status: SessionStatus,
        options: UpdateOptions,
    ) -> Result<SessionRecord> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let mut record = self
            .store
            .load(session_id)
            .ok_or_else(|| AtelierError::SessionNotFound(session_id.to_string()))?;
        record.status = new_status;
        record.stuck_reason = if new_status == SessionStatus::Stuck {
            options.reason
        } else {
            None
        };
        if let Some(url) = options.pr_url {
            record.pr_url = Some(url);
        }
        record.last_heartbeat = Utc::now();
        self.store.save(&record)?;
        self.emit(SessionEventKind::Updated, session_id, Some(&record));
        Ok(record)
    }

    pub async fn pause(&self, session_id: &str) -> Result<SessionRecord> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let mut record = self
            .store
            .load(session_id)
            .ok_or_else(|| AtelierError::SessionNotFound(session_id.to_string()))?;
        if record.status.is_terminal() || record.status.is_deletion_in_progress() {
            return Err(AtelierError::InvalidState(format!(
                "{} is {} and cannot be paused",
                session_id, record.status
            )));
        }
        if record.status == SessionStatus::Paused {
            return Ok(record);
        }
        record.status = SessionStatus::Paused;
        record.stuck_reason = None;
        record.last_heartbeat = Utc::now();
        self.store.save(&record)?;
        self.emit(SessionEventKind::Updated, session_id, Some(&record));
        Ok(record)
    }

    pub async fn resume(&self, session_id: &str) -> Result<SessionRecord> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let mut record = self
            .store
            .load(session_id)
            .ok_or_else(|| AtelierError::SessionNotFound(session_id.to_string()))?;
        if record.status.is_terminal() || record.status.is_deletion_in_progress() {
            return Err(AtelierError::InvalidState(format!(
                "{} is {} and cannot be resumed",
                session_id, record.status
            )));
        }
        if record.status != SessionStatus::Paused {
            return Ok(record);
        }
        record.status = SessionStatus::Working;
        record.stuck_reason = None;
        record.last_heartbeat = Utc::now();
        self.store.save(&record)?;
        self.emit(SessionEventKind::Updated, session_id, Some(&record));
        Ok(record)
    }

    /// Set a forwarded message on the record and mirror it into the
    /// worktree's dynamic state so a running worker can pick it up.
    pub async fn forward(&self, session_id: &str, message: &str) -> Result<SessionRecord> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let mut record = self
            .store
            .load(session_id)
            .ok_or_else(|| AtelierError::SessionNotFound(session_id.to_string()))?;
        if record.status.is_terminal() || record.status.is_deletion_in_progress() {
            return Err(AtelierError::InvalidState(format!(
                "{} is {} and cannot receive messages",
                session_id, record.status
            )));
        }
        record.forwarded_message = Some(message.to_string());
        record.last_heartbeat = Utc::now();
        self.store.save(&record)?;
        self.write_dynamic_state(&record);
        self.emit(SessionEventKind::Updated, session_id, Some(&record));
        Ok(record)
    }

    pub async fn heartbeat(&self, session_id: &str) -> Result<HeartbeatResult> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let mut record = self
            .store
            .load(session_id)
            .ok_or_else(|| AtelierError::SessionNotFound(session_id.to_string()))?;
        record.last_heartbeat = Utc::now();
        self.store.save(&record)?;
        self.emit(SessionEventKind::Updated, session_id, Some(&record));
        Ok(HeartbeatResult {
            recorded: true,
            has_message: record.forwarded_message.is_some(),
        })
    }

    /// Clear a pending forwarded message. No-op when none is pending.
    pub async fn acknowledge_message(&self, session_id: &str) -> Result<SessionRecord> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let mut record = self
            .store
            .load(session_id)
            .ok_or_else(|| AtelierError::SessionNotFound(session_id.to_string()))?;
        if record.forwarded_message.is_none() {
            return Ok(record);
        }
        record.forwarded_message = None;
        record.last_heartbeat = Utc::now();
        self.store.save(&record)?;
        self.write_dynamic_state(&record);
        self.emit(SessionEventKind::Updated, session_id, Some(&record));
        Ok(record)
    }

    fn write_dynamic_state(&self, record: &SessionRecord) {
        if !record.worktree_path.exists() {
            return;
        }
        let state = SessionDynamicState {
            status: record.status,
            forwarded_message: record.forwarded_message.clone(),
            last_updated: Utc::now(),
        };
        if let Err(e) = store::write_session_state(&record.worktree_path, &state) {
            tracing::warn!(
                session_id = %record.session_id,
                error = %e,
                "failed to write worktree state"
            );
        }
    }

    /// Safe-deletion protocol:
    /// 1. already deleting and not forcing → in-progress;
    /// 2. active + worktree removal requested → persist `cancelled`,
    ///    wait the grace period, escalate to `Spawner::stop` if needed;
    /// 3. transition to `deleting`, stashing the previous status;
    /// 4. remove the worktree (failure → `deletion_failed`);
    /// 5. delete branches per mode;
    /// 6. delete the record.
    pub async fn delete(&self, session_id: &str, options: DeleteOptions) -> Result<DeleteResult> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let mut record = self
            .store
            .load(session_id)
            .ok_or_else(|| AtelierError::SessionNotFound(session_id.to_string()))?;

        if record.status == SessionStatus::Deleting && !options.force {
            return Ok(DeleteResult {
                success: false,
                in_progress: true,
                worktree_removed: false,
                record_removed: false,
                error: Some("deletion already in progress".to_string()),
                orphaned_worktree_path: None,
            });
        }

        // Stash the pre-deletion status; keep the original through retries.
        let stashed = if record.status.is_deletion_in_progress() {
            record.previous_status
        } else {
            Some(record.status)
        };

        if record.status.is_active() && !options.keep_working_copy {
            record.status = SessionStatus::Cancelled;
            record.last_heartbeat = Utc::now();
            self.store.save(&record)?;
            self.write_dynamic_state(&record);
            self.emit(SessionEventKind::Updated, session_id, Some(&record));

            tokio::time::sleep(self.cancel_grace).await;

            // Cooperative exit did not happen in time; escalate.
            if let Some(spawn_id) = record.spawn_id.clone() {
                if self.spawner.status(&spawn_id).await.running {
                    tracing::info!(session_id, spawn_id = %spawn_id, "worker still running, stopping");
                    self.spawner.stop(&spawn_id).await;
                }
            }
        }

        record.status = SessionStatus::Deleting;
        record.previous_status = stashed;
        record.last_heartbeat = Utc::now();
        self.store.save(&record)?;
        self.emit(SessionEventKind::Updated, session_id, Some(&record));

        let mut worktree_removed = false;
        if !options.keep_working_copy {
            let removed: RemoveResult = self.git.remove_working_copy(&record.worktree_path).await;
            if !removed.success && !options.force {
                let error = removed
                    .error
                    .unwrap_or_else(|| "worktree removal failed".to_string());
                record.status = SessionStatus::DeletionFailed;
                record.deletion_error = Some(error.clone());
                record.last_heartbeat = Utc::now();
                self.store.save(&record)?;
                self.emit(SessionEventKind::Updated, session_id, Some(&record));
                return Ok(DeleteResult {
                    success: false,
                    in_progress: false,
                    worktree_removed: false,
                    record_removed: false,
                    error: Some(error),
                    orphaned_worktree_path: Some(record.worktree_path.clone()),
                });
            }
            worktree_removed = removed.success;
        }

        if matches!(
            options.deletion_mode,
            DeletionMode::WithLocalBranch | DeletionMode::Everything
        ) {
            let local = self.git.delete_local_branch(&record.branch_name, true).await;
            if !local.success {
                tracing::warn!(
                    session_id,
                    branch = %record.branch_name,
                    error = ?local.error,
                    "local branch deletion failed"
                );
            }
            if options.deletion_mode == DeletionMode::Everything {
                let remote = self.git.delete_remote_branch(&record.branch_name).await;
                if !remote.success {
                    tracing::warn!(
                        session_id,
                        branch = %record.branch_name,
                        error = ?remote.error,
                        "remote branch deletion failed"
                    );
                }
            }
        }

        self.store.delete(session_id)?;
        self.emit(SessionEventKind::Removed, session_id, None);

        tracing::info!(repo_id = %self.repo.id, session_id, "session deleted");
        Ok(DeleteResult {
            success: true,
            in_progress: false,
            worktree_removed,
            record_removed: true,
            error: None,
            orphaned_worktree_path: None,
        })
    }

    /// Re-run deletion for a session stuck in `deletion_failed`.
    pub async fn retry_delete(
        &self,
        session_id: &str,
        options: DeleteOptions,
    ) -> Result<DeleteResult> {
        let record = self
            .store
            .load(session_id)
            .ok_or_else(|| AtelierError::SessionNotFound(session_id.to_string()))?;
        if record.status != SessionStatus::DeletionFailed {
            return Err(AtelierError::NotInDeletionFailedState(session_id.to_string()));
        }
        self.delete(session_id, options).await
    }

    /// Restore a `deletion_failed` session to its pre-deletion status.
    pub async fn rollback_deletion(&self, session_id: &str) -> Result<SessionRecord> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let mut record = self
            .store
            .load(session_id)
            .ok_or_else(|| AtelierError::SessionNotFound(session_id.to_string()))?;
        if record.status != SessionStatus::DeletionFailed {
            return Err(AtelierError::NotInDeletionFailedState(session_id.to_string()));
        }
        record.status = record.previous_status.unwrap_or(SessionStatus::Stuck);
        record.previous_status = None;
        record.deletion_error = None;
        record.last_heartbeat = Utc::now();
        self.store.save(&record)?;
        self.emit(SessionEventKind::Updated, session_id, Some(&record));
        Ok(record)
    }

    /// Remove a worktree that has no live session. Refuses paths that are
    /// not git worktrees and worktrees whose embedded context names a
    /// session that still exists.
    pub async fn cleanup_orphan(&self, path: &Path) -> CleanupResult {
        if !path.exists() {
            return CleanupResult {
                success: true,
                error: None,
                not_found: true,
            };
        }
        if !GitGateway::is_working_copy(path) {
            return CleanupResult {
                success: false,
                error: Some(format!("{} is not a git working copy", path.display())),
                not_found: false,
            };
        }
        if let Some(ctx) = store::read_session_context(path) {
            if self.store.exists(&ctx.session_id) {
                return CleanupResult {
                    success: false,
                    error: Some(format!(
                        "session {} still exists; delete it instead",
                        ctx.session_id
                    )),
                    not_found: false,
                };
            }
        }
        let removed = self.git.remove_working_copy(path).await;
        CleanupResult {
            success: removed.success,
            error: removed.error,
            not_found: removed.not_found,
        }
    }

    pub async fn get_worktree_status(&self, session_id: &str) -> Result<DiffStatus> {
        let record = self
            .store
            .load(session_id)
            .ok_or_else(|| AtelierError::SessionNotFound(session_id.to_string()))?;
        Ok(self
            .git
            .diff_status(&record.worktree_path, &self.repo.base_branch)
            .await)
    }

    pub fn get_worktree_state(&self, session_id: &str) -> Result<Option<SessionDynamicState>> {
        let record = self
            .store
            .load(session_id)
            .ok_or_else(|| AtelierError::SessionNotFound(session_id.to_string()))?;
        Ok(store::read_session_state(&record.worktree_path))
    }

    pub async fn get_worker_status(&self, spawn_id: &str) -> WorkerStatus {
        self.spawner.status(spawn_id).await
    }

    /// Whether the session's heartbeat is older than the staleness
    /// threshold.
    pub fn is_stale(&self, record: &SessionRecord) -> bool {
        let age = Utc::now().signed_duration_since(record.last_heartbeat);
        age.to_std().map(|d| d > self.stale_after).unwrap_or(false)
    }
}
