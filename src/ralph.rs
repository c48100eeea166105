//! Iterative controller - the ralph loop
//!
//! Drives autonomous sessions through bounded re-spawn cycles. A single
//! cooperative ticker sweeps every active loop: polls worker liveness,
//! reads the exit marker the worker leaves behind, evaluates the promise
//! and done signal, runs commit/push hooks, and gates completion behind
//! an external review agent before a pull request goes out.

use crate::config::{DoneSignalConfig, GitOperationsConfig, PromiseConfig, RalphConfig};
use crate::manager::{SessionManager, UpdateOptions};
use crate::session::{SessionRecord, SessionStatus, WorkerMarker, WORKTREE_META_DIR};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;

/// Feedback file the next worker spawn reads after a NEEDS_WORK verdict.
pub const REVIEW_FEEDBACK_FILE: &str = "review-feedback.md";

/// How one worker run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitType {
    Running,
    Clean,
    Abnormal,
    PromiseMet,
}

/// One pass of the bounded re-spawn loop.
#[derive(Debug, Clone)]
pub struct IterationAttempt {
    /// 1-indexed.
    pub iteration: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_type: ExitType,
    pub done_signal_detected: bool,
    pub status_at_end: Option<SessionStatus>,
}

/// Loop lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Waiting,
    Reviewing,
    Done,
    Stuck,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewVerdict {
    Approved,
    NeedsWork,
}

/// Outcome of a commit or push hook. Failures never abort the loop.
#[derive(Debug, Clone)]
pub struct GitOpOutcome {
    pub kind: GitOutcomeKind,
    pub message: String,
    pub iteration: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitOutcomeKind {
    Success,
    NoChanges,
    Failed,
}

/// In-memory per-session loop record. Never persisted.
#[derive(Debug, Clone)]
pub struct IterationState {
    pub repo_id: String,
    pub session_id: String,
    pub current_iteration: u32,
    pub target_iterations: u32,
    pub state: LoopState,
    pub iterations: Vec<IterationAttempt>,
    pub consecutive_failures: u32,
    pub failed_iterations: u32,
    pub review_cycle: u32,
    pub last_review_verdict: Option<ReviewVerdict>,
    pub last_completed_task_count: usize,
    pub last_commit: Option<GitOpOutcome>,
    pub last_push: Option<GitOpOutcome>,
    pub last_checked: Option<DateTime<Utc>>,
    /// When a waiting loop should start its next iteration.
    resume_at: Option<DateTime<Utc>>,
}

impl IterationState {
    fn new(repo_id: String, session_id: String, target_iterations: u32) -> Self {
        Self {
            repo_id,
            session_id,
            current_iteration: 1,
            target_iterations,
            state: LoopState::Running,
            iterations: vec![IterationAttempt {
                iteration: 1,
                started_at: Utc::now(),
                ended_at: None,
                exit_type: ExitType::Running,
                done_signal_detected: false,
                status_at_end: None,
            }],
            consecutive_failures: 0,
            failed_iterations: 0,
            review_cycle: 0,
            last_review_verdict: None,
            last_completed_task_count: 0,
            last_commit: None,
            last_push: None,
            last_checked: None,
            resume_at: None,
        }
    }
}

/// Loop event delivered synchronously to subscribers.
#[derive(Debug, Clone)]
pub struct LoopEvent {
    pub kind: LoopEventKind,
    pub repo_id: String,
    pub session_id: String,
    pub iteration: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEventKind {
    IterationStart,
    IterationEnd,
    LoopDone,
    LoopStuck,
}

/// Structured verdict from the review agent. Free-text agents fall back
/// to keyword detection.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ReviewOutcome {
    pub verdict: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub required_changes: Vec<String>,
    #[serde(default)]
    pub issues: Vec<ReviewIssue>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ReviewIssue {
    #[serde(default)]
    pub severity: String,
    pub description: String,
}

type LoopKey = (String, String);
type LoopCallback = Box<dyn Fn(&LoopEvent) + Send + Sync>;

/// The iterative controller. One per process; sessions register by
/// `(repo_id, session_id)`.
pub struct RalphController {
    config: RalphConfig,
    managers: HashMap<String, Arc<SessionManager>>,
    states: Mutex<HashMap<LoopKey, IterationState>>,
    subscribers: Mutex<Vec<LoopCallback>>,
    /// Held for the duration of one sweep; two sweeps never overlap.
    sweep_gate: tokio::sync::Mutex<()>,
    /// Back-reference for spawning review tasks.
    weak_self: std::sync::Weak<RalphController>,
}

impl RalphController {
    pub fn new(config: RalphConfig, managers: HashMap<String, Arc<SessionManager>>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            managers,
            states: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            sweep_gate: tokio::sync::Mutex::new(()),
            weak_self: weak.clone(),
        })
    }

    pub fn subscribe(&self, callback: impl Fn(&LoopEvent) + Send + Sync + 'static) {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner()).push(Box::new(callback));
    }

    fn emit(&self, kind: LoopEventKind, key: &LoopKey, iteration: u32) {
        let event = LoopEvent {
            kind,
            repo_id: key.0.clone(),
            session_id: key.1.clone(),
            iteration,
        };
        let subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        for callback in subs.iter() {
            if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                tracing::error!(session_id = %event.session_id, "loop event subscriber panicked");
            }
        }
    }

    /// Start driving a session. Call after a successful autonomous spawn.
    pub fn register(&self, repo_id: &str, session_id: &str) {
        let key = (repo_id.to_string(), session_id.to_string());
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.entry(key.clone()).or_insert_with(|| {
            tracing::info!(repo_id, session_id, "iteration loop registered");
            IterationState::new(key.0.clone(), key.1.clone(), self.config.max_iterations)
        });
    }

    /// Stop driving a session and forget its loop state.
    pub fn unregister(&self, repo_id: &str, session_id: &str) {
        let key = (repo_id.to_string(), session_id.to_string());
        if self.states.lock().unwrap_or_else(|e| e.into_inner()).remove(&key).is_some() {
            tracing::info!(repo_id, session_id, "iteration loop unregistered");
        }
    }

    pub fn state_of(&self, repo_id: &str, session_id: &str) -> Option<IterationState> {
        let key = (repo_id.to_string(), session_id.to_string());
        self.states.lock().unwrap_or_else(|e| e.into_inner()).get(&key).cloned()
    }

    pub fn list_states(&self) -> Vec<IterationState> {
        self.states.lock().unwrap_or_else(|e| e.into_inner()).values().cloned().collect()
    }

    /// Spawn the poll ticker. Ticks that arrive while a sweep is still
    /// running are skipped rather than queued.
    pub fn spawn_ticker(&self) -> tokio::task::JoinHandle<()> {
        let Some(controller) = self.weak_self.upgrade() else {
            return tokio::spawn(async {});
        };
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                controller.sweep().await;
            }
        })
    }

    /// One full pass over all registered loops.
    pub async fn sweep(&self) {
        let Ok(_gate) = self.sweep_gate.try_lock() else {
            tracing::debug!("previous sweep still running, skipping tick");
            return;
        };

        let snapshot: Vec<(LoopKey, LoopState, Option<DateTime<Utc>>)> = {
            let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
            states
                .iter()
                .map(|(k, s)| (k.clone(), s.state, s.resume_at))
                .collect()
        };

        for (key, state, resume_at) in snapshot {
            let result = match state {
                LoopState::Running => self.poll_running(&key).await,
                LoopState::Waiting => {
                    let due = resume_at.map(|at| at <= Utc::now()).unwrap_or(true);
                    if due {
                        self.start_next_iteration(&key).await
                    } else {
                        Ok(())
                    }
                }
                LoopState::Paused => {
                    self.poll_paused(&key);
                    Ok(())
                }
                // Reviewing loops are owned by their review task; Done
                // and Stuck loops have nothing to poll.
                _ => Ok(()),
            };
            // A sweep failure is a controller bug; log it and keep
            // sweeping the other sessions.
            if let Err(e) = result {
                tracing::error!(
                    repo_id = %key.0,
                    session_id = %key.1,
                    error = %e,
                    "sweep failed for session"
                );
            }
        }
    }

    async fn poll_running(&self, key: &LoopKey) -> crate::Result<()> {
        let Some(manager) = self.managers.get(&key.0) else {
            self.mark_stuck(key, "Repository no longer configured").await;
            return Ok(());
        };

        let Some(record) = manager.get(&key.1) else {
            self.mark_stuck(key, "Session no longer exists").await;
            return Ok(());
        };

        {
            let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(state) = states.get_mut(key) {
                state.last_checked = Some(Utc::now());
            }
        }

        // A paused session keeps its worker and loop state frozen; the
        // loop wakes back up when the session resumes.
        if record.status == SessionStatus::Paused {
            let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(state) = states.get_mut(key) {
                state.state = LoopState::Paused;
            }
            return Ok(());
        }

        let running = match &record.spawn_id {
            Some(spawn_id) => manager.get_worker_status(spawn_id).await.running,
            None => false,
        };

        if !running {
            return self.worker_stopped(key, manager.clone(), record).await;
        }

        if self.done_signal_met(&record) {
            self.note_done_signal(key);
            return self.handle_loop_done(key, manager.clone(), record).await;
        }

        match record.status {
            SessionStatus::Stuck => {
                self.mark_stuck(key, "Session reported stuck").await;
            }
            SessionStatus::Cancelled => {
                tracing::info!(session_id = %key.1, "session cancelled, stopping loop");
                self.unregister(&key.0, &key.1);
            }
            _ => {}
        }
        Ok(())
    }

    /// The worker process is gone; decide what its exit meant.
    async fn worker_stopped(
        &self,
        key: &LoopKey,
        manager: Arc<SessionManager>,
        record: SessionRecord,
    ) -> crate::Result<()> {
        let marker = take_worker_marker(&record.worktree_path);

        match marker {
            Some(WorkerMarker::Complete) => {
                self.finish_attempt(key, ExitType::Clean, record.status);
                self.run_git_operations(key, &record).await;
                self.enter_review_phase(key, manager, record);
                Ok(())
            }
            Some(WorkerMarker::TaskDone) => {
                self.finish_attempt(key, ExitType::Clean, record.status);
                self.run_git_operations(key, &record).await;
                let iteration = self.current_iteration(key);
                self.emit(LoopEventKind::IterationEnd, key, iteration);
                self.schedule_next(key);
                Ok(())
            }
            None => {
                // No marker: check whether the goal was reached anyway.
                if self.promise_met(&record.worktree_path).await {
                    self.finish_attempt(key, ExitType::PromiseMet, record.status);
                    self.run_git_operations(key, &record).await;
                    self.enter_review_phase(key, manager, record);
                    return Ok(());
                }

                // A worker that gave up leaves a note at the worktree root.
                if let Ok(note) = std::fs::read_to_string(record.worktree_path.join(".stuck")) {
                    self.finish_attempt(key, ExitType::Abnormal, record.status);
                    self.mark_stuck(key, &format!("worker gave up: {}", note.trim()))
                        .await;
                    return Ok(());
                }

                self.finish_attempt(key, ExitType::Abnormal, record.status);
                let (failed, target) = {
                    let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
                    let Some(state) = states.get_mut(key) else {
                        return Ok(());
                    };
                    state.failed_iterations += 1;
                    state.consecutive_failures += 1;
                    (state.failed_iterations, state.target_iterations)
                };
                if failed >= target {
                    self.mark_stuck(
                        key,
                        &format!("worker exited without marker {} times", failed),
                    )
                    .await;
                } else {
                    tracing::warn!(
                        session_id = %key.1,
                        failed_iterations = failed,
                        "worker exited without marker, respawning"
                    );
                    self.schedule_next(key);
                }
                Ok(())
            }
        }
    }

    /// Wake a paused loop once its session is no longer paused.
    fn poll_paused(&self, key: &LoopKey) {
        let Some(manager) = self.managers.get(&key.0) else {
            return;
        };
        let Some(record) = manager.get(&key.1) else {
            return;
        };
        if record.status != SessionStatus::Paused {
            let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(state) = states.get_mut(key) {
                if state.state == LoopState::Paused {
                    state.state = LoopState::Running;
                }
            }
        }
    }

    /// Start the next iteration immediately for a waiting loop, skipping
    /// the remaining delay.
    pub async fn force_next_iteration(
        &self,
        repo_id: &str,
        session_id: &str,
    ) -> crate::Result<()> {
        let key = (repo_id.to_string(), session_id.to_string());
        let waiting = self
            .states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .map(|s| s.state == LoopState::Waiting)
            .unwrap_or(false);
        if !waiting {
            return Err(crate::AtelierError::LoopNotWaiting(session_id.to_string()));
        }
        self.start_next_iteration(&key).await
    }

    fn current_iteration(&self, key: &LoopKey) -> u32 {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|s| s.current_iteration)
            .unwrap_or(0)
    }

    fn finish_attempt(&self, key: &LoopKey, exit_type: ExitType, status: SessionStatus) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = states.get_mut(key) {
            if let Some(attempt) = state.iterations.last_mut() {
                attempt.ended_at = Some(Utc::now());
                attempt.exit_type = exit_type;
                attempt.status_at_end = Some(status);
            }
        }
    }

    fn note_done_signal(&self, key: &LoopKey) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = states.get_mut(key) {
            if let Some(attempt) = state.iterations.last_mut() {
                attempt.done_signal_detected = true;
            }
        }
    }

    /// Move to `waiting`; the next sweep past the delay starts the next
    /// iteration.
    fn schedule_next(&self, key: &LoopKey) {
        let delay = chrono::Duration::milliseconds(self.config.iteration_delay_ms as i64);
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = states.get_mut(key) {
            state.state = LoopState::Waiting;
            state.resume_at = Some(Utc::now() + delay);
        }
    }

    /// Begin the next iteration: bump the counter, push a fresh attempt,
    /// and re-spawn the worker through the session manager.
    async fn start_next_iteration(&self, key: &LoopKey) -> crate::Result<()> {
        let Some(manager) = self.managers.get(&key.0) else {
            self.mark_stuck(key, "Repository no longer configured").await;
            return Ok(());
        };

        let iteration = {
            let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
            let Some(state) = states.get_mut(key) else {
                return Ok(());
            };
            state.current_iteration += 1;
            state.consecutive_failures = 0;
            state.state = LoopState::Running;
            state.resume_at = None;
            state.iterations.push(IterationAttempt {
                iteration: state.current_iteration,
                started_at: Utc::now(),
                ended_at: None,
                exit_type: ExitType::Running,
                done_signal_detected: false,
                status_at_end: None,
            });
            state.current_iteration
        };

        self.emit(LoopEventKind::IterationStart, key, iteration);

        if let Err(e) = manager.restart(&key.1, Some(iteration)).await {
            self.mark_stuck(key, &format!("restart failed: {}", e)).await;
        }
        Ok(())
    }

    async fn handle_loop_done(
        &self,
        key: &LoopKey,
        _manager: Arc<SessionManager>,
        record: SessionRecord,
    ) -> crate::Result<()> {
        self.run_git_operations(key, &record).await;
        let iteration = self.current_iteration(key);
        {
            let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(state) = states.get_mut(key) {
                state.state = LoopState::Done;
            }
        }
        self.emit(LoopEventKind::LoopDone, key, iteration);
        tracing::info!(session_id = %key.1, "iteration loop done");
        Ok(())
    }

    async fn mark_stuck(&self, key: &LoopKey, reason: &str) {
        let iteration = self.current_iteration(key);
        {
            let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(state) = states.get_mut(key) {
                state.state = LoopState::Stuck;
            }
        }
        if let Some(manager) = self.managers.get(&key.0) {
            if manager.get(&key.1).is_some() {
                let _ = manager
                    .update(
                        &key.1,
                        SessionStatus::Stuck,
                        UpdateOptions {
                            reason: Some(reason.to_string()),
                            pr_url: None,
                        },
                    )
                    .await;
            }
        }
        tracing::warn!(session_id = %key.1, reason, "iteration loop stuck");
        self.emit(LoopEventKind::LoopStuck, key, iteration);
    }

    /// Commit/push hooks. Outcomes are recorded on the loop state;
    /// failures never abort the loop.
    async fn run_git_operations(&self, key: &LoopKey, record: &SessionRecord) {
        let ops: &GitOperationsConfig = &self.config.git_operations;
        let Some(manager) = self.managers.get(&key.0) else {
            return;
        };
        let git = manager.git();
        let worktree = &record.worktree_path;
        let iteration = self.current_iteration(key);

        if ops.commit_after_each {
            let outcome = {
                let staged = git.stage_all(worktree).await;
                if !staged.success {
                    GitOpOutcome {
                        kind: GitOutcomeKind::Failed,
                        message: staged.error.unwrap_or_default(),
                        iteration,
                    }
                } else if !git.has_staged_changes(worktree).await {
                    GitOpOutcome {
                        kind: GitOutcomeKind::NoChanges,
                        message: String::new(),
                        iteration,
                    }
                } else {
                    let message = format!("chore: ralph iteration {}", iteration);
                    let committed = git.commit(worktree, &message).await;
                    if committed.success {
                        GitOpOutcome {
                            kind: GitOutcomeKind::Success,
                            message,
                            iteration,
                        }
                    } else {
                        GitOpOutcome {
                            kind: GitOutcomeKind::Failed,
                            message: committed.error.unwrap_or_default(),
                            iteration,
                        }
                    }
                }
            };
            if outcome.kind == GitOutcomeKind::Failed {
                tracing::warn!(session_id = %key.1, message = %outcome.message, "iteration commit failed");
            }
            let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(state) = states.get_mut(key) {
                state.last_commit = Some(outcome);
            }
        }

        if ops.push_after_each {
            let pushed = git.push(worktree, &record.branch_name).await;
            let outcome = GitOpOutcome {
                kind: if pushed.success {
                    GitOutcomeKind::Success
                } else {
                    GitOutcomeKind::Failed
                },
                message: pushed.error.unwrap_or_default(),
                iteration,
            };
            if outcome.kind == GitOutcomeKind::Failed {
                tracing::warn!(session_id = %key.1, message = %outcome.message, "iteration push failed");
            }
            let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(state) = states.get_mut(key) {
                state.last_push = Some(outcome);
            }
        }
    }

    /// Hand the session to the review agent in its own task; the ticker
    /// must not wait on it.
    fn enter_review_phase(
        &self,
        key: &LoopKey,
        manager: Arc<SessionManager>,
        record: SessionRecord,
    ) {
        {
            let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(state) = states.get_mut(key) {
                state.state = LoopState::Reviewing;
            }
        }
        let Some(controller) = self.weak_self.upgrade() else {
            return;
        };
        let key = key.clone();
        tokio::spawn(async move {
            controller.run_review(&key, manager, record).await;
        });
    }

    async fn run_review(
        &self,
        key: &LoopKey,
        manager: Arc<SessionManager>,
        record: SessionRecord,
    ) {
        let (owner, repo) = match self.resolve_coordinates(&manager).await {
            Some(pair) => pair,
            None => ("".to_string(), "".to_string()),
        };

        let outcome = self
            .invoke_review_agent(&record, &owner, &repo)
            .await
            .unwrap_or_else(|error| ReviewOutcome {
                verdict: "NEEDS_WORK".to_string(),
                summary: error,
                required_changes: Vec::new(),
                issues: Vec::new(),
            });

        let verdict = if outcome.verdict.to_uppercase().contains("APPROVED") {
            ReviewVerdict::Approved
        } else {
            ReviewVerdict::NeedsWork
        };
        {
            let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(state) = states.get_mut(key) {
                state.last_review_verdict = Some(verdict);
            }
        }

        match verdict {
            ReviewVerdict::Approved => {
                self.handle_approved(key, manager, record, &owner, &repo, &outcome)
                    .await;
            }
            ReviewVerdict::NeedsWork => {
                self.handle_needs_work(key, manager, record, &outcome).await;
            }
        }
    }

    async fn handle_approved(
        &self,
        key: &LoopKey,
        manager: Arc<SessionManager>,
        record: SessionRecord,
        owner: &str,
        repo: &str,
        outcome: &ReviewOutcome,
    ) {
        let coordinates_known = !owner.is_empty() && !repo.is_empty();
        if self.config.git_operations.create_pr_on_complete && coordinates_known {
            let title = format!("{} (#{})", record.issue.title, record.issue.number);
            let summary = if outcome.summary.is_empty() {
                None
            } else {
                Some(outcome.summary.as_str())
            };
            let body = pr_body(record.issue.number, summary, None);
            let pr = manager
                .github()
                .create_pull_request(&record.worktree_path, &record.branch_name, &title, &body)
                .await;
            if pr.success {
                let _ = manager
                    .update(
                        &record.session_id,
                        SessionStatus::PrReady,
                        UpdateOptions {
                            reason: None,
                            pr_url: pr.url.clone(),
                        },
                    )
                    .await;
                manager
                    .github()
                    .post_notification(&format!(
                        "PR ready for {}/{} issue #{}: {}",
                        owner,
                        repo,
                        record.issue.number,
                        pr.url.as_deref().unwrap_or("(url unknown)")
                    ))
                    .await;
            } else {
                tracing::warn!(
                    session_id = %record.session_id,
                    error = ?pr.error,
                    "pull request creation failed"
                );
            }
        }

        let iteration = self.current_iteration(key);
        {
            let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(state) = states.get_mut(key) {
                state.state = LoopState::Done;
            }
        }
        self.emit(LoopEventKind::LoopDone, key, iteration);
        tracing::info!(session_id = %key.1, "review approved, loop done");
    }

    async fn handle_needs_work(
        &self,
        key: &LoopKey,
        manager: Arc<SessionManager>,
        record: SessionRecord,
        outcome: &ReviewOutcome,
    ) {
        let (cycle, max_cycles) = {
            let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
            let Some(state) = states.get_mut(key) else {
                return;
            };
            state.review_cycle += 1;
            (state.review_cycle, self.config.review.max_cycles)
        };

        if cycle >= max_cycles {
            manager
                .github()
                .post_notification(&format!(
                    "Review stuck after {} cycles for issue #{}",
                    cycle, record.issue.number
                ))
                .await;
            self.mark_stuck(key, &format!("review still NEEDS_WORK after {} cycles", cycle))
                .await;
            return;
        }

        if let Err(e) = write_review_feedback(&record.worktree_path, cycle, outcome) {
            tracing::warn!(session_id = %key.1, error = %e, "failed to write review feedback");
        }
        tracing::info!(
            session_id = %key.1,
            review_cycle = cycle,
            "review needs work, scheduling next iteration"
        );
        self.schedule_next(key);
    }

    /// Invoke the external review agent. The command runs through the
    /// shell with the worktree as cwd and the session facts in its
    /// environment, bounded by the configured timeout.
    async fn invoke_review_agent(
        &self,
        record: &SessionRecord,
        owner: &str,
        repo: &str,
    ) -> std::result::Result<ReviewOutcome, String> {
        let timeout = Duration::from_millis(self.config.review.timeout_ms);
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.config.review.agent_command)
            .current_dir(&record.worktree_path)
            .env("REVIEW_WORKTREE", &record.worktree_path)
            .env("REVIEW_OWNER", owner)
            .env("REVIEW_REPO", repo)
            .env("REVIEW_ISSUE", record.issue.number.to_string())
            .env("REVIEW_TIMEOUT_MS", self.config.review.timeout_ms.to_string())
            .stdin(Stdio::null());
        if let Some(prompt_path) = &self.config.review.agent_prompt_path {
            cmd.env("REVIEW_PROMPT_PATH", prompt_path);
        }

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| format!("review agent timed out after {:?}", timeout))?
            .map_err(|e| format!("review agent failed to run: {}", e))?;

        if !output.status.success() {
            return Err(format!(
                "review agent exited {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_review_output(&stdout))
    }

    /// GitHub coordinates from repo config, falling back to the origin
    /// remote URL.
    async fn resolve_coordinates(&self, manager: &SessionManager) -> Option<(String, String)> {
        let repo = manager.repo();
        if !repo.github_owner.is_empty() && !repo.github_repo.is_empty() {
            return Some((repo.github_owner.clone(), repo.github_repo.clone()));
        }
        let url = manager.git().origin_url().await?;
        parse_github_url(&url)
    }

    async fn promise_met(&self, worktree: &Path) -> bool {
        evaluate_promise(&self.config.promise, worktree).await
    }

    fn done_signal_met(&self, record: &SessionRecord) -> bool {
        match &self.config.done_signal {
            DoneSignalConfig::Status { status } => record.status == *status,
            DoneSignalConfig::File { path } => record.worktree_path.join(path).exists(),
            // Reserved: parses, never fires.
            DoneSignalConfig::ExitCode => false,
        }
    }
}

/// Read and consume the worker's exit marker.
fn take_worker_marker(worktree: &Path) -> Option<WorkerMarker> {
    let path = worktree
        .join(WORKTREE_META_DIR)
        .join(crate::session::WORKER_STATUS_FILE);
    let text = std::fs::read_to_string(&path).ok()?;
    if let Err(e) = std::fs::remove_file(&path) {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove worker marker");
    }
    WorkerMarker::parse(&text)
}

/// Evaluate a promise inside a worktree.
pub async fn evaluate_promise(promise: &PromiseConfig, worktree: &Path) -> bool {
    match promise {
        PromiseConfig::PlanComplete { path } => {
            let plan_path = if path.is_absolute() {
                path.clone()
            } else {
                worktree.join(path)
            };
            match std::fs::read_to_string(&plan_path) {
                Ok(text) => {
                    let (total, unchecked) = count_plan_tasks(&text);
                    total > 0 && unchecked == 0
                }
                Err(_) => false,
            }
        }
        PromiseConfig::File { path } => worktree.join(path).exists(),
        PromiseConfig::TestsPass { command } | PromiseConfig::Custom { command } => {
            let result = Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(worktree)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            result.map(|s| s.success()).unwrap_or(false)
        }
    }
}

/// Count `(total, unchecked)` markdown checklist tasks.
pub fn count_plan_tasks(text: &str) -> (usize, usize) {
    let mut total = 0;
    let mut unchecked = 0;
    for line in text.lines() {
        let line = line.trim_start();
        let item = line
            .strip_prefix("- ")
            .or_else(|| line.strip_prefix("* "));
        let Some(item) = item else {
            continue;
        };
        if item.starts_with("[ ]") {
            total += 1;
            unchecked += 1;
        } else if item.starts_with("[x]") || item.starts_with("[X]") {
            total += 1;
        }
    }
    (total, unchecked)
}

/// Extract `(owner, repo)` from a GitHub remote URL.
pub fn parse_github_url(url: &str) -> Option<(String, String)> {
    let re = regex::Regex::new(r"github\.com[:/]([^/]+)/([^/.]+)").ok()?;
    let captures = re.captures(url)?;
    Some((captures[1].to_string(), captures[2].to_string()))
}

/// Pull request body with the closing reference and optional sections.
pub fn pr_body(issue_number: u64, summary: Option<&str>, test_plan: Option<&str>) -> String {
    let mut body = String::new();
    if let Some(summary) = summary {
        body.push_str("## Summary\n\n");
        body.push_str(summary);
        body.push_str("\n\n");
    }
    if let Some(test_plan) = test_plan {
        body.push_str("## Test plan\n\n");
        body.push_str(test_plan);
        body.push_str("\n\n");
    }
    body.push_str(&format!("Closes #{}\n", issue_number));
    body
}

/// Parse the review agent's stdout: structured JSON first, keyword scan
/// as the fallback.
fn parse_review_output(stdout: &str) -> ReviewOutcome {
    if let Ok(outcome) = serde_json::from_str::<ReviewOutcome>(stdout.trim()) {
        return outcome;
    }
    let upper = stdout.to_uppercase();
    let verdict = if upper.contains("APPROVED") && !upper.contains("NEEDS_WORK") {
        "APPROVED"
    } else {
        "NEEDS_WORK"
    };
    ReviewOutcome {
        verdict: verdict.to_string(),
        summary: stdout.trim().to_string(),
        required_changes: Vec::new(),
        issues: Vec::new(),
    }
}

/// Write the feedback the next worker spawn reads before anything else.
fn write_review_feedback(
    worktree: &Path,
    cycle: u32,
    outcome: &ReviewOutcome,
) -> crate::Result<()> {
    let mut text = format!("# Review feedback (cycle {})\n\n", cycle);
    if !outcome.summary.is_empty() {
        text.push_str(&outcome.summary);
        text.push_str("\n\n");
    }
    if !outcome.required_changes.is_empty() {
        text.push_str("## Required changes\n\n");
        for change in &outcome.required_changes {
            text.push_str(&format!("- {}\n", change));
        }
        text.push('\n');
    }
    if !outcome.issues.is_empty() {
        text.push_str("## Issues\n\n");
        for issue in &outcome.issues {
            let severity = if issue.severity.is_empty() {
                "unspecified".to_string()
            } else {
                issue.severity.clone()
            };
            text.push_str(&format!("- [{}] {}\n", severity, issue.description));
        }
    }
    let dir = worktree.join(WORKTREE_META_DIR);
    std::fs::create_dir_all(&dir)?;
    std::fs::write(dir.join(REVIEW_FEEDBACK_FILE), text)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, RepoConfig, ReviewConfig};
    use crate::manager::SpawnOptions;
    use crate::session::{IssueRef, SessionMode};
    use crate::spawner::{SpawnOutcome, SpawnRequest, WorkerSpawner, WorkerStatus};
    use async_trait::async_trait;
    use std::process::Command as StdCommand;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn plan_with_zero_tasks_is_never_complete() {
        assert_eq!(count_plan_tasks("just prose, no tasks"), (0, 0));
        let config = PromiseConfig::PlanComplete {
            path: "IMPLEMENTATION_PLAN.md".into(),
        };
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("IMPLEMENTATION_PLAN.md"), "prose only\n").unwrap();
        assert!(!futures_block(evaluate_promise(&config, tmp.path())));
    }

    #[test]
    fn plan_task_counting() {
        let text = "\
# Plan
- [x] done thing
- [ ] open thing
  - [X] nested done
* [ ] star style
not a task
- also not a task
";
        assert_eq!(count_plan_tasks(text), (4, 2));
    }

    #[test]
    fn plan_promise_met_when_all_checked() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("IMPLEMENTATION_PLAN.md"),
            "- [x] a\n- [X] b\n",
        )
        .unwrap();
        let config = PromiseConfig::PlanComplete {
            path: "IMPLEMENTATION_PLAN.md".into(),
        };
        assert!(futures_block(evaluate_promise(&config, tmp.path())));
    }

    #[test]
    fn file_promise_checks_existence() {
        let tmp = tempfile::tempdir().unwrap();
        let config = PromiseConfig::File {
            path: "DONE".into(),
        };
        assert!(!futures_block(evaluate_promise(&config, tmp.path())));
        std::fs::write(tmp.path().join("DONE"), "").unwrap();
        assert!(futures_block(evaluate_promise(&config, tmp.path())));
    }

    #[test]
    fn shell_promise_uses_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        let pass = PromiseConfig::TestsPass {
            command: "true".to_string(),
        };
        let fail = PromiseConfig::Custom {
            command: "false".to_string(),
        };
        assert!(futures_block(evaluate_promise(&pass, tmp.path())));
        assert!(!futures_block(evaluate_promise(&fail, tmp.path())));
    }

    fn futures_block<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(future)
    }

    #[test]
    fn github_url_parsing() {
        assert_eq!(
            parse_github_url("git@github.com:acme/widgets.git"),
            Some(("acme".to_string(), "widgets".to_string()))
        );
        assert_eq!(
            parse_github_url("https://github.com/acme/widgets.git"),
            Some(("acme".to_string(), "widgets".to_string()))
        );
        assert_eq!(
            parse_github_url("https://github.com/acme/widgets"),
            Some(("acme".to_string(), "widgets".to_string()))
        );
        assert_eq!(parse_github_url("https://example.com/acme/widgets"), None);
    }

    #[test]
    fn pr_body_always_closes_the_issue() {
        let body = pr_body(42, Some("Did the thing."), Some("cargo test"));
        assert!(body.contains("Closes #42"));
        assert!(body.contains("## Summary"));
        assert!(body.contains("## Test plan"));
        let bare = pr_body(7, None, None);
        assert_eq!(bare, "Closes #7\n");
    }

    #[test]
    fn review_output_parses_json_and_keywords() {
        let json = r#"{"verdict": "NEEDS_WORK", "summary": "add validation",
            "required_changes": ["validate input"],
            "issues": [{"severity": "major", "description": "no bounds check"}]}"#;
        let outcome = parse_review_output(json);
        assert_eq!(outcome.verdict, "NEEDS_WORK");
        assert_eq!(outcome.required_changes.len(), 1);

        let outcome = parse_review_output("All good.\nAPPROVED\n");
        assert_eq!(outcome.verdict, "APPROVED");

        let outcome = parse_review_output("hmm, unclear");
        assert_eq!(outcome.verdict, "NEEDS_WORK");
    }

    #[test]
    fn feedback_file_enumerates_issues() {
        let tmp = tempfile::tempdir().unwrap();
        let outcome = ReviewOutcome {
            verdict: "NEEDS_WORK".to_string(),
            summary: "add input validation".to_string(),
            required_changes: vec!["validate issue numbers".to_string()],
            issues: vec![ReviewIssue {
                severity: "major".to_string(),
                description: "panics on empty input".to_string(),
            }],
        };
        write_review_feedback(tmp.path(), 1, &outcome).unwrap();
        let text = std::fs::read_to_string(
            tmp.path().join(WORKTREE_META_DIR).join(REVIEW_FEEDBACK_FILE),
        )
        .unwrap();
        assert!(text.contains("cycle 1"));
        assert!(text.contains("add input validation"));
        assert!(text.contains("validate issue numbers"));
        assert!(text.contains("[major] panics on empty input"));
    }

    // ----- loop tests against a real manager + fake spawner -----

    struct FakeSpawner {
        running: AtomicBool,
        spawn_count: AtomicUsize,
    }

    impl FakeSpawner {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                running: AtomicBool::new(true),
                spawn_count: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl WorkerSpawner for FakeSpawner {
        async fn available(&self) -> bool {
            true
        }

        fn name(&self) -> &'static str {
            "fake"
        }

        async fn spawn(&self, request: SpawnRequest) -> SpawnOutcome {
            self.spawn_count.fetch_add(1, Ordering::SeqCst);
            self.running.store(true, Ordering::SeqCst);
            let spawn_id = crate::spawner::generate_spawn_id();
            let spawned_at = Utc::now();
            crate::spawner::write_spawn_info(
                &request.working_directory,
                &spawn_id,
                spawned_at,
                request.issue.number,
                request.iteration,
            )
            .unwrap();
            SpawnOutcome::ok(spawn_id, spawned_at)
        }

        async fn stop(&self, _spawn_id: &str) {
            self.running.store(false, Ordering::SeqCst);
        }

        async fn status(&self, _spawn_id: &str) -> WorkerStatus {
            WorkerStatus {
                running: self.running.load(Ordering::SeqCst),
                exit_code: if self.running.load(Ordering::SeqCst) {
                    None
                } else {
                    Some(0)
                },
            }
        }

        fn log_path(&self, _spawn_id: &str) -> Option<std::path::PathBuf> {
            None
        }
    }

    fn init_repo(dir: &Path) {
        let run = |args: &[&str]| {
            let out = StdCommand::new("git")
                .args(args)
                .current_dir(dir)
                .env("GIT_AUTHOR_NAME", "test")
                .env("GIT_AUTHOR_EMAIL", "test@example.com")
                .env("GIT_COMMITTER_NAME", "test")
                .env("GIT_COMMITTER_EMAIL", "test@example.com")
                .output()
                .expect("git should run");
            assert!(out.status.success(), "git {:?} failed", args);
        };
        run(&["init", "-b", "main"]);
        run(&["config", "user.name", "test"]);
        run(&["config", "user.email", "test@example.com"]);
        std::fs::write(dir.join("README.md"), "# test\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "initial commit"]);
    }

    struct LoopFixture {
        _tmp: tempfile::TempDir,
        controller: Arc<RalphController>,
        manager: Arc<SessionManager>,
        spawner: Arc<FakeSpawner>,
    }

    async fn loop_fixture(ralph: RalphConfig) -> (LoopFixture, SessionRecord) {
        let tmp = tempfile::tempdir().unwrap();
        let repo_root = tmp.path().join("widgets");
        std::fs::create_dir(&repo_root).unwrap();
        init_repo(&repo_root);

        let repo = RepoConfig {
            id: "widgets".to_string(),
            root: repo_root,
            base_branch: "main".to_string(),
            github_owner: "acme".to_string(),
            github_repo: "widgets".to_string(),
            worktree_prefix: None,
            default_mode: SessionMode::Autonomous,
        };
        let spawner = FakeSpawner::new();
        let manager = Arc::new(
            SessionManager::new(
                repo,
                &tmp.path().join("base"),
                spawner.clone(),
                &Config::default(),
            )
            .unwrap()
            .with_cancel_grace(Duration::from_millis(10)),
        );

        let record = manager
            .spawn_with_issue(
                IssueRef {
                    number: 42,
                    title: "Add X".to_string(),
                    body: "- [x] first\n- [ ] second\n".to_string(),
                },
                SpawnOptions::default(),
            )
            .await
            .unwrap();

        let mut managers = HashMap::new();
        managers.insert("widgets".to_string(), manager.clone());
        let controller = RalphController::new(ralph, managers);
        controller.register("widgets", "42");

        (
            LoopFixture {
                _tmp: tmp,
                controller,
                manager,
                spawner,
            },
            record,
        )
    }

    fn write_marker(worktree: &Path, marker: &str) {
        std::fs::write(
            worktree
                .join(WORKTREE_META_DIR)
                .join(crate::session::WORKER_STATUS_FILE),
            marker,
        )
        .unwrap();
    }

    #[tokio::test]
    async fn complete_marker_with_approval_finishes_loop() {
        let ralph = RalphConfig {
            iteration_delay_ms: 0,
            review: ReviewConfig {
                agent_command: "echo APPROVED".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let (fx, record) = loop_fixture(ralph).await;

        fx.spawner.running.store(false, Ordering::SeqCst);
        write_marker(&record.worktree_path, "complete");
        fx.controller.sweep().await;

        // Review runs in its own task.
        for _ in 0..50 {
            if fx.controller.state_of("widgets", "42").unwrap().state == LoopState::Done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let state = fx.controller.state_of("widgets", "42").unwrap();
        assert_eq!(state.state, LoopState::Done);
        assert_eq!(state.last_review_verdict, Some(ReviewVerdict::Approved));
        assert_eq!(state.current_iteration, 1);
        // Marker consumed.
        assert!(!record
            .worktree_path
            .join(WORKTREE_META_DIR)
            .join(crate::session::WORKER_STATUS_FILE)
            .exists());
    }

    #[tokio::test]
    async fn needs_work_writes_feedback_and_respawns() {
        let ralph = RalphConfig {
            iteration_delay_ms: 0,
            review: ReviewConfig {
                agent_command: "echo NEEDS_WORK: add input validation".to_string(),
                max_cycles: 3,
                ..Default::default()
            },
            ..Default::default()
        };
        let (fx, record) = loop_fixture(ralph).await;

        fx.spawner.running.store(false, Ordering::SeqCst);
        write_marker(&record.worktree_path, "complete");
        fx.controller.sweep().await;

        for _ in 0..50 {
            if fx.controller.state_of("widgets", "42").unwrap().state == LoopState::Waiting {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let state = fx.controller.state_of("widgets", "42").unwrap();
        assert_eq!(state.state, LoopState::Waiting);
        assert_eq!(state.review_cycle, 1);
        assert!(record
            .worktree_path
            .join(WORKTREE_META_DIR)
            .join(REVIEW_FEEDBACK_FILE)
            .exists());

        // Next sweep starts iteration 2 through the manager.
        fx.controller.sweep().await;
        let state = fx.controller.state_of("widgets", "42").unwrap();
        assert_eq!(state.current_iteration, 2);
        assert_eq!(state.iterations.len(), 2);
        assert_eq!(fx.spawner.spawn_count.load(Ordering::SeqCst), 2);
        assert_eq!(
            fx.manager.get("42").unwrap().status,
            SessionStatus::Working
        );
    }

    #[tokio::test]
    async fn missing_marker_exhausts_iteration_budget() {
        let ralph = RalphConfig {
            max_iterations: 1,
            iteration_delay_ms: 0,
            // Plan has an unchecked task, so the promise stays unmet.
            ..Default::default()
        };
        let (fx, _record) = loop_fixture(ralph).await;

        fx.spawner.running.store(false, Ordering::SeqCst);
        fx.controller.sweep().await;

        let state = fx.controller.state_of("widgets", "42").unwrap();
        assert_eq!(state.state, LoopState::Stuck);
        assert_eq!(state.failed_iterations, 1);
        assert_eq!(state.current_iteration, 1);
        assert_eq!(fx.manager.get("42").unwrap().status, SessionStatus::Stuck);
        assert!(fx.manager.get("42").unwrap().stuck_reason.is_some());
    }

    #[tokio::test]
    async fn met_promise_without_marker_enters_review() {
        let ralph = RalphConfig {
            iteration_delay_ms: 0,
            review: ReviewConfig {
                agent_command: "echo APPROVED".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let (fx, record) = loop_fixture(ralph).await;

        // Complete the plan, then let the worker die with no marker.
        std::fs::write(
            record.worktree_path.join("IMPLEMENTATION_PLAN.md"),
            "- [x] first\n- [x] second\n",
        )
        .unwrap();
        fx.spawner.running.store(false, Ordering::SeqCst);
        fx.controller.sweep().await;

        for _ in 0..50 {
            if fx.controller.state_of("widgets", "42").unwrap().state == LoopState::Done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let state = fx.controller.state_of("widgets", "42").unwrap();
        assert_eq!(state.state, LoopState::Done);
        assert_eq!(
            state.iterations.last().unwrap().exit_type,
            ExitType::PromiseMet
        );
    }

    #[tokio::test]
    async fn review_cycle_cap_marks_loop_stuck() {
        let ralph = RalphConfig {
            iteration_delay_ms: 0,
            review: ReviewConfig {
                agent_command: "echo NEEDS_WORK".to_string(),
                max_cycles: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let (fx, record) = loop_fixture(ralph).await;

        fx.spawner.running.store(false, Ordering::SeqCst);
        write_marker(&record.worktree_path, "complete");
        fx.controller.sweep().await;

        for _ in 0..50 {
            if fx.controller.state_of("widgets", "42").unwrap().state == LoopState::Stuck {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let state = fx.controller.state_of("widgets", "42").unwrap();
        assert_eq!(state.state, LoopState::Stuck);
        assert_eq!(state.review_cycle, 1);
    }

    #[tokio::test]
    async fn task_done_marker_schedules_next_iteration() {
        let ralph = RalphConfig {
            iteration_delay_ms: 0,
            ..Default::default()
        };
        let (fx, record) = loop_fixture(ralph).await;

        let events: Arc<Mutex<Vec<LoopEventKind>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        fx.controller.subscribe(move |event| {
            sink.lock().unwrap_or_else(|e| e.into_inner()).push(event.kind);
        });

        fx.spawner.running.store(false, Ordering::SeqCst);
        write_marker(&record.worktree_path, "task_done");
        fx.controller.sweep().await;

        let state = fx.controller.state_of("widgets", "42").unwrap();
        assert_eq!(state.state, LoopState::Waiting);
        assert!(events.lock().unwrap_or_else(|e| e.into_inner()).contains(&LoopEventKind::IterationEnd));

        fx.controller.sweep().await;
        let state = fx.controller.state_of("widgets", "42").unwrap();
        assert_eq!(state.current_iteration, 2);
        assert!(events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&LoopEventKind::IterationStart));
    }

    #[tokio::test]
    async fn vanished_session_marks_loop_stuck() {
        let ralph = RalphConfig::default();
        let (fx, _record) = loop_fixture(ralph).await;
        fx.manager.store().delete("42").unwrap();

        fx.controller.sweep().await;
        let state = fx.controller.state_of("widgets", "42").unwrap();
        assert_eq!(state.state, LoopState::Stuck);
    }

    #[tokio::test]
    async fn iterations_length_tracks_current_iteration() {
        let ralph = RalphConfig {
            iteration_delay_ms: 0,
            ..Default::default()
        };
        let (fx, record) = loop_fixture(ralph).await;

        for expected in 2..=4u32 {
            fx.spawner.running.store(false, Ordering::SeqCst);
            write_marker(&record.worktree_path, "task_done");
            fx.controller.sweep().await; // consume marker, go waiting
            fx.controller.sweep().await; // start next iteration
            let state = fx.controller.state_of("widgets", "42").unwrap();
            assert_eq!(state.current_iteration, expected);
            assert_eq!(state.iterations.len(), expected as usize);
            let numbers: Vec<u32> = state.iterations.iter().map(|a| a.iteration).collect();
            assert_eq!(numbers, (1..=expected).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn stuck_note_from_worker_stops_the_loop() {
        let ralph = RalphConfig {
            iteration_delay_ms: 0,
            ..Default::default()
        };
        let (fx, record) = loop_fixture(ralph).await;

        std::fs::write(record.worktree_path.join(".stuck"), "missing credentials\n").unwrap();
        fx.spawner.running.store(false, Ordering::SeqCst);
        fx.controller.sweep().await;

        let state = fx.controller.state_of("widgets", "42").unwrap();
        assert_eq!(state.state, LoopState::Stuck);
        let rec = fx.manager.get("42").unwrap();
        assert_eq!(rec.status, SessionStatus::Stuck);
        assert!(rec.stuck_reason.unwrap().contains("missing credentials"));
    }

    #[tokio::test]
    async fn paused_session_freezes_and_resumes_the_loop() {
        let ralph = RalphConfig::default();
        let (fx, _record) = loop_fixture(ralph).await;

        fx.manager.pause("42").await.unwrap();
        fx.controller.sweep().await;
        assert_eq!(
            fx.controller.state_of("widgets", "42").unwrap().state,
            LoopState::Paused
        );

        // Even with the worker gone, a paused loop does not count failures.
        fx.spawner.running.store(false, Ordering::SeqCst);
        fx.controller.sweep().await;
        let state = fx.controller.state_of("widgets", "42").unwrap();
        assert_eq!(state.state, LoopState::Paused);
        assert_eq!(state.failed_iterations, 0);

        fx.manager.resume("42").await.unwrap();
        fx.controller.sweep().await;
        assert_eq!(
            fx.controller.state_of("widgets", "42").unwrap().state,
            LoopState::Running
        );
    }

    #[tokio::test]
    async fn force_next_iteration_requires_a_waiting_loop() {
        let ralph = RalphConfig {
            // A long delay the forced start skips over.
            iteration_delay_ms: 3_600_000,
            ..Default::default()
        };
        let (fx, record) = loop_fixture(ralph).await;

        let err = fx
            .controller
            .force_next_iteration("widgets", "42")
            .await
            .unwrap_err();
        assert!(matches!(err, crate::AtelierError::LoopNotWaiting(_)));

        fx.spawner.running.store(false, Ordering::SeqCst);
        write_marker(&record.worktree_path, "task_done");
        fx.controller.sweep().await;
        assert_eq!(
            fx.controller.state_of("widgets", "42").unwrap().state,
            LoopState::Waiting
        );
        // The delay has not elapsed; a sweep leaves the loop waiting.
        fx.controller.sweep().await;
        assert_eq!(
            fx.controller.state_of("widgets", "42").unwrap().state,
            LoopState::Waiting
        );

        fx.controller
            .force_next_iteration("widgets", "42")
            .await
            .unwrap();
        let state = fx.controller.state_of("widgets", "42").unwrap();
        assert_eq!(state.state, LoopState::Running);
        assert_eq!(state.current_iteration, 2);
    }
}
