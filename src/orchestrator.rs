//! Multi-repo facade
//!
//! One session manager per configured repository, one iterative
//! controller across all of them, and a unified event stream tagged with
//! the repository id. Also owns the periodic orphan sweep.

use crate::config::Config;
use crate::git::GitGateway;
use crate::manager::{SessionEvent, SessionManager, SpawnOptions};
use crate::protocol::{OrphanEntry, SnapshotEntry};
use crate::ralph::RalphController;
use crate::session::{SessionMode, SessionRecord};
use crate::spawner::{self, WorkerSpawner};
use crate::store;
use crate::watcher::{SessionFileEvent, SessionWatcher, WorktreeStateWatcher};
use crate::{AtelierError, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Interval between orphan sweeps.
const ORPHAN_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(300);

/// Root of the control plane: constructed once at startup, passed
/// explicitly to everything that needs it. No ambient globals.
pub struct Orchestrator {
    config: Config,
    managers: HashMap<String, Arc<SessionManager>>,
    ralph: Arc<RalphController>,
    events: broadcast::Sender<SessionEvent>,
    /// Live file watchers; populated by `start_background_tasks`.
    watchers: Mutex<Vec<SessionWatcher>>,
    state_watcher: Mutex<Option<WorktreeStateWatcher>>,
}

impl Orchestrator {
    /// Build the orchestrator from config: one spawner for the process,
    /// one manager per repository, one controller over all of them.
    pub fn new(config: Config, base_dir: &std::path::Path) -> Result<Arc<Self>> {
        let spawner: Arc<dyn WorkerSpawner> = spawner::from_config(&config.spawner);

        let mut managers = HashMap::new();
        for repo in &config.repositories {
            let manager = Arc::new(SessionManager::new(
                repo.clone(),
                base_dir,
                spawner.clone(),
                &config,
            )?);
            managers.insert(repo.id.clone(), manager);
        }

        let ralph = RalphController::new(config.ralph.clone(), managers.clone());

        let (events, _) = broadcast::channel(512);
        for manager in managers.values() {
            let mut rx = manager.subscribe();
            let tx = events.clone();
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            let _ = tx.send(event);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "event fan-in lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
        }

        Ok(Arc::new(Self {
            config,
            managers,
            ralph,
            events,
            watchers: Mutex::new(Vec::new()),
            state_watcher: Mutex::new(None),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ralph(&self) -> &Arc<RalphController> {
        &self.ralph
    }

    /// Unified event stream across all repositories.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn manager(&self, repo_id: &str) -> Result<&Arc<SessionManager>> {
        self.managers
            .get(repo_id)
            .ok_or_else(|| AtelierError::RepoNotFound(repo_id.to_string()))
    }

    pub fn repo_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.managers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Resolve the repository for a CLI call: an explicit id, or the
    /// sole configured repository.
    pub fn resolve_repo(&self, explicit: Option<&str>) -> Result<String> {
        if let Some(id) = explicit {
            self.manager(id)?;
            return Ok(id.to_string());
        }
        match self.managers.len() {
            0 => Err(AtelierError::Config(
                "no repositories configured".to_string(),
            )),
            1 => Ok(self.managers.keys().next().cloned().unwrap_or_default()),
            _ => Err(AtelierError::Config(
                "multiple repositories configured; pass --repo".to_string(),
            )),
        }
    }

    /// Spawn a session and, for autonomous mode, hand it to the
    /// iterative controller.
    pub async fn spawn(
        &self,
        repo_id: &str,
        issue_number: u64,
        options: SpawnOptions,
    ) -> Result<SessionRecord> {
        let manager = self.manager(repo_id)?;
        let record = manager.spawn(issue_number, options).await?;
        if record.mode == SessionMode::Autonomous {
            self.ralph.register(repo_id, &record.session_id);
        }
        if let Some(watcher) = &*self.state_watcher.lock().unwrap_or_else(|e| e.into_inner()) {
            if let Err(e) = watcher.register(&record.session_id, &record.worktree_path) {
                tracing::warn!(session_id = %record.session_id, error = %e, "failed to watch worktree");
            }
        }
        Ok(record)
    }

    /// Delete a session, dropping any loop state it had.
    pub async fn delete(
        &self,
        repo_id: &str,
        session_id: &str,
        options: crate::manager::DeleteOptions,
    ) -> Result<crate::manager::DeleteResult> {
        let manager = self.manager(repo_id)?;
        let worktree = manager.get(session_id).map(|r| r.worktree_path);
        let result = manager.delete(session_id, options).await?;
        if result.success {
            self.ralph.unregister(repo_id, session_id);
            if let (Some(watcher), Some(worktree)) =
                (&*self.state_watcher.lock().unwrap_or_else(|e| e.into_inner()), worktree)
            {
                watcher.unregister(&worktree);
            }
        }
        Ok(result)
    }

    /// Full session listing across repositories, for the snapshot
    /// fallback broadcast.
    pub fn snapshot(&self) -> Result<Vec<SnapshotEntry>> {
        let mut entries = Vec::new();
        for (repo_id, manager) in &self.managers {
            for listing in manager.list_with_cleanup_info()? {
                entries.push(SnapshotEntry {
                    repository_id: repo_id.clone(),
                    worktree_missing: listing.worktree_missing,
                    session: listing.record,
                });
            }
        }
        entries.sort_by(|a, b| {
            (&a.repository_id, a.session.issue.number)
                .cmp(&(&b.repository_id, b.session.issue.number))
        });
        Ok(entries)
    }

    /// Enumerate worktree directories that look like this system's
    /// products but have no session record.
    pub fn sweep_orphans(&self) -> Vec<OrphanEntry> {
        let mut orphans = Vec::new();
        for (repo_id, manager) in &self.managers {
            let repo = manager.repo();
            let Some(parent) = repo.root.parent() else {
                continue;
            };
            let prefix = format!("{}issue-", repo.prefix());
            let known: Vec<PathBuf> = manager
                .list()
                .map(|records| records.into_iter().map(|r| r.worktree_path).collect())
                .unwrap_or_default();

            let Ok(entries) = std::fs::read_dir(parent) else {
                continue;
            };
            for entry in entries.filter_map(|e| e.ok()) {
                let path = entry.path();
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if !name.starts_with(&prefix) || !path.is_dir() {
                    continue;
                }
                if known.iter().any(|p| p == &path) {
                    continue;
                }
                if !GitGateway::is_working_copy(&path) {
                    continue;
                }
                let session_id = store::read_session_context(&path).map(|ctx| ctx.session_id);
                orphans.push(OrphanEntry {
                    repository_id: repo_id.clone(),
                    path,
                    session_id,
                });
            }
        }
        orphans
    }

    /// Start the long-lived background work: the iteration ticker, the
    /// periodic orphan sweep, and the file watchers that make store
    /// mutations from other processes (one-shot CLI invocations, external
    /// inspectors) visible on the unified event stream.
    pub fn start_background_tasks(self: &Arc<Self>) -> Result<()> {
        self.ralph.spawn_ticker();

        let orchestrator = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ORPHAN_SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let orphans = orchestrator.sweep_orphans();
                if !orphans.is_empty() {
                    tracing::info!(count = orphans.len(), "orphan worktrees detected");
                }
            }
        });

        let mut watchers = Vec::new();
        for (repo_id, manager) in &self.managers {
            let watcher = SessionWatcher::start(manager.store().sessions_dir())?;
            let tx = self.events.clone();
            let repo_id = repo_id.clone();
            watcher.subscribe(move |event| {
                let session_event = match event {
                    SessionFileEvent::Added { session_id, record } => SessionEvent {
                        repo_id: repo_id.clone(),
                        kind: crate::manager::SessionEventKind::Added,
                        session_id: session_id.clone(),
                        record: Some(record.clone()),
                    },
                    SessionFileEvent::Updated { session_id, record } => SessionEvent {
                        repo_id: repo_id.clone(),
                        kind: crate::manager::SessionEventKind::Updated,
                        session_id: session_id.clone(),
                        record: Some(record.clone()),
                    },
                    SessionFileEvent::Removed { session_id } => SessionEvent {
                        repo_id: repo_id.clone(),
                        kind: crate::manager::SessionEventKind::Removed,
                        session_id: session_id.clone(),
                        record: None,
                    },
                };
                let _ = tx.send(session_event);
            });
            watchers.push(watcher);
        }
        *self.watchers.lock().unwrap_or_else(|e| e.into_inner()) = watchers;

        let state_watcher = WorktreeStateWatcher::start()?;
        for manager in self.managers.values() {
            for record in manager.list_running()? {
                if record.worktree_path.exists() {
                    state_watcher.register(&record.session_id, &record.worktree_path)?;
                }
            }
        }
        state_watcher.subscribe(|event| {
            tracing::debug!(
                session_id = %event.session_id,
                status = %event.state.status,
                "worktree state changed"
            );
        });
        *self.state_watcher.lock().unwrap_or_else(|e| e.into_inner()) = Some(state_watcher);

        Ok(())
    }
}
