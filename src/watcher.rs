//! File watchers - on-disk state changes as typed event streams
//!
//! Two watchers feed the control plane: one over a repository's session
//! directory, one over the dynamic-state files inside registered
//! worktrees. Writes are debounced for a short stability window before
//! being read so partial writes are never parsed. Subscriber callbacks
//! are isolated; a panicking subscriber is logged and the rest still run.

use crate::session::{SessionDynamicState, SessionRecord, WORKTREE_META_DIR};
use crate::store::SessionStore;
use crate::Result;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Stability window before a changed file is read.
const DEBOUNCE: Duration = Duration::from_millis(100);

/// Change to a session file in the store directory.
#[derive(Debug, Clone)]
pub enum SessionFileEvent {
    Added {
        session_id: String,
        record: SessionRecord,
    },
    Updated {
        session_id: String,
        record: SessionRecord,
    },
    Removed {
        session_id: String,
    },
}

impl SessionFileEvent {
    pub fn session_id(&self) -> &str {
        match self {
            SessionFileEvent::Added { session_id, .. }
            | SessionFileEvent::Updated { session_id, .. }
            | SessionFileEvent::Removed { session_id } => session_id,
        }
    }
}

type SessionCallback = Box<dyn Fn(&SessionFileEvent) + Send + Sync>;

/// Watches one repository's sessions directory.
pub struct SessionWatcher {
    subscribers: Arc<Mutex<Vec<SessionCallback>>>,
    // Dropping the watcher stops the stream.
    _watcher: RecommendedWatcher,
}

impl SessionWatcher {
    /// Start watching. Files already present are treated as known; they
    /// produce `Updated` (not `Added`) on their next change.
    pub fn start(sessions_dir: &Path) -> Result<Self> {
        let (raw_tx, mut raw_rx) = tokio::sync::mpsc::unbounded_channel::<PathBuf>();

        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    for path in event.paths {
                        let _ = raw_tx.send(path);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "session watcher error");
                }
            })?;
        watcher.watch(sessions_dir, RecursiveMode::NonRecursive)?;

        let subscribers: Arc<Mutex<Vec<SessionCallback>>> = Arc::new(Mutex::new(Vec::new()));

        let known: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(
            std::fs::read_dir(sessions_dir)
                .map(|entries| {
                    entries
                        .filter_map(|e| e.ok())
                        .filter_map(|e| SessionStore::session_id_for_path(&e.path()))
                        .collect()
                })
                .unwrap_or_default(),
        ));

        let generations: Arc<Mutex<HashMap<PathBuf, u64>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let subs = subscribers.clone();
        tokio::spawn(async move {
            while let Some(path) = raw_rx.recv().await {
                let Some(session_id) = SessionStore::session_id_for_path(&path) else {
                    continue;
                };
                let generation = {
                    let mut gens = generations.lock().unwrap_or_else(|e| e.into_inner());
                    let entry = gens.entry(path.clone()).or_insert(0);
                    *entry += 1;
                    *entry
                };
                let gens = generations.clone();
                let known = known.clone();
                let subs = subs.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(DEBOUNCE).await;
                    // A newer event for this path restarts the window.
                    {
                        let current = gens.lock().unwrap_or_else(|e| e.into_inner());
                        if current.get(&path) != Some(&generation) {
                            return;
                        }
                    }
                    if let Some(event) = classify(&path, &session_id, &known) {
                        dispatch_session_event(&subs, &event);
                    }
                });
            }
        });

        Ok(Self {
            subscribers,
            _watcher: watcher,
        })
    }

    pub fn subscribe(&self, callback: impl Fn(&SessionFileEvent) + Send + Sync + 'static) {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner()).push(Box::new(callback));
    }
}

fn classify(
    path: &Path,
    session_id: &str,
    known: &Mutex<HashSet<String>>,
) -> Option<SessionFileEvent> {
    if path.exists() {
        let text = std::fs::read_to_string(path).ok()?;
        let record: SessionRecord = match serde_json::from_str(&text) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unparseable session file");
                return None;
            }
        };
        let newly_known = known.lock().unwrap_or_else(|e| e.into_inner()).insert(session_id.to_string());
        if newly_known {
            Some(SessionFileEvent::Added {
                session_id: session_id.to_string(),
                record,
            })
        } else {
            Some(SessionFileEvent::Updated {
                session_id: session_id.to_string(),
                record,
            })
        }
    } else {
        known.lock().unwrap_or_else(|e| e.into_inner()).remove(session_id);
        Some(SessionFileEvent::Removed {
            session_id: session_id.to_string(),
        })
    }
}

fn dispatch_session_event(
    subscribers: &Mutex<Vec<SessionCallback>>,
    event: &SessionFileEvent,
) {
    let subs = subscribers.lock().unwrap_or_else(|e| e.into_inner());
    for callback in subs.iter() {
        if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
            tracing::error!(
                session_id = %event.session_id(),
                "session event subscriber panicked"
            );
        }
    }
}

/// Change to a worktree's dynamic-state file.
#[derive(Debug, Clone)]
pub struct WorktreeStateEvent {
    pub session_id: String,
    pub state: SessionDynamicState,
}

type WorktreeCallback = Box<dyn Fn(&WorktreeStateEvent) + Send + Sync>;

/// Watches `session-state.json` inside each registered worktree.
pub struct WorktreeStateWatcher {
    subscribers: Arc<Mutex<Vec<WorktreeCallback>>>,
    /// Watched meta-dir path → session id.
    registered: Arc<Mutex<HashMap<PathBuf, String>>>,
    watcher: Mutex<RecommendedWatcher>,
}

impl WorktreeStateWatcher {
    pub fn start() -> Result<Self> {
        let (raw_tx, mut raw_rx) = tokio::sync::mpsc::unbounded_channel::<PathBuf>();

        let watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    for path in event.paths {
                        let _ = raw_tx.send(path);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "worktree state watcher error");
                }
            })?;

        let subscribers: Arc<Mutex<Vec<WorktreeCallback>>> = Arc::new(Mutex::new(Vec::new()));
        let registered: Arc<Mutex<HashMap<PathBuf, String>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let generations: Arc<Mutex<HashMap<PathBuf, u64>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let subs = subscribers.clone();
        let reg = registered.clone();
        tokio::spawn(async move {
            while let Some(path) = raw_rx.recv().await {
                if path.file_name().and_then(|n| n.to_str()) != Some("session-state.json") {
                    continue;
                }
                let session_id = {
                    let reg = reg.lock().unwrap_or_else(|e| e.into_inner());
                    path.parent().and_then(|dir| reg.get(dir).cloned())
                };
                let Some(session_id) = session_id else {
                    continue;
                };
                let generation = {
                    let mut gens = generations.lock().unwrap_or_else(|e| e.into_inner());
                    let entry = gens.entry(path.clone()).or_insert(0);
                    *entry += 1;
                    *entry
                };
                let gens = generations.clone();
                let subs = subs.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(DEBOUNCE).await;
                    {
                        let current = gens.lock().unwrap_or_else(|e| e.into_inner());
                        if current.get(&path) != Some(&generation) {
                            return;
                        }
                    }
                    let Ok(text) = std::fs::read_to_string(&path) else {
                        return;
                    };
                    let state: SessionDynamicState = match serde_json::from_str(&text) {
                        Ok(s) => s,
                        Err(e) => {
                            tracing::warn!(path = %path.display(), error = %e, "skipping unparseable state file");
                            return;
                        }
                    };
                    let event = WorktreeStateEvent { session_id, state };
                    let subs = subs.lock().unwrap_or_else(|e| e.into_inner());
                    for callback in subs.iter() {
                        if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                            tracing::error!(
                                session_id = %event.session_id,
                                "worktree state subscriber panicked"
                            );
                        }
                    }
                });
            }
        });

        Ok(Self {
            subscribers,
            registered,
            watcher: Mutex::new(watcher),
        })
    }

    /// Start watching a session's worktree.
    pub fn register(&self, session_id: &str, worktree: &Path) -> Result<()> {
        let meta_dir = worktree.join(WORKTREE_META_DIR);
        std::fs::create_dir_all(&meta_dir)?;
        self.watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .watch(&meta_dir, RecursiveMode::NonRecursive)?;
        self.registered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(meta_dir, session_id.to_string());
        Ok(())
    }

    /// Stop watching a session's worktree. Unknown paths are silent.
    pub fn unregister(&self, worktree: &Path) {
        let meta_dir = worktree.join(WORKTREE_META_DIR);
        let _ = self.watcher.lock().unwrap_or_else(|e| e.into_inner()).unwatch(&meta_dir);
        self.registered.lock().unwrap_or_else(|e| e.into_inner()).remove(&meta_dir);
    }

    pub fn subscribe(&self, callback: impl Fn(&WorktreeStateEvent) + Send + Sync + 'static) {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner()).push(Box::new(callback));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{IssueRef, SessionMode, SessionStatus};

    fn record(n: u64) -> SessionRecord {
        SessionRecord::new(
            "demo",
            IssueRef {
                number: n,
                title: format!("Issue {}", n),
                body: String::new(),
            },
            format!("issue-{}", n),
            PathBuf::from(format!("/tmp/demo-issue-{}", n)),
            SessionMode::Manual,
        )
    }

    async fn wait_for<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..40 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn session_file_lifecycle_emits_events() {
        let base = tempfile::tempdir().unwrap();
        let store = SessionStore::open(base.path(), "demo").unwrap();

        let watcher = SessionWatcher::start(store.sessions_dir()).unwrap();
        let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        watcher.subscribe(move |event| {
            let tag = match event {
                SessionFileEvent::Added { .. } => "add",
                SessionFileEvent::Updated { .. } => "update",
                SessionFileEvent::Removed { .. } => "remove",
            };
            sink.lock().unwrap_or_else(|e| e.into_inner()).push(format!("{}:{}", tag, event.session_id()));
        });

        store.save(&record(7)).unwrap();
        assert!(
            wait_for(|| events.lock().unwrap_or_else(|e| e.into_inner()).iter().any(|e| e == "add:7")).await,
            "no add event: {:?}",
            events.lock().unwrap_or_else(|e| e.into_inner())
        );

        let mut rec = record(7);
        rec.status = SessionStatus::Working;
        store.save(&rec).unwrap();
        assert!(
            wait_for(|| events.lock().unwrap_or_else(|e| e.into_inner()).iter().any(|e| e == "update:7")).await,
            "no update event: {:?}",
            events.lock().unwrap_or_else(|e| e.into_inner())
        );

        store.delete("7").unwrap();
        assert!(
            wait_for(|| events.lock().unwrap_or_else(|e| e.into_inner()).iter().any(|e| e == "remove:7")).await,
            "no remove event: {:?}",
            events.lock().unwrap_or_else(|e| e.into_inner())
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn panicking_subscriber_does_not_poison_others() {
        let base = tempfile::tempdir().unwrap();
        let store = SessionStore::open(base.path(), "demo").unwrap();

        let watcher = SessionWatcher::start(store.sessions_dir()).unwrap();
        watcher.subscribe(|_| panic!("bad subscriber"));
        let seen = Arc::new(Mutex::new(0usize));
        let sink = seen.clone();
        watcher.subscribe(move |_| {
            *sink.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        });

        store.save(&record(1)).unwrap();
        assert!(
            wait_for(|| *seen.lock().unwrap_or_else(|e| e.into_inner()) > 0).await,
            "second subscriber never ran"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn worktree_state_watcher_reports_rewrites() {
        let worktree = tempfile::tempdir().unwrap();
        let watcher = WorktreeStateWatcher::start().unwrap();
        watcher.register("42", worktree.path()).unwrap();

        let seen: Arc<Mutex<Vec<WorktreeStateEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        watcher.subscribe(move |event| {
            sink.lock().unwrap_or_else(|e| e.into_inner()).push(event.clone());
        });

        crate::store::write_session_state(
            worktree.path(),
            &SessionDynamicState {
                status: SessionStatus::Cancelled,
                forwarded_message: None,
                last_updated: chrono::Utc::now(),
            },
        )
        .unwrap();

        assert!(
            wait_for(|| {
                seen.lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .iter()
                    .any(|e| e.session_id == "42" && e.state.status == SessionStatus::Cancelled)
            })
            .await,
            "no state event"
        );
    }
}
