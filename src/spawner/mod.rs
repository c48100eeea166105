//! Worker spawners
//!
//! Three ways to run a worker: a headless child process, an interactive
//! pseudo-terminal, or a container. All three implement one contract; the
//! variant is chosen from config at startup and dispatched dynamically.

pub mod container;
pub mod headless;
pub mod pty;

pub use container::ContainerSpawner;
pub use headless::HeadlessSpawner;
pub use pty::{MarkerReady, PtySpawner, ReadyDetector};

use crate::config::{SpawnerConfig, SpawnerKind};
use crate::session::{IssueRef, SpawnInfo, WORKTREE_META_DIR};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Everything a spawner needs to start one worker.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub session_id: String,
    pub issue: IssueRef,
    pub working_directory: PathBuf,
    pub prompt_file_path: PathBuf,
    /// Full prompt text; may be large.
    pub prompt_content: String,
    pub github_owner: String,
    pub github_repo: String,
    pub iteration: Option<u32>,
    pub use_pty: bool,
}

/// Result of a spawn attempt.
#[derive(Debug, Clone)]
pub struct SpawnOutcome {
    pub success: bool,
    pub spawn_id: Option<String>,
    pub spawned_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl SpawnOutcome {
    pub fn ok(spawn_id: String, spawned_at: DateTime<Utc>) -> Self {
        Self {
            success: true,
            spawn_id: Some(spawn_id),
            spawned_at: Some(spawned_at),
            error: None,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            spawn_id: None,
            spawned_at: None,
            error: Some(error.into()),
        }
    }
}

/// Liveness snapshot for one spawn.
#[derive(Debug, Clone, Copy)]
pub struct WorkerStatus {
    pub running: bool,
    pub exit_code: Option<i32>,
}

impl WorkerStatus {
    /// Unknown spawn ids report as not running with no exit code.
    pub fn unknown() -> Self {
        Self {
            running: false,
            exit_code: None,
        }
    }
}

/// Contract shared by all spawner variants.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    /// Can this variant run on this host?
    async fn available(&self) -> bool;

    /// Human-readable variant name.
    fn name(&self) -> &'static str;

    /// Start one worker. `spawn-info.json` is written into the worktree
    /// before a success is reported.
    async fn spawn(&self, request: SpawnRequest) -> SpawnOutcome;

    /// Request termination. Idempotent; unknown ids are silent. Best
    /// effort: may return before the process has exited.
    async fn stop(&self, spawn_id: &str);

    async fn status(&self, spawn_id: &str) -> WorkerStatus;

    /// Captured output log, where the variant keeps one.
    fn log_path(&self, spawn_id: &str) -> Option<PathBuf>;

    /// Output history plus a live byte stream, for terminal attach.
    /// Only the interactive variant supports this.
    fn subscribe_output(
        &self,
        _spawn_id: &str,
    ) -> Option<(Vec<u8>, tokio::sync::broadcast::Receiver<Vec<u8>>)> {
        None
    }

    /// Write terminal input to the worker. Only the interactive variant
    /// supports this; others report false.
    async fn write_input(&self, _spawn_id: &str, _data: &[u8]) -> bool {
        false
    }

    /// Resize the worker's terminal, where it has one.
    async fn resize(&self, _spawn_id: &str, _rows: u16, _cols: u16) -> bool {
        false
    }
}

/// Build the configured spawner variant.
pub fn from_config(config: &SpawnerConfig) -> Arc<dyn WorkerSpawner> {
    match config.kind {
        SpawnerKind::Headless => Arc::new(HeadlessSpawner::new(
            config.worker_command.clone(),
            config.worker_args.clone(),
        )),
        SpawnerKind::Interactive => Arc::new(PtySpawner::new(
            config.worker_command.clone(),
            config.worker_args.clone(),
            config.pty.clone(),
        )),
        SpawnerKind::Container => Arc::new(ContainerSpawner::new(
            config.worker_command.clone(),
            config.worker_args.clone(),
            config.container.clone(),
        )),
    }
}

/// Generate a unique spawn id: millisecond timestamp plus random suffix.
pub fn generate_spawn_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let suffix: String = (0..4)
        .map(|_| format!("{:x}", rand::random::<u8>() % 16))
        .collect();
    format!("spawn-{:x}-{}", millis, suffix)
}

/// Write `spawn-info.json` into the worktree's reserved directory.
pub(crate) fn write_spawn_info(
    worktree: &Path,
    spawn_id: &str,
    spawned_at: DateTime<Utc>,
    issue_number: u64,
    iteration: Option<u32>,
) -> Result<()> {
    let dir = worktree.join(WORKTREE_META_DIR);
    std::fs::create_dir_all(&dir)?;
    let info = SpawnInfo {
        spawn_id: spawn_id.to_string(),
        spawned_at,
        issue_numbers: vec![issue_number],
        iteration,
    };
    let json = serde_json::to_string_pretty(&info)?;
    let path = dir.join("spawn-info.json");
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

/// Log file name for one worker run.
pub(crate) fn worker_log_name(iteration: Option<u32>) -> String {
    let iteration = iteration.unwrap_or(1);
    let stamp = Utc::now().format("%Y%m%dT%H%M%S");
    format!("worker-{}-{}.log", iteration, stamp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_ids_are_unique() {
        let a = generate_spawn_id();
        let b = generate_spawn_id();
        assert!(a.starts_with("spawn-"));
        assert_ne!(a, b);
    }

    #[test]
    fn spawn_info_lands_in_meta_dir() {
        let worktree = tempfile::tempdir().unwrap();
        write_spawn_info(worktree.path(), "spawn-1", Utc::now(), 42, Some(3)).unwrap();

        let text = std::fs::read_to_string(
            worktree.path().join(WORKTREE_META_DIR).join("spawn-info.json"),
        )
        .unwrap();
        let info: SpawnInfo = serde_json::from_str(&text).unwrap();
        assert_eq!(info.spawn_id, "spawn-1");
        assert_eq!(info.issue_numbers, vec![42]);
        assert_eq!(info.iteration, Some(3));
    }

    #[test]
    fn worker_log_name_includes_iteration() {
        let name = worker_log_name(Some(2));
        assert!(name.starts_with("worker-2-"));
        assert!(name.ends_with(".log"));
        assert!(worker_log_name(None).starts_with("worker-1-"));
    }
}
