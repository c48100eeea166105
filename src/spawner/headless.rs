//! Headless spawner - plain child process, prompt on stdin
//!
//! The worker runs as a direct child in the worktree with the prompt
//! delivered on standard input. Combined stdout/stderr is captured to a
//! timestamped log under the worktree's reserved directory. Process exit
//! is the completion signal.

use super::{
    generate_spawn_id, worker_log_name, write_spawn_info, SpawnOutcome, SpawnRequest,
    WorkerSpawner, WorkerStatus,
};
use crate::session::WORKTREE_META_DIR;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

struct WorkerEntry {
    /// Present until the process has been reaped.
    child: Option<Child>,
    /// Process-group id, for tree kills.
    pgid: Option<i32>,
    exit_code: Option<i32>,
    log_path: PathBuf,
}

/// Spawner running workers as headless child processes.
pub struct HeadlessSpawner {
    worker_command: String,
    worker_args: Vec<String>,
    workers: Arc<Mutex<HashMap<String, WorkerEntry>>>,
}

impl HeadlessSpawner {
    pub fn new(worker_command: String, worker_args: Vec<String>) -> Self {
        Self {
            worker_command,
            worker_args,
            workers: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl WorkerSpawner for HeadlessSpawner {
    async fn available(&self) -> bool {
        Command::new(&self.worker_command)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn name(&self) -> &'static str {
        "headless"
    }

    async fn spawn(&self, request: SpawnRequest) -> SpawnOutcome {
        let spawn_id = generate_spawn_id();
        let spawned_at = Utc::now();

        let meta_dir = request.working_directory.join(WORKTREE_META_DIR);
        if let Err(e) = std::fs::create_dir_all(&meta_dir) {
            return SpawnOutcome::fail(format!("failed to create meta dir: {}", e));
        }
        let log_path = meta_dir.join(worker_log_name(request.iteration));
        let log_file = match std::fs::File::create(&log_path) {
            Ok(f) => f,
            Err(e) => return SpawnOutcome::fail(format!("failed to create log file: {}", e)),
        };
        let log_clone = match log_file.try_clone() {
            Ok(f) => f,
            Err(e) => return SpawnOutcome::fail(format!("failed to clone log handle: {}", e)),
        };

        let mut cmd = Command::new(&self.worker_command);
        cmd.args(&self.worker_args)
            .current_dir(&request.working_directory)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_clone));
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                return SpawnOutcome::fail(format!(
                    "failed to spawn {}: {}",
                    self.worker_command, e
                ))
            }
        };
        let pgid = child.id().map(|pid| pid as i32);

        // Deliver the prompt on stdin without blocking the caller on a
        // slow reader; closing stdin signals end-of-prompt.
        if let Some(mut stdin) = child.stdin.take() {
            let prompt = request.prompt_content.clone();
            let id = spawn_id.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    tracing::warn!(spawn_id = %id, error = %e, "failed to write prompt to worker stdin");
                }
                let _ = stdin.shutdown().await;
            });
        }

        if let Err(e) = write_spawn_info(
            &request.working_directory,
            &spawn_id,
            spawned_at,
            request.issue.number,
            request.iteration,
        ) {
            // Without spawn-info the spawn does not count; take the
            // process back down.
            if let Some(pgid) = pgid {
                kill_group(pgid, libc::SIGKILL);
            }
            return SpawnOutcome::fail(format!("failed to write spawn-info: {}", e));
        }

        tracing::info!(
            spawn_id = %spawn_id,
            session_id = %request.session_id,
            workdir = %request.working_directory.display(),
            "worker spawned"
        );

        self.workers.lock().unwrap_or_else(|e| e.into_inner()).insert(
            spawn_id.clone(),
            WorkerEntry {
                child: Some(child),
                pgid,
                exit_code: None,
                log_path,
            },
        );

        SpawnOutcome::ok(spawn_id, spawned_at)
    }

    async fn stop(&self, spawn_id: &str) {
        let pgid = {
            let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.get(spawn_id).and_then(|w| w.pgid)
        };
        if let Some(pgid) = pgid {
            tracing::info!(spawn_id, pgid, "stopping worker process group");
            kill_group(pgid, libc::SIGTERM);
        }
    }

    async fn status(&self, spawn_id: &str) -> WorkerStatus {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = workers.get_mut(spawn_id) else {
            return WorkerStatus::unknown();
        };
        if let Some(code) = entry.exit_code {
            return WorkerStatus {
                running: false,
                exit_code: Some(code),
            };
        }
        let Some(child) = entry.child.as_mut() else {
            return WorkerStatus::unknown();
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                let code = status.code().unwrap_or(-1);
                entry.exit_code = Some(code);
                entry.child = None;
                WorkerStatus {
                    running: false,
                    exit_code: Some(code),
                }
            }
            Ok(None) => WorkerStatus {
                running: true,
                exit_code: None,
            },
            Err(e) => {
                tracing::warn!(spawn_id, error = %e, "failed to poll worker");
                WorkerStatus::unknown()
            }
        }
    }

    fn log_path(&self, spawn_id: &str) -> Option<PathBuf> {
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(spawn_id)
            .map(|w| w.log_path.clone())
    }
}

#[cfg(unix)]
fn kill_group(pgid: i32, signal: i32) {
    // Negative pid targets the whole process group.
    unsafe {
        libc::kill(-pgid, signal);
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: i32, _signal: i32) {}
