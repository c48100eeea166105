//! Container spawner
//!
//! Runs the worker inside a locked-down container: privileges dropped,
//! PID/memory/CPU caps, no-new-privileges, the worktree bind-mounted at a
//! fixed path and the prompt file mounted read-only. Dependencies for
//! recognised project shapes are primed in the host worktree first so the
//! container does not need network access for package fetches.

use super::{
    generate_spawn_id, worker_log_name, write_spawn_info, SpawnOutcome, SpawnRequest,
    WorkerSpawner, WorkerStatus,
};
use crate::config::ContainerConfig;
use crate::session::WORKTREE_META_DIR;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::process::Command;

/// Where the worktree appears inside the container.
const CONTAINER_WORKSPACE: &str = "/workspace";

/// Where the prompt file appears inside the container.
const CONTAINER_PROMPT: &str = "/workspace-prompt.md";

/// Where worker credentials appear inside the container.
const CONTAINER_CREDENTIALS: &str = "/home/worker/.claude";

struct ContainerEntry {
    container_name: String,
    log_path: PathBuf,
}

/// Spawner running workers in containers.
pub struct ContainerSpawner {
    worker_command: String,
    worker_args: Vec<String>,
    config: ContainerConfig,
    containers: Arc<Mutex<HashMap<String, ContainerEntry>>>,
}

impl ContainerSpawner {
    pub fn new(
        worker_command: String,
        worker_args: Vec<String>,
        config: ContainerConfig,
    ) -> Self {
        Self {
            worker_command,
            worker_args,
            config,
            containers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Idempotent dependency prime for recognised project shapes, run in
    /// the host worktree. Failures are logged, never fatal: the worker
    /// can still try inside the container.
    async fn prime_dependencies(worktree: &Path) {
        let steps: &[(&str, &[&str])] = &[
            ("package.json", &["npm", "ci"]),
            ("Cargo.toml", &["cargo", "fetch"]),
            ("requirements.txt", &["pip", "install", "-r", "requirements.txt"]),
        ];
        for (marker, command) in steps {
            if !worktree.join(marker).exists() {
                continue;
            }
            tracing::info!(
                worktree = %worktree.display(),
                command = ?command,
                "priming dependencies"
            );
            let result = Command::new(command[0])
                .args(&command[1..])
                .current_dir(worktree)
                .stdin(Stdio::null())
                .output()
                .await;
            match result {
                Ok(out) if out.status.success() => {}
                Ok(out) => {
                    tracing::warn!(
                        command = ?command,
                        stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                        "dependency prime failed"
                    );
                }
                Err(e) => {
                    tracing::warn!(command = ?command, error = %e, "dependency prime did not run");
                }
            }
        }
    }
}

#[async_trait]
impl WorkerSpawner for ContainerSpawner {
    async fn available(&self) -> bool {
        Command::new("docker")
            .args(["version", "--format", "{{.Server.Version}}"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn name(&self) -> &'static str {
        "container"
    }

    async fn spawn(&self, request: SpawnRequest) -> SpawnOutcome {
        let spawn_id = generate_spawn_id();
        let spawned_at = Utc::now();
        let container_name = format!("atelier-{}", spawn_id);

        Self::prime_dependencies(&request.working_directory).await;

        let meta_dir = request.working_directory.join(WORKTREE_META_DIR);
        if let Err(e) = std::fs::create_dir_all(&meta_dir) {
            return SpawnOutcome::fail(format!("failed to create meta dir: {}", e));
        }
        let log_path = meta_dir.join(worker_log_name(request.iteration));

        let workspace_mount = format!(
            "{}:{}",
            request.working_directory.display(),
            CONTAINER_WORKSPACE
        );
        let prompt_mount = format!(
            "{}:{}:ro",
            request.prompt_file_path.display(),
            CONTAINER_PROMPT
        );
        let pids_limit = self.config.pids_limit.to_string();

        let mut cmd = Command::new("docker");
        cmd.args(["run", "-d", "--name", &container_name])
            .args(["--cap-drop", "ALL"])
            .args(["--security-opt", "no-new-privileges"])
            .args(["--pids-limit", &pids_limit])
            .args(["--memory", &self.config.memory])
            .args(["--cpus", &self.config.cpus])
            .args(["-v", &workspace_mount])
            .args(["-v", &prompt_mount])
            .args(["-w", CONTAINER_WORKSPACE]);
        if let Some(creds) = &self.config.credentials_dir {
            let creds_mount = format!("{}:{}", creds.display(), CONTAINER_CREDENTIALS);
            cmd.args(["-v", &creds_mount]);
        }
        // Prompt goes in on stdin, same contract as the headless variant.
        let shell_line = format!(
            "{} {} < {}",
            self.worker_command,
            self.worker_args.join(" "),
            CONTAINER_PROMPT
        );
        cmd.arg(&self.config.image)
            .args(["sh", "-c", &shell_line])
            .stdin(Stdio::null());

        let output = match cmd.output().await {
            Ok(o) => o,
            Err(e) => return SpawnOutcome::fail(format!("failed to run docker: {}", e)),
        };
        if !output.status.success() {
            return SpawnOutcome::fail(format!(
                "docker run failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        if let Err(e) = write_spawn_info(
            &request.working_directory,
            &spawn_id,
            spawned_at,
            request.issue.number,
            request.iteration,
        ) {
            let _ = Command::new("docker")
                .args(["rm", "-f", &container_name])
                .output()
                .await;
            return SpawnOutcome::fail(format!("failed to write spawn-info: {}", e));
        }

        // Follow container output into the worker log.
        match std::fs::File::create(&log_path) {
            Ok(log_file) => {
                let log_clone = log_file.try_clone().ok();
                let mut follow = Command::new("docker");
                follow
                    .args(["logs", "-f", &container_name])
                    .stdin(Stdio::null())
                    .stdout(Stdio::from(log_file));
                if let Some(clone) = log_clone {
                    follow.stderr(Stdio::from(clone));
                }
                if let Err(e) = follow.spawn() {
                    tracing::warn!(error = %e, "failed to follow container logs");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to create container log file");
            }
        }

        tracing::info!(
            spawn_id = %spawn_id,
            container = %container_name,
            session_id = %request.session_id,
            "container worker started"
        );

        self.containers.lock().unwrap_or_else(|e| e.into_inner()).insert(
            spawn_id.clone(),
            ContainerEntry {
                container_name,
                log_path,
            },
        );

        SpawnOutcome::ok(spawn_id, spawned_at)
    }

    async fn stop(&self, spawn_id: &str) {
        let name = {
            let containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
            containers.get(spawn_id).map(|c| c.container_name.clone())
        };
        let Some(name) = name else {
            return;
        };
        tracing::info!(spawn_id, container = %name, "removing container");
        let result = Command::new("docker")
            .args(["rm", "-f", &name])
            .stdin(Stdio::null())
            .output()
            .await;
        if let Err(e) = result {
            tracing::warn!(spawn_id, error = %e, "failed to remove container");
        }
    }

    async fn status(&self, spawn_id: &str) -> WorkerStatus {
        let name = {
            let containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
            containers.get(spawn_id).map(|c| c.container_name.clone())
        };
        let Some(name) = name else {
            return WorkerStatus::unknown();
        };

        let output = Command::new("docker")
            .args([
                "inspect",
                "--format",
                "{{.State.Running}};{{.State.ExitCode}}",
                &name,
            ])
            .stdin(Stdio::null())
            .output()
            .await;
        let Ok(output) = output else {
            return WorkerStatus::unknown();
        };
        if !output.status.success() {
            // Container already removed.
            return WorkerStatus::unknown();
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let mut parts = text.trim().split(';');
        let running = parts.next() == Some("true");
        let exit_code = if running {
            None
        } else {
            parts.next().and_then(|c| c.parse::<i32>().ok())
        };
        WorkerStatus { running, exit_code }
    }

    fn log_path(&self, spawn_id: &str) -> Option<PathBuf> {
        self.containers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(spawn_id)
            .map(|c| c.log_path.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_ids_report_unknown() {
        let spawner = ContainerSpawner::new(
            "claude".to_string(),
            vec![],
            ContainerConfig::default(),
        );
        let status = spawner.status("spawn-nope").await;
        assert!(!status.running);
        assert!(status.exit_code.is_none());
        spawner.stop("spawn-nope").await;
        assert!(spawner.log_path("spawn-nope").is_none());
    }

    #[tokio::test]
    async fn priming_tolerates_unrecognised_projects() {
        let worktree = tempfile::tempdir().unwrap();
        // No markers present: nothing to do, nothing to fail.
        ContainerSpawner::prime_dependencies(worktree.path()).await;
    }
}
