//! Orchestrator configuration
//!
//! One `config.json` under the orchestration base directory, loaded once at
//! startup. `ORCH_CONFIG_PATH` overrides the config file location.

use crate::{AtelierError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::session::SessionMode;

/// Environment variable overriding the config file path.
pub const CONFIG_PATH_ENV: &str = "ORCH_CONFIG_PATH";

/// Directory under `$HOME` holding config and per-repo session stores.
pub const BASE_DIR_NAME: &str = ".orchestration";

/// One repository the orchestrator manages. Declared in config, never
/// created at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    pub id: String,
    /// Absolute path to the main checkout.
    pub root: PathBuf,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    pub github_owner: String,
    pub github_repo: String,
    /// Prefix for worktree directory names; defaults to `<basename(root)>-`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_prefix: Option<String>,
    #[serde(default = "default_mode")]
    pub default_mode: SessionMode,
}

impl RepoConfig {
    /// Worktree directory name prefix for this repository.
    pub fn prefix(&self) -> String {
        match &self.worktree_prefix {
            Some(p) => p.clone(),
            None => {
                let base = self
                    .root
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| self.id.clone());
                format!("{}-", base)
            }
        }
    }
}

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_mode() -> SessionMode {
    SessionMode::Manual
}

/// Which spawner variant to use for workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpawnerKind {
    #[default]
    Headless,
    Interactive,
    Container,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PtyConfig {
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    /// Output substring that means the worker is ready for input.
    #[serde(default = "default_ready_marker")]
    pub ready_marker: String,
}

fn default_cols() -> u16 {
    120
}

fn default_rows() -> u16 {
    40
}

fn default_ready_marker() -> String {
    "\u{276f}".to_string() // ❯
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            cols: default_cols(),
            rows: default_rows(),
            ready_marker: default_ready_marker(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_cpus")]
    pub cpus: String,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: u32,
    /// Host directory with worker credentials, bind-mounted read-write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_dir: Option<PathBuf>,
}

fn default_image() -> String {
    "atelier-worker:latest".to_string()
}

fn default_memory() -> String {
    "4g".to_string()
}

fn default_cpus() -> String {
    "2".to_string()
}

fn default_pids_limit() -> u32 {
    512
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            memory: default_memory(),
            cpus: default_cpus(),
            pids_limit: default_pids_limit(),
            credentials_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnerConfig {
    #[serde(default)]
    pub kind: SpawnerKind,
    /// The worker agent command (e.g. "claude").
    #[serde(default = "default_worker_command")]
    pub worker_command: String,
    #[serde(default)]
    pub worker_args: Vec<String>,
    #[serde(default)]
    pub pty: PtyConfig,
    #[serde(default)]
    pub container: ContainerConfig,
}

fn default_worker_command() -> String {
    "claude".to_string()
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            kind: SpawnerKind::default(),
            worker_command: default_worker_command(),
            worker_args: Vec::new(),
            pty: PtyConfig::default(),
            container: ContainerConfig::default(),
        }
    }
}

/// Condition that declares the session's goal reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PromiseConfig {
    /// All markdown checklist tasks in the plan file are checked.
    PlanComplete { path: PathBuf },
    /// A file exists at this path, relative to the worktree.
    File { path: PathBuf },
    /// A shell command exits zero in the worktree.
    TestsPass { command: String },
    /// Same semantics as `tests_pass`; named for intent.
    Custom { command: String },
}

/// Condition that ends the iterative loop successfully, independent of
/// the promise.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DoneSignalConfig {
    /// The session record reaches this status.
    Status { status: crate::session::SessionStatus },
    /// A file exists at this path, relative to the worktree.
    File { path: PathBuf },
    /// Reserved; parses but never fires.
    ExitCode,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GitOperationsConfig {
    #[serde(default)]
    pub commit_after_each: bool,
    #[serde(default)]
    pub push_after_each: bool,
    #[serde(default)]
    pub create_pr_on_complete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    #[serde(default = "default_review_cycles")]
    pub max_cycles: u32,
    #[serde(default = "default_review_timeout_ms")]
    pub timeout_ms: u64,
    /// External review agent command; receives the worktree as cwd.
    #[serde(default = "default_review_command")]
    pub agent_command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_prompt_path: Option<PathBuf>,
}

fn default_review_cycles() -> u32 {
    3
}

fn default_review_timeout_ms() -> u64 {
    600_000
}

fn default_review_command() -> String {
    "atelier-review".to_string()
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            max_cycles: default_review_cycles(),
            timeout_ms: default_review_timeout_ms(),
            agent_command: default_review_command(),
            agent_prompt_path: None,
        }
    }
}

/// Iterative controller ("ralph loop") configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RalphConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_iteration_delay_ms")]
    pub iteration_delay_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_promise")]
    pub promise: PromiseConfig,
    #[serde(default = "default_done_signal")]
    pub done_signal: DoneSignalConfig,
    #[serde(default)]
    pub git_operations: GitOperationsConfig,
    #[serde(default)]
    pub review: ReviewConfig,
}

fn default_max_iterations() -> u32 {
    10
}

fn default_iteration_delay_ms() -> u64 {
    5_000
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_promise() -> PromiseConfig {
    PromiseConfig::PlanComplete {
        path: PathBuf::from("IMPLEMENTATION_PLAN.md"),
    }
}

fn default_done_signal() -> DoneSignalConfig {
    DoneSignalConfig::Status {
        status: crate::session::SessionStatus::Complete,
    }
}

impl Default for RalphConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            iteration_delay_ms: default_iteration_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            promise: default_promise(),
            done_signal: default_done_signal(),
            git_operations: GitOperationsConfig::default(),
            review: ReviewConfig::default(),
        }
    }
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub repositories: Vec<RepoConfig>,
    #[serde(default)]
    pub spawner: SpawnerConfig,
    #[serde(default)]
    pub ralph: RalphConfig,
    /// Heartbeat age beyond which a session counts as stale.
    #[serde(default = "default_stale_secs")]
    pub stale_after_secs: u64,
    /// Command invoked with a single message argument for notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_command: Option<Vec<String>>,
}

fn default_stale_secs() -> u64 {
    90
}

impl Default for Config {
    fn default() -> Self {
        Self {
            repositories: Vec::new(),
            spawner: SpawnerConfig::default(),
            ralph: RalphConfig::default(),
            stale_after_secs: default_stale_secs(),
            notify_command: None,
        }
    }
}

impl Config {
    /// Resolve the orchestration base directory (`~/.orchestration`).
    pub fn base_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().ok_or_else(|| {
            AtelierError::Config("could not determine home directory".to_string())
        })?;
        Ok(home.join(BASE_DIR_NAME))
    }

    /// Resolve the config file path, honoring `ORCH_CONFIG_PATH`.
    pub fn config_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Ok(PathBuf::from(path));
        }
        Ok(Self::base_dir()?.join("config.json"))
    }

    /// Load the config from the resolved path, or defaults if absent.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| AtelierError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    pub fn repo(&self, id: &str) -> Option<&RepoConfig> {
        self.repositories.iter().find(|r| r.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_defaults_to_root_basename() {
        let repo = RepoConfig {
            id: "demo".to_string(),
            root: PathBuf::from("/work/widgets"),
            base_branch: "main".to_string(),
            github_owner: "acme".to_string(),
            github_repo: "widgets".to_string(),
            worktree_prefix: None,
            default_mode: SessionMode::Manual,
        };
        assert_eq!(repo.prefix(), "widgets-");
    }

    #[test]
    fn explicit_prefix_wins() {
        let repo = RepoConfig {
            id: "demo".to_string(),
            root: PathBuf::from("/work/widgets"),
            base_branch: "main".to_string(),
            github_owner: "acme".to_string(),
            github_repo: "widgets".to_string(),
            worktree_prefix: Some("wt-".to_string()),
            default_mode: SessionMode::Manual,
        };
        assert_eq!(repo.prefix(), "wt-");
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let json = r#"{
            "repositories": [{
                "id": "demo",
                "root": "/work/demo",
                "github_owner": "acme",
                "github_repo": "demo"
            }]
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.repositories.len(), 1);
        assert_eq!(config.repositories[0].base_branch, "main");
        assert_eq!(config.spawner.kind, SpawnerKind::Headless);
        assert_eq!(config.ralph.max_iterations, 10);
        assert_eq!(config.stale_after_secs, 90);
    }

    #[test]
    fn promise_config_is_tagged() {
        let json = r#"{"kind": "tests_pass", "command": "cargo test"}"#;
        let promise: PromiseConfig = serde_json::from_str(json).unwrap();
        match promise {
            PromiseConfig::TestsPass { command } => assert_eq!(command, "cargo test"),
            other => panic!("unexpected promise: {:?}", other),
        }
    }

    #[test]
    fn missing_config_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("nope.json")).unwrap();
        assert!(config.repositories.is_empty());
    }
}
