//! Interactive PTY spawner
//!
//! Runs the worker inside a pseudo-terminal, waits for its ready marker,
//! then types the prompt and submits it with a carriage return. The PTY
//! byte stream stays available for terminal subscribers, with a bounded
//! window of recent output for late attach.

use super::{
    generate_spawn_id, worker_log_name, write_spawn_info, SpawnOutcome, SpawnRequest,
    WorkerSpawner, WorkerStatus,
};
use crate::config::PtyConfig;
use crate::session::WORKTREE_META_DIR;
use async_trait::async_trait;
use chrono::Utc;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// How long to wait for the worker's ready marker before giving up.
const READY_TIMEOUT: Duration = Duration::from_secs(15);

/// Pause after the marker appears, letting the worker's UI settle.
const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Recent worker output kept per session for late-attaching terminals.
const HISTORY_CAPACITY: usize = 256 * 1024;

/// Bounded window over a worker's terminal output.
///
/// A terminal client attaching mid-session gets this as its backlog;
/// only the most recent bytes are kept. The complete stream is on disk
/// in the worker log, so older output is simply discarded.
pub struct OutputHistory {
    bytes: VecDeque<u8>,
    capacity: usize,
}

impl OutputHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: VecDeque::new(),
            capacity,
        }
    }

    /// Append a chunk of output, discarding the oldest bytes once the
    /// window is full.
    pub fn append(&mut self, chunk: &[u8]) {
        if self.capacity == 0 {
            return;
        }
        if chunk.len() >= self.capacity {
            self.bytes.clear();
            self.bytes.extend(&chunk[chunk.len() - self.capacity..]);
            return;
        }
        let overflow = (self.bytes.len() + chunk.len()).saturating_sub(self.capacity);
        self.bytes.drain(..overflow);
        self.bytes.extend(chunk);
    }

    /// The retained output, oldest bytes first.
    pub fn contents(&self) -> Vec<u8> {
        let (front, back) = self.bytes.as_slices();
        let mut out = Vec::with_capacity(front.len() + back.len());
        out.extend_from_slice(front);
        out.extend_from_slice(back);
        out
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }
}

/// Decides, from accumulated output, whether the worker is ready for
/// input. Injected so tests can drive readiness deterministically.
pub trait ReadyDetector: Send + Sync {
    fn is_ready(&self, output: &str) -> bool;
}

/// Default detector: a fixed marker substring in ANSI-stripped output.
pub struct MarkerReady {
    marker: String,
}

impl MarkerReady {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }
}

impl ReadyDetector for MarkerReady {
    fn is_ready(&self, output: &str) -> bool {
        output.contains(&self.marker)
    }
}

struct PtyWorker {
    child: Box<dyn Child + Send + Sync>,
    writer: Box<dyn Write + Send>,
    master: Box<dyn MasterPty + Send>,
    history: Arc<Mutex<OutputHistory>>,
    output_tx: broadcast::Sender<Vec<u8>>,
    exit_code: Option<i32>,
    log_path: PathBuf,
}

/// Spawner running workers inside pseudo-terminals.
pub struct PtySpawner {
    worker_command: String,
    worker_args: Vec<String>,
    config: PtyConfig,
    ready: Arc<dyn ReadyDetector>,
    workers: Arc<Mutex<HashMap<String, PtyWorker>>>,
}

impl PtySpawner {
    pub fn new(worker_command: String, worker_args: Vec<String>, config: PtyConfig) -> Self {
        let ready = Arc::new(MarkerReady::new(config.ready_marker.clone()));
        Self::with_ready_detector(worker_command, worker_args, config, ready)
    }

    /// Construct with a custom readiness predicate (used by tests).
    pub fn with_ready_detector(
        worker_command: String,
        worker_args: Vec<String>,
        config: PtyConfig,
        ready: Arc<dyn ReadyDetector>,
    ) -> Self {
        Self {
            worker_command,
            worker_args,
            config,
            ready,
            workers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Pause long enough for the worker to buffer a typed prompt before
    /// the submitting carriage return: at least 1s, at most 3s, scaled
    /// by prompt length.
    fn submit_delay(prompt_len: usize) -> Duration {
        Duration::from_millis((1_000 + prompt_len as u64 / 100).min(3_000))
    }
}

#[async_trait]
impl WorkerSpawner for PtySpawner {
    async fn available(&self) -> bool {
        tokio::process::Command::new(&self.worker_command)
            .arg("--version")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn name(&self) -> &'static str {
        "interactive-pty"
    }

    async fn spawn(&self, request: SpawnRequest) -> SpawnOutcome {
        let spawn_id = generate_spawn_id();
        let spawned_at = Utc::now();

        let meta_dir = request.working_directory.join(WORKTREE_META_DIR);
        if let Err(e) = std::fs::create_dir_all(&meta_dir) {
            return SpawnOutcome::fail(format!("failed to create meta dir: {}", e));
        }
        let log_path = meta_dir.join(worker_log_name(request.iteration));
        let mut log_file = match std::fs::File::create(&log_path) {
            Ok(f) => f,
            Err(e) => return SpawnOutcome::fail(format!("failed to create log file: {}", e)),
        };

        let pty_system = native_pty_system();
        let size = PtySize {
            rows: self.config.rows,
            cols: self.config.cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        let pair = match pty_system.openpty(size) {
            Ok(p) => p,
            Err(e) => return SpawnOutcome::fail(format!("failed to open pty: {}", e)),
        };

        let mut cmd = CommandBuilder::new(&self.worker_command);
        cmd.args(&self.worker_args);
        cmd.cwd(&request.working_directory);

        let mut child = match pair.slave.spawn_command(cmd) {
            Ok(c) => c,
            Err(e) => return SpawnOutcome::fail(format!("failed to spawn in pty: {}", e)),
        };
        let mut writer = match pair.master.take_writer() {
            Ok(w) => w,
            Err(e) => {
                let _ = child.kill();
                return SpawnOutcome::fail(format!("failed to take pty writer: {}", e));
            }
        };
        let mut reader = match pair.master.try_clone_reader() {
            Ok(r) => r,
            Err(e) => {
                let _ = child.kill();
                return SpawnOutcome::fail(format!("failed to clone pty reader: {}", e));
            }
        };

        let history = Arc::new(Mutex::new(OutputHistory::new(HISTORY_CAPACITY)));
        let (output_tx, _) = broadcast::channel(256);
        let (ready_tx, mut ready_rx) = watch::channel(false);

        // Reader thread: mirror PTY output to the history window, the
        // broadcast stream, and the log file, scanning stripped text for
        // the ready marker until it fires.
        let reader_history = history.clone();
        let reader_tx = output_tx.clone();
        let detector = self.ready.clone();
        std::thread::spawn(move || {
            let mut scanned = String::new();
            let mut ready_sent = false;
            // Some detectors need no output at all (test doubles).
            if detector.is_ready(&scanned) {
                ready_sent = true;
                let _ = ready_tx.send(true);
            }
            let mut chunk = [0u8; 4096];
            loop {
                match reader.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        let data = &chunk[..n];
                        if let Ok(mut guard) = reader_history.lock() {
                            guard.append(data);
                        }
                        let _ = reader_tx.send(data.to_vec());
                        if let Err(e) = log_file.write_all(data) {
                            tracing::warn!(error = %e, "failed to write pty log");
                        }
                        if !ready_sent {
                            let stripped = strip_ansi_escapes::strip(data);
                            scanned.push_str(&String::from_utf8_lossy(&stripped));
                            if detector.is_ready(&scanned) {
                                ready_sent = true;
                                scanned.clear();
                                let _ = ready_tx.send(true);
                            }
                            // Bound the scan window; markers are short.
                            if scanned.len() > 64 * 1024 {
                                let cut = scanned.len() - 32 * 1024;
                                scanned.drain(..cut);
                            }
                        }
                    }
                    Err(_) => break,
                }
            }
            let _ = log_file.flush();
        });

        // Wait for the ready marker, bounded.
        let became_ready = tokio::time::timeout(READY_TIMEOUT, async {
            loop {
                if *ready_rx.borrow() {
                    return true;
                }
                if ready_rx.changed().await.is_err() {
                    return *ready_rx.borrow();
                }
            }
        })
        .await
        .unwrap_or(false);

        if !became_ready {
            tracing::warn!(
                session_id = %request.session_id,
                "worker never showed ready marker, killing pty"
            );
            let _ = child.kill();
            return SpawnOutcome::fail("worker did not become ready within 15s");
        }

        tokio::time::sleep(SETTLE_DELAY).await;

        // Type the prompt, give the worker time to buffer it, then submit.
        if let Err(e) = writer.write_all(request.prompt_content.as_bytes()) {
            let _ = child.kill();
            return SpawnOutcome::fail(format!("failed to write prompt: {}", e));
        }
        let _ = writer.flush();
        tokio::time::sleep(Self::submit_delay(request.prompt_content.len())).await;
        if let Err(e) = writer.write_all(b"\r") {
            let _ = child.kill();
            return SpawnOutcome::fail(format!("failed to submit prompt: {}", e));
        }
        let _ = writer.flush();

        if let Err(e) = write_spawn_info(
            &request.working_directory,
            &spawn_id,
            spawned_at,
            request.issue.number,
            request.iteration,
        ) {
            let _ = child.kill();
            return SpawnOutcome::fail(format!("failed to write spawn-info: {}", e));
        }

        tracing::info!(
            spawn_id = %spawn_id,
            session_id = %request.session_id,
            "interactive worker ready, prompt submitted"
        );

        self.workers.lock().unwrap_or_else(|e| e.into_inner()).insert(
            spawn_id.clone(),
            PtyWorker {
                child,
                writer,
                master: pair.master,
                history,
                output_tx,
                exit_code: None,
                log_path,
            },
        );

        SpawnOutcome::ok(spawn_id, spawned_at)
    }

    async fn stop(&self, spawn_id: &str) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(worker) = workers.get_mut(spawn_id) {
            tracing::info!(spawn_id, "killing pty worker");
            if let Err(e) = worker.child.kill() {
                tracing::warn!(spawn_id, error = %e, "failed to kill pty worker");
            }
        }
    }

    async fn status(&self, spawn_id: &str) -> WorkerStatus {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        let Some(worker) = workers.get_mut(spawn_id) else {
            return WorkerStatus::unknown();
        };
        if let Some(code) = worker.exit_code {
            return WorkerStatus {
                running: false,
                exit_code: Some(code),
            };
        }
        match worker.child.try_wait() {
            Ok(Some(status)) => {
                let code = status.exit_code() as i32;
                worker.exit_code = Some(code);
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
                tracing::warn!(spawn_id, error = %e, "failed to poll pty worker");
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

    fn subscribe_output(&self, spawn_id: &str) -> Option<(Vec<u8>, broadcast::Receiver<Vec<u8>>)> {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        let worker = workers.get(spawn_id)?;
        let backlog = worker
            .history
            .lock()
            .map(|h| h.contents())
            .unwrap_or_default();
        Some((backlog, worker.output_tx.subscribe()))
    }

    async fn write_input(&self, spawn_id: &str, data: &[u8]) -> bool {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        let Some(worker) = workers.get_mut(spawn_id) else {
            return false;
        };
        worker.writer.write_all(data).and_then(|_| worker.writer.flush()).is_ok()
    }

    async fn resize(&self, spawn_id: &str, rows: u16, cols: u16) -> bool {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        let Some(worker) = workers.get(spawn_id) else {
            return false;
        };
        worker
            .master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_delay_is_clamped() {
        assert_eq!(PtySpawner::submit_delay(0), Duration::from_millis(1_000));
        assert_eq!(PtySpawner::submit_delay(10_000), Duration::from_millis(1_100));
        assert_eq!(PtySpawner::submit_delay(1_000_000), Duration::from_millis(3_000));
    }

    #[test]
    fn marker_detector_matches_substring() {
        let detector = MarkerReady::new("\u{276f}");
        assert!(!detector.is_ready("starting up..."));
        assert!(detector.is_ready("starting up...\n\u{276f} "));
    }

    #[test]
    fn history_starts_empty_and_accumulates_in_order() {
        let mut history = OutputHistory::new(64);
        assert_eq!(history.len(), 0);
        assert_eq!(history.contents(), b"");
        history.append(b"$ claude\n");
        history.append(b"reading plan...\n");
        assert_eq!(history.contents(), b"$ claude\nreading plan...\n");
    }

    #[test]
    fn history_discards_oldest_output_first() {
        let mut history = OutputHistory::new(10);
        history.append(b"iteration");
        history.append(b" 2");
        assert_eq!(history.len(), 10);
        assert_eq!(history.contents(), b"teration 2");
    }

    #[test]
    fn oversized_chunk_keeps_only_its_tail() {
        let mut history = OutputHistory::new(8);
        history.append(b"a very long burst of worker output");
        assert_eq!(history.contents(), b"r output");
        // The window recovers normally afterwards.
        history.append(b"!!");
        assert_eq!(history.contents(), b"output!!");
    }

    #[test]
    fn zero_capacity_history_stays_empty() {
        let mut history = OutputHistory::new(0);
        history.append(b"anything");
        assert_eq!(history.len(), 0);
        assert_eq!(history.contents(), b"");
    }

    struct AlwaysReady;
    impl ReadyDetector for AlwaysReady {
        fn is_ready(&self, _output: &str) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn spawn_with_injected_detector_submits_prompt() {
        let workdir = tempfile::tempdir().unwrap();
        // `cat` echoes the typed prompt back, so any output counts as
        // ready and the echoed prompt lands in the buffer.
        let spawner = PtySpawner::with_ready_detector(
            "cat".to_string(),
            vec![],
            PtyConfig::default(),
            Arc::new(AlwaysReady),
        );
        let outcome = spawner
            .spawn(SpawnRequest {
                session_id: "1".to_string(),
                issue: crate::session::IssueRef {
                    number: 1,
                    title: "t".to_string(),
                    body: String::new(),
                },
                working_directory: workdir.path().to_path_buf(),
                prompt_file_path: PathBuf::from("prompt.md"),
                prompt_content: "do the thing".to_string(),
                github_owner: "acme".to_string(),
                github_repo: "demo".to_string(),
                iteration: None,
                use_pty: true,
            })
            .await;
        assert!(outcome.success, "spawn failed: {:?}", outcome.error);
        let spawn_id = outcome.spawn_id.unwrap();

        assert!(spawner.status(&spawn_id).await.running);
        // Give the reader thread a beat to mirror the echoed prompt.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let (history, _rx) = spawner.subscribe_output(&spawn_id).expect("subscribe");
        let text = String::from_utf8_lossy(&history);
        assert!(text.contains("do the thing"), "history: {:?}", text);

        spawner.stop(&spawn_id).await;
    }
}
