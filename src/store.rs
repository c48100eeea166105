//! Session store - file-per-session persistence
//!
//! One directory per repository under the orchestration base dir; one
//! `work-<sessionId>.json` file per session. Writes go through a temp file
//! and rename so readers (the file watcher, external inspectors) never see
//! a partial record.

use crate::session::{
    SessionContext, SessionDynamicState, SessionRecord, WORKTREE_META_DIR,
};
use crate::Result;
use std::fs;
use std::path::{Path, PathBuf};

/// Prefix of every session file name.
pub const SESSION_FILE_PREFIX: &str = "work-";

/// File-per-session store for one repository.
pub struct SessionStore {
    sessions_dir: PathBuf,
}

impl SessionStore {
    /// Open (creating if needed) the store at `<base>/<repoId>/sessions/`.
    pub fn open(base_dir: &Path, repo_id: &str) -> Result<Self> {
        let sessions_dir = base_dir.join(repo_id).join("sessions");
        fs::create_dir_all(&sessions_dir)?;
        Ok(Self { sessions_dir })
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    /// File path for a session id.
    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.sessions_dir
            .join(format!("{}{}.json", SESSION_FILE_PREFIX, session_id))
    }

    /// Session id encoded in a store file name, if it is one.
    pub fn session_id_for_path(path: &Path) -> Option<String> {
        let name = path.file_name()?.to_str()?;
        let stem = name.strip_suffix(".json")?;
        let id = stem.strip_prefix(SESSION_FILE_PREFIX)?;
        if id.is_empty() {
            None
        } else {
            Some(id.to_string())
        }
    }

    /// Serialise and atomically replace the session file.
    pub fn save(&self, record: &SessionRecord) -> Result<()> {
        let path = self.path_for(&record.session_id);
        write_json_atomic(&path, record)
    }

    /// Load a record; parse failures are logged and reported as absent.
    pub fn load(&self, session_id: &str) -> Option<SessionRecord> {
        let path = self.path_for(session_id);
        read_record(&path)
    }

    /// All records, ordered by primary issue number. Unparseable files
    /// are skipped.
    pub fn list_all(&self) -> Result<Vec<SessionRecord>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.sessions_dir)? {
            let entry = entry?;
            let path = entry.path();
            if Self::session_id_for_path(&path).is_none() {
                continue;
            }
            if let Some(record) = read_record(&path) {
                records.push(record);
            }
        }
        records.sort_by_key(|r| r.issue.number);
        Ok(records)
    }

    pub fn delete(&self, session_id: &str) -> Result<()> {
        let path = self.path_for(session_id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn exists(&self, session_id: &str) -> bool {
        self.path_for(session_id).exists()
    }
}

fn read_record(path: &Path) -> Option<SessionRecord> {
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(_) => return None,
    };
    match serde_json::from_str(&text) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "skipping unparseable session file");
            None
        }
    }
}

/// Write JSON via temp-file-then-rename so no reader sees a partial file.
fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn meta_dir(worktree: &Path) -> PathBuf {
    worktree.join(WORKTREE_META_DIR)
}

/// Write the static session context into a worktree. Written once at spawn.
pub fn write_session_context(worktree: &Path, ctx: &SessionContext) -> Result<()> {
    let dir = meta_dir(worktree);
    fs::create_dir_all(&dir)?;
    write_json_atomic(&dir.join("session-context.json"), ctx)
}

pub fn read_session_context(worktree: &Path) -> Option<SessionContext> {
    let path = meta_dir(worktree).join("session-context.json");
    let text = fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

/// Rewrite the dynamic state file a running worker polls.
pub fn write_session_state(worktree: &Path, state: &SessionDynamicState) -> Result<()> {
    let dir = meta_dir(worktree);
    fs::create_dir_all(&dir)?;
    write_json_atomic(&dir.join("session-state.json"), state)
}

pub fn read_session_state(worktree: &Path) -> Option<SessionDynamicState> {
    let path = meta_dir(worktree).join("session-state.json");
    let text = fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
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
                body: "body".to_string(),
            },
            format!("issue-{}", n),
            PathBuf::from(format!("/tmp/demo-issue-{}", n)),
            SessionMode::Manual,
        )
    }

    #[test]
    fn save_then_load_round_trips() {
        let base = tempfile::tempdir().unwrap();
        let store = SessionStore::open(base.path(), "demo").unwrap();
        let rec = record(42);
        store.save(&rec).unwrap();

        let loaded = store.load("42").expect("record should load");
        assert_eq!(loaded.session_id, "42");
        assert_eq!(loaded.issue.title, "Issue 42");
        assert_eq!(loaded.status, SessionStatus::Registered);
    }

    #[test]
    fn filename_encodes_session_id() {
        let base = tempfile::tempdir().unwrap();
        let store = SessionStore::open(base.path(), "demo").unwrap();
        let path = store.path_for("42");
        assert_eq!(
            SessionStore::session_id_for_path(&path).as_deref(),
            Some("42")
        );
        assert_eq!(
            SessionStore::session_id_for_path(Path::new("/x/other.json")),
            None
        );
        assert_eq!(
            SessionStore::session_id_for_path(Path::new("/x/work-1.json.tmp")),
            None
        );
    }

    #[test]
    fn list_all_orders_by_issue_and_skips_garbage() {
        let base = tempfile::tempdir().unwrap();
        let store = SessionStore::open(base.path(), "demo").unwrap();
        store.save(&record(9)).unwrap();
        store.save(&record(2)).unwrap();
        store.save(&record(30)).unwrap();
        fs::write(store.path_for("bad"), "{ not json").unwrap();

        let all = store.list_all().unwrap();
        let numbers: Vec<u64> = all.iter().map(|r| r.issue.number).collect();
        assert_eq!(numbers, vec![2, 9, 30]);
    }

    #[test]
    fn delete_is_idempotent() {
        let base = tempfile::tempdir().unwrap();
        let store = SessionStore::open(base.path(), "demo").unwrap();
        store.save(&record(1)).unwrap();
        assert!(store.exists("1"));
        store.delete("1").unwrap();
        assert!(!store.exists("1"));
        store.delete("1").unwrap();
    }

    #[test]
    fn no_temp_file_left_behind_after_save() {
        let base = tempfile::tempdir().unwrap();
        let store = SessionStore::open(base.path(), "demo").unwrap();
        store.save(&record(5)).unwrap();
        let leftovers: Vec<_> = fs::read_dir(store.sessions_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn worktree_state_round_trips() {
        let worktree = tempfile::tempdir().unwrap();
        let state = SessionDynamicState {
            status: SessionStatus::Working,
            forwarded_message: Some("use variant B".to_string()),
            last_updated: chrono::Utc::now(),
        };
        write_session_state(worktree.path(), &state).unwrap();
        let back = read_session_state(worktree.path()).expect("state should read");
        assert_eq!(back.status, SessionStatus::Working);
        assert_eq!(back.forwarded_message.as_deref(), Some("use variant B"));
    }

    #[test]
    fn missing_worktree_state_reads_as_none() {
        let worktree = tempfile::tempdir().unwrap();
        assert!(read_session_state(worktree.path()).is_none());
        assert!(read_session_context(worktree.path()).is_none());
    }
}
