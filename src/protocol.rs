//! Control-plane wire protocol
//!
//! Message types exchanged with dashboard and terminal clients over the
//! WebSocket surface. The server itself is a thin adapter elsewhere;
//! these types are the contract.

use crate::manager::{SessionEvent, SessionEventKind};
use crate::session::SessionRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Messages the control plane pushes to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "session:add")]
    SessionAdd {
        #[serde(rename = "repositoryId")]
        repository_id: String,
        #[serde(rename = "sessionId")]
        session_id: String,
        session: SessionRecord,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "session:update")]
    SessionUpdate {
        #[serde(rename = "repositoryId")]
        repository_id: String,
        #[serde(rename = "sessionId")]
        session_id: String,
        session: SessionRecord,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "session:remove")]
    SessionRemove {
        #[serde(rename = "repositoryId")]
        repository_id: String,
        #[serde(rename = "sessionId")]
        session_id: String,
        timestamp: DateTime<Utc>,
    },

    /// Full listing, broadcast periodically as a fallback for clients
    /// that missed incremental events.
    #[serde(rename = "sessions:snapshot")]
    SessionsSnapshot {
        sessions: Vec<SnapshotEntry>,
        timestamp: DateTime<Utc>,
    },

    /// Periodic orphan sweep results.
    #[serde(rename = "orphans:detected")]
    OrphansDetected {
        orphans: Vec<OrphanEntry>,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "terminal:connected")]
    TerminalConnected {
        #[serde(rename = "sessionId")]
        session_id: String,
    },

    #[serde(rename = "terminal:data")]
    TerminalData {
        #[serde(rename = "sessionId")]
        session_id: String,
        /// Raw terminal bytes, lossily decoded.
        data: String,
    },

    #[serde(rename = "terminal:exit")]
    TerminalExit {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "exitCode", skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },

    #[serde(rename = "terminal:error")]
    TerminalError {
        #[serde(rename = "sessionId")]
        session_id: String,
        message: String,
    },
}

/// Messages terminal clients send to the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "terminal:connect")]
    TerminalConnect {
        #[serde(rename = "sessionId")]
        session_id: String,
    },

    #[serde(rename = "terminal:input")]
    TerminalInput {
        #[serde(rename = "sessionId")]
        session_id: String,
        data: String,
    },

    #[serde(rename = "terminal:resize")]
    TerminalResize {
        #[serde(rename = "sessionId")]
        session_id: String,
        rows: u16,
        cols: u16,
    },

    #[serde(rename = "terminal:disconnect")]
    TerminalDisconnect {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEntry {
    #[serde(rename = "repositoryId")]
    pub repository_id: String,
    pub session: SessionRecord,
    #[serde(rename = "worktreeMissing")]
    pub worktree_missing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrphanEntry {
    #[serde(rename = "repositoryId")]
    pub repository_id: String,
    pub path: std::path::PathBuf,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ServerMessage {
    /// Wrap a session-manager event for the wire.
    pub fn from_event(event: SessionEvent) -> Option<Self> {
        let timestamp = Utc::now();
        match event.kind {
            SessionEventKind::Added => event.record.map(|session| ServerMessage::SessionAdd {
                repository_id: event.repo_id,
                session_id: event.session_id,
                session,
                timestamp,
            }),
            SessionEventKind::Updated => {
                event.record.map(|session| ServerMessage::SessionUpdate {
                    repository_id: event.repo_id,
                    session_id: event.session_id,
                    session,
                    timestamp,
                })
            }
            SessionEventKind::Removed => Some(ServerMessage::SessionRemove {
                repository_id: event.repo_id,
                session_id: event.session_id,
                timestamp,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{IssueRef, SessionMode};
    use std::path::PathBuf;

    fn record() -> SessionRecord {
        SessionRecord::new(
            "widgets",
            IssueRef {
                number: 42,
                title: "Add X".to_string(),
                body: String::new(),
            },
            "issue-42",
            PathBuf::from("/work/widgets-issue-42"),
            SessionMode::Manual,
        )
    }

    #[test]
    fn server_messages_use_colon_tags() {
        let message = ServerMessage::SessionRemove {
            repository_id: "widgets".to_string(),
            session_id: "42".to_string(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"type\":\"session:remove\""));
        assert!(json.contains("\"repositoryId\":\"widgets\""));
        assert!(json.contains("\"sessionId\":\"42\""));
    }

    #[test]
    fn client_messages_round_trip() {
        let json = r#"{"type":"terminal:resize","sessionId":"42","rows":40,"cols":120}"#;
        let message: ClientMessage = serde_json::from_str(json).unwrap();
        match message {
            ClientMessage::TerminalResize {
                session_id,
                rows,
                cols,
            } => {
                assert_eq!(session_id, "42");
                assert_eq!(rows, 40);
                assert_eq!(cols, 120);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn add_event_converts_with_payload() {
        let event = SessionEvent {
            repo_id: "widgets".to_string(),
            kind: SessionEventKind::Added,
            session_id: "42".to_string(),
            record: Some(record()),
        };
        let message = ServerMessage::from_event(event).unwrap();
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"type\":\"session:add\""));
        assert!(json.contains("\"session\":{"));
    }

    #[test]
    fn add_event_without_record_converts_to_nothing() {
        let event = SessionEvent {
            repo_id: "widgets".to_string(),
            kind: SessionEventKind::Added,
            session_id: "42".to_string(),
            record: None,
        };
        assert!(ServerMessage::from_event(event).is_none());
    }
}
