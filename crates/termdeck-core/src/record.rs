//! Persisted session metadata.
//!
//! A [`SessionRecord`] is the durable row behind every shell session. It
//! survives server restarts so that a reconnecting client can be offered a
//! recovered session seeded from the recorded working directory, environment,
//! and terminal size.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// At least one connection is attached and the process is running.
    Active,
    /// No connections attached; the process is kept alive.
    Paused,
    /// The process exited, was killed, or was not recoverable at startup.
    Terminated,
}

/// Durable metadata for one PTY-backed shell session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Stable session identifier, used on the wire and in pane assignments.
    pub id: String,
    /// Owning workspace.
    pub workspace_id: String,
    /// OS process id of the shell; changes across recovery.
    pub pid: Option<u32>,
    /// Secret a client presents to reclaim this session after a full
    /// disconnect. Unique per session.
    pub recovery_token: String,
    pub status: SessionStatus,
    pub cols: u16,
    pub rows: u16,
    /// Working directory the shell was started in (best-effort snapshot).
    pub cwd: PathBuf,
    /// Environment overrides applied at spawn (best-effort snapshot).
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Most recent completed input line, kept for recovery breadcrumbs.
    pub last_command: Option<String>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl SessionRecord {
    /// Build a fresh record for a newly created session.
    pub fn new(
        id: String,
        workspace_id: String,
        recovery_token: String,
        cwd: PathBuf,
        cols: u16,
        rows: u16,
    ) -> Self {
        let now = now_ms();
        Self {
            id,
            workspace_id,
            pid: None,
            recovery_token,
            status: SessionStatus::Active,
            cols,
            rows,
            cwd,
            env: HashMap::new(),
            last_command: None,
            created_at_ms: now,
            updated_at_ms: now,
        }
    }

    /// Refresh the modification timestamp.
    pub fn touch(&mut self) {
        self.updated_at_ms = now_ms();
    }

    /// Whether the record could still be backing a live process.
    pub fn is_resumable(&self) -> bool {
        self.status != SessionStatus::Terminated
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&SessionStatus::Paused).unwrap(),
            "\"paused\""
        );
    }

    #[test]
    fn terminated_is_not_resumable() {
        let mut r = SessionRecord::new(
            "s1".into(),
            "w1".into(),
            "tok".into(),
            PathBuf::from("/tmp"),
            80,
            24,
        );
        assert!(r.is_resumable());
        r.status = SessionStatus::Terminated;
        assert!(!r.is_resumable());
    }
}
