//! Durable session record store.
//!
//! The multiplexer treats this as an external collaborator: a row store for
//! [`SessionRecord`]s that must survive process restarts. The shipped
//! implementation keeps one JSON file per session under the data directory.
//! Callers log-and-continue on store errors — the live terminal is never
//! held hostage by its bookkeeping.

use std::fs;
use std::path::{Path, PathBuf};
use termdeck_core::{DeckError, DeckResult, SessionRecord, SessionStatus};
use tracing::{debug, warn};

/// CRUD over durable session metadata.
///
/// Methods are synchronous: records are single small JSON documents and the
/// store is consulted from the multiplexer's serialized control flow only.
pub trait SessionStore: Send + Sync {
    fn upsert(&self, record: &SessionRecord) -> DeckResult<()>;

    fn get(&self, session_id: &str) -> DeckResult<Option<SessionRecord>>;

    /// Look up a session by its recovery token. Malformed or unknown tokens
    /// yield `None`, never an error.
    fn find_by_recovery_token(&self, token: &str) -> DeckResult<Option<SessionRecord>>;

    fn list_for_workspace(&self, workspace_id: &str) -> DeckResult<Vec<SessionRecord>>;

    /// Startup reconciliation: flip every `active`/`paused` record to
    /// `terminated` (no process survives a server restart). Returns how many
    /// records were flipped.
    fn mark_all_terminated(&self) -> DeckResult<usize>;
}

/// One JSON file per session under `<dir>/<session_id>.json`.
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> DeckResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn record_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.json"))
    }

    fn read_record(&self, path: &Path) -> Option<SessionRecord> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "unreadable session record");
                }
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(record) => Some(record),
            Err(e) => {
                // A corrupt record is skipped, never fatal to the scan.
                warn!(path = %path.display(), error = %e, "corrupt session record skipped");
                None
            }
        }
    }

    fn scan(&self) -> DeckResult<Vec<SessionRecord>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "json") {
                if let Some(record) = self.read_record(&path) {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }
}

impl SessionStore for FileSessionStore {
    fn upsert(&self, record: &SessionRecord) -> DeckResult<()> {
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| DeckError::Persistence(format!("encode record: {e}")))?;
        fs::write(self.record_path(&record.id), json)
            .map_err(|e| DeckError::Persistence(format!("write record: {e}")))?;
        Ok(())
    }

    fn get(&self, session_id: &str) -> DeckResult<Option<SessionRecord>> {
        Ok(self.read_record(&self.record_path(session_id)))
    }

    fn find_by_recovery_token(&self, token: &str) -> DeckResult<Option<SessionRecord>> {
        Ok(self.scan()?.into_iter().find(|r| r.recovery_token == token))
    }

    fn list_for_workspace(&self, workspace_id: &str) -> DeckResult<Vec<SessionRecord>> {
        let mut records: Vec<SessionRecord> = self
            .scan()?
            .into_iter()
            .filter(|r| r.workspace_id == workspace_id)
            .collect();
        records.sort_by_key(|r| r.created_at_ms);
        Ok(records)
    }

    fn mark_all_terminated(&self) -> DeckResult<usize> {
        let mut flipped = 0usize;
        for mut record in self.scan()? {
            if record.status != SessionStatus::Terminated {
                record.status = SessionStatus::Terminated;
                record.touch();
                self.upsert(&record)?;
                flipped += 1;
            }
        }
        if flipped > 0 {
            debug!(count = flipped, "stale session records marked terminated");
        }
        Ok(flipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn record(id: &str, workspace: &str, token: &str) -> SessionRecord {
        SessionRecord::new(
            id.into(),
            workspace.into(),
            token.into(),
            PathBuf::from("/tmp"),
            80,
            24,
        )
    }

    fn store() -> (tempfile::TempDir, FileSessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path().join("sessions")).unwrap();
        (dir, store)
    }

    #[test]
    fn upsert_and_get_round_trip() {
        let (_dir, store) = store();
        let rec = record("s1", "w1", "tok-1");
        store.upsert(&rec).unwrap();

        let loaded = store.get("s1").unwrap().unwrap();
        assert_eq!(loaded.workspace_id, "w1");
        assert_eq!(loaded.recovery_token, "tok-1");
        assert_eq!(loaded.status, SessionStatus::Active);
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn find_by_token_ignores_unknown_tokens() {
        let (_dir, store) = store();
        store.upsert(&record("s1", "w1", "tok-1")).unwrap();
        store.upsert(&record("s2", "w2", "tok-2")).unwrap();

        let hit = store.find_by_recovery_token("tok-2").unwrap().unwrap();
        assert_eq!(hit.id, "s2");
        assert!(store.find_by_recovery_token("garbage").unwrap().is_none());
    }

    #[test]
    fn list_for_workspace_filters_and_sorts() {
        let (_dir, store) = store();
        let mut a = record("s1", "w1", "t1");
        a.created_at_ms = 2;
        let mut b = record("s2", "w1", "t2");
        b.created_at_ms = 1;
        store.upsert(&a).unwrap();
        store.upsert(&b).unwrap();
        store.upsert(&record("s3", "w2", "t3")).unwrap();

        let listed = store.list_for_workspace("w1").unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, "s2");
        assert_eq!(listed[1].id, "s1");
    }

    #[test]
    fn mark_all_terminated_flips_live_records_only() {
        let (_dir, store) = store();
        let mut paused = record("s1", "w1", "t1");
        paused.status = SessionStatus::Paused;
        let mut dead = record("s2", "w1", "t2");
        dead.status = SessionStatus::Terminated;
        store.upsert(&paused).unwrap();
        store.upsert(&dead).unwrap();
        store.upsert(&record("s3", "w1", "t3")).unwrap();

        let flipped = store.mark_all_terminated().unwrap();
        assert_eq!(flipped, 2);
        for id in ["s1", "s2", "s3"] {
            let rec = store.get(id).unwrap().unwrap();
            assert_eq!(rec.status, SessionStatus::Terminated, "{id}");
        }
    }

    #[test]
    fn corrupt_record_is_skipped_not_fatal() {
        let (_dir, store) = store();
        store.upsert(&record("s1", "w1", "t1")).unwrap();
        fs::write(store.record_path("junk"), "{not json").unwrap();

        let listed = store.list_for_workspace("w1").unwrap();
        assert_eq!(listed.len(), 1);
    }
}
