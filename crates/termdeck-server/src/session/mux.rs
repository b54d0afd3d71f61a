//! Session multiplexing and recovery.
//!
//! Owns the mapping between workspaces, PTY-backed sessions, and attached
//! connections. Handles the create/resume/recover protocol, fans live output
//! out to every attachment through the room registry, keeps the durable
//! session records up to date, and sweeps for processes that died without a
//! clean exit.
//!
//! Locking: `sessions` is the single-writer heart of the core. Every map
//! mutation and every broadcast happens under its write lock, in the order
//! `sessions` → `by_conn` → rooms, so PTY output can never interleave with
//! an in-flight attach and history replay always precedes live output.

use super::history::HistoryStore;
use super::pty::{self, PtyEvent, PtyHandle, SpawnSpec};
use super::store::SessionStore;
use crate::transport::rooms::{session_room, workspace_room, ConnId, RoomRegistry};
use crate::workspace::{Workspace, WorkspaceResolver};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use termdeck_core::messages::{
    SessionSummary, TerminalError, TerminalKilled, TerminalOutput, TerminalReady,
    TerminalRecovered,
};
use termdeck_core::{
    generate_recovery_token, generate_session_id, ServerEvent, SessionRecord, SessionStatus,
};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Tuning knobs for the multiplexer.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Shell binary for new sessions.
    pub shell: String,
    /// Arguments passed to the shell (login shell by default).
    pub shell_args: Vec<String>,
    /// Directory holding per-session history logs.
    pub history_dir: PathBuf,
    /// Replay window per session, in chunks.
    pub history_capacity: usize,
    pub max_sessions: usize,
}

/// One live, in-memory session.
pub struct Session {
    pub record: SessionRecord,
    pub pty: PtyHandle,
    pub history: HistoryStore,
    /// Connections currently receiving this session's output.
    pub attached: HashSet<ConnId>,
    /// Accumulator for last-command tracking.
    input_line: String,
}

impl Session {
    fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.record.id.clone(),
            status: self.record.status,
            cols: self.record.cols,
            rows: self.record.rows,
            last_command: self.record.last_command.clone(),
            attached_count: self.attached.len(),
        }
    }
}

enum ReadyKind {
    Created,
    Resumed,
    Recovered { last_command: Option<String> },
}

/// Outcome of publishing a freshly spawned shell into the session map.
enum Install {
    /// Inserted; the output pump is running.
    Installed,
    /// A concurrent request installed the same session id first. The
    /// surplus shell was killed; callers join the winner instead.
    Lost,
    /// The session cap was hit; the surplus shell was killed.
    AtCapacity,
}

/// What `spawn_fresh` produced: a brand-new session, or the id of an
/// existing one when a concurrent create for the same id won.
enum Spawned {
    Fresh(String),
    Raced(String),
}

/// The session multiplexer. One instance per process, shared by `Arc`.
pub struct SessionMux {
    config: MuxConfig,
    store: Arc<dyn SessionStore>,
    workspaces: Arc<dyn WorkspaceResolver>,
    rooms: Arc<RoomRegistry>,
    sessions: RwLock<HashMap<String, Session>>,
    by_conn: RwLock<HashMap<ConnId, String>>,
}

impl SessionMux {
    pub fn new(
        config: MuxConfig,
        store: Arc<dyn SessionStore>,
        workspaces: Arc<dyn WorkspaceResolver>,
        rooms: Arc<RoomRegistry>,
    ) -> Self {
        if let Err(e) = std::fs::create_dir_all(&config.history_dir) {
            warn!(path = %config.history_dir.display(), error = %e, "could not create history dir");
        }
        Self {
            config,
            store,
            workspaces,
            rooms,
            sessions: RwLock::new(HashMap::new()),
            by_conn: RwLock::new(HashMap::new()),
        }
    }

    /// Startup reconciliation: no process survives a server restart, so any
    /// record still flagged active/paused is stale and gets terminated before
    /// the listener accepts connections.
    pub fn reconcile_startup(&self) {
        match self.store.mark_all_terminated() {
            Ok(0) => {}
            Ok(n) => info!(count = n, "reconciled stale session records"),
            Err(e) => warn!(error = %e, "startup reconciliation failed"),
        }
    }

    /// The create-or-resume protocol behind `create-terminal`.
    pub async fn create_or_resume(
        self: &Arc<Self>,
        conn: ConnId,
        workspace_id: &str,
        session_id: Option<String>,
        recovery_token: Option<String>,
        cols: Option<u16>,
        rows: Option<u16>,
    ) {
        let Some(workspace) = self.workspaces.get(workspace_id) else {
            self.error_to(conn, format!("workspace not found: {workspace_id}"))
                .await;
            return;
        };

        // A connection is attached to at most one session; switching always
        // detaches the old one first.
        self.detach(conn).await;

        // A recovery token only qualifies if its workspace matches.
        let token_record = match recovery_token.as_deref() {
            Some(token) => match self.store.find_by_recovery_token(token) {
                Ok(Some(rec)) if rec.workspace_id == workspace.id => Some(rec),
                Ok(_) => {
                    debug!(conn, "recovery token unknown or workspace mismatch, ignored");
                    None
                }
                Err(e) => {
                    warn!(error = %e, "recovery token lookup failed");
                    None
                }
            },
            None => None,
        };

        let target_id = session_id
            .clone()
            .or_else(|| token_record.as_ref().map(|r| r.id.clone()));

        // Resume: an in-memory session already backs the target.
        let resume_id = {
            let sessions = self.sessions.read().await;
            match &target_id {
                Some(sid) => sessions
                    .get(sid)
                    .filter(|s| s.record.workspace_id == workspace.id)
                    .map(|s| s.record.id.clone()),
                None => newest_for_workspace(&sessions, &workspace.id),
            }
        };
        if let Some(sid) = resume_id {
            self.attach_and_notify(conn, &sid, true, ReadyKind::Resumed)
                .await;
            return;
        }

        // Recover: a qualifying persisted record exists but no live session.
        let persisted = match token_record {
            Some(rec) => Some(rec),
            None => match &session_id {
                Some(sid) => match self.store.get(sid) {
                    Ok(Some(rec)) if rec.workspace_id == workspace.id => Some(rec),
                    Ok(_) => None,
                    Err(e) => {
                        warn!(error = %e, "session record lookup failed");
                        None
                    }
                },
                None => None,
            },
        };
        if let Some(record) = persisted {
            self.recover_session(conn, &workspace, record).await;
            return;
        }

        // Pristine create.
        self.create_session(conn, &workspace, session_id, cols, rows)
            .await;
    }

    async fn recover_session(self: &Arc<Self>, conn: ConnId, workspace: &Workspace, mut record: SessionRecord) {
        // Reconciliation already terminated anything predating this process;
        // a probe against such a record would hit a stale (possibly reused)
        // pid, so only records still claiming a live process are probed.
        if record.is_resumable() {
            if let Some(pid) = record.pid {
                if pty::is_alive(pid) {
                    // No PTY fd survives to reattach to; recovery is
                    // best-effort environment restoration either way.
                    warn!(session_id = %record.id, pid, "recorded pid still alive; spawning replacement shell");
                }
            }
        }

        let cwd = if record.cwd.is_dir() {
            record.cwd.clone()
        } else {
            workspace.local_path.clone()
        };
        let spec = SpawnSpec {
            shell: self.config.shell.clone(),
            args: self.config.shell_args.clone(),
            cwd: cwd.clone(),
            env: record.env.clone(),
            cols: record.cols,
            rows: record.rows,
        };
        let (handle, events) = match PtyHandle::spawn(&spec) {
            Ok(pair) => pair,
            Err(e) => {
                self.error_to(conn, e.to_string()).await;
                return;
            }
        };

        let last_command = record.last_command.clone();
        record.pid = handle.pid();
        record.cwd = cwd;
        record.status = SessionStatus::Active;
        record.touch();

        let sid = record.id.clone();
        let history = HistoryStore::open(
            self.history_path(&sid),
            self.config.history_capacity,
        )
        .await;

        match self.install_session(record, handle, history, events).await {
            Install::Installed => {
                info!(session_id = %sid, conn, "session recovered");
                self.attach_and_notify(conn, &sid, true, ReadyKind::Recovered { last_command })
                    .await;
            }
            Install::Lost => {
                // A concurrent request revived this session first.
                self.attach_and_notify(conn, &sid, true, ReadyKind::Resumed)
                    .await;
            }
            Install::AtCapacity => {
                self.error_to(
                    conn,
                    format!("max sessions ({}) reached", self.config.max_sessions),
                )
                .await;
            }
        }
    }

    async fn create_session(
        self: &Arc<Self>,
        conn: ConnId,
        workspace: &Workspace,
        session_id: Option<String>,
        cols: Option<u16>,
        rows: Option<u16>,
    ) {
        match self
            .spawn_fresh(workspace, session_id, cols.unwrap_or(80), rows.unwrap_or(24))
            .await
        {
            Ok(Spawned::Fresh(sid)) => {
                self.attach_and_notify(conn, &sid, false, ReadyKind::Created)
                    .await;
            }
            // Lost a concurrent create for the same id; the winner's
            // session is the one to join.
            Ok(Spawned::Raced(sid)) => {
                self.attach_and_notify(conn, &sid, true, ReadyKind::Resumed)
                    .await;
            }
            Err(e) => self.error_to(conn, e.to_string()).await,
        }
    }

    /// Spawn a session with no attachments. Used both for pristine creates
    /// and for filling empty panes after a split conversion.
    pub async fn create_detached(
        self: &Arc<Self>,
        workspace_id: &str,
    ) -> termdeck_core::DeckResult<String> {
        let workspace = self
            .workspaces
            .get(workspace_id)
            .ok_or_else(|| termdeck_core::DeckError::WorkspaceNotFound(workspace_id.to_string()))?;
        match self.spawn_fresh(&workspace, None, 80, 24).await? {
            Spawned::Fresh(sid) | Spawned::Raced(sid) => Ok(sid),
        }
    }

    async fn spawn_fresh(
        self: &Arc<Self>,
        workspace: &Workspace,
        session_id: Option<String>,
        cols: u16,
        rows: u16,
    ) -> termdeck_core::DeckResult<Spawned> {
        // Cheap early reject; install_session re-checks under the write
        // lock before anything becomes visible.
        {
            let sessions = self.sessions.read().await;
            if sessions.len() >= self.config.max_sessions {
                return Err(termdeck_core::DeckError::Other(format!(
                    "max sessions ({}) reached",
                    self.config.max_sessions
                )));
            }
        }

        let sid = session_id.unwrap_or_else(generate_session_id);
        let spec = SpawnSpec {
            shell: self.config.shell.clone(),
            args: self.config.shell_args.clone(),
            cwd: workspace.local_path.clone(),
            env: HashMap::new(),
            cols,
            rows,
        };
        let (handle, events) = PtyHandle::spawn(&spec)?;

        let mut record = SessionRecord::new(
            sid.clone(),
            workspace.id.clone(),
            generate_recovery_token(),
            workspace.local_path.clone(),
            cols,
            rows,
        );
        record.pid = handle.pid();

        let history = HistoryStore::open(
            self.history_path(&sid),
            self.config.history_capacity,
        )
        .await;

        match self.install_session(record, handle, history, events).await {
            Install::Installed => {
                info!(session_id = %sid, workspace_id = %workspace.id, "session created");
                Ok(Spawned::Fresh(sid))
            }
            Install::Lost => {
                debug!(session_id = %sid, "lost create race, joining the existing session");
                Ok(Spawned::Raced(sid))
            }
            Install::AtCapacity => Err(termdeck_core::DeckError::Other(format!(
                "max sessions ({}) reached",
                self.config.max_sessions
            ))),
        }
    }

    /// Publish a spawned session. The existence and capacity checks happen
    /// under the `sessions` write lock, so two concurrent creates for the
    /// same id can never both install a shell. The record is persisted here,
    /// on the winning path only, so a losing racer never clobbers the
    /// winner's durable record.
    async fn install_session(
        self: &Arc<Self>,
        record: SessionRecord,
        pty: PtyHandle,
        history: HistoryStore,
        events: mpsc::Receiver<PtyEvent>,
    ) -> Install {
        let sid = record.id.clone();
        {
            let mut sessions = self.sessions.write().await;
            if !sessions.contains_key(&sid) && sessions.len() < self.config.max_sessions {
                self.persist(&record);
                sessions.insert(
                    sid.clone(),
                    Session {
                        record,
                        pty,
                        history,
                        attached: HashSet::new(),
                        input_line: String::new(),
                    },
                );
                drop(sessions);
                self.spawn_pump(sid, events);
                return Install::Installed;
            }
            let outcome = if sessions.contains_key(&sid) {
                Install::Lost
            } else {
                Install::AtCapacity
            };
            drop(sessions);
            // The surplus shell never reaches the map; kill it and let the
            // dropped event receiver end its pump.
            if let Err(e) = pty.kill() {
                debug!(session_id = %sid, error = %e, "surplus shell kill failed");
            }
            outcome
        }
    }

    /// Per-session dispatcher: serializes PTY output onto the sessions lock,
    /// so history and fan-out stay ordered with respect to attaches.
    fn spawn_pump(self: &Arc<Self>, session_id: String, mut events: mpsc::Receiver<PtyEvent>) {
        let mux = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    PtyEvent::Data(chunk) => {
                        let mut sessions = mux.sessions.write().await;
                        let Some(session) = sessions.get_mut(&session_id) else {
                            break;
                        };
                        session.history.write(&chunk);
                        let room =
                            session_room(&session.record.workspace_id, &session_id);
                        let output = ServerEvent::TerminalOutput(TerminalOutput {
                            session_id: session_id.clone(),
                            data: String::from_utf8_lossy(&chunk).into_owned(),
                        });
                        // Broadcast while holding the sessions lock: an
                        // attach in flight either sees this chunk in its
                        // replay snapshot or joins the room before it.
                        mux.rooms.broadcast(&room, output).await;
                    }
                    PtyEvent::Exit { code } => {
                        mux.finish_session(&session_id, code, "exit").await;
                        break;
                    }
                }
            }
        });
    }

    /// Attach a connection to an in-memory session, replaying backlog to the
    /// requester only before any live output.
    async fn attach_and_notify(&self, conn: ConnId, session_id: &str, replay: bool, kind: ReadyKind) {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(session_id) else {
            self.error_to(conn, format!("session not found: {session_id}"))
                .await;
            return;
        };

        session.attached.insert(conn);
        if session.record.status != SessionStatus::Active {
            session.record.status = SessionStatus::Active;
            session.record.touch();
        }
        self.persist(&session.record);
        self.by_conn
            .write()
            .await
            .insert(conn, session_id.to_string());

        let ready = match kind {
            ReadyKind::Created => ServerEvent::TerminalCreated(TerminalReady {
                session_id: session.record.id.clone(),
                recovery_token: session.record.recovery_token.clone(),
            }),
            ReadyKind::Resumed => ServerEvent::TerminalResumed(TerminalReady {
                session_id: session.record.id.clone(),
                recovery_token: session.record.recovery_token.clone(),
            }),
            ReadyKind::Recovered { last_command } => {
                ServerEvent::TerminalRecovered(TerminalRecovered {
                    session_id: session.record.id.clone(),
                    recovery_token: session.record.recovery_token.clone(),
                    last_command,
                })
            }
        };
        self.rooms.send_to(conn, ready).await;

        if replay && !session.history.is_empty() {
            let mut backlog = Vec::new();
            for chunk in session.history.recent_chunks() {
                backlog.extend_from_slice(&chunk);
            }
            self.rooms
                .send_to(
                    conn,
                    ServerEvent::TerminalOutput(TerminalOutput {
                        session_id: session.record.id.clone(),
                        data: String::from_utf8_lossy(&backlog).into_owned(),
                    }),
                )
                .await;
        }

        // Join rooms only after the replay is enqueued; live output starts
        // strictly afterwards for this connection.
        let ws = session.record.workspace_id.clone();
        self.rooms.join(&session_room(&ws, session_id), conn).await;
        self.rooms.join(&workspace_room(&ws), conn).await;
        debug!(conn, session_id, attached = session.attached.len(), "connection attached");
    }

    /// Forward input bytes to the session's PTY. A connection without a
    /// session is a silent no-op: writes racing a teardown are expected.
    pub async fn write_input(&self, conn: ConnId, data: &str, session_id: Option<String>) {
        let mut sessions = self.sessions.write().await;
        let sid = match session_id {
            Some(sid) => sid,
            None => match self.by_conn.read().await.get(&conn) {
                Some(sid) => sid.clone(),
                None => return,
            },
        };
        let Some(session) = sessions.get_mut(&sid) else {
            return;
        };

        if let Err(e) = session.pty.write(data.as_bytes()) {
            debug!(session_id = %sid, error = %e, "write to PTY failed");
        }

        // Best-effort last-command tracking for recovery breadcrumbs.
        for ch in data.chars() {
            match ch {
                '\r' | '\n' => {
                    let line = session.input_line.trim().to_string();
                    session.input_line.clear();
                    if !line.is_empty() {
                        session.record.last_command = Some(line);
                        session.record.touch();
                        self.persist(&session.record);
                    }
                }
                '\u{7f}' | '\u{8}' => {
                    session.input_line.pop();
                }
                c if !c.is_control() => session.input_line.push(c),
                _ => {}
            }
        }
    }

    /// Resize the session's PTY and persist the new size.
    pub async fn resize(&self, conn: ConnId, cols: u16, rows: u16, session_id: Option<String>) {
        let mut sessions = self.sessions.write().await;
        let sid = match session_id {
            Some(sid) => sid,
            None => match self.by_conn.read().await.get(&conn) {
                Some(sid) => sid.clone(),
                None => return,
            },
        };
        let Some(session) = sessions.get_mut(&sid) else {
            return;
        };
        if let Err(e) = session.pty.resize(cols, rows) {
            debug!(session_id = %sid, error = %e, "PTY resize failed");
        }
        session.record.cols = cols;
        session.record.rows = rows;
        session.record.touch();
        self.persist(&session.record);
    }

    /// Detach a connection from whatever session it is attached to. The
    /// process is kept alive; an emptied attachment set pauses the session.
    pub async fn detach(&self, conn: ConnId) {
        let mut sessions = self.sessions.write().await;
        let sid = match self.by_conn.write().await.remove(&conn) {
            Some(sid) => sid,
            None => return,
        };
        let Some(session) = sessions.get_mut(&sid) else {
            return;
        };
        session.attached.remove(&conn);
        // Drops both the session room and any stale workspace-room
        // membership from a previous workspace.
        self.rooms.leave_all(conn).await;
        if session.attached.is_empty() {
            session.record.status = SessionStatus::Paused;
            session.record.touch();
            self.persist(&session.record);
            info!(session_id = %sid, "last connection detached, session paused");
        } else {
            debug!(session_id = %sid, conn, "connection detached");
        }
    }

    /// Explicit termination. Idempotent: killing an absent session is a
    /// no-op beyond a best-effort record update.
    pub async fn kill(self: &Arc<Self>, workspace_id: &str, session_id: Option<String>) {
        let sid = match session_id {
            Some(sid) => Some(sid),
            None => {
                let sessions = self.sessions.read().await;
                newest_for_workspace(&sessions, workspace_id)
            }
        };
        let Some(sid) = sid else {
            return;
        };

        let kill_result = {
            let sessions = self.sessions.read().await;
            match sessions.get(&sid) {
                Some(s) if s.record.workspace_id == workspace_id => Some(s.pty.kill()),
                _ => None,
            }
        };
        match kill_result {
            Some(result) => {
                if let Err(e) = result {
                    debug!(session_id = %sid, error = %e, "kill signal failed (process already gone?)");
                }
                self.finish_session(&sid, None, "kill").await;
            }
            None => {
                // Not in memory: make sure the durable record agrees, and
                // retire its token like any other explicit termination.
                if let Ok(Some(mut rec)) = self.store.get(&sid) {
                    if rec.workspace_id == workspace_id && rec.is_resumable() {
                        rec.status = SessionStatus::Terminated;
                        rec.pid = None;
                        rec.recovery_token = generate_recovery_token();
                        rec.touch();
                        self.persist(&rec);
                    }
                }
            }
        }
    }

    /// Common teardown for exits, explicit kills, and sweep cleanup. Safe to
    /// call multiple times; only the first call for a session has effects.
    async fn finish_session(&self, session_id: &str, exit_code: Option<i32>, reason: &str) {
        let session = {
            let mut sessions = self.sessions.write().await;
            let removed = sessions.remove(session_id);
            if removed.is_some() {
                self.by_conn
                    .write()
                    .await
                    .retain(|_, sid| sid != session_id);
            }
            removed
        };
        let Some(mut session) = session else {
            return;
        };

        // Terminated sessions can never be resumed; their scrollback goes too.
        session.history.clear();

        let mut record = session.record;
        record.status = SessionStatus::Terminated;
        record.pid = None;
        // Rotate the token: credentials handed out while the session was
        // alive must never resurrect it.
        record.recovery_token = generate_recovery_token();
        record.touch();
        self.persist(&record);

        let room = session_room(&record.workspace_id, session_id);
        self.rooms
            .broadcast(
                &room,
                ServerEvent::TerminalKilled(TerminalKilled {
                    session_id: session_id.to_string(),
                    exit_code,
                }),
            )
            .await;
        for conn in self.rooms.members(&room).await {
            self.rooms.leave(&room, conn).await;
        }
        info!(session_id, exit_code, reason, "session terminated");
    }

    /// Switch a connection to another session of the same workspace without
    /// a full history replay.
    pub async fn switch_session(&self, conn: ConnId, workspace_id: &str, session_id: &str) {
        let valid = {
            let sessions = self.sessions.read().await;
            sessions
                .get(session_id)
                .is_some_and(|s| s.record.workspace_id == workspace_id)
        };
        if !valid {
            self.error_to(conn, format!("session not found: {session_id}"))
                .await;
            return;
        }
        self.detach(conn).await;
        self.attach_and_notify(conn, session_id, false, ReadyKind::Resumed)
            .await;
    }

    /// Session list for a workspace. Attaches the connection to the default
    /// (most recent) session when one exists.
    pub async fn workspace_sessions(
        &self,
        conn: ConnId,
        workspace_id: &str,
    ) -> Vec<SessionSummary> {
        let (mut summaries, default) = {
            let sessions = self.sessions.read().await;
            let summaries: Vec<SessionSummary> = sessions
                .values()
                .filter(|s| s.record.workspace_id == workspace_id)
                .map(|s| s.summary())
                .collect();
            (summaries, newest_for_workspace(&sessions, workspace_id))
        };
        // Persisted records not yet loaded in memory still count.
        match self.store.list_for_workspace(workspace_id) {
            Ok(records) => {
                for rec in records {
                    if rec.is_resumable() && !summaries.iter().any(|s| s.session_id == rec.id) {
                        summaries.push(SessionSummary {
                            session_id: rec.id,
                            status: rec.status,
                            cols: rec.cols,
                            rows: rec.rows,
                            last_command: rec.last_command,
                            attached_count: 0,
                        });
                    }
                }
            }
            Err(e) => warn!(error = %e, "session record listing failed"),
        }
        summaries.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        if let Some(sid) = default {
            let already_attached = self.by_conn.read().await.get(&conn) == Some(&sid);
            if !already_attached {
                self.detach(conn).await;
                self.attach_and_notify(conn, &sid, true, ReadyKind::Resumed)
                    .await;
            }
        }
        summaries
    }

    /// In-memory session ids for a workspace (layout redistribution).
    pub async fn session_ids_for(&self, workspace_id: &str) -> Vec<String> {
        let sessions = self.sessions.read().await;
        let mut ids: Vec<(u64, String)> = sessions
            .values()
            .filter(|s| s.record.workspace_id == workspace_id)
            .map(|s| (s.record.created_at_ms, s.record.id.clone()))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Probe every in-memory session's process; dead ones take the normal
    /// exit teardown. Catches shells that died without delivering an exit
    /// event (OOM kills and the like).
    pub async fn sweep(self: &Arc<Self>) {
        let stale: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|s| s.record.pid.is_some_and(|pid| !pty::is_alive(pid)))
                .map(|s| s.record.id.clone())
                .collect()
        };
        for sid in stale {
            warn!(session_id = %sid, "liveness sweep found dead PTY process");
            self.finish_session(&sid, None, "sweep").await;
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Session a connection is currently attached to, if any.
    pub async fn attached_session(&self, conn: ConnId) -> Option<String> {
        self.by_conn.read().await.get(&conn).cloned()
    }

    fn history_path(&self, session_id: &str) -> PathBuf {
        self.config.history_dir.join(format!("{session_id}.log"))
    }

    /// Record-store writes never abort the in-memory lifecycle; a degraded
    /// store costs durability, not the live shell.
    fn persist(&self, record: &SessionRecord) {
        if let Err(e) = self.store.upsert(record) {
            warn!(session_id = %record.id, error = %e, "session record persistence failed");
        }
    }

    async fn error_to(&self, conn: ConnId, message: String) {
        self.rooms
            .send_to(conn, ServerEvent::TerminalError(TerminalError { message }))
            .await;
    }
}

fn newest_for_workspace(
    sessions: &HashMap<String, Session>,
    workspace_id: &str,
) -> Option<String> {
    sessions
        .values()
        .filter(|s| s.record.workspace_id == workspace_id)
        .max_by_key(|s| (s.record.created_at_ms, s.record.id.clone()))
        .map(|s| s.record.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::store::FileSessionStore;
    use crate::workspace::ManifestResolver;
    use std::path::Path;
    use std::time::Duration;

    fn harness(dir: &Path) -> (Arc<SessionMux>, Arc<RoomRegistry>, Arc<FileSessionStore>) {
        harness_with_shell(dir, "/bin/sh")
    }

    fn harness_with_shell(
        dir: &Path,
        shell: &str,
    ) -> (Arc<SessionMux>, Arc<RoomRegistry>, Arc<FileSessionStore>) {
        let store = Arc::new(FileSessionStore::new(dir.join("sessions")).unwrap());
        let resolver = Arc::new(ManifestResolver::from_workspaces(vec![Workspace {
            id: "w1".into(),
            name: "w1".into(),
            local_path: dir.to_path_buf(),
        }]));
        let rooms = Arc::new(RoomRegistry::new());
        let mux = Arc::new(SessionMux::new(
            MuxConfig {
                shell: shell.into(),
                shell_args: vec![],
                history_dir: dir.join("history"),
                history_capacity: 500,
                max_sessions: 16,
            },
            store.clone(),
            resolver,
            rooms.clone(),
        ));
        (mux, rooms, store)
    }

    async fn connect(rooms: &RoomRegistry, conn: ConnId) -> mpsc::Receiver<ServerEvent> {
        let (tx, rx) = mpsc::channel(1024);
        rooms.register(conn, tx).await;
        rx
    }

    async fn next_event(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    /// Drain output events until one contains `needle`.
    async fn wait_for_output(rx: &mut mpsc::Receiver<ServerEvent>, needle: &str) -> String {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        let mut seen = String::new();
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .expect("timed out waiting for terminal output");
            let event = tokio::time::timeout(remaining, rx.recv())
                .await
                .expect("timed out waiting for terminal output")
                .expect("event channel closed");
            if let ServerEvent::TerminalOutput(out) = event {
                seen.push_str(&out.data);
                if seen.contains(needle) {
                    return seen;
                }
            }
        }
    }

    #[tokio::test]
    async fn create_echo_and_broadcast() {
        let dir = tempfile::tempdir().unwrap();
        let (mux, rooms, _store) = harness(dir.path());
        let mut rx = connect(&rooms, 1).await;

        mux.create_or_resume(1, "w1", None, None, None, None).await;
        let (sid, token) = match next_event(&mut rx).await {
            ServerEvent::TerminalCreated(p) => (p.session_id, p.recovery_token),
            other => panic!("expected terminal-created, got {other:?}"),
        };
        assert!(!token.is_empty());
        assert_eq!(mux.session_count().await, 1);

        mux.write_input(1, "echo live-marker\n", None).await;
        wait_for_output(&mut rx, "live-marker").await;

        mux.kill("w1", Some(sid)).await;
    }

    #[tokio::test]
    async fn workspace_not_found_is_an_error_with_no_state() {
        let dir = tempfile::tempdir().unwrap();
        let (mux, rooms, _store) = harness(dir.path());
        let mut rx = connect(&rooms, 1).await;

        mux.create_or_resume(1, "nope", None, None, None, None).await;
        match next_event(&mut rx).await {
            ServerEvent::TerminalError(e) => assert!(e.message.contains("nope")),
            other => panic!("expected terminal-error, got {other:?}"),
        }
        assert_eq!(mux.session_count().await, 0);
    }

    #[tokio::test]
    async fn spawn_failure_leaves_no_orphan() {
        let dir = tempfile::tempdir().unwrap();
        let (mux, rooms, _store) = harness_with_shell(dir.path(), "/definitely/not/a/shell");
        let mut rx = connect(&rooms, 1).await;

        mux.create_or_resume(1, "w1", None, None, None, None).await;
        match next_event(&mut rx).await {
            ServerEvent::TerminalError(_) => {}
            other => panic!("expected terminal-error, got {other:?}"),
        }
        assert_eq!(mux.session_count().await, 0);
    }

    #[tokio::test]
    async fn at_most_one_process_per_session() {
        let dir = tempfile::tempdir().unwrap();
        let (mux, rooms, _store) = harness(dir.path());
        let mut rx1 = connect(&rooms, 1).await;
        let mut rx2 = connect(&rooms, 2).await;

        mux.create_or_resume(1, "w1", Some("fixed".into()), None, None, None)
            .await;
        match next_event(&mut rx1).await {
            ServerEvent::TerminalCreated(p) => assert_eq!(p.session_id, "fixed"),
            other => panic!("expected terminal-created, got {other:?}"),
        }

        // Same target from another connection resumes; no second process.
        mux.create_or_resume(2, "w1", Some("fixed".into()), None, None, None)
            .await;
        match next_event(&mut rx2).await {
            ServerEvent::TerminalResumed(p) => assert_eq!(p.session_id, "fixed"),
            other => panic!("expected terminal-resumed, got {other:?}"),
        }
        assert_eq!(mux.session_count().await, 1);
    }

    #[tokio::test]
    async fn concurrent_creates_converge_on_one_session() {
        let dir = tempfile::tempdir().unwrap();
        let (mux, rooms, store) = harness(dir.path());
        let mut rx1 = connect(&rooms, 1).await;
        let mut rx2 = connect(&rooms, 2).await;

        // Two connections request the same session id simultaneously; only
        // one shell may come out of it.
        let m1 = Arc::clone(&mux);
        let m2 = Arc::clone(&mux);
        let (a, b) = tokio::join!(
            tokio::spawn(async move {
                m1.create_or_resume(1, "w1", Some("fixed".into()), None, None, None)
                    .await;
            }),
            tokio::spawn(async move {
                m2.create_or_resume(2, "w1", Some("fixed".into()), None, None, None)
                    .await;
            }),
        );
        a.unwrap();
        b.unwrap();

        let mut created = 0;
        let mut tokens = Vec::new();
        for rx in [&mut rx1, &mut rx2] {
            match next_event(rx).await {
                ServerEvent::TerminalCreated(p) => {
                    assert_eq!(p.session_id, "fixed");
                    created += 1;
                    tokens.push(p.recovery_token);
                }
                ServerEvent::TerminalResumed(p) => {
                    assert_eq!(p.session_id, "fixed");
                    tokens.push(p.recovery_token);
                }
                other => panic!("expected created/resumed, got {other:?}"),
            }
        }
        assert_eq!(created, 1, "exactly one connection created the shell");
        assert_eq!(tokens[0], tokens[1], "both connections hold the same token");
        assert_eq!(mux.session_count().await, 1);
        // The durable record matches what was handed out.
        assert_eq!(
            store.get("fixed").unwrap().unwrap().recovery_token,
            tokens[0]
        );

        mux.kill("w1", Some("fixed".into())).await;
    }

    #[tokio::test]
    async fn kill_retires_the_recovery_token() {
        let dir = tempfile::tempdir().unwrap();
        let (mux, rooms, store) = harness(dir.path());
        let mut rx = connect(&rooms, 1).await;

        mux.create_or_resume(1, "w1", None, None, None, None).await;
        let (sid, token) = match next_event(&mut rx).await {
            ServerEvent::TerminalCreated(p) => (p.session_id, p.recovery_token),
            other => panic!("expected terminal-created, got {other:?}"),
        };

        mux.kill("w1", Some(sid.clone())).await;
        assert_ne!(
            store.get(&sid).unwrap().unwrap().recovery_token,
            token,
            "an explicit kill must invalidate the handed-out token"
        );

        // The stale token falls through to a pristine create; the killed
        // session stays dead.
        let mut rx2 = connect(&rooms, 2).await;
        mux.create_or_resume(2, "w1", None, Some(token), None, None)
            .await;
        match next_event(&mut rx2).await {
            ServerEvent::TerminalCreated(p) => assert_ne!(p.session_id, sid),
            other => panic!("expected terminal-created, got {other:?}"),
        }
        mux.kill("w1", None).await;
    }

    #[tokio::test]
    async fn detach_pauses_but_preserves_process() {
        let dir = tempfile::tempdir().unwrap();
        let (mux, rooms, store) = harness(dir.path());
        let mut rx = connect(&rooms, 1).await;

        mux.create_or_resume(1, "w1", None, None, None, None).await;
        let sid = match next_event(&mut rx).await {
            ServerEvent::TerminalCreated(p) => p.session_id,
            other => panic!("expected terminal-created, got {other:?}"),
        };
        let pid = {
            let sessions = mux.sessions.read().await;
            sessions.get(&sid).unwrap().record.pid.unwrap()
        };

        mux.detach(1).await;
        assert_eq!(mux.session_count().await, 1);
        assert!(pty::is_alive(pid));
        assert_eq!(
            store.get(&sid).unwrap().unwrap().status,
            SessionStatus::Paused
        );

        // Still killable after the detach.
        mux.kill("w1", Some(sid.clone())).await;
        assert_eq!(mux.session_count().await, 0);
        assert_eq!(
            store.get(&sid).unwrap().unwrap().status,
            SessionStatus::Terminated
        );
    }

    #[tokio::test]
    async fn kill_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (mux, rooms, _store) = harness(dir.path());
        let mut rx = connect(&rooms, 1).await;

        mux.create_or_resume(1, "w1", None, None, None, None).await;
        let sid = match next_event(&mut rx).await {
            ServerEvent::TerminalCreated(p) => p.session_id,
            other => panic!("expected terminal-created, got {other:?}"),
        };

        mux.kill("w1", Some(sid.clone())).await;
        let mut killed = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, ServerEvent::TerminalKilled(_)) {
                killed += 1;
            }
        }
        assert_eq!(killed, 1);

        // Second kill is a no-op: no session, no extra events.
        mux.kill("w1", Some(sid)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(mux.session_count().await, 0);
    }

    #[tokio::test]
    async fn resume_replays_backlog_before_live_output() {
        let dir = tempfile::tempdir().unwrap();
        let (mux, rooms, _store) = harness(dir.path());
        let mut rx1 = connect(&rooms, 1).await;

        mux.create_or_resume(1, "w1", None, None, None, None).await;
        let (sid, token) = match next_event(&mut rx1).await {
            ServerEvent::TerminalCreated(p) => (p.session_id, p.recovery_token),
            other => panic!("expected terminal-created, got {other:?}"),
        };
        mux.write_input(1, "echo first-marker\n", None).await;
        wait_for_output(&mut rx1, "first-marker").await;
        mux.detach(1).await;

        // Reconnect with the recovery token: resumed, not created, and the
        // first output delivered is the replayed backlog.
        let mut rx2 = connect(&rooms, 2).await;
        mux.create_or_resume(2, "w1", None, Some(token), None, None)
            .await;
        match next_event(&mut rx2).await {
            ServerEvent::TerminalResumed(p) => assert_eq!(p.session_id, sid),
            other => panic!("expected terminal-resumed, got {other:?}"),
        }
        match next_event(&mut rx2).await {
            ServerEvent::TerminalOutput(out) => {
                assert!(out.data.contains("first-marker"), "replay missing backlog");
            }
            other => panic!("expected replay output, got {other:?}"),
        }

        // Live output still flows after the replay.
        mux.write_input(2, "echo second-marker\n", None).await;
        wait_for_output(&mut rx2, "second-marker").await;
        mux.kill("w1", Some(sid)).await;
    }

    #[tokio::test]
    async fn recovery_spawns_fresh_process_with_breadcrumbs() {
        let dir = tempfile::tempdir().unwrap();
        let (mux, rooms, store) = harness(dir.path());

        // A record left behind by a previous server process.
        let mut stale = SessionRecord::new(
            "old-session".into(),
            "w1".into(),
            "stale-token".into(),
            dir.path().to_path_buf(),
            100,
            30,
        );
        stale.pid = Some(999_999_999);
        stale.last_command = Some("cargo test".into());
        store.upsert(&stale).unwrap();

        mux.reconcile_startup();
        assert_eq!(
            store.get("old-session").unwrap().unwrap().status,
            SessionStatus::Terminated
        );

        let mut rx = connect(&rooms, 1).await;
        mux.create_or_resume(1, "w1", None, Some("stale-token".into()), None, None)
            .await;
        match next_event(&mut rx).await {
            ServerEvent::TerminalRecovered(p) => {
                assert_eq!(p.session_id, "old-session");
                assert_eq!(p.last_command.as_deref(), Some("cargo test"));
            }
            other => panic!("expected terminal-recovered, got {other:?}"),
        }

        // The recovered session runs a fresh process under a new pid with
        // the recorded terminal size.
        {
            let sessions = mux.sessions.read().await;
            let session = sessions.get("old-session").unwrap();
            assert_ne!(session.record.pid, Some(999_999_999));
            assert_eq!((session.record.cols, session.record.rows), (100, 30));
        }
        mux.kill("w1", Some("old-session".into())).await;
    }

    #[tokio::test]
    async fn sweep_reaps_dead_processes() {
        let dir = tempfile::tempdir().unwrap();
        let (mux, rooms, store) = harness(dir.path());
        let mut rx = connect(&rooms, 1).await;

        mux.create_or_resume(1, "w1", None, None, None, None).await;
        let sid = match next_event(&mut rx).await {
            ServerEvent::TerminalCreated(p) => p.session_id,
            other => panic!("expected terminal-created, got {other:?}"),
        };

        // Fake a process that died without an exit event reaching us.
        {
            let mut sessions = mux.sessions.write().await;
            let session = sessions.get_mut(&sid).unwrap();
            let _ = session.pty.kill();
            session.record.pid = Some(999_999_999);
        }
        // Absorb the teardown the real exit event may already have done,
        // then force one through the sweep.
        mux.sweep().await;
        assert_eq!(mux.session_count().await, 0);
        assert_eq!(
            store.get(&sid).unwrap().unwrap().status,
            SessionStatus::Terminated
        );
    }

    #[tokio::test]
    async fn last_command_is_tracked_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let (mux, rooms, _store) = harness(dir.path());
        let mut rx = connect(&rooms, 1).await;

        mux.create_or_resume(1, "w1", None, None, None, None).await;
        let sid = match next_event(&mut rx).await {
            ServerEvent::TerminalCreated(p) => p.session_id,
            other => panic!("expected terminal-created, got {other:?}"),
        };

        mux.write_input(1, "ls -la\n", None).await;
        mux.write_input(1, "git sta", None).await;
        {
            let sessions = mux.sessions.read().await;
            let record = &sessions.get(&sid).unwrap().record;
            assert_eq!(record.last_command.as_deref(), Some("ls -la"));
        }
        mux.kill("w1", Some(sid)).await;
    }

    #[tokio::test]
    async fn detached_sessions_appear_in_workspace_list() {
        let dir = tempfile::tempdir().unwrap();
        let (mux, rooms, _store) = harness(dir.path());

        let a = mux.create_detached("w1").await.unwrap();
        let b = mux.create_detached("w1").await.unwrap();
        assert_ne!(a, b);

        let mut rx = connect(&rooms, 1).await;
        let summaries = mux.workspace_sessions(1, "w1").await;
        assert_eq!(summaries.len(), 2);
        // Auto-attached to the default session.
        match next_event(&mut rx).await {
            ServerEvent::TerminalResumed(_) => {}
            other => panic!("expected terminal-resumed, got {other:?}"),
        }

        mux.kill("w1", Some(a)).await;
        mux.kill("w1", Some(b)).await;
    }
}
