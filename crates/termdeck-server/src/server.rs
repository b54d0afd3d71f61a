//! termdeck-server: accept loop, per-connection event loop, and dispatch.
//!
//! Each websocket connection gets a numeric id, an outbound event channel
//! registered with the room registry, and a `select!` loop that interleaves
//! outbound delivery with inbound event dispatch. Dispatch fans out to the
//! session multiplexer and the layout manager.

use crate::config::ServerConfig;
use crate::layout::{recommended_layout, LayoutManager};
use crate::session::{FileSessionStore, MuxConfig, SessionMux};
use crate::transport::rooms::{workspace_room, ConnId, RoomRegistry};
use crate::transport::websocket::{self, WebSocketConnection};
use crate::workspace::{ManifestResolver, WorkspaceResolver};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use termdeck_core::messages::{
    LayoutChanged, RecommendedLayout, TerminalError, WorkspaceSessions,
};
use termdeck_core::{ClientEvent, DeckError, DeckResult, ServerEvent};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct DeckServer {
    config: ServerConfig,
    mux: Arc<SessionMux>,
    layouts: Arc<LayoutManager>,
    rooms: Arc<RoomRegistry>,
    next_conn_id: AtomicU64,
}

impl DeckServer {
    pub fn new(config: ServerConfig) -> DeckResult<Self> {
        let store = Arc::new(FileSessionStore::new(config.data_dir.join("sessions"))?);

        let resolver: Arc<dyn WorkspaceResolver> = if config.manifest_path.exists() {
            Arc::new(ManifestResolver::load(&config.manifest_path)?)
        } else {
            warn!(path = %config.manifest_path.display(), "no workspace manifest; no workspaces available");
            Arc::new(ManifestResolver::from_workspaces(Vec::new()))
        };

        let rooms = Arc::new(RoomRegistry::new());
        let mux = Arc::new(SessionMux::new(
            MuxConfig {
                shell: config.shell.clone(),
                shell_args: config.shell_args.clone(),
                history_dir: config.data_dir.join("history"),
                history_capacity: config.history_capacity,
                max_sessions: config.max_sessions,
            },
            store,
            resolver,
            rooms.clone(),
        ));
        mux.reconcile_startup();

        Ok(Self {
            config,
            mux,
            layouts: Arc::new(LayoutManager::new()),
            rooms,
            next_conn_id: AtomicU64::new(1),
        })
    }

    /// Start listening and serve until the accept channel closes.
    pub async fn run(self) -> DeckResult<()> {
        let server = Arc::new(self);

        let addr: SocketAddr = format!("{}:{}", server.config.bind, server.config.port)
            .parse()
            .map_err(|e| DeckError::Other(format!("invalid address: {e}")))?;

        let mut ws_rx = websocket::start_listener(addr).await?;

        // Liveness sweep task.
        let sweeper = server.mux.clone();
        let sweep_interval = server.config.sweep_interval_secs.max(1);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(sweep_interval));
            loop {
                interval.tick().await;
                sweeper.sweep().await;
            }
        });

        info!(addr = %addr, "termdeck-server ready");

        while let Some(ws_conn) = ws_rx.recv().await {
            let srv = server.clone();
            tokio::spawn(async move {
                let conn_id = srv.next_conn_id.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = srv.handle_connection(conn_id, ws_conn).await {
                    warn!(conn_id, error = %e, "connection error");
                }
            });
        }

        info!("listener closed, shutting down");
        Ok(())
    }

    async fn handle_connection(
        &self,
        conn_id: ConnId,
        conn: WebSocketConnection,
    ) -> DeckResult<()> {
        info!(conn_id, remote = %conn.remote_addr, "connection opened");
        let mut ws = conn.ws_stream;

        let (tx, mut outbound) = mpsc::channel::<ServerEvent>(256);
        self.rooms.register(conn_id, tx).await;

        loop {
            tokio::select! {
                Some(event) = outbound.recv() => {
                    if let Err(e) = websocket::ws_send_event(&mut ws, &event).await {
                        debug!(conn_id, error = %e, "outbound send failed");
                        break;
                    }
                }
                incoming = websocket::ws_recv_event(&mut ws) => {
                    match incoming {
                        Ok(Some(event)) => self.dispatch(conn_id, event).await,
                        Ok(None) => break,
                        Err(DeckError::InvalidMessage(msg)) => {
                            // Malformed frames are reported, not fatal.
                            warn!(conn_id, %msg, "invalid client event");
                            self.error_to(conn_id, msg).await;
                        }
                        Err(e) => {
                            debug!(conn_id, error = %e, "receive failed");
                            break;
                        }
                    }
                }
            }
        }

        // PTY processes survive the disconnect; only the attachment goes.
        self.mux.detach(conn_id).await;
        self.rooms.unregister(conn_id).await;
        info!(conn_id, "connection closed");
        Ok(())
    }

    async fn dispatch(&self, conn: ConnId, event: ClientEvent) {
        match event {
            ClientEvent::CreateTerminal(p) => {
                self.mux
                    .create_or_resume(
                        conn,
                        &p.workspace_id,
                        p.session_id,
                        p.recovery_token,
                        p.cols,
                        p.rows,
                    )
                    .await;
                self.track_in_layout(conn, &p.workspace_id).await;
            }
            ClientEvent::TerminalInput(p) => {
                self.mux.write_input(conn, &p.data, p.session_id).await;
            }
            ClientEvent::TerminalResize(p) => {
                self.mux.resize(conn, p.cols, p.rows, p.session_id).await;
            }
            ClientEvent::KillTerminal(p) => {
                let sid = match p.session_id {
                    Some(sid) => Some(sid),
                    None => self
                        .mux
                        .session_ids_for(&p.workspace_id)
                        .await
                        .last()
                        .cloned(),
                };
                let Some(sid) = sid else { return };
                self.mux.kill(&p.workspace_id, Some(sid.clone())).await;
                if let Some(layout) = self.layouts.remove_session(&p.workspace_id, &sid).await {
                    self.broadcast_layout(&p.workspace_id, layout).await;
                }
            }
            ClientEvent::GetWorkspaceSessions(p) => {
                let sessions = self.mux.workspace_sessions(conn, &p.workspace_id).await;
                self.rooms
                    .send_to(
                        conn,
                        ServerEvent::WorkspaceSessions(WorkspaceSessions {
                            workspace_id: p.workspace_id,
                            sessions,
                        }),
                    )
                    .await;
            }
            ClientEvent::SwitchTerminalSession(p) => {
                self.mux
                    .switch_session(conn, &p.workspace_id, &p.session_id)
                    .await;
            }
            ClientEvent::ConvertToSplit(p) => {
                let known = self.mux.session_ids_for(&p.workspace_id).await;
                match self
                    .layouts
                    .convert_to_split(&p.workspace_id, p.layout, p.viewport_width, known)
                    .await
                {
                    Ok(conversion) => {
                        let mut layout = conversion.layout;
                        // Empty panes get fresh detached sessions.
                        for pane_id in conversion.empty_pane_ids {
                            match self.mux.create_detached(&p.workspace_id).await {
                                Ok(sid) => {
                                    match self
                                        .layouts
                                        .add_tab(&p.workspace_id, &pane_id, &sid)
                                        .await
                                    {
                                        Ok(updated) => layout = updated,
                                        Err(e) => warn!(error = %e, pane_id, "pane fill failed"),
                                    }
                                }
                                Err(e) => {
                                    warn!(error = %e, pane_id, "could not create pane session");
                                }
                            }
                        }
                        self.broadcast_layout(&p.workspace_id, layout).await;
                    }
                    Err(e) => self.error_to(conn, e.to_string()).await,
                }
            }
            ClientEvent::ConvertToSingle(p) => {
                let layout = self.layouts.convert_to_single(&p.workspace_id).await;
                self.broadcast_layout(&p.workspace_id, layout).await;
            }
            ClientEvent::MoveTabBetweenPanes(p) => {
                match self
                    .layouts
                    .move_tab(&p.workspace_id, &p.from_pane_id, &p.to_pane_id, &p.session_id)
                    .await
                {
                    Ok(layout) => self.broadcast_layout(&p.workspace_id, layout).await,
                    Err(e) => self.error_to(conn, e.to_string()).await,
                }
            }
            ClientEvent::SetActivePaneTab(p) => {
                match self
                    .layouts
                    .set_active_tab(&p.workspace_id, &p.pane_id, &p.session_id)
                    .await
                {
                    Ok(layout) => self.broadcast_layout(&p.workspace_id, layout).await,
                    Err(e) => self.error_to(conn, e.to_string()).await,
                }
            }
            ClientEvent::AddTabToPane(p) => {
                // Only sessions the multiplexer actually runs become tabs.
                let known = self.mux.session_ids_for(&p.workspace_id).await;
                if !known.contains(&p.session_id) {
                    let err = DeckError::SessionNotFound(p.session_id.clone());
                    self.error_to(conn, err.to_string()).await;
                    return;
                }
                match self
                    .layouts
                    .add_tab(&p.workspace_id, &p.pane_id, &p.session_id)
                    .await
                {
                    Ok(layout) => self.broadcast_layout(&p.workspace_id, layout).await,
                    Err(e) => self.error_to(conn, e.to_string()).await,
                }
            }
            ClientEvent::RemoveTabFromPane(p) => {
                match self
                    .layouts
                    .remove_tab(&p.workspace_id, &p.pane_id, &p.session_id)
                    .await
                {
                    Ok(layout) => {
                        // Closing a tab terminates the session behind it.
                        self.mux.kill(&p.workspace_id, Some(p.session_id)).await;
                        self.broadcast_layout(&p.workspace_id, layout).await;
                    }
                    Err(e) => self.error_to(conn, e.to_string()).await,
                }
            }
            ClientEvent::GetRecommendedLayout(p) => {
                self.rooms
                    .send_to(
                        conn,
                        ServerEvent::RecommendedLayout(RecommendedLayout {
                            layout: recommended_layout(p.viewport_width, p.session_count),
                        }),
                    )
                    .await;
            }
        }
    }

    /// Make sure the session a connection just created or resumed is
    /// referenced by the workspace layout.
    async fn track_in_layout(&self, conn: ConnId, workspace_id: &str) {
        let Some(sid) = self.mux.attached_session(conn).await else {
            return;
        };
        let layout = self
            .layouts
            .default_layout(workspace_id, Some(sid.clone()))
            .await;
        if layout.session_ids().contains(&sid) {
            return;
        }
        let Some(first_pane) = layout.panes.first() else {
            return;
        };
        match self.layouts.add_tab(workspace_id, &first_pane.id, &sid).await {
            Ok(updated) => self.broadcast_layout(workspace_id, updated).await,
            Err(e) => warn!(error = %e, "could not track session in layout"),
        }
    }

    async fn broadcast_layout(&self, workspace_id: &str, layout: termdeck_core::WorkspaceLayout) {
        self.rooms
            .broadcast(
                &workspace_room(workspace_id),
                ServerEvent::LayoutChanged(LayoutChanged { layout }),
            )
            .await;
    }

    async fn error_to(&self, conn: ConnId, message: String) {
        self.rooms
            .send_to(conn, ServerEvent::TerminalError(TerminalError { message }))
            .await;
    }
}
