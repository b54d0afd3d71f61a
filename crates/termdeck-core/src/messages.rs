//! JSON wire events for the websocket transport.
//!
//! Every frame is one envelope: `{"event": "<name>", "data": {...}}` with
//! kebab-case event names and camelCase payload fields. [`ClientEvent`] is
//! inbound (client → server), [`ServerEvent`] outbound.

use crate::layout::{LayoutKind, WorkspaceLayout};
use crate::record::SessionStatus;
use serde::{Deserialize, Serialize};

/// Inbound events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    CreateTerminal(CreateTerminal),
    TerminalInput(TerminalInput),
    TerminalResize(TerminalResize),
    KillTerminal(KillTerminal),
    GetWorkspaceSessions(GetWorkspaceSessions),
    SwitchTerminalSession(SwitchTerminalSession),
    ConvertToSplit(ConvertToSplit),
    ConvertToSingle(ConvertToSingle),
    MoveTabBetweenPanes(MoveTabBetweenPanes),
    SetActivePaneTab(PaneTab),
    AddTabToPane(PaneTab),
    RemoveTabFromPane(PaneTab),
    GetRecommendedLayout(GetRecommendedLayout),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTerminal {
    pub workspace_id: String,
    pub session_id: Option<String>,
    pub recovery_token: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalInput {
    pub data: String,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalResize {
    pub cols: u16,
    pub rows: u16,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KillTerminal {
    pub workspace_id: String,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetWorkspaceSessions {
    pub workspace_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchTerminalSession {
    pub workspace_id: String,
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertToSplit {
    pub workspace_id: String,
    pub layout: LayoutKind,
    pub viewport_width: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertToSingle {
    pub workspace_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveTabBetweenPanes {
    pub workspace_id: String,
    pub from_pane_id: String,
    pub to_pane_id: String,
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaneTab {
    pub workspace_id: String,
    pub pane_id: String,
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetRecommendedLayout {
    pub viewport_width: u32,
    pub session_count: usize,
}

/// Outbound events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    TerminalOutput(TerminalOutput),
    TerminalCreated(TerminalReady),
    TerminalResumed(TerminalReady),
    TerminalRecovered(TerminalRecovered),
    TerminalKilled(TerminalKilled),
    TerminalError(TerminalError),
    WorkspaceSessions(WorkspaceSessions),
    LayoutChanged(LayoutChanged),
    RecommendedLayout(RecommendedLayout),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalOutput {
    pub session_id: String,
    pub data: String,
}

/// Payload shared by `terminal-created` and `terminal-resumed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalReady {
    pub session_id: String,
    pub recovery_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalRecovered {
    pub session_id: String,
    pub recovery_token: String,
    /// Breadcrumb: the last input line recorded before the disconnect.
    pub last_command: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalKilled {
    pub session_id: String,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalError {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub status: SessionStatus,
    pub cols: u16,
    pub rows: u16,
    pub last_command: Option<String>,
    pub attached_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSessions {
    pub workspace_id: String,
    pub sessions: Vec<SessionSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutChanged {
    pub layout: WorkspaceLayout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendedLayout {
    pub layout: LayoutKind,
}
