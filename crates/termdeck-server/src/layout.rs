//! Per-workspace pane/tab layout management.
//!
//! A coordination layer over session ids owned by the multiplexer: it
//! arranges sessions into panes and tabs for split-view clients and never
//! touches process state. Killing the session behind a removed tab is the
//! caller's job.

use std::collections::HashMap;
use termdeck_core::{DeckError, DeckResult, LayoutKind, Pane, WorkspaceLayout};
use tokio::sync::RwLock;
use tracing::debug;

/// Result of a split conversion: the new layout plus the panes left without
/// any session, which the caller is expected to fill.
#[derive(Debug)]
pub struct SplitConversion {
    pub layout: WorkspaceLayout,
    pub empty_pane_ids: Vec<String>,
}

/// Tracks one layout per workspace.
#[derive(Default)]
pub struct LayoutManager {
    layouts: RwLock<HashMap<String, WorkspaceLayout>>,
}

impl LayoutManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing layout for the workspace, or a single-pane default seeded
    /// with the given session.
    pub async fn default_layout(
        &self,
        workspace_id: &str,
        default_session: Option<String>,
    ) -> WorkspaceLayout {
        let mut layouts = self.layouts.write().await;
        layouts
            .entry(workspace_id.to_string())
            .or_insert_with(|| WorkspaceLayout::single(workspace_id, default_session))
            .clone()
    }

    /// Re-arrange the workspace into a multi-pane layout.
    ///
    /// `known_sessions` supplies sessions not yet referenced by the current
    /// layout (display order). Existing tabs are redistributed round-robin
    /// across the new panes; panes left empty are reported so the caller can
    /// create filler sessions and assign them via [`add_tab`](Self::add_tab).
    pub async fn convert_to_split(
        &self,
        workspace_id: &str,
        kind: LayoutKind,
        viewport_width: u32,
        known_sessions: Vec<String>,
    ) -> DeckResult<SplitConversion> {
        if kind == LayoutKind::Single {
            return Err(DeckError::Layout(
                "convert-to-split cannot target a single-pane layout".into(),
            ));
        }
        if viewport_width < kind.min_viewport_width() {
            return Err(DeckError::Layout(format!(
                "viewport {viewport_width}px is too narrow for {kind:?} (needs {}px)",
                kind.min_viewport_width()
            )));
        }

        let mut layouts = self.layouts.write().await;

        // Sessions to distribute: current layout order first, then any
        // known sessions it does not reference yet.
        let mut sessions = layouts
            .get(workspace_id)
            .map(|l| l.session_ids())
            .unwrap_or_default();
        for sid in known_sessions {
            if !sessions.contains(&sid) {
                sessions.push(sid);
            }
        }

        let pane_count = kind.pane_count();
        let mut panes: Vec<Pane> = (0..pane_count)
            .map(|i| Pane::new(format!("pane-{i}")))
            .collect();
        for (i, sid) in sessions.into_iter().enumerate() {
            panes[i % pane_count].add_tab(sid);
        }

        let empty_pane_ids: Vec<String> = panes
            .iter()
            .filter(|p| p.session_ids.is_empty())
            .map(|p| p.id.clone())
            .collect();

        let layout = WorkspaceLayout {
            workspace_id: workspace_id.to_string(),
            kind,
            panes,
        };
        layouts.insert(workspace_id.to_string(), layout.clone());
        debug!(workspace_id, ?kind, empty = empty_pane_ids.len(), "layout converted to split");

        Ok(SplitConversion {
            layout,
            empty_pane_ids,
        })
    }

    /// Collapse back to one pane. Every session survives as a tab in the
    /// surviving pane; the previously focused session stays active.
    pub async fn convert_to_single(&self, workspace_id: &str) -> WorkspaceLayout {
        let mut layouts = self.layouts.write().await;
        let existing = layouts
            .entry(workspace_id.to_string())
            .or_insert_with(|| WorkspaceLayout::single(workspace_id, None));

        let survivor = existing
            .panes
            .first()
            .and_then(|p| p.active_session_id.clone());
        let sessions = existing.session_ids();

        let mut pane = Pane::new("pane-0");
        for sid in sessions {
            pane.add_tab(sid);
        }
        if let Some(active) = survivor {
            if pane.session_ids.contains(&active) {
                pane.active_session_id = Some(active);
            }
        }

        let layout = WorkspaceLayout {
            workspace_id: workspace_id.to_string(),
            kind: LayoutKind::Single,
            panes: vec![pane],
        };
        layouts.insert(workspace_id.to_string(), layout.clone());
        layout
    }

    /// Move a tab from one pane to another.
    pub async fn move_tab(
        &self,
        workspace_id: &str,
        from_pane_id: &str,
        to_pane_id: &str,
        session_id: &str,
    ) -> DeckResult<WorkspaceLayout> {
        self.mutate(workspace_id, |layout| {
            let from = layout
                .pane_mut(from_pane_id)
                .ok_or_else(|| DeckError::Layout(format!("no pane {from_pane_id}")))?;
            if !from.remove_tab(session_id) {
                return Err(DeckError::Layout(format!(
                    "session {session_id} is not a tab of {from_pane_id}"
                )));
            }
            let to = layout
                .pane_mut(to_pane_id)
                .ok_or_else(|| DeckError::Layout(format!("no pane {to_pane_id}")))?;
            to.add_tab(session_id.to_string());
            to.active_session_id = Some(session_id.to_string());
            Ok(())
        })
        .await
    }

    /// Make a tab the visible session of its pane.
    pub async fn set_active_tab(
        &self,
        workspace_id: &str,
        pane_id: &str,
        session_id: &str,
    ) -> DeckResult<WorkspaceLayout> {
        self.mutate(workspace_id, |layout| {
            let pane = layout
                .pane_mut(pane_id)
                .ok_or_else(|| DeckError::Layout(format!("no pane {pane_id}")))?;
            if !pane.session_ids.iter().any(|s| s == session_id) {
                return Err(DeckError::Layout(format!(
                    "session {session_id} is not a tab of {pane_id}"
                )));
            }
            pane.active_session_id = Some(session_id.to_string());
            Ok(())
        })
        .await
    }

    /// Append a tab to a pane.
    pub async fn add_tab(
        &self,
        workspace_id: &str,
        pane_id: &str,
        session_id: &str,
    ) -> DeckResult<WorkspaceLayout> {
        self.mutate(workspace_id, |layout| {
            let pane = layout
                .pane_mut(pane_id)
                .ok_or_else(|| DeckError::Layout(format!("no pane {pane_id}")))?;
            pane.add_tab(session_id.to_string());
            Ok(())
        })
        .await
    }

    /// Remove a tab from a pane. The caller cascades into the multiplexer's
    /// `kill` for the removed session.
    pub async fn remove_tab(
        &self,
        workspace_id: &str,
        pane_id: &str,
        session_id: &str,
    ) -> DeckResult<WorkspaceLayout> {
        self.mutate(workspace_id, |layout| {
            let pane = layout
                .pane_mut(pane_id)
                .ok_or_else(|| DeckError::Layout(format!("no pane {pane_id}")))?;
            if !pane.remove_tab(session_id) {
                return Err(DeckError::Layout(format!(
                    "session {session_id} is not a tab of {pane_id}"
                )));
            }
            Ok(())
        })
        .await
    }

    /// Drop a terminated session from whichever pane references it. Returns
    /// the updated layout when anything changed.
    pub async fn remove_session(
        &self,
        workspace_id: &str,
        session_id: &str,
    ) -> Option<WorkspaceLayout> {
        let mut layouts = self.layouts.write().await;
        let layout = layouts.get_mut(workspace_id)?;
        let mut changed = false;
        for pane in &mut layout.panes {
            changed |= pane.remove_tab(session_id);
        }
        changed.then(|| layout.clone())
    }

    async fn mutate<F>(&self, workspace_id: &str, f: F) -> DeckResult<WorkspaceLayout>
    where
        F: FnOnce(&mut WorkspaceLayout) -> DeckResult<()>,
    {
        let mut layouts = self.layouts.write().await;
        let layout = layouts
            .get_mut(workspace_id)
            .ok_or_else(|| DeckError::Layout(format!("no layout for workspace {workspace_id}")))?;
        f(layout)?;
        Ok(layout.clone())
    }
}

/// Suggest a layout for a viewport and session count. Pure; clients call
/// this before committing to a conversion.
pub fn recommended_layout(viewport_width: u32, session_count: usize) -> LayoutKind {
    if session_count <= 1 || viewport_width < LayoutKind::SplitVertical.min_viewport_width() {
        LayoutKind::Single
    } else if session_count >= 4 && viewport_width >= LayoutKind::Grid.min_viewport_width() {
        LayoutKind::Grid
    } else {
        LayoutKind::SplitVertical
    }
}
