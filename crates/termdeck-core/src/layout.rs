//! Layout types for split-view terminal arrangements.
//!
//! A workspace has exactly one [`WorkspaceLayout`]: a pane arrangement where
//! each pane holds an ordered list of session-id tabs and one active tab.
//! Layouts reference sessions by id only; they never own process state.

use serde::{Deserialize, Serialize};

/// Supported pane arrangements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LayoutKind {
    Single,
    SplitHorizontal,
    SplitVertical,
    Grid,
}

impl LayoutKind {
    /// Number of panes this arrangement uses.
    pub fn pane_count(self) -> usize {
        match self {
            LayoutKind::Single => 1,
            LayoutKind::SplitHorizontal | LayoutKind::SplitVertical => 2,
            LayoutKind::Grid => 4,
        }
    }

    /// Minimum viewport width (CSS px) at which this arrangement is usable.
    pub fn min_viewport_width(self) -> u32 {
        match self {
            LayoutKind::Single => 0,
            LayoutKind::SplitHorizontal | LayoutKind::SplitVertical => 640,
            LayoutKind::Grid => 1024,
        }
    }
}

/// One pane in a layout: an ordered tab list plus the visible tab.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pane {
    pub id: String,
    /// Session ids shown as tabs, in display order.
    pub session_ids: Vec<String>,
    /// The session currently visible in this pane.
    pub active_session_id: Option<String>,
}

impl Pane {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            session_ids: Vec::new(),
            active_session_id: None,
        }
    }

    /// Append a tab and make it active if the pane had none.
    pub fn add_tab(&mut self, session_id: String) {
        if !self.session_ids.contains(&session_id) {
            self.session_ids.push(session_id.clone());
        }
        if self.active_session_id.is_none() {
            self.active_session_id = Some(session_id);
        }
    }

    /// Remove a tab, shifting the active tab to a neighbour if needed.
    pub fn remove_tab(&mut self, session_id: &str) -> bool {
        let before = self.session_ids.len();
        self.session_ids.retain(|s| s != session_id);
        if self.active_session_id.as_deref() == Some(session_id) {
            self.active_session_id = self.session_ids.first().cloned();
        }
        self.session_ids.len() != before
    }
}

/// The pane arrangement for one workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceLayout {
    pub workspace_id: String,
    pub kind: LayoutKind,
    pub panes: Vec<Pane>,
}

impl WorkspaceLayout {
    /// A single-pane layout, optionally seeded with one session tab.
    pub fn single(workspace_id: impl Into<String>, session_id: Option<String>) -> Self {
        let mut pane = Pane::new("pane-0");
        if let Some(sid) = session_id {
            pane.add_tab(sid);
        }
        Self {
            workspace_id: workspace_id.into(),
            kind: LayoutKind::Single,
            panes: vec![pane],
        }
    }

    /// All session ids referenced anywhere in the layout, in pane order.
    pub fn session_ids(&self) -> Vec<String> {
        let mut out = Vec::new();
        for pane in &self.panes {
            for sid in &pane.session_ids {
                if !out.contains(sid) {
                    out.push(sid.clone());
                }
            }
        }
        out
    }

    pub fn pane_mut(&mut self, pane_id: &str) -> Option<&mut Pane> {
        self.panes.iter_mut().find(|p| p.id == pane_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&LayoutKind::SplitHorizontal).unwrap(),
            "\"split-horizontal\""
        );
    }

    #[test]
    fn pane_active_tab_follows_removal() {
        let mut pane = Pane::new("pane-0");
        pane.add_tab("a".into());
        pane.add_tab("b".into());
        assert_eq!(pane.active_session_id.as_deref(), Some("a"));
        assert!(pane.remove_tab("a"));
        assert_eq!(pane.active_session_id.as_deref(), Some("b"));
    }

    #[test]
    fn session_ids_deduplicated_in_order() {
        let mut layout = WorkspaceLayout::single("w", Some("a".into()));
        layout.panes.push(Pane::new("pane-1"));
        layout.panes[1].add_tab("b".into());
        layout.panes[1].add_tab("a".into());
        assert_eq!(layout.session_ids(), vec!["a".to_string(), "b".to_string()]);
    }
}
