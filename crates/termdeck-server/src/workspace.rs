//! Workspace lookup.
//!
//! Workspaces are external to the session core: something else clones
//! repositories and maintains the catalog. The multiplexer only needs to
//! resolve a workspace id to a local path, so that lives behind a small
//! trait. The shipped implementation reads a TOML manifest.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use termdeck_core::DeckResult;
use tracing::info;

/// A checked-out workspace the server can open shells in.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub local_path: PathBuf,
}

/// Resolve workspace ids to local paths.
pub trait WorkspaceResolver: Send + Sync {
    fn get(&self, id: &str) -> Option<Workspace>;

    /// All known workspaces; the first entry is the default-workspace
    /// fallback.
    fn list(&self) -> Vec<Workspace>;
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    workspace: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    id: String,
    #[serde(default)]
    name: Option<String>,
    path: String,
}

/// Static resolver backed by a TOML manifest of `[[workspace]]` tables.
pub struct ManifestResolver {
    workspaces: Vec<Workspace>,
}

impl ManifestResolver {
    /// Load `[[workspace]]` entries from a TOML file.
    pub fn load(path: &Path) -> DeckResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let manifest: Manifest = toml::from_str(&content).map_err(|e| {
            termdeck_core::DeckError::Other(format!("workspace manifest parse error: {e}"))
        })?;
        let workspaces = manifest
            .workspace
            .into_iter()
            .map(|e| Workspace {
                name: e.name.unwrap_or_else(|| e.id.clone()),
                id: e.id,
                local_path: PathBuf::from(e.path),
            })
            .collect::<Vec<_>>();
        info!(path = %path.display(), count = workspaces.len(), "loaded workspace manifest");
        Ok(Self { workspaces })
    }

    /// Build a resolver from an in-memory list (used by tests).
    pub fn from_workspaces(workspaces: Vec<Workspace>) -> Self {
        Self { workspaces }
    }
}

impl WorkspaceResolver for ManifestResolver {
    fn get(&self, id: &str) -> Option<Workspace> {
        self.workspaces.iter().find(|w| w.id == id).cloned()
    }

    fn list(&self) -> Vec<Workspace> {
        self.workspaces.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_manifest_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workspaces.toml");
        std::fs::write(
            &path,
            r#"
[[workspace]]
id = "w1"
name = "demo"
path = "/tmp/w1"

[[workspace]]
id = "w2"
path = "/tmp/w2"
"#,
        )
        .unwrap();

        let resolver = ManifestResolver::load(&path).unwrap();
        assert_eq!(resolver.list().len(), 2);
        let w1 = resolver.get("w1").unwrap();
        assert_eq!(w1.name, "demo");
        assert_eq!(w1.local_path, PathBuf::from("/tmp/w1"));
        // Name falls back to the id.
        assert_eq!(resolver.get("w2").unwrap().name, "w2");
        assert!(resolver.get("missing").is_none());
    }
}
