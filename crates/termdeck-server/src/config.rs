//! Server configuration: TOML file + CLI overrides.

use crate::session::history::DEFAULT_HISTORY_CAPACITY;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use termdeck_core::DeckResult;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub workspaces: WorkspacesSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_shell_args")]
    pub shell_args: Vec<String>,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            data_dir: default_data_dir(),
            shell: default_shell(),
            shell_args: default_shell_args(),
            history_capacity: default_history_capacity(),
            max_sessions: default_max_sessions(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// `[workspaces]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkspacesSection {
    #[serde(default = "default_manifest_path")]
    pub manifest: String,
}

impl Default for WorkspacesSection {
    fn default() -> Self {
        Self {
            manifest: default_manifest_path(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    4450
}
fn default_data_dir() -> String {
    "~/.termdeck".to_string()
}
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string())
}
fn default_shell_args() -> Vec<String> {
    vec!["-l".to_string()]
}
fn default_history_capacity() -> usize {
    DEFAULT_HISTORY_CAPACITY
}
fn default_max_sessions() -> usize {
    100
}
fn default_sweep_interval() -> u64 {
    300
}
fn default_manifest_path() -> String {
    "~/.termdeck/workspaces.toml".to_string()
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub shell: String,
    pub shell_args: Vec<String>,
    pub history_capacity: usize,
    pub max_sessions: usize,
    pub sweep_interval_secs: u64,
    pub manifest_path: PathBuf,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_port: Option<u16>,
        cli_data_dir: Option<&str>,
        cli_shell: Option<&str>,
        cli_workspaces: Option<&str>,
        cli_max_sessions: Option<usize>,
    ) -> DeckResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content).map_err(|e| {
                    termdeck_core::DeckError::Other(format!("config parse error: {e}"))
                })?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile {
                    server: ServerSection::default(),
                    workspaces: WorkspacesSection::default(),
                }
            }
        } else {
            ConfigFile {
                server: ServerSection::default(),
                workspaces: WorkspacesSection::default(),
            }
        };

        let port = cli_port.unwrap_or(file_config.server.port);
        let data_dir = cli_data_dir
            .map(|s| s.to_string())
            .unwrap_or(file_config.server.data_dir);
        let shell = cli_shell
            .map(|s| s.to_string())
            .unwrap_or(file_config.server.shell);
        let manifest = cli_workspaces
            .map(|s| s.to_string())
            .unwrap_or(file_config.workspaces.manifest);
        let max_sessions = cli_max_sessions.unwrap_or(file_config.server.max_sessions);

        Ok(Self {
            bind: file_config.server.bind,
            port,
            data_dir: expand_tilde_str(&data_dir),
            shell,
            shell_args: file_config.server.shell_args,
            history_capacity: file_config.server.history_capacity,
            max_sessions,
            sweep_interval_secs: file_config.server.sweep_interval_secs,
            manifest_path: expand_tilde_str(&manifest),
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if s.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(&s[2..]);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_values_with_cli_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[server]
port = 5000
shell = "/bin/zsh"
history_capacity = 1234

[workspaces]
manifest = "/etc/termdeck/workspaces.toml"
"#,
        )
        .unwrap();

        let cfg = ServerConfig::load(Some(&path), Some(6000), None, None, None, None).unwrap();
        // CLI port wins over the file value.
        assert_eq!(cfg.port, 6000);
        assert_eq!(cfg.shell, "/bin/zsh");
        assert_eq!(cfg.history_capacity, 1234);
        assert_eq!(
            cfg.manifest_path,
            PathBuf::from("/etc/termdeck/workspaces.toml")
        );
        assert_eq!(cfg.max_sessions, 100);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg =
            ServerConfig::load(Some(Path::new("/nonexistent/config.toml")), None, None, None, None, None)
                .unwrap();
        assert_eq!(cfg.port, 4450);
        assert_eq!(cfg.history_capacity, 5000);
        assert_eq!(cfg.sweep_interval_secs, 300);
    }
}
