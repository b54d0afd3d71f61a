//! termdeck-server: terminal session server for workspace IDEs.
//!
//! Accepts WebSocket connections, multiplexes PTY-backed shell sessions per
//! workspace, replays scrollback on reattach, and recovers sessions across
//! restarts via recovery tokens.

mod config;
mod layout;
mod server;
mod session;
mod transport;
mod workspace;

use clap::Parser;
use config::ServerConfig;
use server::DeckServer;
use std::path::PathBuf;
use tracing::{error, info};

/// termdeck-server — workspace terminal session server
#[derive(Parser, Debug)]
#[command(name = "termdeck-server", version, about = "Workspace terminal session server")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.termdeck/config.toml")]
    config: String,

    /// Data directory (session records and history logs)
    #[arg(long)]
    data_dir: Option<String>,

    /// Shell binary for new sessions
    #[arg(long)]
    shell: Option<String>,

    /// Workspace manifest path
    #[arg(long)]
    workspaces: Option<String>,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting termdeck-server"
    );

    // Load server config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(
        Some(&config_path),
        cli.port,
        cli.data_dir.as_deref(),
        cli.shell.as_deref(),
        cli.workspaces.as_deref(),
        cli.max_sessions,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let deck_server = match DeckServer::new(server_config) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to create server");
            std::process::exit(1);
        }
    };

    // Run until shutdown signal
    tokio::select! {
        result = deck_server.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("termdeck-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
