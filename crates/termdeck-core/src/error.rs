use thiserror::Error;

/// Errors produced by the termdeck session layer.
#[derive(Debug, Error)]
pub enum DeckError {
    #[error("workspace not found: {0}")]
    WorkspaceNotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("layout error: {0}")]
    Layout(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type DeckResult<T> = Result<T, DeckError>;
