//! termdeck-core: Shared types for the termdeck terminal server.
//!
//! Provides the JSON wire events exchanged over the websocket transport,
//! the persisted session record model, layout types, and the error taxonomy.

pub mod error;
pub mod ids;
pub mod layout;
pub mod messages;
pub mod record;

// Re-export commonly used items at crate root.
pub use error::{DeckError, DeckResult};
pub use ids::{generate_recovery_token, generate_session_id};
pub use layout::{LayoutKind, Pane, WorkspaceLayout};
pub use messages::{ClientEvent, ServerEvent};
pub use record::{SessionRecord, SessionStatus};
