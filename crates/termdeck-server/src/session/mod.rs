//! Session management: PTY processes, history, durable records, and the
//! multiplexer tying them together.

pub mod history;
pub mod mux;
pub mod pty;
pub mod ring_buffer;
pub mod store;

pub use mux::{MuxConfig, SessionMux};
pub use store::FileSessionStore;
