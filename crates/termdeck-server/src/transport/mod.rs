//! Connection-facing plumbing: the websocket listener and the room registry
//! used for output fan-out.

pub mod rooms;
pub mod websocket;
