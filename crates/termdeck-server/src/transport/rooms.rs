//! Broadcast groups for attached connections.
//!
//! Models "all connections attached to session S" as an explicit registry,
//! independent of the websocket library: connection ids map to outbound
//! event senders, room keys map to member sets. Sends are `try_send`
//! best-effort so a slow consumer drops frames instead of stalling the PTY
//! output pump.

use std::collections::{HashMap, HashSet};
use termdeck_core::ServerEvent;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace};

pub type ConnId = u64;

/// Room key for a session's output fan-out group.
pub fn session_room(workspace_id: &str, session_id: &str) -> String {
    format!("{workspace_id}/{session_id}")
}

/// Room key for workspace-wide notifications (layout changes).
pub fn workspace_room(workspace_id: &str) -> String {
    workspace_id.to_string()
}

#[derive(Default)]
struct Inner {
    senders: HashMap<ConnId, mpsc::Sender<ServerEvent>>,
    rooms: HashMap<String, HashSet<ConnId>>,
}

/// Registry of connection senders and their room memberships.
#[derive(Default)]
pub struct RoomRegistry {
    inner: RwLock<Inner>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection's outbound sender. Called once per connection
    /// before any event can be delivered to it.
    pub async fn register(&self, conn: ConnId, sender: mpsc::Sender<ServerEvent>) {
        self.inner.write().await.senders.insert(conn, sender);
    }

    /// Remove a connection and every room membership it held.
    pub async fn unregister(&self, conn: ConnId) {
        let mut inner = self.inner.write().await;
        inner.senders.remove(&conn);
        inner.rooms.retain(|_, members| {
            members.remove(&conn);
            !members.is_empty()
        });
    }

    pub async fn join(&self, room: &str, conn: ConnId) {
        let mut inner = self.inner.write().await;
        inner.rooms.entry(room.to_string()).or_default().insert(conn);
        trace!(room, conn, "joined room");
    }

    pub async fn leave(&self, room: &str, conn: ConnId) {
        let mut inner = self.inner.write().await;
        if let Some(members) = inner.rooms.get_mut(room) {
            members.remove(&conn);
            if members.is_empty() {
                inner.rooms.remove(room);
            }
        }
    }

    /// Leave every room this connection belongs to, keeping its sender.
    pub async fn leave_all(&self, conn: ConnId) {
        let mut inner = self.inner.write().await;
        inner.rooms.retain(|_, members| {
            members.remove(&conn);
            !members.is_empty()
        });
    }

    /// Deliver an event to one connection. Best-effort: a full queue or a
    /// departed connection drops the event.
    pub async fn send_to(&self, conn: ConnId, event: ServerEvent) {
        let inner = self.inner.read().await;
        if let Some(sender) = inner.senders.get(&conn) {
            if sender.try_send(event).is_err() {
                debug!(conn, "dropped event for slow or closed connection");
            }
        }
    }

    /// Deliver an event to every member of a room, in registry order.
    pub async fn broadcast(&self, room: &str, event: ServerEvent) {
        let inner = self.inner.read().await;
        let Some(members) = inner.rooms.get(room) else {
            return;
        };
        for conn in members {
            if let Some(sender) = inner.senders.get(conn) {
                if sender.try_send(event.clone()).is_err() {
                    debug!(conn, room, "dropped broadcast for slow or closed connection");
                }
            }
        }
    }

    /// Members of a room (for diagnostics and tests).
    pub async fn members(&self, room: &str) -> Vec<ConnId> {
        let inner = self.inner.read().await;
        inner
            .rooms
            .get(room)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use termdeck_core::messages::{TerminalError, TerminalOutput};

    fn output(data: &str) -> ServerEvent {
        ServerEvent::TerminalOutput(TerminalOutput {
            session_id: "s1".into(),
            data: data.into(),
        })
    }

    #[tokio::test]
    async fn broadcast_reaches_all_members() {
        let registry = RoomRegistry::new();
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        registry.register(1, tx1).await;
        registry.register(2, tx2).await;
        registry.join("w/s1", 1).await;
        registry.join("w/s1", 2).await;

        registry.broadcast("w/s1", output("hi")).await;
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn send_to_targets_one_connection() {
        let registry = RoomRegistry::new();
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        registry.register(1, tx1).await;
        registry.register(2, tx2).await;

        registry
            .send_to(
                1,
                ServerEvent::TerminalError(TerminalError {
                    message: "nope".into(),
                }),
            )
            .await;
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_removes_memberships() {
        let registry = RoomRegistry::new();
        let (tx, _rx) = mpsc::channel(8);
        registry.register(1, tx).await;
        registry.join("w/s1", 1).await;
        registry.unregister(1).await;
        assert!(registry.members("w/s1").await.is_empty());
    }

    #[tokio::test]
    async fn full_queue_does_not_block_broadcast() {
        let registry = RoomRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        registry.register(1, tx).await;
        registry.join("w/s1", 1).await;

        // Second broadcast overflows the queue and is dropped, not awaited.
        registry.broadcast("w/s1", output("a")).await;
        registry.broadcast("w/s1", output("b")).await;
    }
}
