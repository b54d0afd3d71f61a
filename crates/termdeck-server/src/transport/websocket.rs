//! WebSocket listener using tokio-tungstenite.
//!
//! The wire protocol is one JSON event envelope per text frame. This module
//! only moves frames; envelope handling lives in the server's connection
//! loop.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use termdeck_core::{ClientEvent, DeckError, DeckResult, ServerEvent};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
}

/// Start the WebSocket listener.
///
/// Returns a receiver that yields accepted connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
) -> DeckResult<mpsc::Receiver<WebSocketConnection>> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| DeckError::Transport(format!("WS bind failed: {e}")))?;

    info!(addr = %bind_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok(rx)
}

/// Maximum frame size for inbound WebSocket messages (1 MiB).
const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// Send one server event as a JSON text frame.
pub async fn ws_send_event(
    ws: &mut tokio_tungstenite::WebSocketStream<TcpStream>,
    event: &ServerEvent,
) -> DeckResult<()> {
    let json = serde_json::to_string(event)
        .map_err(|e| DeckError::InvalidMessage(format!("event serialization failed: {e}")))?;
    ws.send(Message::Text(json.into()))
        .await
        .map_err(|e| DeckError::Transport(format!("WS send failed: {e}")))
}

/// Receive the next client event.
///
/// Returns `Ok(None)` when the connection closed. Binary frames are ignored;
/// pings are answered inline. A frame that is not a valid event envelope is
/// an [`DeckError::InvalidMessage`], which the caller reports back to the
/// client without dropping the connection.
pub async fn ws_recv_event(
    ws: &mut tokio_tungstenite::WebSocketStream<TcpStream>,
) -> DeckResult<Option<ClientEvent>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                if text.len() > MAX_WS_FRAME_SIZE {
                    return Err(DeckError::InvalidMessage(format!(
                        "WS frame too large: {} bytes (max {})",
                        text.len(),
                        MAX_WS_FRAME_SIZE
                    )));
                }
                return serde_json::from_str::<ClientEvent>(&text)
                    .map(Some)
                    .map_err(|e| DeckError::InvalidMessage(format!("bad event envelope: {e}")));
            }
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(Message::Ping(payload))) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            Some(Ok(_)) => {
                // Ignore binary and other message types.
                continue;
            }
            Some(Err(e)) => {
                return Err(DeckError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        }
    }
}
