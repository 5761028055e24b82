//! WebSocket client for the whiteboard server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Typed senders for every client message
//! - Server messages surfaced as [`SyncEvent`]s on a channel

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::document::{CanvasObject, ObjectPatch, Whiteboard};
use crate::presence::{Presence, Vec2};
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Join accepted
    Joined {
        active_users: Vec<Presence>,
        whiteboard: Whiteboard,
    },
    PeerJoined(Presence),
    PeerLeft(Uuid),
    CursorMoved { user_id: Uuid, cursor: Vec2 },
    ObjectCreated(CanvasObject),
    ObjectUpdated(CanvasObject),
    ObjectDeleted(String),
    /// Error reply for one of our messages
    Error(String),
}

impl From<ServerMessage> for SyncEvent {
    fn from(msg: ServerMessage) -> Self {
        match msg {
            ServerMessage::Joined {
                active_users,
                whiteboard,
            } => SyncEvent::Joined {
                active_users,
                whiteboard,
            },
            ServerMessage::UserJoined { user } => SyncEvent::PeerJoined(user),
            ServerMessage::UserLeft { user_id } => SyncEvent::PeerLeft(user_id),
            ServerMessage::CursorUpdate { user_id, cursor } => {
                SyncEvent::CursorMoved { user_id, cursor }
            }
            ServerMessage::ObjectCreate { object } => SyncEvent::ObjectCreated(object),
            ServerMessage::ObjectUpdate { object } => SyncEvent::ObjectUpdated(object),
            ServerMessage::ObjectDelete { object_id } => SyncEvent::ObjectDeleted(object_id),
            ServerMessage::Error { message } => SyncEvent::Error(message),
        }
    }
}

/// Client bound to one whiteboard.
pub struct WhiteboardClient {
    whiteboard_id: Uuid,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<SyncEvent>,

    server_url: String,
}

impl WhiteboardClient {
    pub fn new(whiteboard_id: Uuid, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            whiteboard_id,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server and spawn the reader and writer tasks.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket, close when the
        // channel is dropped
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        // Reader task: surface server messages as events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerMessage::decode(text.as_str()) {
                        Ok(server_msg) => {
                            let _ = event_tx.send(server_msg.into()).await;
                        }
                        Err(e) => log::warn!("Undecodable server frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Close the connection. The server treats this like `leave`.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    pub async fn join(&self, token: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Join {
            whiteboard_id: self.whiteboard_id,
            token: token.into(),
        })
        .await
    }

    pub async fn leave(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Leave).await
    }

    pub async fn send_cursor(&self, position: Vec2) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Cursor { position }).await
    }

    pub async fn create_object(&self, object: CanvasObject) -> Result<(), ProtocolError> {
        self.send(ClientMessage::ObjectCreate { object }).await
    }

    pub async fn update_object(&self, patch: ObjectPatch) -> Result<(), ProtocolError> {
        self.send(ClientMessage::ObjectUpdate { patch }).await
    }

    pub async fn delete_object(&self, object_id: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(ClientMessage::ObjectDelete {
            object_id: object_id.into(),
        })
        .await
    }

    pub async fn send(&self, msg: ClientMessage) -> Result<(), ProtocolError> {
        self.send_raw(msg.encode(self.whiteboard_id)?).await
    }

    /// Send a text frame as-is.
    pub async fn send_raw(&self, text: impl Into<String>) -> Result<(), ProtocolError> {
        let tx = self
            .outgoing_tx
            .as_ref()
            .ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(text.into())
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn whiteboard_id(&self) -> Uuid {
        self.whiteboard_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
