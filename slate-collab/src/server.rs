//! WebSocket server: one task per connection, all sharing one engine.
//!
//! Architecture:
//! ```text
//! Client A ──┐                        ┌── AuthGate (tokens)
//!             ├── connection task ──► ObjectSyncEngine ──┼── DocumentStore (memory / RocksDB)
//! Client B ──┘        ▲                    │             └── RoomRegistry
//!                     │                    │                    │
//!                     └── outbound queue ◄─┴──── BroadcastDispatcher
//! ```
//!
//! Each connection task selects over four sources: inbound frames, its
//! outbound queue, the heartbeat timer, and an eviction signal. However the
//! loop ends, the session is cleaned up exactly once.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};

use crate::auth::AuthGate;
use crate::broadcast::ConnectionHandle;
use crate::protocol::ProtocolError;
use crate::room::RoomRegistry;
use crate::storage::{DocumentStore, MemoryStore, RocksStore, StoreConfig, StoreError};
use crate::sync::{EngineOptions, ObjectSyncEngine, Session};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum members per whiteboard room
    pub max_peers_per_room: usize,
    /// Frames queued per connection before broadcasts to it are dropped
    pub outbound_capacity: usize,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Close connections silent for this long (0 = never)
    pub idle_timeout_secs: u64,
    /// Extra attempts after a store version conflict
    pub max_write_retries: u32,
    /// Only editors (and owners) may mutate
    pub enforce_edit_permission: bool,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            outbound_capacity: 256,
            heartbeat_interval_secs: 30,
            idle_timeout_secs: 90,
            max_write_retries: 3,
            enforce_edit_permission: false,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            max_write_retries: self.max_write_retries,
            enforce_edit_permission: self.enforce_edit_permission,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

/// Open the store selected by `config.storage_path`.
pub fn open_store(config: &ServerConfig) -> Result<Arc<dyn DocumentStore>, StoreError> {
    match &config.storage_path {
        Some(path) => Ok(Arc::new(RocksStore::open(StoreConfig::new(path.clone()))?)),
        None => {
            log::warn!("No storage path configured, whiteboards live in memory only");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_frames: u64,
    pub active_rooms: usize,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

/// The whiteboard sync server.
pub struct SyncServer {
    config: ServerConfig,
    engine: Arc<ObjectSyncEngine>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(
        config: ServerConfig,
        auth: Arc<dyn AuthGate>,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        let registry = Arc::new(RoomRegistry::new(config.max_peers_per_room));
        let engine = Arc::new(ObjectSyncEngine::new(
            registry,
            auth,
            store,
            config.engine_options(),
        ));
        Self {
            config,
            engine,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Bind to the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let engine = self.engine.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, engine, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        engine: Arc<ObjectSyncEngine>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (handle, mut outbound_rx) = ConnectionHandle::channel(config.outbound_capacity);
        let mut session = Session::new(handle.clone());
        log::info!("WebSocket connection {} established from {addr}", handle.id());

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut heartbeat = tokio::time::interval(config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        heartbeat.tick().await;
        let idle_timeout = config.idle_timeout();
        let mut last_seen = Instant::now();

        let result: Result<(), ServerError> = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            last_seen = Instant::now();
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.len() as u64;
                            }
                            engine.process(&mut session, text.as_str()).await;
                        }

                        Some(Ok(Message::Binary(data))) => {
                            last_seen = Instant::now();
                            log::warn!("Rejected {} byte binary frame from {addr}", data.len());
                            stats.write().await.rejected_frames += 1;
                            engine.report(&session, &ProtocolError::BinaryFrame.into());
                        }

                        Some(Ok(Message::Ping(data))) => {
                            last_seen = Instant::now();
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                break Err(e.into());
                            }
                        }

                        Some(Ok(Message::Pong(_))) => {
                            last_seen = Instant::now();
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection {} closed from {addr}", handle.id());
                            break Ok(());
                        }

                        Some(Ok(Message::Frame(_))) => {}

                        Some(Err(e)) => break Err(e.into()),
                    }
                }

                frame = outbound_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            if let Err(e) = ws_sender.send(Message::Text(frame.to_string().into())).await {
                                break Err(e.into());
                            }
                        }
                        None => break Ok(()),
                    }
                }

                _ = heartbeat.tick() => {
                    if let Some(limit) = idle_timeout {
                        if last_seen.elapsed() >= limit {
                            log::info!("Closing idle connection {} from {addr}", handle.id());
                            let _ = ws_sender.send(Message::Close(None)).await;
                            break Ok(());
                        }
                    }
                    if let Err(e) = ws_sender.send(Message::Ping(Vec::new().into())).await {
                        break Err(e.into());
                    }
                }

                _ = handle.close_requested() => {
                    log::info!("Connection {} superseded, closing", handle.id());
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break Ok(());
                }
            }
        };

        engine.disconnect(&mut session).await;

        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }

        result
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.engine.registry().room_count().await;
        stats
    }

    pub fn engine(&self) -> &Arc<ObjectSyncEngine> {
        &self.engine
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}
