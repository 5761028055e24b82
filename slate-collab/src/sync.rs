//! Per-connection message handling: join, presence, and document mutations.
//!
//! ```text
//!            join ok                     leave / socket closed
//! Unjoined ───────────► Joined(Membership) ───────────────────► Left
//!    │                                                           ▲
//!    └──────────────────── socket closed ────────────────────────┘
//! ```
//!
//! Mutations run read → apply → version-checked write under the room's
//! writer lock, retrying when the store reports that the version moved.
//! The broadcast happens before the lock is released, so peers see
//! changes in version order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use crate::auth::{AuthError, AuthGate};
use crate::broadcast::{ConnectionHandle, ConnectionId};
use crate::document::{CanvasObject, Document, ObjectPatch};
use crate::error::CollabError;
use crate::presence::Vec2;
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};
use crate::room::{Membership, RoomRegistry};
use crate::storage::{DocumentStore, PermissionLevel, StoreError};

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unjoined,
    Joined(Membership),
    Left,
}

/// One client connection as seen by the engine.
#[derive(Debug)]
pub struct Session {
    handle: ConnectionHandle,
    state: SessionState,
}

impl Session {
    pub fn new(handle: ConnectionHandle) -> Self {
        Self {
            handle,
            state: SessionState::Unjoined,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn membership(&self) -> Option<Membership> {
        match self.state {
            SessionState::Joined(membership) => Some(membership),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Extra read-modify-write attempts after a version conflict
    pub max_write_retries: u32,
    /// Reject mutations from viewers and commenters
    pub enforce_edit_permission: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_write_retries: 3,
            enforce_edit_permission: false,
        }
    }
}

/// A document change requested by a client.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Create(CanvasObject),
    Update(ObjectPatch),
    Delete(String),
}

impl Mutation {
    /// Apply to `doc` and return the message to broadcast, or `None` if
    /// nothing changed.
    pub fn apply(&self, doc: &mut Document) -> Option<ServerMessage> {
        match self {
            Mutation::Create(object) => {
                doc.create(object.clone());
                Some(ServerMessage::ObjectCreate {
                    object: object.clone(),
                })
            }
            Mutation::Update(patch) => doc.update(patch).map(|object| ServerMessage::ObjectUpdate {
                object: object.clone(),
            }),
            Mutation::Delete(object_id) => {
                doc.delete(object_id);
                Some(ServerMessage::ObjectDelete {
                    object_id: object_id.clone(),
                })
            }
        }
    }

    pub fn object_id(&self) -> &str {
        match self {
            Mutation::Create(object) => &object.id,
            Mutation::Update(patch) => &patch.id,
            Mutation::Delete(object_id) => object_id,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Mutation::Create(_) => "create",
            Mutation::Update(_) => "update",
            Mutation::Delete(_) => "delete",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineStats {
    pub messages_processed: u64,
    pub errors: u64,
    pub mutations_applied: u64,
    pub write_conflicts: u64,
}

#[derive(Debug, Default)]
struct EngineCounters {
    messages_processed: AtomicU64,
    errors: AtomicU64,
    mutations_applied: AtomicU64,
    write_conflicts: AtomicU64,
}

/// Routes client messages to the registry and the document store.
pub struct ObjectSyncEngine {
    registry: Arc<RoomRegistry>,
    auth: Arc<dyn AuthGate>,
    store: Arc<dyn DocumentStore>,
    options: EngineOptions,
    counters: EngineCounters,
}

impl ObjectSyncEngine {
    pub fn new(
        registry: Arc<RoomRegistry>,
        auth: Arc<dyn AuthGate>,
        store: Arc<dyn DocumentStore>,
        options: EngineOptions,
    ) -> Self {
        Self {
            registry,
            auth,
            store,
            options,
            counters: EngineCounters::default(),
        }
    }

    /// Handle one inbound text frame. Any failure becomes an `error` reply
    /// to this session only.
    pub async fn process(&self, session: &mut Session, text: &str) {
        self.counters
            .messages_processed
            .fetch_add(1, Ordering::Relaxed);

        let result = match ClientMessage::decode(text) {
            Ok(msg) => {
                log::debug!("{} -> {}", session.id(), msg.message_type().as_str());
                self.handle(session, msg).await
            }
            Err(e) => Err(e.into()),
        };

        if let Err(e) = result {
            self.report(session, &e);
        }
    }

    /// Send `err` back to the session and log it.
    pub fn report(&self, session: &Session, err: &CollabError) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        match err {
            CollabError::Persistence(_) => log::error!("{} on {}: {err}", err.kind(), session.id()),
            _ => log::warn!("{} error on {}: {err}", err.kind(), session.id()),
        }

        match session.handle.reply(&ServerMessage::error(err.client_message())) {
            Ok(true) => {}
            Ok(false) => log::debug!("Dropped error reply for {}", session.id()),
            Err(e) => log::error!("Failed to encode error reply: {e}"),
        }
    }

    /// Dispatch a validated message according to the session state.
    pub async fn handle(&self, session: &mut Session, msg: ClientMessage) -> Result<(), CollabError> {
        if session.handle.is_closing() && session.state != SessionState::Left {
            // Superseded by a newer connection of the same member
            session.state = SessionState::Left;
        }

        let joined = match session.state {
            SessionState::Left => return Err(ProtocolError::ConnectionLeft.into()),
            SessionState::Unjoined => None,
            SessionState::Joined(membership) => Some(membership),
        };

        match msg {
            ClientMessage::Join {
                whiteboard_id,
                token,
            } => match joined {
                Some(membership) => Err(ProtocolError::AlreadyJoined(membership.room_id).into()),
                None => self.join(session, whiteboard_id, &token).await,
            },
            ClientMessage::Leave => {
                self.leave(session).await;
                Ok(())
            }
            ClientMessage::Cursor { position } => {
                let membership = joined.ok_or(ProtocolError::NotJoined)?;
                self.cursor(membership, position).await
            }
            ClientMessage::ObjectCreate { object } => {
                let membership = joined.ok_or(ProtocolError::NotJoined)?;
                self.mutate(membership, Mutation::Create(object)).await
            }
            ClientMessage::ObjectUpdate { patch } => {
                let membership = joined.ok_or(ProtocolError::NotJoined)?;
                self.mutate(membership, Mutation::Update(patch)).await
            }
            ClientMessage::ObjectDelete { object_id } => {
                let membership = joined.ok_or(ProtocolError::NotJoined)?;
                self.mutate(membership, Mutation::Delete(object_id)).await
            }
        }
    }

    async fn join(
        &self,
        session: &mut Session,
        whiteboard_id: Uuid,
        token: &str,
    ) -> Result<(), CollabError> {
        let member_id = self
            .auth
            .verify_credential(token)
            .await
            .ok_or(AuthError::InvalidToken)?;
        let member = self
            .store
            .get_member(member_id)
            .await?
            .ok_or(AuthError::UnknownMember(member_id))?;

        let owner_id = self.store.get_document_owner(whiteboard_id).await?;
        let level = if owner_id == member_id {
            PermissionLevel::Editor
        } else {
            self.store
                .get_permission(whiteboard_id, member_id)
                .await?
                .ok_or_else(CollabError::access_denied)?
        };

        let membership = Membership {
            room_id: whiteboard_id,
            member_id,
            level,
        };

        // Hold the writer lock so no mutation lands between the snapshot
        // and the registration.
        let lock = self.registry.write_lock(whiteboard_id).await;
        let result = {
            let _guard = lock.lock().await;
            match self.store.read_document(whiteboard_id).await {
                Ok(whiteboard) => {
                    self.registry
                        .join(&session.handle, membership, &member.name, |active_users| {
                            ServerMessage::Joined {
                                active_users,
                                whiteboard,
                            }
                        })
                        .await
                }
                Err(e) => Err(e.into()),
            }
        };
        drop(lock);
        self.registry.release_write_lock(whiteboard_id).await;

        let outcome = result?;
        session.state = SessionState::Joined(membership);
        log::info!(
            "{} ({member_id}) joined whiteboard {whiteboard_id} as {} with color {}",
            member.name,
            level.as_str(),
            outcome.presence.color
        );
        Ok(())
    }

    /// Explicit leave. No-op unless joined; afterwards the session is `Left`.
    pub async fn leave(&self, session: &mut Session) {
        let SessionState::Joined(membership) = session.state else {
            return;
        };
        session.state = SessionState::Left;

        let Some(outcome) = self.registry.leave(session.id()).await else {
            // Already evicted by a newer connection
            return;
        };

        log::info!(
            "Member {} left whiteboard {}{}",
            membership.member_id,
            membership.room_id,
            if outcome.room_closed { " (room closed)" } else { "" }
        );
    }

    /// Socket closed. Same cleanup as [`ObjectSyncEngine::leave`], and the
    /// session ends up `Left` regardless of where it was.
    pub async fn disconnect(&self, session: &mut Session) {
        self.leave(session).await;
        session.state = SessionState::Left;
    }

    async fn cursor(&self, membership: Membership, position: Vec2) -> Result<(), CollabError> {
        let updated = self
            .registry
            .update_cursor(membership.room_id, membership.member_id, position)
            .await;
        if updated.is_none() {
            return Ok(());
        }

        log::trace!(
            "Cursor {} -> ({}, {})",
            membership.member_id,
            position.x,
            position.y
        );
        let msg = ServerMessage::CursorUpdate {
            user_id: membership.member_id,
            cursor: position,
        };
        self.registry
            .broadcast(membership.room_id, &msg, Some(membership.member_id))
            .await?;
        Ok(())
    }

    async fn mutate(&self, membership: Membership, mutation: Mutation) -> Result<(), CollabError> {
        if self.options.enforce_edit_permission && !membership.level.can_edit() {
            return Err(CollabError::Access(format!(
                "Editor permission required ({} access)",
                membership.level.as_str()
            )));
        }

        let room_id = membership.room_id;
        let lock = self.registry.write_lock(room_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.apply_locked(membership, &mutation).await
        };
        drop(lock);
        // The room may have closed while we held the lock
        self.registry.release_write_lock(room_id).await;
        result
    }

    /// Read, apply, write and broadcast. Caller holds the room's writer lock.
    async fn apply_locked(
        &self,
        membership: Membership,
        mutation: &Mutation,
    ) -> Result<(), CollabError> {
        let room_id = membership.room_id;
        let mut attempt = 0u32;
        loop {
            let mut doc = self.store.read_document(room_id).await?.content;
            let expected = doc.version;

            let Some(msg) = mutation.apply(&mut doc) else {
                log::debug!(
                    "No object {} in whiteboard {room_id}, {} ignored",
                    mutation.object_id(),
                    mutation.kind()
                );
                return Ok(());
            };

            match self.store.write_document(room_id, doc, expected).await {
                Ok(written) => {
                    self.counters
                        .mutations_applied
                        .fetch_add(1, Ordering::Relaxed);
                    log::debug!(
                        "Applied {} of {} to whiteboard {room_id} (v{})",
                        mutation.kind(),
                        mutation.object_id(),
                        written.version
                    );
                    self.registry
                        .broadcast(room_id, &msg, Some(membership.member_id))
                        .await?;
                    return Ok(());
                }
                Err(StoreError::Conflict { expected, found }) => {
                    self.counters.write_conflicts.fetch_add(1, Ordering::Relaxed);
                    if attempt >= self.options.max_write_retries {
                        return Err(CollabError::Conflict {
                            whiteboard_id: room_id,
                            expected,
                            found,
                        });
                    }
                    attempt += 1;
                    log::warn!(
                        "Whiteboard {room_id} moved from v{expected} to v{found}, retrying {} ({attempt}/{})",
                        mutation.kind(),
                        self.options.max_write_retries
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            messages_processed: self.counters.messages_processed.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            mutations_applied: self.counters.mutations_applied.load(Ordering::Relaxed),
            write_conflicts: self.counters.write_conflicts.load(Ordering::Relaxed),
        }
    }
}
