//! Room registry: which connections are in which whiteboard.
//!
//! A room exists exactly while it has at least one member. Each member has
//! one live connection per room; a second connection for the same member
//! supersedes the first, which is asked to close.
//!
//! Membership records are keyed by [`ConnectionId`] and never change after
//! join, so a connection's cleanup always knows which room to leave even if
//! it races with a newer connection for the same member.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::broadcast::{BroadcastDispatcher, BroadcastStats, ConnectionHandle, ConnectionId};
use crate::error::CollabError;
use crate::presence::{Presence, PresenceTracker, Vec2};
use crate::protocol::{ProtocolError, ServerMessage};
use crate::storage::PermissionLevel;

/// What a joined connection is, fixed at join time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Membership {
    pub room_id: Uuid,
    pub member_id: Uuid,
    pub level: PermissionLevel,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinOutcome {
    pub presence: Presence,
    /// Earlier connection of the same member that was superseded
    pub evicted: Option<ConnectionId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeaveOutcome {
    pub membership: Membership,
    /// The member's presence was removed (false if a newer connection owns it)
    pub presence_removed: bool,
    pub room_closed: bool,
}

#[derive(Debug, Default)]
struct Room {
    members: HashMap<Uuid, ConnectionHandle>,
    presence: PresenceTracker,
}

#[derive(Debug, Default)]
struct RegistryState {
    rooms: HashMap<Uuid, Room>,
    memberships: HashMap<ConnectionId, Membership>,
    /// Per-room writer locks. An entry can outlive its room while a holder
    /// still has it, and can precede the room while a join is in flight.
    write_locks: HashMap<Uuid, Arc<Mutex<()>>>,
}

impl RegistryState {
    fn prune_write_lock(&mut self, room_id: &Uuid) {
        if self.rooms.contains_key(room_id) {
            return;
        }
        let unused = self
            .write_locks
            .get(room_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if unused {
            self.write_locks.remove(room_id);
        }
    }
}

/// Live rooms plus the dispatcher used to reach their members.
#[derive(Debug)]
pub struct RoomRegistry {
    state: Mutex<RegistryState>,
    dispatcher: BroadcastDispatcher,
    max_members_per_room: usize,
}

impl RoomRegistry {
    pub fn new(max_members_per_room: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            dispatcher: BroadcastDispatcher::new(),
            max_members_per_room,
        }
    }

    /// Register `conn` in the room named by `membership`.
    ///
    /// Under one lock: the joiner is added, receives `welcome(active_users)`
    /// built from the updated presence list, and everyone else receives
    /// `user_joined`.
    pub async fn join<F>(
        &self,
        conn: &ConnectionHandle,
        membership: Membership,
        name: &str,
        welcome: F,
    ) -> Result<JoinOutcome, CollabError>
    where
        F: FnOnce(Vec<Presence>) -> ServerMessage,
    {
        let mut state = self.state.lock().await;
        let RegistryState {
            rooms, memberships, ..
        } = &mut *state;

        if let Some(existing) = memberships.get(&conn.id()) {
            return Err(ProtocolError::AlreadyJoined(existing.room_id).into());
        }

        let member_id = membership.member_id;
        if let Some(room) = rooms.get(&membership.room_id) {
            if !room.members.contains_key(&member_id)
                && room.members.len() >= self.max_members_per_room
            {
                return Err(CollabError::Access("room is full".into()));
            }
        }

        let room = rooms.entry(membership.room_id).or_insert_with(|| {
            log::info!("Opened room {}", membership.room_id);
            Room::default()
        });

        let evicted = match room.members.insert(member_id, conn.clone()) {
            Some(previous) if previous.id() != conn.id() => {
                memberships.remove(&previous.id());
                previous.request_close();
                log::info!(
                    "Member {member_id} rejoined room {} on {}, closing {}",
                    membership.room_id,
                    conn.id(),
                    previous.id()
                );
                Some(previous.id())
            }
            _ => None,
        };

        let presence = room.presence.join(member_id, name);
        memberships.insert(conn.id(), membership);

        if !conn.reply(&welcome(room.presence.list()))? {
            log::warn!("Could not queue join reply for {}", conn.id());
        }
        let joined = ServerMessage::UserJoined {
            user: presence.clone(),
        };
        self.dispatcher.send(&room.members, &joined, Some(member_id))?;

        Ok(JoinOutcome { presence, evicted })
    }

    /// Remove a connection from its room. `None` if it never joined (or was
    /// already removed). Deletes the room when its last member leaves,
    /// otherwise tells the remaining members with `user_left` under the
    /// same lock, so it is ordered against any `user_joined`.
    pub async fn leave(&self, conn_id: ConnectionId) -> Option<LeaveOutcome> {
        let mut state = self.state.lock().await;
        let RegistryState {
            rooms, memberships, ..
        } = &mut *state;

        let membership = memberships.remove(&conn_id)?;
        let mut presence_removed = false;
        let mut room_closed = false;

        if let Some(room) = rooms.get_mut(&membership.room_id) {
            let owns_slot = room
                .members
                .get(&membership.member_id)
                .is_some_and(|handle| handle.id() == conn_id);
            if owns_slot {
                room.members.remove(&membership.member_id);
                presence_removed = room.presence.leave(&membership.member_id).is_some();
            }
            if room.members.is_empty() {
                rooms.remove(&membership.room_id);
                room_closed = true;
                log::info!("Closed room {}", membership.room_id);
            } else if presence_removed {
                let left = ServerMessage::UserLeft {
                    user_id: membership.member_id,
                };
                if let Err(e) = self
                    .dispatcher
                    .send(&room.members, &left, Some(membership.member_id))
                {
                    log::error!("Failed to announce leave of {}: {e}", membership.member_id);
                }
            }
        }
        if room_closed {
            state.prune_write_lock(&membership.room_id);
        }

        Some(LeaveOutcome {
            membership,
            presence_removed,
            room_closed,
        })
    }

    /// Send to every member of `room_id` except `exclude`. No-op for an
    /// unknown room.
    pub async fn broadcast(
        &self,
        room_id: Uuid,
        msg: &ServerMessage,
        exclude: Option<Uuid>,
    ) -> Result<usize, ProtocolError> {
        let state = self.state.lock().await;
        match state.rooms.get(&room_id) {
            Some(room) => self.dispatcher.send(&room.members, msg, exclude),
            None => Ok(0),
        }
    }

    /// Move a member's cursor. `None` if they have no presence in the room.
    pub async fn update_cursor(
        &self,
        room_id: Uuid,
        member_id: Uuid,
        position: Vec2,
    ) -> Option<Presence> {
        let mut state = self.state.lock().await;
        state
            .rooms
            .get_mut(&room_id)?
            .presence
            .update_cursor(&member_id, position)
            .cloned()
    }

    /// Single-writer lock for document reads-then-writes in `room_id`.
    /// Created on first use, before the room itself if need be.
    pub async fn write_lock(&self, room_id: Uuid) -> Arc<Mutex<()>> {
        let mut state = self.state.lock().await;
        state.write_locks.entry(room_id).or_default().clone()
    }

    /// Forget the lock for `room_id` if no room and no other holder needs
    /// it. Call after dropping your own handle to the lock.
    pub async fn release_write_lock(&self, room_id: Uuid) {
        self.state.lock().await.prune_write_lock(&room_id);
    }

    pub async fn write_lock_count(&self) -> usize {
        self.state.lock().await.write_locks.len()
    }

    pub async fn membership(&self, conn_id: ConnectionId) -> Option<Membership> {
        self.state.lock().await.memberships.get(&conn_id).copied()
    }

    pub async fn presence_list(&self, room_id: Uuid) -> Vec<Presence> {
        let state = self.state.lock().await;
        state
            .rooms
            .get(&room_id)
            .map(|room| room.presence.list())
            .unwrap_or_default()
    }

    pub async fn room_count(&self) -> usize {
        self.state.lock().await.rooms.len()
    }

    pub async fn active_rooms(&self) -> Vec<Uuid> {
        self.state.lock().await.rooms.keys().copied().collect()
    }

    pub async fn member_count(&self, room_id: Uuid) -> usize {
        let state = self.state.lock().await;
        state
            .rooms
            .get(&room_id)
            .map_or(0, |room| room.members.len())
    }

    pub fn max_members_per_room(&self) -> usize {
        self.max_members_per_room
    }

    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.dispatcher.stats()
    }
}
