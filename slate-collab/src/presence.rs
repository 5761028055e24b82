//! Presence tracking: who is in a whiteboard, where their cursor is, and
//! which color they are drawn with.
//!
//! ```text
//! join(user)            cursor(user, pos)          leave(user)
//!     │                        │                         │
//!     ▼                        ▼                         ▼
//! PresenceTracker::join  PresenceTracker::update_cursor  PresenceTracker::leave
//!     │                        │                         │
//!     ▼                        ▼                         ▼
//!  user_joined           cursor_update             user_left
//! ```
//!
//! One tracker lives inside each room. It holds at most one entry per user
//! and keeps entries in join order so `joined` replies list users the way
//! they arrived.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// 2D position in whiteboard (world) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point.
    pub fn distance(&self, other: &Vec2) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

impl Default for Vec2 {
    fn default() -> Self {
        Self::ZERO
    }
}

/// Fixed cursor palette, assigned in order.
pub const PALETTE: [&str; 7] = [
    "#FF6B6B", "#4ECDC4", "#45B7D1", "#96CEB4", "#FECA57", "#FF9FF3", "#54A0FF",
];

/// Palette color for a room that currently holds `size` users.
pub fn color_for(size: usize) -> &'static str {
    PALETTE[size % PALETTE.len()]
}

/// One user's live presence in a whiteboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    pub id: Uuid,
    pub name: String,
    pub cursor: Vec2,
    pub color: String,
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

/// Presence table for a single room.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    users: Vec<Presence>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `user_id` to the room, or refresh the entry if already present.
    ///
    /// A new entry starts with the cursor at the origin and the next color
    /// from [`PresenceTracker::pick_color`]. A re-join keeps the existing
    /// color and cursor and updates the display name.
    pub fn join(&mut self, user_id: Uuid, name: impl Into<String>) -> Presence {
        let name = name.into();
        if let Some(existing) = self.users.iter_mut().find(|p| p.id == user_id) {
            existing.name = name;
            return existing.clone();
        }

        let presence = Presence {
            id: user_id,
            name,
            cursor: Vec2::ZERO,
            color: self.pick_color().to_string(),
        };
        self.users.push(presence.clone());
        presence
    }

    /// Lowest palette color not held by anyone in the room. Once the palette
    /// is exhausted colors repeat by room size.
    pub fn pick_color(&self) -> &'static str {
        PALETTE
            .iter()
            .copied()
            .find(|color| !self.users.iter().any(|p| p.color == *color))
            .unwrap_or_else(|| color_for(self.users.len()))
    }

    /// Remove a user. Returns the removed entry.
    pub fn leave(&mut self, user_id: &Uuid) -> Option<Presence> {
        let index = self.users.iter().position(|p| p.id == *user_id)?;
        Some(self.users.remove(index))
    }

    /// Move a user's cursor. `None` if the user is not present.
    pub fn update_cursor(&mut self, user_id: &Uuid, position: Vec2) -> Option<&Presence> {
        let presence = self.users.iter_mut().find(|p| p.id == *user_id)?;
        presence.cursor = position;
        Some(presence)
    }

    pub fn get(&self, user_id: &Uuid) -> Option<&Presence> {
        self.users.iter().find(|p| p.id == *user_id)
    }

    /// Snapshot of everyone present, in join order.
    pub fn list(&self) -> Vec<Presence> {
        self.users.clone()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
