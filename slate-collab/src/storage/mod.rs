//! Storage layer for whiteboards, members, and permission grants.
//!
//! ```text
//! ┌────────────────┐   read / write(expected_version)  ┌──────────────────┐
//! │ ObjectSyncEngine│ ─────────────────────────────────►│ dyn DocumentStore│
//! └────────────────┘                                    └────────┬─────────┘
//!                                                                │
//!                                      ┌─────────────────────────┼──────────────┐
//!                                      ▼                                        ▼
//!                              ┌──────────────┐                   ┌──────────────────────────┐
//!                              │ MemoryStore  │                   │ RocksStore               │
//!                              │ (tests, dev) │                   │ CF "whiteboards" (LZ4)   │
//!                              └──────────────┘                   │ CF "metadata"            │
//!                                                                 │ CF "members"             │
//!                                                                 │ CF "permissions"         │
//!                                                                 └──────────────────────────┘
//! ```
//!
//! Writes are version-checked: `write_document` only succeeds when the
//! stored version still equals the version the caller read.

pub mod memory;
pub mod rocks;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::document::{Document, Whiteboard};

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig, WhiteboardMetadata};

/// A registered user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: Uuid,
    pub name: String,
    pub email: Option<String>,
}

impl Member {
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            email: None,
        }
    }
}

/// Access level granted on a whiteboard, ordered from least to most.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    Viewer,
    Commenter,
    Editor,
}

impl PermissionLevel {
    pub fn can_edit(&self) -> bool {
        *self >= PermissionLevel::Editor
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionLevel::Viewer => "viewer",
            PermissionLevel::Commenter => "commenter",
            PermissionLevel::Editor => "editor",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "viewer" => Some(PermissionLevel::Viewer),
            "commenter" => Some(PermissionLevel::Commenter),
            "editor" => Some(PermissionLevel::Editor),
            _ => None,
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Whiteboard not found: {0}")]
    WhiteboardNotFound(Uuid),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    /// The stored version moved between read and write.
    #[error("Version conflict: expected {expected}, found {found}")]
    Conflict { expected: u64, found: u64 },
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Persistence collaborator consumed by the sync engine.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_member(&self, member_id: Uuid) -> Result<Option<Member>, StoreError>;

    async fn get_document_owner(&self, whiteboard_id: Uuid) -> Result<Uuid, StoreError>;

    async fn get_permission(
        &self,
        whiteboard_id: Uuid,
        member_id: Uuid,
    ) -> Result<Option<PermissionLevel>, StoreError>;

    async fn read_document(&self, whiteboard_id: Uuid) -> Result<Whiteboard, StoreError>;

    /// Replace the whiteboard content if the stored version is still
    /// `expected_version`; otherwise fail with [`StoreError::Conflict`].
    async fn write_document(
        &self,
        whiteboard_id: Uuid,
        content: Document,
        expected_version: u64,
    ) -> Result<Document, StoreError>;
}
