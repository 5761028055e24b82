//! In-memory [`DocumentStore`] used by tests and `--in-memory` servers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{DocumentStore, Member, PermissionLevel, StoreError};
use crate::document::{Document, Whiteboard};

#[derive(Debug, Default)]
struct MemoryState {
    members: HashMap<Uuid, Member>,
    whiteboards: HashMap<Uuid, Whiteboard>,
    permissions: HashMap<(Uuid, Uuid), PermissionLevel>,
}

/// Volatile store. Everything is lost when it is dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_member(&self, member: Member) {
        self.state.write().await.members.insert(member.id, member);
    }

    /// Create an empty whiteboard owned by `owner_id` and return its id.
    pub async fn create_whiteboard(&self, title: impl Into<String>, owner_id: Uuid) -> Uuid {
        let id = Uuid::new_v4();
        self.insert_whiteboard(Whiteboard::new(id, title, owner_id))
            .await;
        id
    }

    pub async fn insert_whiteboard(&self, whiteboard: Whiteboard) {
        self.state
            .write()
            .await
            .whiteboards
            .insert(whiteboard.id, whiteboard);
    }

    pub async fn grant(&self, whiteboard_id: Uuid, member_id: Uuid, level: PermissionLevel) {
        self.state
            .write()
            .await
            .permissions
            .insert((whiteboard_id, member_id), level);
    }

    /// Number of successful document writes.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get_member(&self, member_id: Uuid) -> Result<Option<Member>, StoreError> {
        Ok(self.state.read().await.members.get(&member_id).cloned())
    }

    async fn get_document_owner(&self, whiteboard_id: Uuid) -> Result<Uuid, StoreError> {
        self.state
            .read()
            .await
            .whiteboards
            .get(&whiteboard_id)
            .map(|wb| wb.owner_id)
            .ok_or(StoreError::WhiteboardNotFound(whiteboard_id))
    }

    async fn get_permission(
        &self,
        whiteboard_id: Uuid,
        member_id: Uuid,
    ) -> Result<Option<PermissionLevel>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .permissions
            .get(&(whiteboard_id, member_id))
            .copied())
    }

    async fn read_document(&self, whiteboard_id: Uuid) -> Result<Whiteboard, StoreError> {
        self.state
            .read()
            .await
            .whiteboards
            .get(&whiteboard_id)
            .cloned()
            .ok_or(StoreError::WhiteboardNotFound(whiteboard_id))
    }

    async fn write_document(
        &self,
        whiteboard_id: Uuid,
        content: Document,
        expected_version: u64,
    ) -> Result<Document, StoreError> {
        let mut state = self.state.write().await;
        let whiteboard = state
            .whiteboards
            .get_mut(&whiteboard_id)
            .ok_or(StoreError::WhiteboardNotFound(whiteboard_id))?;

        if whiteboard.content.version != expected_version {
            return Err(StoreError::Conflict {
                expected: expected_version,
                found: whiteboard.content.version,
            });
        }

        whiteboard.content = content.clone();
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{CanvasObject, ObjectKind};

    #[tokio::test]
    async fn test_read_missing_whiteboard() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        assert_eq!(
            store.read_document(id).await,
            Err(StoreError::WhiteboardNotFound(id))
        );
        assert!(store.get_document_owner(id).await.is_err());
    }

    #[tokio::test]
    async fn test_members_and_permissions() {
        let store = MemoryStore::new();
        let member = Member::new(Uuid::new_v4(), "Alice");
        store.insert_member(member.clone()).await;
        assert_eq!(store.get_member(member.id).await.unwrap(), Some(member.clone()));
        assert_eq!(store.get_member(Uuid::new_v4()).await.unwrap(), None);

        let wb = store.create_whiteboard("Board", Uuid::new_v4()).await;
        assert_eq!(store.get_permission(wb, member.id).await.unwrap(), None);
        store.grant(wb, member.id, PermissionLevel::Commenter).await;
        assert_eq!(
            store.get_permission(wb, member.id).await.unwrap(),
            Some(PermissionLevel::Commenter)
        );
    }

    #[tokio::test]
    async fn test_versioned_write() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();
        let wb = store.create_whiteboard("Board", owner).await;
        assert_eq!(store.get_document_owner(wb).await.unwrap(), owner);

        let mut doc = store.read_document(wb).await.unwrap().content;
        doc.create(CanvasObject::new("a", ObjectKind::Text, 0.0, 0.0));
        let written = store.write_document(wb, doc.clone(), 0).await.unwrap();
        assert_eq!(written.version, 1);
        assert_eq!(store.write_count(), 1);

        // Second writer still holding version 0 loses
        let err = store.write_document(wb, doc, 0).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::Conflict {
                expected: 0,
                found: 1
            }
        );
        assert_eq!(store.read_document(wb).await.unwrap().content.len(), 1);
    }
}
