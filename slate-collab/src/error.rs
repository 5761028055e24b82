//! Top-level error type for message handling.
//!
//! Every failure while handling one inbound message ends up as a
//! [`CollabError`], which is turned into an `error` reply for the sender
//! only. None of them close the connection.

use thiserror::Error;
use uuid::Uuid;

use crate::auth::AuthError;
use crate::protocol::ProtocolError;
use crate::storage::StoreError;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CollabError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("{0}")]
    Access(String),
    #[error("Persistence error: {0}")]
    Persistence(StoreError),
    /// The whiteboard kept moving underneath us; the client may retry.
    #[error("Whiteboard {whiteboard_id} was modified concurrently (expected v{expected}, found v{found}), please retry")]
    Conflict {
        whiteboard_id: Uuid,
        expected: u64,
        found: u64,
    },
}

impl CollabError {
    pub fn access_denied() -> Self {
        CollabError::Access("Access denied".into())
    }

    /// Text sent back to the client. Storage internals are not exposed.
    pub fn client_message(&self) -> String {
        match self {
            CollabError::Protocol(ProtocolError::Malformed(_)) => {
                "Invalid message format".to_string()
            }
            CollabError::Persistence(StoreError::WhiteboardNotFound(_)) => {
                "Whiteboard not found".to_string()
            }
            CollabError::Persistence(_) => "Failed to access whiteboard storage".to_string(),
            other => other.to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CollabError::Protocol(_) => "protocol",
            CollabError::Auth(_) => "auth",
            CollabError::Access(_) => "access",
            CollabError::Persistence(_) => "persistence",
            CollabError::Conflict { .. } => "conflict",
        }
    }
}

impl From<StoreError> for CollabError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict { expected, found } => CollabError::Conflict {
                whiteboard_id: Uuid::nil(),
                expected,
                found,
            },
            other => CollabError::Persistence(other),
        }
    }
}
