//! JSON wire protocol for whiteboard collaboration.
//!
//! Client → server envelope:
//! ```text
//! { "type": "object_create", "whiteboardId": "<uuid>", "data": { "object": { … } } }
//! ```
//!
//! Server → client envelope:
//! ```text
//! { "type": "cursor_update", "data": { "userId": "<uuid>", "cursor": { "x": 1.0, "y": 2.0 } } }
//! ```
//!
//! Inbound frames are parsed into a loose [`Envelope`] first and then
//! validated into the closed [`ClientMessage`] union, so every message the
//! engine sees has a checked payload shape.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::document::{CanvasObject, ObjectPatch, Whiteboard};
use crate::presence::{Presence, Vec2};

/// Message type tags accepted from clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Join,
    Leave,
    Cursor,
    ObjectCreate,
    ObjectUpdate,
    ObjectDelete,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Join => "join",
            MessageType::Leave => "leave",
            MessageType::Cursor => "cursor",
            MessageType::ObjectCreate => "object_create",
            MessageType::ObjectUpdate => "object_update",
            MessageType::ObjectDelete => "object_delete",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "join" => Some(MessageType::Join),
            "leave" => Some(MessageType::Leave),
            "cursor" => Some(MessageType::Cursor),
            "object_create" => Some(MessageType::ObjectCreate),
            "object_update" => Some(MessageType::ObjectUpdate),
            "object_delete" => Some(MessageType::ObjectDelete),
            _ => None,
        }
    }
}

/// Raw client envelope before payload validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub whiteboard_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Client-declared identity. Never trusted; the joined identity comes
    /// from the credential.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Deserialize)]
struct JoinData {
    token: String,
}

#[derive(Deserialize)]
struct ObjectData<T> {
    object: T,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteData {
    object_id: String,
}

/// A validated client message.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Join { whiteboard_id: Uuid, token: String },
    Leave,
    Cursor { position: Vec2 },
    ObjectCreate { object: CanvasObject },
    ObjectUpdate { patch: ObjectPatch },
    ObjectDelete { object_id: String },
}

impl ClientMessage {
    /// Parse and validate a text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Self::from_envelope(envelope)
    }

    /// Validate an already-parsed envelope against the payload schema for its type.
    pub fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
        let kind = MessageType::parse(&envelope.kind)
            .ok_or_else(|| ProtocolError::UnknownType(envelope.kind.clone()))?;

        match kind {
            MessageType::Join => {
                let whiteboard_id = envelope
                    .whiteboard_id
                    .as_deref()
                    .and_then(|id| Uuid::parse_str(id).ok())
                    .ok_or(ProtocolError::InvalidWhiteboardId)?;
                let data: JoinData = payload(kind, envelope.data)?;
                Ok(ClientMessage::Join {
                    whiteboard_id,
                    token: data.token,
                })
            }
            MessageType::Leave => Ok(ClientMessage::Leave),
            MessageType::Cursor => {
                let position: Vec2 = payload(kind, envelope.data)?;
                Ok(ClientMessage::Cursor { position })
            }
            MessageType::ObjectCreate => {
                let data: ObjectData<CanvasObject> = payload(kind, envelope.data)?;
                Ok(ClientMessage::ObjectCreate { object: data.object })
            }
            MessageType::ObjectUpdate => {
                let data: ObjectData<ObjectPatch> = payload(kind, envelope.data)?;
                Ok(ClientMessage::ObjectUpdate { patch: data.object })
            }
            MessageType::ObjectDelete => {
                let data: DeleteData = payload(kind, envelope.data)?;
                Ok(ClientMessage::ObjectDelete {
                    object_id: data.object_id,
                })
            }
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            ClientMessage::Join { .. } => MessageType::Join,
            ClientMessage::Leave => MessageType::Leave,
            ClientMessage::Cursor { .. } => MessageType::Cursor,
            ClientMessage::ObjectCreate { .. } => MessageType::ObjectCreate,
            ClientMessage::ObjectUpdate { .. } => MessageType::ObjectUpdate,
            ClientMessage::ObjectDelete { .. } => MessageType::ObjectDelete,
        }
    }

    /// Build the wire envelope for this message addressed to `whiteboard_id`.
    pub fn to_envelope(&self, whiteboard_id: Uuid) -> Result<Envelope, ProtocolError> {
        let (whiteboard_id, data) = match self {
            ClientMessage::Join {
                whiteboard_id,
                token,
            } => (*whiteboard_id, Some(json!({ "token": token }))),
            ClientMessage::Leave => (whiteboard_id, None),
            ClientMessage::Cursor { position } => (whiteboard_id, Some(to_value(position)?)),
            ClientMessage::ObjectCreate { object } => {
                (whiteboard_id, Some(json!({ "object": to_value(object)? })))
            }
            ClientMessage::ObjectUpdate { patch } => {
                (whiteboard_id, Some(json!({ "object": to_value(patch)? })))
            }
            ClientMessage::ObjectDelete { object_id } => {
                (whiteboard_id, Some(json!({ "objectId": object_id })))
            }
        };
        Ok(Envelope {
            kind: self.message_type().as_str().to_string(),
            whiteboard_id: Some(whiteboard_id.to_string()),
            data,
            user_id: None,
        })
    }

    /// Serialize to a text frame.
    pub fn encode(&self, whiteboard_id: Uuid) -> Result<String, ProtocolError> {
        let envelope = self.to_envelope(whiteboard_id)?;
        serde_json::to_string(&envelope).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

fn payload<T: DeserializeOwned>(kind: MessageType, data: Option<Value>) -> Result<T, ProtocolError> {
    let data = data.ok_or(ProtocolError::MissingData(kind.as_str()))?;
    serde_json::from_value(data).map_err(|e| ProtocolError::InvalidPayload {
        kind: kind.as_str(),
        reason: e.to_string(),
    })
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, ProtocolError> {
    serde_json::to_value(value).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

/// Messages pushed from the server to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    /// Reply to a successful join: everyone present (including the joiner)
    /// and the full whiteboard record.
    Joined {
        active_users: Vec<Presence>,
        whiteboard: Whiteboard,
    },
    UserJoined { user: Presence },
    UserLeft { user_id: Uuid },
    CursorUpdate { user_id: Uuid, cursor: Vec2 },
    ObjectCreate { object: CanvasObject },
    ObjectUpdate { object: CanvasObject },
    ObjectDelete { object_id: String },
    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ServerMessage::Joined { .. } => "joined",
            ServerMessage::UserJoined { .. } => "user_joined",
            ServerMessage::UserLeft { .. } => "user_left",
            ServerMessage::CursorUpdate { .. } => "cursor_update",
            ServerMessage::ObjectCreate { .. } => "object_create",
            ServerMessage::ObjectUpdate { .. } => "object_update",
            ServerMessage::ObjectDelete { .. } => "object_delete",
            ServerMessage::Error { .. } => "error",
        }
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a text frame received from the server.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("Invalid message format: {0}")]
    Malformed(String),
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("Missing data for '{0}' message")]
    MissingData(&'static str),
    #[error("Invalid data for '{kind}' message: {reason}")]
    InvalidPayload { kind: &'static str, reason: String },
    #[error("Missing or invalid whiteboardId")]
    InvalidWhiteboardId,
    #[error("Binary frames are not supported")]
    BinaryFrame,
    #[error("Not joined to a whiteboard")]
    NotJoined,
    #[error("Already joined to whiteboard {0}")]
    AlreadyJoined(Uuid),
    #[error("Connection has already left")]
    ConnectionLeft,
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Connection closed")]
    ConnectionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ObjectKind;

    #[test]
    fn test_decode_join() {
        let id = Uuid::new_v4();
        let text = format!(r#"{{"type":"join","whiteboardId":"{id}","data":{{"token":"abc"}}}}"#);
        let msg = ClientMessage::decode(&text).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Join {
                whiteboard_id: id,
                token: "abc".into()
            }
        );
    }

    #[test]
    fn test_decode_join_requires_whiteboard_id() {
        let text = r#"{"type":"join","data":{"token":"abc"}}"#;
        assert_eq!(
            ClientMessage::decode(text),
            Err(ProtocolError::InvalidWhiteboardId)
        );

        let text = r#"{"type":"join","whiteboardId":"not-a-uuid","data":{"token":"abc"}}"#;
        assert_eq!(
            ClientMessage::decode(text),
            Err(ProtocolError::InvalidWhiteboardId)
        );
    }

    #[test]
    fn test_decode_leave_without_data() {
        let msg = ClientMessage::decode(r#"{"type":"leave","whiteboardId":"x"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Leave);
    }

    #[test]
    fn test_decode_cursor() {
        let msg = ClientMessage::decode(r#"{"type":"cursor","data":{"x":10,"y":20.5}}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Cursor {
                position: Vec2::new(10.0, 20.5)
            }
        );
    }

    #[test]
    fn test_decode_object_create() {
        let text = r#"{"type":"object_create","data":{"object":{"id":"t1","type":"text","x":1,"y":2,"content":"hi"}}}"#;
        match ClientMessage::decode(text).unwrap() {
            ClientMessage::ObjectCreate { object } => {
                assert_eq!(object.id, "t1");
                assert_eq!(object.kind, ObjectKind::Text);
                assert_eq!(object.content.as_deref(), Some("hi"));
            }
            other => panic!("Expected ObjectCreate, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_object_update_partial() {
        let text = r#"{"type":"object_update","data":{"object":{"id":"s1","x":42}}}"#;
        match ClientMessage::decode(text).unwrap() {
            ClientMessage::ObjectUpdate { patch } => {
                assert_eq!(patch.id, "s1");
                assert_eq!(patch.x, Some(42.0));
                assert!(patch.y.is_none());
                assert!(patch.kind.is_none());
            }
            other => panic!("Expected ObjectUpdate, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_object_delete() {
        let msg =
            ClientMessage::decode(r#"{"type":"object_delete","data":{"objectId":"a1"}}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::ObjectDelete {
                object_id: "a1".into()
            }
        );
    }

    #[test]
    fn test_unknown_type() {
        let err = ClientMessage::decode(r#"{"type":"explode"}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownType("explode".into()));
    }

    #[test]
    fn test_malformed_json() {
        let err = ClientMessage::decode("{not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
        assert!(err.to_string().starts_with("Invalid message format"));
    }

    #[test]
    fn test_missing_and_invalid_data() {
        let err = ClientMessage::decode(r#"{"type":"cursor"}"#).unwrap_err();
        assert_eq!(err, ProtocolError::MissingData("cursor"));

        let err = ClientMessage::decode(r#"{"type":"cursor","data":{"x":"left"}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { kind: "cursor", .. }));

        // Object type outside the closed set
        let text = r#"{"type":"object_create","data":{"object":{"id":"z","type":"blob","x":0,"y":0}}}"#;
        let err = ClientMessage::decode(text).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { kind: "object_create", .. }));
    }

    #[test]
    fn test_client_encode_decodes_back() {
        let wb = Uuid::new_v4();
        let msg = ClientMessage::ObjectDelete {
            object_id: "gone".into(),
        };
        let text = msg.encode(wb).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "object_delete");
        assert_eq!(value["whiteboardId"], wb.to_string());
        assert_eq!(value["data"]["objectId"], "gone");
        assert_eq!(ClientMessage::decode(&text).unwrap(), msg);
    }

    #[test]
    fn test_server_message_wire_shape() {
        let user_id = Uuid::new_v4();
        let msg = ServerMessage::CursorUpdate {
            user_id,
            cursor: Vec2::new(3.0, 4.0),
        };
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "cursor_update");
        assert_eq!(value["data"]["userId"], user_id.to_string());
        assert_eq!(value["data"]["cursor"]["x"], 3.0);

        let value: Value =
            serde_json::from_str(&ServerMessage::error("Access denied").encode().unwrap()).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["data"]["message"], "Access denied");

        let msg = ServerMessage::ObjectDelete {
            object_id: "o9".into(),
        };
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["data"]["objectId"], "o9");
    }

    #[test]
    fn test_server_type_names_match_wire_tags() {
        let msgs = vec![
            ServerMessage::UserLeft {
                user_id: Uuid::nil(),
            },
            ServerMessage::ObjectDelete {
                object_id: "x".into(),
            },
            ServerMessage::error("e"),
        ];
        for msg in msgs {
            let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
            assert_eq!(value["type"], msg.type_name());
        }
    }
}
