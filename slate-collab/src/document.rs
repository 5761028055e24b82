//! Whiteboard document model: canvas objects, partial updates, and the
//! versioned object list stored per whiteboard.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::presence::Vec2;

/// Closed set of drawable object kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Text,
    Shape,
    Arrow,
    Line,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStyle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke_width: Option<f64>,
}

/// A drawable element on the canvas.
///
/// Fields the server does not model are kept in `extra` and written back
/// unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasObject {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ObjectKind,
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<ObjectStyle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<Vec<Vec2>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CanvasObject {
    pub fn new(id: impl Into<String>, kind: ObjectKind, x: f64, y: f64) -> Self {
        Self {
            id: id.into(),
            kind,
            x,
            y,
            width: None,
            height: None,
            content: None,
            style: None,
            points: None,
            extra: Map::new(),
        }
    }

    /// Shallow merge: every field present in `patch` replaces the current
    /// value, everything else is kept. `style` and `points` are replaced
    /// as a whole. The id never changes.
    pub fn merge(&mut self, patch: &ObjectPatch) {
        if let Some(kind) = patch.kind {
            self.kind = kind;
        }
        if let Some(x) = patch.x {
            self.x = x;
        }
        if let Some(y) = patch.y {
            self.y = y;
        }
        if let Some(width) = patch.width {
            self.width = Some(width);
        }
        if let Some(height) = patch.height {
            self.height = Some(height);
        }
        if let Some(content) = &patch.content {
            self.content = Some(content.clone());
        }
        if let Some(style) = &patch.style {
            self.style = Some(style.clone());
        }
        if let Some(points) = &patch.points {
            self.points = Some(points.clone());
        }
        for (key, value) in &patch.extra {
            if !value.is_null() {
                self.extra.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Partial object carried by `object_update`. Only `id` is required.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectPatch {
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ObjectKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<ObjectStyle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<Vec<Vec2>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ObjectPatch {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

/// Ordered object list plus a version that moves by one per applied change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub objects: Vec<CanvasObject>,
    pub version: u64,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an object. Ids are not checked for uniqueness.
    pub fn create(&mut self, object: CanvasObject) {
        self.objects.push(object);
        self.version += 1;
    }

    /// Merge `patch` into the object with the same id. Returns the merged
    /// object, or `None` (and leaves the version alone) if there is none.
    pub fn update(&mut self, patch: &ObjectPatch) -> Option<&CanvasObject> {
        let index = self.objects.iter().position(|o| o.id == patch.id)?;
        self.objects[index].merge(patch);
        self.version += 1;
        Some(&self.objects[index])
    }

    /// Remove every object with `object_id`. The version moves even when
    /// nothing matched. Returns the number of objects removed.
    pub fn delete(&mut self, object_id: &str) -> usize {
        let before = self.objects.len();
        self.objects.retain(|o| o.id != object_id);
        self.version += 1;
        before - self.objects.len()
    }

    pub fn get(&self, object_id: &str) -> Option<&CanvasObject> {
        self.objects.iter().find(|o| o.id == object_id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// Stored whiteboard record, sent whole in the `joined` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Whiteboard {
    pub id: Uuid,
    pub title: String,
    pub owner_id: Uuid,
    pub content: Document,
}

impl Whiteboard {
    pub fn new(id: Uuid, title: impl Into<String>, owner_id: Uuid) -> Self {
        Self {
            id,
            title: title.into(),
            owner_id,
            content: Document::new(),
        }
    }
}
