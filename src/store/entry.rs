//! Board entry model
//!
//! An entry is immutable once created; the only mutation is deletion.
//! Text entries carry their content inline. Image entries carry a payload
//! reference and an inline preview. The body enum makes "exactly one of
//! content or payload, matching the kind" a property of the type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::media::{MediaType, Preview};
use crate::payload::PayloadRef;

/// Unique entry identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(Uuid);

impl EntryId {
    /// Generate a fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw).ok().map(Self)
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Entry kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Text,
    Image,
}

/// Kind-specific entry content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EntryBody {
    Text {
        content: String,
    },
    Image {
        payload: PayloadRef,
        preview: Preview,
        media_type: MediaType,
    },
}

/// One item of a board's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    #[serde(flatten)]
    pub body: EntryBody,
    /// Size of the text in bytes, or of the full image payload
    pub byte_size: u64,
    /// Ordering key of the history
    pub created_at: DateTime<Utc>,
}

impl Entry {
    /// New text entry stamped with the current time
    pub fn text(content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            id: EntryId::new(),
            byte_size: content.len() as u64,
            body: EntryBody::Text { content },
            created_at: Utc::now(),
        }
    }

    /// New image entry; the payload reference is derived from `id`
    pub fn image(id: EntryId, media_type: MediaType, preview: Preview, byte_size: u64) -> Self {
        Self {
            id,
            body: EntryBody::Image {
                payload: PayloadRef::for_entry(id, media_type),
                preview,
                media_type,
            },
            byte_size,
            created_at: Utc::now(),
        }
    }

    /// Override the creation timestamp
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn kind(&self) -> EntryKind {
        match self.body {
            EntryBody::Text { .. } => EntryKind::Text,
            EntryBody::Image { .. } => EntryKind::Image,
        }
    }

    pub fn content(&self) -> Option<&str> {
        match &self.body {
            EntryBody::Text { content } => Some(content),
            EntryBody::Image { .. } => None,
        }
    }

    pub fn payload(&self) -> Option<&PayloadRef> {
        match &self.body {
            EntryBody::Image { payload, .. } => Some(payload),
            EntryBody::Text { .. } => None,
        }
    }

    pub fn media_type(&self) -> Option<MediaType> {
        match &self.body {
            EntryBody::Image { media_type, .. } => Some(*media_type),
            EntryBody::Text { .. } => None,
        }
    }

    /// Store score: creation time in milliseconds since the epoch
    pub fn score(&self) -> i64 {
        self.created_at.timestamp_millis()
    }

    /// Viewer-facing projection without payload internals
    pub fn view(&self) -> EntryView {
        let (content, preview) = match &self.body {
            EntryBody::Text { content } => (Some(content.clone()), None),
            EntryBody::Image { preview, .. } => (None, Some(preview.clone())),
        };

        EntryView {
            id: self.id,
            kind: self.kind(),
            content,
            preview,
            media_type: self.media_type(),
            byte_size: self.byte_size,
            created_at: self.created_at,
        }
    }
}

/// Serializable entry as pushed to viewers
///
/// Image entries carry only their preview. Full bytes are fetched through
/// the payload endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryView {
    pub id: EntryId,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<Preview>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaType>,
    pub byte_size: u64,
    pub created_at: DateTime<Utc>,
}
