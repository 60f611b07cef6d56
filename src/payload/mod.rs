//! Out-of-band storage for full-resolution image payloads
//!
//! Payloads live outside the bounded, TTL'd history. Each one is owned by
//! exactly one image entry: its reference is derived from the entry id, so
//! no entry can point at another entry's bytes.
//!
//! Deletion is best-effort and idempotent. Deleting a payload that is
//! already gone reports `Ok(false)`, never an error.

pub mod fs;
pub mod memory;

use std::future::Future;
use std::time::SystemTime;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::media::MediaType;
use crate::store::EntryId;

pub use fs::FsPayloadStore;
pub use memory::MemoryPayloadStore;

const PAYLOAD_DIR: &str = "images";

/// Error type for payload storage
#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("payload io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("payload store rejected operation: {0}")]
    Rejected(String),
}

/// Reference from an image entry to its payload: `images/{entry_id}.{ext}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PayloadRef {
    entry_id: EntryId,
    media_type: MediaType,
}

impl PayloadRef {
    /// Reference owned by the given entry
    pub fn for_entry(entry_id: EntryId, media_type: MediaType) -> Self {
        Self {
            entry_id,
            media_type,
        }
    }

    /// Parse a stored reference, rejecting anything outside the payload directory
    pub fn parse(raw: &str) -> Option<Self> {
        let file_name = raw.strip_prefix(PAYLOAD_DIR)?.strip_prefix('/')?;
        Self::from_file_name(file_name)
    }

    /// Parse a bare file name (`{entry_id}.{ext}`)
    pub fn from_file_name(file_name: &str) -> Option<Self> {
        let (stem, ext) = file_name.rsplit_once('.')?;
        Some(Self {
            entry_id: EntryId::parse(stem)?,
            media_type: MediaType::from_extension(ext)?,
        })
    }

    pub fn entry_id(&self) -> EntryId {
        self.entry_id
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn file_name(&self) -> String {
        format!("{}.{}", self.entry_id, self.media_type.extension())
    }
}

impl std::fmt::Display for PayloadRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", PAYLOAD_DIR, self.file_name())
    }
}

impl TryFrom<String> for PayloadRef {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw).ok_or_else(|| format!("invalid payload reference: {raw}"))
    }
}

impl From<PayloadRef> for String {
    fn from(reference: PayloadRef) -> Self {
        reference.to_string()
    }
}

/// A payload found in the store, used by the orphan sweep
#[derive(Debug, Clone)]
pub struct StoredPayload {
    pub reference: PayloadRef,
    pub stored_at: SystemTime,
}

/// Storage for full-resolution payload bytes
pub trait PayloadStore: Send + Sync + 'static {
    /// Store the payload, replacing any previous bytes under the same reference
    fn put(
        &self,
        reference: &PayloadRef,
        data: Bytes,
    ) -> impl Future<Output = Result<(), PayloadError>> + Send;

    /// Fetch payload bytes, `None` if absent
    fn get(
        &self,
        reference: &PayloadRef,
    ) -> impl Future<Output = Result<Option<Bytes>, PayloadError>> + Send;

    /// Delete a payload. Returns whether anything was removed.
    fn delete(
        &self,
        reference: &PayloadRef,
    ) -> impl Future<Output = Result<bool, PayloadError>> + Send;

    /// Every payload currently stored
    fn list(&self) -> impl Future<Output = Result<Vec<StoredPayload>, PayloadError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_format() {
        let id = EntryId::new();
        let reference = PayloadRef::for_entry(id, MediaType::Jpeg);

        assert_eq!(reference.to_string(), format!("images/{}.jpg", id));
        assert_eq!(PayloadRef::parse(&reference.to_string()), Some(reference));
    }

    #[test]
    fn test_rejects_foreign_paths() {
        let id = EntryId::new();

        assert_eq!(PayloadRef::parse(&format!("../{}.png", id)), None);
        assert_eq!(PayloadRef::parse(&format!("images/../{}.png", id)), None);
        assert_eq!(PayloadRef::parse("images/not-a-uuid.png"), None);
        assert_eq!(PayloadRef::parse(&format!("images/{}.gif", id)), None);
    }

    #[test]
    fn test_serde_as_string() {
        let reference = PayloadRef::for_entry(EntryId::new(), MediaType::Png);
        let json = serde_json::to_string(&reference).unwrap();

        assert_eq!(json, format!("\"{}\"", reference));
        let back: PayloadRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, reference);
    }
}
