//! Filesystem payload store
//!
//! Payloads are written to `{root}/images/{entry_id}.{ext}`. Writes go to a
//! temporary file first and are renamed into place, so a crash never leaves
//! a truncated payload under a live reference.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;

use super::{PayloadError, PayloadRef, PayloadStore, StoredPayload, PAYLOAD_DIR};

const TEMP_SUFFIX: &str = ".part";

/// Payload store rooted at a data directory
#[derive(Debug, Clone)]
pub struct FsPayloadStore {
    dir: PathBuf,
}

impl FsPayloadStore {
    /// Create a store under `root`; the payload directory is created lazily
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            dir: root.into().join(PAYLOAD_DIR),
        }
    }

    /// Create the payload directory now
    pub async fn ensure_dir(&self) -> Result<(), PayloadError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, reference: &PayloadRef) -> PathBuf {
        self.dir.join(reference.file_name())
    }
}

impl PayloadStore for FsPayloadStore {
    async fn put(&self, reference: &PayloadRef, data: Bytes) -> Result<(), PayloadError> {
        self.ensure_dir().await?;

        let path = self.path_of(reference);
        let temp = self.dir.join(format!("{}{}", reference.file_name(), TEMP_SUFFIX));

        tokio::fs::write(&temp, &data).await?;
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }

        tracing::debug!(payload = %reference, bytes = data.len(), "Payload stored");
        Ok(())
    }

    async fn get(&self, reference: &PayloadRef) -> Result<Option<Bytes>, PayloadError> {
        match tokio::fs::read(self.path_of(reference)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, reference: &PayloadRef) -> Result<bool, PayloadError> {
        match tokio::fs::remove_file(self.path_of(reference)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<StoredPayload>, PayloadError> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut payloads = Vec::new();
        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            // Foreign files and in-flight temp files are left alone
            let Some(reference) = PayloadRef::from_file_name(name) else {
                continue;
            };
            // A file deleted by a concurrent cleanup since the listing is skipped
            let metadata = match tokio::fs::metadata(item.path()).await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let stored_at = metadata.modified()?;
            payloads.push(StoredPayload {
                reference,
                stored_at,
            });
        }

        Ok(payloads)
    }
}
