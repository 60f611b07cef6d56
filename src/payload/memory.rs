//! In-memory payload store

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::Mutex;

use super::{PayloadError, PayloadRef, PayloadStore, StoredPayload};

/// Payload store kept in process memory
///
/// Suitable for single-process deployments and tests. Deletions can be made
/// to fail on demand to exercise best-effort cleanup paths.
#[derive(Debug, Default)]
pub struct MemoryPayloadStore {
    payloads: Mutex<HashMap<PayloadRef, (Bytes, SystemTime)>>,
    fail_deletes: AtomicBool,
}

impl MemoryPayloadStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent delete fail
    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::Relaxed);
    }

    pub fn contains(&self, reference: &PayloadRef) -> bool {
        self.payloads.lock().contains_key(reference)
    }

    pub fn len(&self) -> usize {
        self.payloads.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.lock().is_empty()
    }
}

impl PayloadStore for MemoryPayloadStore {
    async fn put(&self, reference: &PayloadRef, data: Bytes) -> Result<(), PayloadError> {
        self.payloads
            .lock()
            .insert(reference.clone(), (data, SystemTime::now()));
        Ok(())
    }

    async fn get(&self, reference: &PayloadRef) -> Result<Option<Bytes>, PayloadError> {
        Ok(self
            .payloads
            .lock()
            .get(reference)
            .map(|(data, _)| data.clone()))
    }

    async fn delete(&self, reference: &PayloadRef) -> Result<bool, PayloadError> {
        if self.fail_deletes.load(Ordering::Relaxed) {
            return Err(PayloadError::Rejected(format!("delete of {reference} refused")));
        }
        Ok(self.payloads.lock().remove(reference).is_some())
    }

    async fn list(&self) -> Result<Vec<StoredPayload>, PayloadError> {
        Ok(self
            .payloads
            .lock()
            .iter()
            .map(|(reference, (_, stored_at))| StoredPayload {
                reference: reference.clone(),
                stored_at: *stored_at,
            })
            .collect())
    }
}
