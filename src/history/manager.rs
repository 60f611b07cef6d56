//! History manager implementation

use std::sync::Arc;
use std::time::Duration;

use tokio_util::task::TaskTracker;

use crate::bus::BoardEvent;
use crate::config::BoardConfig;
use crate::error::{Error, Result};
use crate::payload::{PayloadRef, PayloadStore};
use crate::stats::ServiceStats;
use crate::store::{BatchOutcome, BoardId, Entry, EntryId, Store, WriteBatch};

/// Enforces capacity and TTL on every write and owns payload cleanup
pub struct HistoryManager<S, P> {
    pub(super) store: Arc<S>,
    pub(super) payloads: Arc<P>,
    capacity: usize,
    ttl: Duration,
    pub(super) sweep_grace: Duration,
    cleanup: TaskTracker,
    pub(super) stats: Arc<ServiceStats>,
}

impl<S: Store, P: PayloadStore> HistoryManager<S, P> {
    pub fn new(
        store: Arc<S>,
        payloads: Arc<P>,
        config: &BoardConfig,
        stats: Arc<ServiceStats>,
    ) -> Self {
        Self {
            store,
            payloads,
            capacity: config.capacity,
            ttl: config.ttl,
            sweep_grace: config.sweep_grace,
            cleanup: TaskTracker::new(),
            stats,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Admit an entry: insert, trim and refresh TTL as one atomic batch
    ///
    /// Returns the evicted entries, oldest first. Their payloads are
    /// released in the background.
    pub async fn commit(&self, board: &BoardId, entry: Entry) -> Result<Vec<Entry>> {
        Ok(self.commit_with(board, entry, None).await?.evicted)
    }

    /// [`commit`](Self::commit), handing `announce` to the store to publish
    /// atomically with the write
    ///
    /// `outcome.announced` tells whether the store published it.
    pub async fn commit_with(
        &self,
        board: &BoardId,
        entry: Entry,
        announce: Option<BoardEvent>,
    ) -> Result<BatchOutcome> {
        let entry_id = entry.id;
        let mut batch = WriteBatch::new()
            .put(entry)
            .trim_to_capacity(self.capacity)
            .refresh_ttl(self.ttl);
        if let Some(event) = announce {
            batch = batch.announce(event);
        }

        let outcome = self.store.execute(board, batch).await?;

        self.stats.entries_evicted(outcome.evicted.len());
        self.release_payloads(board, &outcome.evicted);

        if outcome.len > self.capacity {
            tracing::error!(
                board = %board,
                entry_id = %entry_id,
                len = outcome.len,
                capacity = self.capacity,
                "History above capacity after commit"
            );
            return Err(Error::CapacityExceededInternally {
                board: board.clone(),
                len: outcome.len,
                capacity: self.capacity,
            });
        }

        if !outcome.evicted.is_empty() {
            tracing::debug!(
                board = %board,
                entry_id = %entry_id,
                evicted = outcome.evicted.len(),
                "Entries evicted"
            );
        }

        Ok(outcome)
    }

    /// Remove one entry and release its payload
    ///
    /// `Ok(None)` when the entry does not exist, including when it was
    /// already removed.
    pub async fn remove(&self, board: &BoardId, id: EntryId) -> Result<Option<Entry>> {
        Ok(self.remove_with(board, id, None).await?.removed.pop())
    }

    /// [`remove`](Self::remove) with an announcement published by the store
    /// if the entry was there
    pub async fn remove_with(
        &self,
        board: &BoardId,
        id: EntryId,
        announce: Option<BoardEvent>,
    ) -> Result<BatchOutcome> {
        let mut batch = WriteBatch::new().remove(id);
        if let Some(event) = announce {
            batch = batch.announce(event);
        }

        let outcome = self.store.execute(board, batch).await?;
        self.release_payloads(board, &outcome.removed);
        Ok(outcome)
    }

    /// Schedule deletion of the payloads referenced by `entries`
    pub fn release_payloads(&self, board: &BoardId, entries: &[Entry]) {
        let refs: Vec<PayloadRef> = entries.iter().filter_map(|e| e.payload().cloned()).collect();
        if refs.is_empty() {
            return;
        }

        let payloads = Arc::clone(&self.payloads);
        let stats = Arc::clone(&self.stats);
        let board = board.clone();

        self.cleanup.spawn(async move {
            for reference in refs {
                delete_payload(payloads.as_ref(), &stats, Some(&board), &reference).await;
            }
        });
    }

    /// Wait until every scheduled payload cleanup has finished
    pub async fn wait_for_cleanup(&self) {
        self.cleanup.close();
        self.cleanup.wait().await;
        self.cleanup.reopen();
    }
}

/// Delete one payload, counting the outcome
///
/// `board` is the owning board when known; sweeps delete payloads whose
/// board is already gone.
pub(super) async fn delete_payload<P: PayloadStore>(
    payloads: &P,
    stats: &ServiceStats,
    board: Option<&BoardId>,
    reference: &PayloadRef,
) -> bool {
    let board = board.map(BoardId::as_str);
    match payloads.delete(reference).await {
        Ok(true) => {
            stats.payload_deleted();
            tracing::debug!(board = board, payload = %reference, "Payload deleted");
            true
        }
        Ok(false) => {
            tracing::debug!(board = board, payload = %reference, "Payload already gone");
            true
        }
        Err(e) => {
            stats.payload_cleanup_failed();
            tracing::warn!(
                board = board,
                payload = %reference,
                error = %e,
                "Payload cleanup failed"
            );
            false
        }
    }
}
