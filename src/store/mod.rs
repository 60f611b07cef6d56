//! Keyed board state in a shared backing service
//!
//! The store is the single source of truth. Per board it holds an ordered,
//! capacity-bounded entry history and an optional access key, each with its
//! own expiry. Every server process talks to the same backing service.
//!
//! # Atomic batches
//!
//! Writes to one board are expressed as a [`WriteBatch`] and applied by
//! [`Store::execute`] as a single indivisible unit: readers observe either
//! none or all of the batch. This is what keeps `len <= capacity` true at
//! every observable point without any client-side locking.
//!
//! ```text
//!   WriteBatch::new()
//!       .put(entry)             ──┐
//!       .trim_to_capacity(20)     │  one atomic unit
//!       .refresh_ttl(48h)         │
//!       .announce(event)        ──┘
//!                │
//!                ▼
//!   BatchOutcome { evicted: [oldest..], removed, len, announced }
//! ```
//!
//! An `announce` step publishes its event on the board channel from inside
//! the batch, but only if the batch changed the history. Stores that cannot
//! publish skip it and report `announced: false`; the caller then publishes
//! itself and is responsible for keeping publish order equal to commit
//! order.

pub mod entry;
pub mod error;
pub mod key;
pub mod memory;
#[cfg(feature = "redis-backend")]
pub mod redis;

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use crate::bus::BoardEvent;
use crate::payload::PayloadRef;

pub use entry::{Entry, EntryBody, EntryId, EntryKind, EntryView};
pub use error::StoreError;
pub use key::BoardId;
pub use memory::MemoryStore;
#[cfg(feature = "redis-backend")]
pub use self::redis::RedisStore;

/// One step of an atomic write
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    /// Insert an entry, ordered by its creation timestamp
    Put(Entry),
    /// Evict the oldest entries until at most this many remain
    TrimToCapacity(usize),
    /// Reset the expiry of the board's history and access key
    RefreshTtl(Duration),
    /// Remove one entry by id, if present
    Remove(EntryId),
    /// Publish an event on the board channel if the batch changed the history
    Announce(BoardEvent),
}

/// Ordered list of operations applied atomically to one board
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(mut self, entry: Entry) -> Self {
        self.ops.push(BatchOp::Put(entry));
        self
    }

    pub fn trim_to_capacity(mut self, capacity: usize) -> Self {
        self.ops.push(BatchOp::TrimToCapacity(capacity));
        self
    }

    pub fn refresh_ttl(mut self, ttl: Duration) -> Self {
        self.ops.push(BatchOp::RefreshTtl(ttl));
        self
    }

    pub fn remove(mut self, id: EntryId) -> Self {
        self.ops.push(BatchOp::Remove(id));
        self
    }

    pub fn announce(mut self, event: BoardEvent) -> Self {
        self.ops.push(BatchOp::Announce(event));
        self
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Result of an executed batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    /// Entries removed by trimming, oldest first
    pub evicted: Vec<Entry>,
    /// Entries removed by id
    pub removed: Vec<Entry>,
    /// History length once the batch committed
    pub len: usize,
    /// The store published the batch's announcement itself
    pub announced: bool,
}

/// Shared keyed board state
///
/// Implementations must apply [`Store::execute`] atomically per board and
/// report an unreachable backend as [`StoreError::Unavailable`].
pub trait Store: Send + Sync + 'static {
    /// Apply a batch atomically
    fn execute(
        &self,
        board: &BoardId,
        batch: WriteBatch,
    ) -> impl Future<Output = Result<BatchOutcome, StoreError>> + Send;

    /// Current history, newest first
    fn list(&self, board: &BoardId)
        -> impl Future<Output = Result<Vec<Entry>, StoreError>> + Send;

    fn get_key(
        &self,
        board: &BoardId,
    ) -> impl Future<Output = Result<Option<String>, StoreError>> + Send;

    /// Compare-and-set the access key
    ///
    /// Atomically replaces the key with `new` (removing it when `None`, else
    /// with expiry `ttl`) if the stored key still equals `current`, where
    /// `None` means "no key". Returns `false` and changes nothing otherwise.
    fn replace_key(
        &self,
        board: &BoardId,
        current: Option<&str>,
        new: Option<&str>,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Set the access key unconditionally, with its own expiry
    fn set_key(
        &self,
        board: &BoardId,
        key: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        async move {
            loop {
                let current = self.get_key(board).await?;
                if self.replace_key(board, current.as_deref(), Some(key), ttl).await? {
                    return Ok(());
                }
            }
        }
    }

    /// Remove the access key, whatever its value
    fn clear_key(&self, board: &BoardId) -> impl Future<Output = Result<(), StoreError>> + Send {
        async move {
            while let Some(current) = self.get_key(board).await? {
                if self.replace_key(board, Some(&current), None, Duration::ZERO).await? {
                    break;
                }
            }
            Ok(())
        }
    }

    /// Payload references held by any live history
    fn referenced_payloads(
        &self,
    ) -> impl Future<Output = Result<HashSet<PayloadRef>, StoreError>> + Send;

    /// Check that the backing service is reachable
    fn ping(&self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Whether `announce` steps are published by the store itself
    fn can_announce(&self) -> bool {
        false
    }

    /// Insert a single entry
    ///
    /// The history gets no expiry from this call alone; pair it with
    /// [`Store::refresh_ttl`] or use a batch.
    fn put(
        &self,
        board: &BoardId,
        entry: Entry,
    ) -> impl Future<Output = Result<BatchOutcome, StoreError>> + Send {
        self.execute(board, WriteBatch::new().put(entry))
    }

    /// Trim a history, returning what was evicted
    fn trim_to_capacity(
        &self,
        board: &BoardId,
        capacity: usize,
    ) -> impl Future<Output = Result<Vec<Entry>, StoreError>> + Send {
        let outcome = self.execute(board, WriteBatch::new().trim_to_capacity(capacity));
        async move { outcome.await.map(|o| o.evicted) }
    }

    /// Remove one entry, returning it if it was present
    fn remove(
        &self,
        board: &BoardId,
        id: EntryId,
    ) -> impl Future<Output = Result<Option<Entry>, StoreError>> + Send {
        let outcome = self.execute(board, WriteBatch::new().remove(id));
        async move { outcome.await.map(|mut o| o.removed.pop()) }
    }

    fn refresh_ttl(
        &self,
        board: &BoardId,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        let outcome = self.execute(board, WriteBatch::new().refresh_ttl(ttl));
        async move { outcome.await.map(|_| ()) }
    }

    /// Look up a single entry
    fn get_entry(
        &self,
        board: &BoardId,
        id: EntryId,
    ) -> impl Future<Output = Result<Option<Entry>, StoreError>> + Send {
        let entries = self.list(board);
        async move { Ok(entries.await?.into_iter().find(|e| e.id == id)) }
    }

    /// A board exists while any of its sub-records is unexpired
    fn board_exists(
        &self,
        board: &BoardId,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send {
        let entries = self.list(board);
        let key = self.get_key(board);
        async move { Ok(!entries.await?.is_empty() || key.await?.is_some()) }
    }
}
