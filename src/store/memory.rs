//! In-process store
//!
//! Mirrors the semantics of the shared backing service inside one process:
//! independent expiry per sub-record, insertion-order tie-breaking and
//! atomic batches. A batch runs entirely under one lock with no I/O inside,
//! so no reader can see it half applied.
//!
//! Expired records are dropped lazily on access, the same way the backing
//! service treats an expired key as absent.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use super::{BatchOp, BatchOutcome, BoardId, Entry, Store, StoreError, WriteBatch};
use crate::payload::PayloadRef;

/// `(score, insertion sequence)`: ordering by timestamp, then insertion
type HistoryKey = (i64, u64);

#[derive(Debug, Default)]
struct BoardRecord {
    history: BTreeMap<HistoryKey, Entry>,
    history_expires_at: Option<Instant>,
    next_seq: u64,
    key: Option<(String, Instant)>,
}

impl BoardRecord {
    fn expire(&mut self, now: Instant) {
        if self.history_expires_at.is_some_and(|at| at <= now) {
            self.history.clear();
            self.history_expires_at = None;
            self.next_seq = 0;
        }
        if self.key.as_ref().is_some_and(|(_, at)| *at <= now) {
            self.key = None;
        }
    }

    fn is_empty(&self) -> bool {
        self.history.is_empty() && self.key.is_none()
    }

    fn apply(&mut self, op: BatchOp, now: Instant, outcome: &mut BatchOutcome) {
        match op {
            BatchOp::Put(entry) => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.history.insert((entry.score(), seq), entry);
            }
            BatchOp::TrimToCapacity(capacity) => {
                while self.history.len() > capacity {
                    match self.history.pop_first() {
                        Some((_, entry)) => outcome.evicted.push(entry),
                        None => break,
                    }
                }
            }
            BatchOp::Remove(id) => {
                let key = self
                    .history
                    .iter()
                    .find(|(_, entry)| entry.id == id)
                    .map(|(key, _)| *key);
                if let Some(entry) = key.and_then(|key| self.history.remove(&key)) {
                    outcome.removed.push(entry);
                }
                if self.history.is_empty() {
                    self.history_expires_at = None;
                }
            }
            // Nothing to publish on; the caller announces instead
            BatchOp::Announce(_) => {}
            BatchOp::RefreshTtl(ttl) => {
                let expires_at = now + ttl;
                if !self.history.is_empty() {
                    self.history_expires_at = Some(expires_at);
                }
                if let Some((_, at)) = self.key.as_mut() {
                    *at = expires_at;
                }
            }
        }
    }
}

/// Store held in process memory
#[derive(Debug)]
pub struct MemoryStore {
    boards: Mutex<HashMap<BoardId, BoardRecord>>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            boards: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the backing service going away (or coming back)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".into()))
        }
    }

    /// Run `f` against a board's live record; empty records are discarded
    fn with_record<T>(&self, board: &BoardId, f: impl FnOnce(&mut BoardRecord, Instant) -> T) -> T {
        let now = Instant::now();
        let mut boards = self.boards.lock();
        let record = boards.entry(board.clone()).or_default();
        record.expire(now);
        let result = f(record, now);
        if record.is_empty() {
            boards.remove(board);
        }
        result
    }

    fn live_records<T>(&self, mut f: impl FnMut(&BoardId, &BoardRecord) -> Option<T>) -> Vec<T> {
        let now = Instant::now();
        let mut boards = self.boards.lock();
        boards.retain(|_, record| {
            record.expire(now);
            !record.is_empty()
        });
        boards.iter().filter_map(|(board, record)| f(board, record)).collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    async fn execute(&self, board: &BoardId, batch: WriteBatch) -> Result<BatchOutcome, StoreError> {
        self.check_available()?;

        Ok(self.with_record(board, |record, now| {
            let mut outcome = BatchOutcome::default();
            for op in batch.into_ops() {
                record.apply(op, now, &mut outcome);
            }
            outcome.len = record.history.len();
            outcome
        }))
    }

    async fn list(&self, board: &BoardId) -> Result<Vec<Entry>, StoreError> {
        self.check_available()?;

        Ok(self.with_record(board, |record, _| {
            record.history.values().rev().cloned().collect()
        }))
    }

    async fn get_key(&self, board: &BoardId) -> Result<Option<String>, StoreError> {
        self.check_available()?;

        Ok(self.with_record(board, |record, _| {
            record.key.as_ref().map(|(key, _)| key.clone())
        }))
    }

    async fn replace_key(
        &self,
        board: &BoardId,
        current: Option<&str>,
        new: Option<&str>,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check_available()?;

        Ok(self.with_record(board, |record, now| {
            if record.key.as_ref().map(|(key, _)| key.as_str()) != current {
                return false;
            }
            record.key = new.map(|key| (key.to_string(), now + ttl));
            true
        }))
    }

    async fn referenced_payloads(&self) -> Result<HashSet<PayloadRef>, StoreError> {
        self.check_available()?;

        let refs = self.live_records(|_, record| {
            Some(
                record
                    .history
                    .values()
                    .filter_map(|entry| entry.payload().cloned())
                    .collect::<Vec<_>>(),
            )
        });
        Ok(refs.into_iter().flatten().collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }
}
