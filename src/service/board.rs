//! Board service implementation
//!
//! Events of one board reach viewers in commit order. A store that
//! publishes from inside the write orders them itself. With any other store
//! (process-local) the commit and the publish run under a per-board lock.

use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::access;
use crate::bus::{BoardEvent, Bus};
use crate::config::BoardConfig;
use crate::error::{Error, Result};
use crate::history::HistoryManager;
use crate::media::{MediaType, PreviewError, Previewer, ThumbnailPreviewer};
use crate::payload::{PayloadRef, PayloadStore};
use crate::session::{CloseReason, PushMessage, SubscriptionSession};
use crate::stats::{ServiceStats, StatsSnapshot};
use crate::store::{BoardId, Entry, EntryId, EntryKind, Store};

/// Content submitted for a new entry
#[derive(Debug, Clone)]
pub enum NewEntry {
    Text(String),
    Image { media_type: MediaType, data: Bytes },
}

impl NewEntry {
    pub fn text(content: impl Into<String>) -> Self {
        NewEntry::Text(content.into())
    }

    pub fn image(media_type: MediaType, data: impl Into<Bytes>) -> Self {
        NewEntry::Image {
            media_type,
            data: data.into(),
        }
    }

    pub fn kind(&self) -> EntryKind {
        match self {
            NewEntry::Text(_) => EntryKind::Text,
            NewEntry::Image { .. } => EntryKind::Image,
        }
    }

    /// Size counted against the upload limit
    pub fn byte_size(&self) -> usize {
        match self {
            NewEntry::Text(content) => content.len(),
            NewEntry::Image { data, .. } => data.len(),
        }
    }
}

/// Number of per-board ordering locks
const ORDER_SLOTS: usize = 64;

/// Board engine: history, payloads, bus and sessions behind one handle
pub struct BoardService<S, P, B> {
    config: BoardConfig,
    store: Arc<S>,
    payloads: Arc<P>,
    bus: Arc<B>,
    history: Arc<HistoryManager<S, P>>,
    previewer: Arc<dyn Previewer>,
    stats: Arc<ServiceStats>,
    next_session_id: AtomicU64,
    order_slots: Box<[Mutex<()>]>,
    order_hasher: RandomState,
    shutdown: CancellationToken,
}

impl<S: Store, P: PayloadStore, B: Bus> BoardService<S, P, B> {
    pub fn new(config: BoardConfig, store: Arc<S>, payloads: Arc<P>, bus: Arc<B>) -> Self {
        let stats = Arc::new(ServiceStats::new());
        let history = Arc::new(HistoryManager::new(
            Arc::clone(&store),
            Arc::clone(&payloads),
            &config,
            Arc::clone(&stats),
        ));
        let previewer = Arc::new(ThumbnailPreviewer::new(
            config.preview_width,
            config.preview_quality,
        ));

        Self {
            config,
            store,
            payloads,
            bus,
            history,
            previewer,
            stats,
            next_session_id: AtomicU64::new(1),
            order_slots: (0..ORDER_SLOTS).map(|_| Mutex::new(())).collect(),
            order_hasher: RandomState::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Replace the preview generator
    pub fn with_previewer(mut self, previewer: impl Previewer) -> Self {
        self.previewer = Arc::new(previewer);
        self
    }

    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn history(&self) -> &Arc<HistoryManager<S, P>> {
        &self.history
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Run the start-up orphan sweep and spawn the periodic one if configured
    pub async fn start(&self) -> Option<JoinHandle<()>> {
        if let Err(e) = self.history.sweep_orphans().await {
            tracing::warn!(error = %e, "Start-up orphan sweep failed");
        }

        let interval = self.config.sweep_interval?;
        tracing::info!(interval_secs = interval.as_secs(), "Periodic orphan sweep enabled");
        Some(self.history.spawn_sweep_task(interval, self.shutdown.child_token()))
    }

    /// Close every session and background task, then wait for pending cleanups
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.history.wait_for_cleanup().await;
        tracing::info!("Board service stopped");
    }

    /// Validate, store and announce a new entry
    pub async fn create_entry(&self, board: &BoardId, new: NewEntry) -> Result<Entry> {
        let size = new.byte_size();
        if size > self.config.max_payload_bytes {
            return Err(Error::PayloadTooLarge {
                size,
                max: self.config.max_payload_bytes,
            });
        }

        let entry = match new {
            NewEntry::Text(content) => {
                if content.is_empty() {
                    return Err(Error::InvalidContent("text entry has no content"));
                }
                let entry = Entry::text(content);
                self.commit_entry(board, &entry).await?;
                entry
            }
            NewEntry::Image { media_type, data } => {
                if data.is_empty() {
                    return Err(Error::InvalidContent("image entry has no data"));
                }
                self.create_image(board, media_type, data).await?
            }
        };

        self.stats.entry_added();
        tracing::info!(
            board = %board,
            entry_id = %entry.id,
            kind = ?entry.kind(),
            byte_size = entry.byte_size,
            "Entry created"
        );

        Ok(entry)
    }

    /// Commit an entry and announce it in commit order
    async fn commit_entry(&self, board: &BoardId, entry: &Entry) -> Result<()> {
        let event = BoardEvent::entry_added(board.clone(), entry.view());

        if self.store_announces() {
            self.history.commit_with(board, entry.clone(), Some(event)).await?;
            return Ok(());
        }

        let _order = self.order_slot(board).lock().await;
        self.history.commit(board, entry.clone()).await?;
        self.publish(event).await;
        Ok(())
    }

    async fn create_image(&self, board: &BoardId, media_type: MediaType, data: Bytes) -> Result<Entry> {
        let previewer = Arc::clone(&self.previewer);
        let source = data.clone();
        let preview = tokio::task::spawn_blocking(move || previewer.make_preview(&source, media_type))
            .await
            .map_err(|e| PreviewError::Task(e.to_string()))??;

        let id = EntryId::new();
        let entry = Entry::image(id, media_type, preview, data.len() as u64);
        let reference = PayloadRef::for_entry(id, media_type);

        self.payloads.put(&reference, data).await?;

        if let Err(e) = self.commit_entry(board, &entry).await {
            if e.is_unavailable() {
                self.rollback_payload(board, &reference).await;
            }
            return Err(e);
        }

        Ok(entry)
    }

    async fn rollback_payload(&self, board: &BoardId, reference: &PayloadRef) {
        match self.payloads.delete(reference).await {
            Ok(_) => tracing::debug!(board = %board, payload = %reference, "Payload rolled back"),
            Err(e) => {
                self.stats.payload_cleanup_failed();
                tracing::warn!(
                    board = %board,
                    payload = %reference,
                    error = %e,
                    "Payload rollback failed"
                );
            }
        }
    }

    /// Delete an entry; `Ok(false)` if it did not exist
    pub async fn delete_entry(&self, board: &BoardId, id: EntryId) -> Result<bool> {
        let event = BoardEvent::entry_removed(board.clone(), id);

        let removed = if self.store_announces() {
            self.history.remove_with(board, id, Some(event)).await?.removed.pop()
        } else {
            let _order = self.order_slot(board).lock().await;
            let removed = self.history.remove(board, id).await?;
            if removed.is_some() {
                self.publish(event).await;
            }
            removed
        };

        let Some(entry) = removed else {
            tracing::debug!(board = %board, entry_id = %id, "Delete of missing entry");
            return Ok(false);
        };

        self.stats.entry_removed();
        tracing::info!(board = %board, entry_id = %id, kind = ?entry.kind(), "Entry deleted");
        Ok(true)
    }

    /// Current history, newest first
    pub async fn list_entries(&self, board: &BoardId) -> Result<Vec<Entry>> {
        Ok(self.store.list(board).await?)
    }

    pub async fn get_entry(&self, board: &BoardId, id: EntryId) -> Result<Entry> {
        self.store
            .get_entry(board, id)
            .await?
            .ok_or_else(|| Error::entry_not_found(board, id))
    }

    /// Full-size content of an image entry
    pub async fn get_payload(&self, board: &BoardId, id: EntryId) -> Result<(MediaType, Bytes)> {
        let entry = self.get_entry(board, id).await?;
        let reference = entry
            .payload()
            .ok_or_else(|| Error::NotFound(format!("entry {id} has no payload")))?;

        let data = self
            .payloads
            .get(reference)
            .await?
            .ok_or_else(|| Error::NotFound(format!("payload {reference}")))?;

        Ok((reference.media_type(), data))
    }

    /// Register a session and read the history snapshot
    ///
    /// Registration happens first, so every write that commits after the
    /// snapshot reaches the session. A write racing the snapshot may show
    /// up in both.
    pub async fn subscribe(&self, board: &BoardId) -> Result<(Vec<Entry>, SubscriptionSession)> {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let mut session = SubscriptionSession::new(id, board.clone(), Arc::clone(&self.stats));
        session.activate(self.bus.as_ref());

        let snapshot = self.store.list(board).await?;
        Ok((snapshot, session))
    }

    /// Subscribe and forward into a bounded channel until the viewer leaves
    ///
    /// The forwarder stops on service shutdown.
    pub async fn stream(
        &self,
        board: &BoardId,
    ) -> Result<(Vec<Entry>, mpsc::Receiver<PushMessage>, JoinHandle<CloseReason>)> {
        let (snapshot, session) = self.subscribe(board).await?;
        let (tx, rx) = mpsc::channel(self.config.outbound_buffer.max(1));
        let forwarder = session.forward(tx, self.shutdown.child_token());
        Ok((snapshot, rx, forwarder))
    }

    /// Check a provided key against the board's key
    pub async fn authorize(&self, board: &BoardId, provided: Option<&str>) -> Result<()> {
        let current = self.store.get_key(board).await?;
        access::check(current.as_deref(), provided)
    }

    /// Set a fresh access key and return it
    ///
    /// A keyed board requires its current key. If the key changes between
    /// the check and the update, the caller's key is stale and the update
    /// is refused.
    pub async fn set_access_key(&self, board: &BoardId, provided: Option<&str>) -> Result<String> {
        let current = self.store.get_key(board).await?;
        access::check(current.as_deref(), provided)?;

        let key = access::generate_key();
        if !self
            .store
            .replace_key(board, current.as_deref(), Some(&key), self.config.ttl)
            .await?
        {
            tracing::warn!(board = %board, "Access key changed during update");
            return Err(Error::Unauthorized);
        }

        tracing::info!(board = %board, "Access key set");
        Ok(key)
    }

    /// Remove the access key using the current key
    pub async fn clear_access_key(&self, board: &BoardId, provided: &str) -> Result<()> {
        let Some(current) = self.store.get_key(board).await? else {
            return Err(Error::NotFound(format!("access key for board {board}")));
        };
        access::check(Some(current.as_str()), Some(provided))?;

        if !self
            .store
            .replace_key(board, Some(&current), None, self.config.ttl)
            .await?
        {
            tracing::warn!(board = %board, "Access key changed during clear");
            return Err(Error::Unauthorized);
        }

        tracing::info!(board = %board, "Access key cleared");
        Ok(())
    }

    pub async fn board_exists(&self, board: &BoardId) -> Result<bool> {
        Ok(self.store.board_exists(board).await?)
    }

    pub async fn ping(&self) -> Result<()> {
        Ok(self.store.ping().await?)
    }

    /// The store publishes events inside the write and this bus hears them
    fn store_announces(&self) -> bool {
        self.store.can_announce() && self.bus.accepts_store_announcements()
    }

    fn order_slot(&self, board: &BoardId) -> &Mutex<()> {
        let slot = self.order_hasher.hash_one(board) as usize % self.order_slots.len();
        &self.order_slots[slot]
    }

    async fn publish(&self, event: BoardEvent) {
        let board = event.board.clone();
        let name = event.event.name();

        if let Err(e) = self.bus.publish(event).await {
            self.stats.bus_publish_failed();
            tracing::warn!(board = %board, event = name, error = %e, "Bus publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::bus::{BusError, EventKind, LocalBus, Registration};
    use crate::store::{BatchOp, BatchOutcome, StoreError, WriteBatch};
    use crate::media::preview::tests::sample_image;
    use crate::payload::MemoryPayloadStore;
    use crate::store::MemoryStore;

    type TestService = BoardService<MemoryStore, MemoryPayloadStore, LocalBus>;

    struct Fixture {
        service: TestService,
        store: Arc<MemoryStore>,
        payloads: Arc<MemoryPayloadStore>,
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn fixture(config: BoardConfig) -> Fixture {
        init_tracing();
        let store = Arc::new(MemoryStore::new());
        let payloads = Arc::new(MemoryPayloadStore::new());
        let service = BoardService::new(
            config,
            Arc::clone(&store),
            Arc::clone(&payloads),
            Arc::new(LocalBus::new()),
        );
        Fixture {
            service,
            store,
            payloads,
        }
    }

    fn png(width: u32, height: u32) -> NewEntry {
        NewEntry::image(MediaType::Png, sample_image(width, height, MediaType::Png))
    }

    #[tokio::test]
    async fn test_text_round_trip() {
        let f = fixture(BoardConfig::default());
        let board = BoardId::new("notes");

        let entry = f.service.create_entry(&board, NewEntry::text("X")).await.unwrap();
        let listed = f.service.list_entries(&board).await.unwrap();

        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, entry.id);
        assert_eq!(listed[0].kind(), EntryKind::Text);
        assert_eq!(listed[0].content(), Some("X"));
        assert_eq!(f.service.get_entry(&board, entry.id).await.unwrap(), entry);

        assert!(f.service.delete_entry(&board, entry.id).await.unwrap());
        assert!(f.service.list_entries(&board).await.unwrap().is_empty());
        assert!(matches!(
            f.service.get_entry(&board, entry.id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_capacity_scenario() {
        let f = fixture(BoardConfig::default().capacity(3));
        let board = BoardId::new("b");

        let a = f.service.create_entry(&board, png(40, 20)).await.unwrap();
        let b = f.service.create_entry(&board, NewEntry::text("B")).await.unwrap();
        let c = f.service.create_entry(&board, NewEntry::text("C")).await.unwrap();
        let d = f.service.create_entry(&board, NewEntry::text("D")).await.unwrap();
        f.service.history().wait_for_cleanup().await;

        let ids: Vec<EntryId> = f.service.list_entries(&board).await.unwrap().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![d.id, c.id, b.id]);
        assert!(!f.payloads.contains(a.payload().unwrap()));
        assert!(f.payloads.is_empty());
        assert_eq!(f.service.stats().entries_evicted, 1);
    }

    #[tokio::test]
    async fn test_image_entry_and_payload() {
        let f = fixture(BoardConfig::default());
        let board = BoardId::new("pics");
        let bytes = sample_image(400, 100, MediaType::Png);

        let entry = f
            .service
            .create_entry(&board, NewEntry::image(MediaType::Png, bytes.clone()))
            .await
            .unwrap();

        assert_eq!(entry.kind(), EntryKind::Image);
        assert_eq!(entry.byte_size, bytes.len() as u64);
        assert_eq!(entry.media_type(), Some(MediaType::Png));

        let (media, data) = f.service.get_payload(&board, entry.id).await.unwrap();
        assert_eq!(media, MediaType::Png);
        assert_eq!(data.as_ref(), bytes.as_slice());
    }

    #[tokio::test]
    async fn test_payload_too_large_leaves_no_trace() {
        let f = fixture(BoardConfig::default().max_payload_bytes(10));
        let board = BoardId::new("b");

        let err = f
            .service
            .create_entry(&board, NewEntry::text("eleven char"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { size: 11, max: 10 }));

        let err = f.service.create_entry(&board, png(20, 20)).await.unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { .. }));

        assert!(!f.service.board_exists(&board).await.unwrap());
        assert!(f.payloads.is_empty());
    }

    #[tokio::test]
    async fn test_empty_content_rejected() {
        let f = fixture(BoardConfig::default());
        let board = BoardId::new("b");

        assert!(matches!(
            f.service.create_entry(&board, NewEntry::text("")).await,
            Err(Error::InvalidContent(_))
        ));
        assert!(matches!(
            f.service.create_entry(&board, NewEntry::image(MediaType::Png, Bytes::new())).await,
            Err(Error::InvalidContent(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_media_fails_whole_entry() {
        let f = fixture(BoardConfig::default());
        let board = BoardId::new("b");

        let garbage = NewEntry::image(MediaType::Png, Bytes::from_static(b"not an image at all"));
        assert!(matches!(
            f.service.create_entry(&board, garbage).await,
            Err(Error::InvalidMedia(_))
        ));

        let mislabeled = NewEntry::image(MediaType::Png, sample_image(20, 20, MediaType::Jpeg));
        assert!(matches!(
            f.service.create_entry(&board, mislabeled).await,
            Err(Error::InvalidMedia(PreviewError::Mismatch { .. }))
        ));

        assert!(f.service.list_entries(&board).await.unwrap().is_empty());
        assert!(f.payloads.is_empty());
    }

    #[tokio::test]
    async fn test_delete_twice_and_payload_unreachable() {
        let f = fixture(BoardConfig::default());
        let board = BoardId::new("b");
        let entry = f.service.create_entry(&board, png(30, 30)).await.unwrap();

        assert!(f.service.delete_entry(&board, entry.id).await.unwrap());
        assert!(!f.service.delete_entry(&board, entry.id).await.unwrap());
        assert!(matches!(
            f.service.get_payload(&board, entry.id).await,
            Err(Error::NotFound(_))
        ));

        f.service.history().wait_for_cleanup().await;
        assert!(f.payloads.is_empty());
        assert_eq!(f.service.stats().entries_removed, 1);
    }

    #[tokio::test]
    async fn test_text_entry_has_no_payload() {
        let f = fixture(BoardConfig::default());
        let board = BoardId::new("b");
        let entry = f.service.create_entry(&board, NewEntry::text("t")).await.unwrap();

        assert!(matches!(
            f.service.get_payload(&board, entry.id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_subscriber_before_writes_sees_each_in_order() {
        let f = fixture(BoardConfig::default());
        let board = BoardId::new("live");
        let cancel = CancellationToken::new();

        let (snapshot, mut session) = f.service.subscribe(&board).await.unwrap();
        assert!(snapshot.is_empty());

        let mut written = Vec::new();
        for text in ["one", "two", "three"] {
            written.push(f.service.create_entry(&board, NewEntry::text(text)).await.unwrap());
        }
        f.service.delete_entry(&board, written[0].id).await.unwrap();

        for entry in &written {
            let event = session.next_event(&cancel).await.unwrap();
            assert_eq!(event, BoardEvent::entry_added(board.clone(), entry.view()));
        }
        let event = session.next_event(&cancel).await.unwrap();
        assert_eq!(event, BoardEvent::entry_removed(board.clone(), written[0].id));
    }

    #[tokio::test]
    async fn test_subscriber_after_write_gets_snapshot_only() {
        let f = fixture(BoardConfig::default());
        let board = BoardId::new("live");
        let entry = f.service.create_entry(&board, NewEntry::text("early")).await.unwrap();

        let (snapshot, session) = f.service.subscribe(&board).await.unwrap();
        assert_eq!(snapshot, vec![entry]);

        let mut stream = Box::pin(session.into_stream(CancellationToken::new()));
        let late = f.service.create_entry(&board, NewEntry::text("late")).await.unwrap();

        let message = futures::StreamExt::next(&mut stream).await.unwrap();
        let data: serde_json::Value = serde_json::from_str(&message.data).unwrap();
        assert_eq!(data["id"], late.id.to_string());
    }

    #[tokio::test]
    async fn test_other_boards_are_isolated() {
        let f = fixture(BoardConfig::default());
        let (_, mut session) = f.service.subscribe(&BoardId::new("a")).await.unwrap();

        f.service.create_entry(&BoardId::new("b"), NewEntry::text("x")).await.unwrap();
        let mine = f.service.create_entry(&BoardId::new("a"), NewEntry::text("y")).await.unwrap();

        let event = session.next_event(&CancellationToken::new()).await.unwrap();
        assert_eq!(event, BoardEvent::entry_added(BoardId::new("a"), mine.view()));
    }

    #[tokio::test]
    async fn test_stream_ends_on_shutdown() {
        let f = fixture(BoardConfig::default());
        let board = BoardId::new("b");

        let (_, mut rx, forwarder) = f.service.stream(&board).await.unwrap();
        f.service.create_entry(&board, NewEntry::text("hi")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().event, "new_entry");

        f.service.shutdown().await;
        assert_eq!(forwarder.await.unwrap(), CloseReason::Cancelled);
        assert_eq!(f.service.bus().subscriber_count(&board), 0);
        assert_eq!(f.service.stats().active_sessions, 0);
    }

    #[tokio::test]
    async fn test_access_key_flows() {
        let f = fixture(BoardConfig::default());
        let board = BoardId::new("secret");

        f.service.authorize(&board, None).await.unwrap();
        let key = f.service.set_access_key(&board, None).await.unwrap();
        assert_eq!(key.len(), 16);

        assert!(matches!(f.service.authorize(&board, None).await, Err(Error::Unauthorized)));
        assert!(matches!(
            f.service.authorize(&board, Some("wrong")).await,
            Err(Error::Unauthorized)
        ));
        f.service.authorize(&board, Some(&key)).await.unwrap();

        assert!(matches!(
            f.service.set_access_key(&board, Some("wrong")).await,
            Err(Error::Unauthorized)
        ));
        let rotated = f.service.set_access_key(&board, Some(&key)).await.unwrap();
        assert_ne!(rotated, key);

        assert!(matches!(
            f.service.clear_access_key(&board, &key).await,
            Err(Error::Unauthorized)
        ));
        f.service.clear_access_key(&board, &rotated).await.unwrap();
        f.service.authorize(&board, None).await.unwrap();
        assert!(matches!(
            f.service.clear_access_key(&board, &rotated).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_key_alone_keeps_board_alive() {
        let f = fixture(BoardConfig::default());
        let board = BoardId::new("locked");

        assert!(!f.service.board_exists(&board).await.unwrap());
        f.service.set_access_key(&board, None).await.unwrap();
        assert!(f.service.board_exists(&board).await.unwrap());
    }

    #[tokio::test]
    async fn test_store_outage_rolls_back_payload() {
        let f = fixture(BoardConfig::default());
        let board = BoardId::new("b");
        f.store.set_available(false);

        let err = f.service.create_entry(&board, png(20, 20)).await.unwrap_err();
        assert!(err.is_unavailable());
        assert!(f.payloads.is_empty());

        assert!(f.service.list_entries(&board).await.unwrap_err().is_unavailable());
        assert!(f.service.ping().await.unwrap_err().is_unavailable());

        f.store.set_available(true);
        assert!(f.service.list_entries(&board).await.unwrap().is_empty());
        f.service.ping().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_board_expires_after_idle_ttl() {
        let f = fixture(BoardConfig::default().ttl(Duration::from_secs(48 * 3600)));
        let board = BoardId::new("idle");

        f.service.create_entry(&board, NewEntry::text("x")).await.unwrap();
        tokio::time::advance(Duration::from_secs(48 * 3600 - 1)).await;
        f.service.create_entry(&board, NewEntry::text("y")).await.unwrap();

        tokio::time::advance(Duration::from_secs(48 * 3600 - 1)).await;
        assert_eq!(f.service.list_entries(&board).await.unwrap().len(), 2);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(f.service.list_entries(&board).await.unwrap().is_empty());
        assert!(!f.service.board_exists(&board).await.unwrap());
    }

    #[tokio::test]
    async fn test_start_sweeps_orphans() {
        let f = fixture(
            BoardConfig::default()
                .sweep_grace(Duration::ZERO)
                .without_periodic_sweep(),
        );
        let orphan = PayloadRef::for_entry(EntryId::new(), MediaType::Png);
        f.payloads.put(&orphan, Bytes::from_static(b"x")).await.unwrap();

        assert!(f.service.start().await.is_none());
        assert!(!f.payloads.contains(&orphan));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_board_payload_swept_by_default() {
        let config = BoardConfig::default().sweep_grace(Duration::ZERO);
        let (ttl, interval) = (config.ttl, config.sweep_interval.unwrap());
        let f = fixture(config);
        let board = BoardId::new("forgotten");

        let sweeper = f.service.start().await.unwrap();
        let entry = f.service.create_entry(&board, png(20, 20)).await.unwrap();
        let reference = entry.payload().cloned().unwrap();

        tokio::time::advance(ttl + Duration::from_secs(1)).await;
        assert!(!f.service.board_exists(&board).await.unwrap());

        tokio::time::advance(interval).await;
        for _ in 0..10 {
            if !f.payloads.contains(&reference) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!f.payloads.contains(&reference));

        f.service.shutdown().await;
        sweeper.await.unwrap();
    }

    /// Memory store whose write replies can be held back and whose key can
    /// be changed behind the caller's back
    #[derive(Default)]
    struct ScriptedStore {
        inner: MemoryStore,
        ack_delays: parking_lot::Mutex<std::collections::VecDeque<Duration>>,
        committed: parking_lot::Mutex<Vec<EntryId>>,
        rotate_before_replace: parking_lot::Mutex<Option<String>>,
    }

    impl Store for ScriptedStore {
        async fn execute(
            &self,
            board: &BoardId,
            batch: WriteBatch,
        ) -> std::result::Result<BatchOutcome, StoreError> {
            let added: Vec<EntryId> = batch
                .ops()
                .iter()
                .filter_map(|op| match op {
                    BatchOp::Put(entry) => Some(entry.id),
                    _ => None,
                })
                .collect();

            let outcome = self.inner.execute(board, batch).await?;
            self.committed.lock().extend(added);

            let delay = self.ack_delays.lock().pop_front().unwrap_or_default();
            tokio::time::sleep(delay).await;
            Ok(outcome)
        }

        async fn list(&self, board: &BoardId) -> std::result::Result<Vec<Entry>, StoreError> {
            self.inner.list(board).await
        }

        async fn get_key(&self, board: &BoardId) -> std::result::Result<Option<String>, StoreError> {
            self.inner.get_key(board).await
        }

        async fn replace_key(
            &self,
            board: &BoardId,
            current: Option<&str>,
            new: Option<&str>,
            ttl: Duration,
        ) -> std::result::Result<bool, StoreError> {
            let rotated = self.rotate_before_replace.lock().take();
            if let Some(rotated) = rotated {
                let stored = self.inner.get_key(board).await?;
                self.inner
                    .replace_key(board, stored.as_deref(), Some(&rotated), ttl)
                    .await?;
            }
            self.inner.replace_key(board, current, new, ttl).await
        }

        async fn referenced_payloads(
            &self,
        ) -> std::result::Result<std::collections::HashSet<PayloadRef>, StoreError> {
            self.inner.referenced_payloads().await
        }

        async fn ping(&self) -> std::result::Result<(), StoreError> {
            self.inner.ping().await
        }
    }

    fn scripted_service(store: &Arc<ScriptedStore>) -> BoardService<ScriptedStore, MemoryPayloadStore, LocalBus> {
        init_tracing();
        BoardService::new(
            BoardConfig::default(),
            Arc::clone(store),
            Arc::new(MemoryPayloadStore::new()),
            Arc::new(LocalBus::new()),
        )
    }

    fn added_ids(events: &[BoardEvent]) -> Vec<EntryId> {
        events
            .iter()
            .filter_map(|e| match &e.event {
                EventKind::EntryAdded(view) => Some(view.id),
                EventKind::EntryRemoved { .. } => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_writers_delivered_in_commit_order() {
        let store = Arc::new(ScriptedStore::default());
        // The first write to commit is acknowledged last
        store
            .ack_delays
            .lock()
            .extend([Duration::from_millis(50), Duration::from_millis(1)]);
        let service = scripted_service(&store);
        let board = BoardId::new("race");
        let cancel = CancellationToken::new();

        let (_, mut session) = service.subscribe(&board).await.unwrap();
        let (a, b) = tokio::join!(
            service.create_entry(&board, NewEntry::text("A")),
            service.create_entry(&board, NewEntry::text("B")),
        );
        a.unwrap();
        b.unwrap();

        let mut delivered = Vec::new();
        for _ in 0..2 {
            delivered.push(session.next_event(&cancel).await.unwrap());
        }

        let committed = store.committed.lock().clone();
        assert_eq!(committed.len(), 2);
        assert_eq!(added_ids(&delivered), committed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_write_and_delete_keep_order() {
        let store = Arc::new(ScriptedStore::default());
        let service = scripted_service(&store);
        let board = BoardId::new("race");
        let first = service.create_entry(&board, NewEntry::text("first")).await.unwrap();
        let cancel = CancellationToken::new();

        let (_, mut session) = service.subscribe(&board).await.unwrap();
        store.ack_delays.lock().push_back(Duration::from_millis(50));
        let (second, deleted) = tokio::join!(
            service.create_entry(&board, NewEntry::text("second")),
            service.delete_entry(&board, first.id),
        );
        let second = second.unwrap();
        assert!(deleted.unwrap());

        assert_eq!(
            session.next_event(&cancel).await.unwrap(),
            BoardEvent::entry_added(board.clone(), second.view())
        );
        assert_eq!(
            session.next_event(&cancel).await.unwrap(),
            BoardEvent::entry_removed(board.clone(), first.id)
        );
    }

    #[tokio::test]
    async fn test_stale_key_cannot_rotate_after_concurrent_change() {
        let store = Arc::new(ScriptedStore::default());
        let service = scripted_service(&store);
        let board = BoardId::new("locked");

        let key = service.set_access_key(&board, None).await.unwrap();
        *store.rotate_before_replace.lock() = Some("rotated-elsewhere".into());

        assert!(matches!(
            service.set_access_key(&board, Some(&key)).await,
            Err(Error::Unauthorized)
        ));
        assert_eq!(service.store.get_key(&board).await.unwrap().as_deref(), Some("rotated-elsewhere"));

        *store.rotate_before_replace.lock() = Some("rotated-again".into());
        assert!(matches!(
            service.clear_access_key(&board, "rotated-elsewhere").await,
            Err(Error::Unauthorized)
        ));
        assert_eq!(service.store.get_key(&board).await.unwrap().as_deref(), Some("rotated-again"));
    }

    /// Memory store that publishes announcements to a bus itself, the way a
    /// shared store with pub/sub does
    struct AnnouncingStore {
        inner: MemoryStore,
        bus: LocalBus,
    }

    impl Store for AnnouncingStore {
        async fn execute(
            &self,
            board: &BoardId,
            batch: WriteBatch,
        ) -> std::result::Result<BatchOutcome, StoreError> {
            let puts = batch.ops().iter().any(|op| matches!(op, BatchOp::Put(_)));
            let events: Vec<BoardEvent> = batch
                .ops()
                .iter()
                .filter_map(|op| match op {
                    BatchOp::Announce(event) => Some(event.clone()),
                    _ => None,
                })
                .collect();

            let mut outcome = self.inner.execute(board, batch).await?;
            if puts || !outcome.removed.is_empty() {
                for event in events {
                    self.bus.deliver(event);
                    outcome.announced = true;
                }
            }
            Ok(outcome)
        }

        async fn list(&self, board: &BoardId) -> std::result::Result<Vec<Entry>, StoreError> {
            self.inner.list(board).await
        }

        async fn get_key(&self, board: &BoardId) -> std::result::Result<Option<String>, StoreError> {
            self.inner.get_key(board).await
        }

        async fn replace_key(
            &self,
            board: &BoardId,
            current: Option<&str>,
            new: Option<&str>,
            ttl: Duration,
        ) -> std::result::Result<bool, StoreError> {
            self.inner.replace_key(board, current, new, ttl).await
        }

        async fn referenced_payloads(
            &self,
        ) -> std::result::Result<std::collections::HashSet<PayloadRef>, StoreError> {
            self.inner.referenced_payloads().await
        }

        async fn ping(&self) -> std::result::Result<(), StoreError> {
            self.inner.ping().await
        }

        fn can_announce(&self) -> bool {
            true
        }
    }

    /// Local bus that also hears the store's announcements
    struct SharedChannelBus(LocalBus);

    impl Bus for SharedChannelBus {
        async fn publish(&self, event: BoardEvent) -> std::result::Result<(), BusError> {
            self.0.publish(event).await
        }

        fn register(&self, board: &BoardId) -> Registration {
            self.0.register(board)
        }

        fn subscriber_count(&self, board: &BoardId) -> usize {
            self.0.subscriber_count(board)
        }

        fn accepts_store_announcements(&self) -> bool {
            true
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_announcements_are_not_republished() {
        let local = LocalBus::new();
        let store = Arc::new(AnnouncingStore {
            inner: MemoryStore::new(),
            bus: local.clone(),
        });
        let service = BoardService::new(
            BoardConfig::default(),
            store,
            Arc::new(MemoryPayloadStore::new()),
            Arc::new(SharedChannelBus(local)),
        );
        let board = BoardId::new("shared");
        let cancel = CancellationToken::new();

        let (_, mut session) = service.subscribe(&board).await.unwrap();
        let entry = service.create_entry(&board, NewEntry::text("once")).await.unwrap();
        assert!(service.delete_entry(&board, entry.id).await.unwrap());
        assert!(!service.delete_entry(&board, entry.id).await.unwrap());

        assert_eq!(
            session.next_event(&cancel).await.unwrap(),
            BoardEvent::entry_added(board.clone(), entry.view())
        );
        assert_eq!(
            session.next_event(&cancel).await.unwrap(),
            BoardEvent::entry_removed(board.clone(), entry.id)
        );
        let extra = tokio::time::timeout(Duration::from_millis(100), session.next_event(&cancel)).await;
        assert!(extra.is_err());
    }

    struct OfflineBus(LocalBus);

    impl Bus for OfflineBus {
        async fn publish(&self, _event: BoardEvent) -> std::result::Result<(), BusError> {
            Err(BusError::Publish("connection refused".into()))
        }

        fn register(&self, board: &BoardId) -> Registration {
            self.0.register(board)
        }

        fn subscriber_count(&self, board: &BoardId) -> usize {
            self.0.subscriber_count(board)
        }
    }

    #[tokio::test]
    async fn test_bus_outage_does_not_fail_writes() {
        let store = Arc::new(MemoryStore::new());
        let service = BoardService::new(
            BoardConfig::default(),
            Arc::clone(&store),
            Arc::new(MemoryPayloadStore::new()),
            Arc::new(OfflineBus(LocalBus::new())),
        );
        let board = BoardId::new("b");

        let entry = service.create_entry(&board, NewEntry::text("kept")).await.unwrap();
        assert_eq!(service.list_entries(&board).await.unwrap(), vec![entry]);
        assert_eq!(service.stats().bus_publish_failures, 1);
    }
}
