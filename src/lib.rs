//! Board engine and realtime broadcast layer for an ephemeral shared clipboard
//!
//! Boards are named clipboard namespaces that hold a short, bounded history
//! of text and image entries. Every write refreshes the board's rolling
//! expiry; a board nobody writes to simply disappears. Viewers subscribe to
//! a board and receive each new entry as it is committed, whichever server
//! process handled the write.
//!
//! # Components
//!
//! - [`store`]: shared keyed state (history plus optional access key)
//! - [`history`]: atomic insert/trim/refresh and payload cleanup
//! - [`bus`]: per-board publish/subscribe across processes
//! - [`session`]: one viewer's live subscription
//! - [`service`]: the operations an HTTP layer calls
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use lanclip_rs::{BoardConfig, BoardId, BoardService, FsPayloadStore, LocalBus, MemoryStore, NewEntry};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BoardConfig::from_env()?;
//!     let payloads = FsPayloadStore::new("./data");
//!     payloads.ensure_dir().await?;
//!
//!     let bus = LocalBus::with_capacity(config.bus_capacity);
//!     let service = BoardService::new(config, Arc::new(MemoryStore::new()), Arc::new(payloads), Arc::new(bus));
//!     let _sweeper = service.start().await;
//!
//!     let board = BoardId::new("notes");
//!     service.create_entry(&board, NewEntry::text("hello")).await?;
//!
//!     let (snapshot, mut events, _forwarder) = service.stream(&board).await?;
//!     println!("{} entries so far", snapshot.len());
//!     while let Some(message) = events.recv().await {
//!         print!("{}", message.to_sse());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `redis-backend`: `RedisStore` and `RedisBus` for multi-process
//!   deployments sharing one Redis instance

pub mod bus;
pub mod config;
pub mod error;
pub mod history;
pub mod media;
pub mod payload;
pub mod service;
pub mod session;
pub mod stats;
pub mod store;

pub use bus::{BoardEvent, Bus, BusError, EventKind, LocalBus};
pub use config::{BoardConfig, ConfigError};
pub use error::{Error, Result};
pub use history::{HistoryManager, SweepReport};
pub use media::{MediaType, Preview, PreviewError, Previewer, ThumbnailPreviewer};
pub use payload::{FsPayloadStore, MemoryPayloadStore, PayloadError, PayloadRef, PayloadStore};
pub use service::{BoardService, NewEntry};
pub use session::{CloseReason, PushMessage, SessionPhase, SubscriptionSession};
pub use stats::{ServiceStats, StatsSnapshot};
pub use store::{BoardId, Entry, EntryId, EntryKind, EntryView, MemoryStore, Store, StoreError};

#[cfg(feature = "redis-backend")]
pub use bus::RedisBus;
#[cfg(feature = "redis-backend")]
pub use store::RedisStore;
