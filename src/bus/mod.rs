//! Broadcast bus for board events
//!
//! The bus delivers each published `(board, event)` to every subscription
//! session registered for that board, whichever server process published it
//! and whichever process holds the session.
//!
//! # Architecture
//!
//! ```text
//!   writer (any process)                       every process
//!   ────────────────────                       ─────────────────────────────
//!   BoardService::create_entry                 RedisBus listener task
//!        │                                          │ PSUBSCRIBE board:*:channel
//!        └──► Bus::publish ──► PUBLISH ─────────────┘
//!                                                   ▼
//!                                            LocalBus::deliver
//!                                   ┌───────────────┼────────────────┐
//!                                   ▼               ▼                ▼
//!                             Registration    Registration     Registration
//!                             (session 1)     (session 2)      (session 3)
//! ```
//!
//! When the store can publish (Redis), the writer's event is sent from
//! inside the write itself instead of through [`Bus::publish`], so events of
//! one board go out in commit order even across processes.
//!
//! In a single-process deployment [`LocalBus`] is used directly. The bus
//! carries transient signals only. A late subscriber never sees earlier
//! events; it reads the history snapshot from the store instead.

pub mod local;
#[cfg(feature = "redis-backend")]
pub mod redis;

use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::{BoardId, EntryId, EntryView};

pub use local::{LocalBus, Registration};
#[cfg(feature = "redis-backend")]
pub use self::redis::RedisBus;

/// Default number of events buffered per board channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Error type for bus operations
#[derive(Error, Debug)]
pub enum BusError {
    #[error("bus publish failed: {0}")]
    Publish(String),

    #[error("bus event encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// What happened on a board
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum EventKind {
    /// A new entry was committed. Images carry only their preview.
    #[serde(rename = "new_entry")]
    EntryAdded(EntryView),
    /// An entry was explicitly deleted
    #[serde(rename = "delete_entry")]
    EntryRemoved { id: EntryId },
}

impl EventKind {
    /// Event name as seen by viewers
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::EntryAdded(_) => "new_entry",
            EventKind::EntryRemoved { .. } => "delete_entry",
        }
    }

    /// JSON body as seen by viewers
    pub fn data(&self) -> Result<String, serde_json::Error> {
        match self {
            EventKind::EntryAdded(view) => serde_json::to_string(view),
            EventKind::EntryRemoved { id } => serde_json::to_string(&serde_json::json!({ "id": id })),
        }
    }
}

/// An event addressed to one board
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardEvent {
    pub board: BoardId,
    pub event: EventKind,
}

impl BoardEvent {
    pub fn entry_added(board: BoardId, view: EntryView) -> Self {
        Self {
            board,
            event: EventKind::EntryAdded(view),
        }
    }

    pub fn entry_removed(board: BoardId, id: EntryId) -> Self {
        Self {
            board,
            event: EventKind::EntryRemoved { id },
        }
    }
}

/// Process-wide publish/subscribe indirection per board
pub trait Bus: Send + Sync + 'static {
    /// Publish an event to every subscriber of its board, in every process
    fn publish(&self, event: BoardEvent) -> impl Future<Output = Result<(), BusError>> + Send;

    /// Register interest in a board. Dropping the registration unregisters.
    fn register(&self, board: &BoardId) -> Registration;

    /// Sessions registered for a board in this process
    fn subscriber_count(&self, board: &BoardId) -> usize;

    /// Whether events a store `PUBLISH`es on `board:{slug}:channel` reach
    /// this bus's subscribers
    fn accepts_store_announcements(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Entry;

    #[test]
    fn test_event_wire_shape() {
        let entry = Entry::text("hi");
        let event = BoardEvent::entry_added(BoardId::new("b"), entry.view());
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();

        assert_eq!(json["board"], "b");
        assert_eq!(json["event"]["event"], "new_entry");
        assert_eq!(json["event"]["data"]["content"], "hi");

        let back: BoardEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_removed_event_data() {
        let id = EntryId::new();
        let kind = EventKind::EntryRemoved { id };

        assert_eq!(kind.name(), "delete_entry");
        assert_eq!(kind.data().unwrap(), format!("{{\"id\":\"{}\"}}", id));
    }
}
