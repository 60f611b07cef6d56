//! In-process bus
//!
//! Owns the mapping from board to its live channel. Each channel is a
//! `tokio::sync::broadcast` sender plus the number of registrations holding
//! a receiver. The map is touched only for register, unregister and
//! deliver; no lock is held across an await.
//!
//! A receiver that falls more than the channel capacity behind observes
//! `RecvError::Lagged`. Senders never wait for slow receivers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{BoardEvent, Bus, BusError, DEFAULT_CHANNEL_CAPACITY};
use crate::store::BoardId;

struct Channel {
    tx: broadcast::Sender<BoardEvent>,
    subscribers: usize,
}

struct Channels {
    map: Mutex<HashMap<BoardId, Channel>>,
    capacity: usize,
}

impl Channels {
    fn unregister(&self, board: &BoardId) {
        let mut map = self.map.lock();
        let Some(channel) = map.get_mut(board) else {
            return;
        };

        channel.subscribers = channel.subscribers.saturating_sub(1);
        let remaining = channel.subscribers;
        if remaining == 0 {
            map.remove(board);
        }

        tracing::debug!(board = %board, subscribers = remaining, "Subscriber unregistered");
    }
}

/// Board channels for the sessions of this process
#[derive(Clone)]
pub struct LocalBus {
    channels: Arc<Channels>,
}

impl LocalBus {
    /// Create a bus with the default per-board buffer
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a bus buffering up to `capacity` events per board
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(Channels {
                map: Mutex::new(HashMap::new()),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Deliver an event to this process's subscribers of its board
    ///
    /// Returns how many receivers got it. Boards without subscribers have no
    /// channel, so the event is simply dropped.
    pub fn deliver(&self, event: BoardEvent) -> usize {
        let map = self.channels.map.lock();
        let Some(channel) = map.get(&event.board) else {
            return 0;
        };
        channel.tx.send(event).unwrap_or(0)
    }

    /// Number of boards with at least one registration
    pub fn channel_count(&self) -> usize {
        self.channels.map.lock().len()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus for LocalBus {
    async fn publish(&self, event: BoardEvent) -> Result<(), BusError> {
        let board = event.board.clone();
        let receivers = self.deliver(event);
        tracing::debug!(board = %board, receivers = receivers, "Event delivered");
        Ok(())
    }

    fn register(&self, board: &BoardId) -> Registration {
        let mut map = self.channels.map.lock();
        let channel = map.entry(board.clone()).or_insert_with(|| Channel {
            tx: broadcast::channel(self.channels.capacity).0,
            subscribers: 0,
        });
        channel.subscribers += 1;

        tracing::debug!(board = %board, subscribers = channel.subscribers, "Subscriber registered");

        Registration {
            board: board.clone(),
            rx: channel.tx.subscribe(),
            channels: Arc::clone(&self.channels),
        }
    }

    fn subscriber_count(&self, board: &BoardId) -> usize {
        self.channels
            .map
            .lock()
            .get(board)
            .map_or(0, |channel| channel.subscribers)
    }
}

/// Receive-only view of one board's channel
///
/// Unregisters on drop, so every exit path of a session (including
/// cancellation of the task that owns it) releases the registration.
pub struct Registration {
    board: BoardId,
    rx: broadcast::Receiver<BoardEvent>,
    channels: Arc<Channels>,
}

impl Registration {
    pub fn board(&self) -> &BoardId {
        &self.board
    }

    /// Next event for this board
    pub async fn recv(&mut self) -> Result<BoardEvent, broadcast::error::RecvError> {
        self.rx.recv().await
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.channels.unregister(&self.board);
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("board", &self.board)
            .finish_non_exhaustive()
    }
}
