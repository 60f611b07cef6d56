//! Session state machine
//!
//! Tracks a subscription session from registration to close.

use std::time::{Duration, Instant};

use crate::store::BoardId;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Created, not yet registered on the bus
    Connecting,
    /// Registered and forwarding events
    Active,
    /// Unregistered; no further events
    Closed,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The viewer went away (outbound side closed)
    ViewerDisconnected,
    /// The service is shutting down or the caller cancelled
    Cancelled,
    /// The outbound buffer was full
    SlowConsumer,
    /// The session fell behind the board channel by this many events
    Lagged(u64),
    /// The board channel closed
    BusClosed,
    /// The session was dropped without an explicit close
    Dropped,
}

impl CloseReason {
    /// Closed for falling behind rather than by either side's choice
    pub fn is_dropped(&self) -> bool {
        matches!(self, CloseReason::SlowConsumer | CloseReason::Lagged(_))
    }
}

/// Complete session state
#[derive(Debug)]
pub struct SessionState {
    /// Unique session ID
    pub id: u64,

    /// Board the session follows
    pub board: BoardId,

    /// Current phase
    pub phase: SessionPhase,

    /// Creation time
    pub created_at: Instant,

    /// Time when the session became active
    pub activated_at: Option<Instant>,

    /// Events handed to the viewer
    pub delivered: u64,

    /// Set once the session is closed
    pub close_reason: Option<CloseReason>,
}

impl SessionState {
    pub fn new(id: u64, board: BoardId) -> Self {
        Self {
            id,
            board,
            phase: SessionPhase::Connecting,
            created_at: Instant::now(),
            activated_at: None,
            delivered: 0,
            close_reason: None,
        }
    }

    /// Transition to active; returns false if not connecting
    pub fn activate(&mut self) -> bool {
        if self.phase != SessionPhase::Connecting {
            return false;
        }
        self.phase = SessionPhase::Active;
        self.activated_at = Some(Instant::now());
        true
    }

    /// Transition to closed; returns the phase left, or None if already closed
    pub fn close(&mut self, reason: CloseReason) -> Option<SessionPhase> {
        if self.phase == SessionPhase::Closed {
            return None;
        }
        let previous = self.phase;
        self.phase = SessionPhase::Closed;
        self.close_reason = Some(reason);
        Some(previous)
    }

    pub fn is_active(&self) -> bool {
        self.phase == SessionPhase::Active
    }

    /// Time spent active, zero if never activated
    pub fn active_duration(&self) -> Duration {
        self.activated_at.map_or(Duration::ZERO, |t| t.elapsed())
    }
}
