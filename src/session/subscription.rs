//! Subscription session
//!
//! One session per connected viewer. While active it holds a bus
//! registration; every way out of the active phase (viewer disconnect,
//! cancellation, falling behind, drop) releases it.

use std::sync::Arc;

use futures::Stream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::push::PushMessage;
use super::state::{CloseReason, SessionPhase, SessionState};
use crate::bus::{BoardEvent, Bus, Registration};
use crate::stats::ServiceStats;
use crate::store::BoardId;

/// A viewer's live interest in one board
pub struct SubscriptionSession {
    state: SessionState,
    registration: Option<Registration>,
    stats: Arc<ServiceStats>,
}

impl SubscriptionSession {
    pub fn new(id: u64, board: BoardId, stats: Arc<ServiceStats>) -> Self {
        Self {
            state: SessionState::new(id, board),
            registration: None,
            stats,
        }
    }

    pub fn id(&self) -> u64 {
        self.state.id
    }

    pub fn board(&self) -> &BoardId {
        &self.state.board
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.phase
    }

    /// Events received from the bus so far
    pub fn delivered(&self) -> u64 {
        self.state.delivered
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.state.close_reason
    }

    /// Register on the bus and start receiving events
    ///
    /// Only valid from `Connecting`; returns false otherwise.
    pub fn activate<B: Bus>(&mut self, bus: &B) -> bool {
        if !self.state.activate() {
            return false;
        }

        self.registration = Some(bus.register(&self.state.board));
        self.stats.session_opened();

        tracing::info!(
            session_id = self.state.id,
            board = %self.state.board,
            "Session active"
        );
        true
    }

    /// Wait for the next event on the board
    ///
    /// Returns `None` once the session is closed. Cancellation, a lagging
    /// receiver and a closed channel all close the session.
    pub async fn next_event(&mut self, cancel: &CancellationToken) -> Option<BoardEvent> {
        if !self.state.is_active() {
            return None;
        }
        let registration = self.registration.as_mut()?;

        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CloseReason::Cancelled),
            result = registration.recv() => result.map_err(|e| match e {
                RecvError::Lagged(skipped) => CloseReason::Lagged(skipped),
                RecvError::Closed => CloseReason::BusClosed,
            }),
        };

        match received {
            Ok(event) => {
                self.state.delivered += 1;
                Some(event)
            }
            Err(reason) => {
                self.close(reason);
                None
            }
        }
    }

    /// Close the session and release its registration
    pub fn close(&mut self, reason: CloseReason) {
        let Some(previous) = self.state.close(reason) else {
            return;
        };
        self.registration = None;

        if previous != SessionPhase::Active {
            return;
        }
        self.stats.session_closed(reason.is_dropped());

        if reason.is_dropped() {
            tracing::warn!(
                session_id = self.state.id,
                board = %self.state.board,
                reason = ?reason,
                delivered = self.state.delivered,
                "Session dropped"
            );
        } else {
            tracing::info!(
                session_id = self.state.id,
                board = %self.state.board,
                reason = ?reason,
                delivered = self.state.delivered,
                duration_ms = self.state.active_duration().as_millis() as u64,
                "Session closed"
            );
        }
    }

    /// Forward events into a bounded outbound channel on a new task
    ///
    /// Never waits on the viewer: a full buffer closes the session as a
    /// slow consumer. A closed receiver ends it as a disconnect. The task
    /// returns the close reason.
    pub fn forward(self, outbound: mpsc::Sender<PushMessage>, cancel: CancellationToken) -> JoinHandle<CloseReason> {
        let mut session = self;

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = outbound.closed() => {
                        session.close(CloseReason::ViewerDisconnected);
                        break;
                    }
                    event = session.next_event(&cancel) => event,
                };
                let Some(event) = event else {
                    break;
                };

                let message = match PushMessage::from_event(&event) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!(session_id = session.id(), error = %e, "Skipping unencodable event");
                        continue;
                    }
                };

                match outbound.try_send(message) {
                    Ok(()) => session.stats.event_forwarded(),
                    Err(TrySendError::Full(_)) => {
                        session.close(CloseReason::SlowConsumer);
                        break;
                    }
                    Err(TrySendError::Closed(_)) => {
                        session.close(CloseReason::ViewerDisconnected);
                        break;
                    }
                }
            }

            session.close_reason().unwrap_or(CloseReason::Dropped)
        })
    }

    /// Pull-based alternative to [`forward`](Self::forward)
    ///
    /// The stream ends when the session closes. Dropping it closes the
    /// session.
    pub fn into_stream(self, cancel: CancellationToken) -> impl Stream<Item = PushMessage> + Send + 'static {
        futures::stream::unfold((self, cancel), |(mut session, cancel)| async move {
            loop {
                let event = session.next_event(&cancel).await?;
                match PushMessage::from_event(&event) {
                    Ok(message) => {
                        session.stats.event_forwarded();
                        return Some((message, (session, cancel)));
                    }
                    Err(e) => {
                        tracing::warn!(session_id = session.id(), error = %e, "Skipping unencodable event");
                    }
                }
            }
        })
    }
}

impl Drop for SubscriptionSession {
    fn drop(&mut self) {
        self.close(CloseReason::Dropped);
    }
}

impl std::fmt::Debug for SubscriptionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionSession")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
