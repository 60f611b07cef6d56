//! Subscription sessions
//!
//! A session is one viewer's live interest in one board. It moves through
//! `Connecting → Active → Closed` and never returns to an earlier phase.
//!
//! ```text
//!   BoardService::subscribe
//!        │ register on bus, then read snapshot
//!        ▼
//!   SubscriptionSession ──forward()──► mpsc::Sender<PushMessage> ──► viewer
//!        │                                   │
//!        │ bus Lagged / Closed               │ Full   → SlowConsumer
//!        │ cancel                            │ Closed → ViewerDisconnected
//!        ▼                                   ▼
//!     Closed (registration dropped, stats updated)
//! ```
//!
//! Events published after the session was registered reach it in publish
//! order. Events may also appear in the snapshot; viewers dedupe by entry id.

pub mod push;
pub mod state;
pub mod subscription;

pub use push::PushMessage;
pub use state::{CloseReason, SessionPhase, SessionState};
pub use subscription::SubscriptionSession;
