//! Router-facing board operations
//!
//! [`BoardService`] is the single entry point an HTTP layer calls into. It
//! assumes board slugs and keys were validated before the call, and
//! classifies every failure with a typed [`Error`](crate::Error) the router
//! maps to a response.
//!
//! ```text
//!   create_entry ─► size check ─► preview (blocking pool) ─► PayloadStore::put
//!                                                              │
//!                       HistoryManager::commit ◄───────────────┘
//!                              │ ok                   │ store unavailable
//!                              ▼                      ▼
//!                  announce in commit order   payload rolled back
//! ```

pub mod access;
pub mod board;

pub use access::generate_key;
pub use board::{BoardService, NewEntry};
