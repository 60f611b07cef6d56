//! Bounded board history
//!
//! The history manager turns every accepted write into one atomic store
//! batch: insert, trim to capacity, refresh TTL. Payloads of evicted or
//! deleted image entries are cleaned up afterwards, best-effort, on a
//! background task tracker. A failed cleanup is logged and counted, and the
//! orphan sweep catches whatever is left behind.
//!
//! ```text
//!   commit(board, entry)
//!        │
//!        ▼
//!   Store::execute ──► BatchOutcome { evicted, len }
//!        │                       │
//!        │ len <= capacity       └──► cleanup task: PayloadStore::delete
//!        ▼
//!   Ok(evicted)
//! ```

pub mod manager;
pub mod sweep;

pub use manager::HistoryManager;
pub use sweep::SweepReport;
