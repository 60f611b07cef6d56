//! Error types
//!
//! Every core operation returns a typed [`Error`] so the router can map it
//! to a response. Sub-systems carry their own error enums which fold into
//! the crate-level taxonomy.

use thiserror::Error;

use crate::media::PreviewError;
use crate::payload::PayloadError;
use crate::store::{BoardId, StoreError};

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-level error taxonomy
#[derive(Error, Debug)]
pub enum Error {
    /// The backing data service could not be reached. No write was applied.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// A committed history was observed above its capacity.
    #[error("board {board} holds {len} entries after commit, capacity is {capacity}")]
    CapacityExceededInternally {
        board: BoardId,
        len: usize,
        capacity: usize,
    },

    /// Entry rejected before any store mutation
    #[error("payload too large: {size} bytes exceeds {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Image could not be decoded or previewed
    #[error("invalid media: {0}")]
    InvalidMedia(#[from] PreviewError),

    /// Entry content failed basic checks (for example, empty text)
    #[error("invalid content: {0}")]
    InvalidContent(&'static str),

    /// Entry or board does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Access key missing or wrong for a keyed board
    #[error("invalid or missing board key")]
    Unauthorized,

    /// Payload write failed before the entry was committed
    #[error("payload storage error: {0}")]
    Payload(#[from] PayloadError),
}

impl Error {
    /// Build a not-found error for an entry
    pub fn entry_not_found(board: &BoardId, id: impl std::fmt::Display) -> Self {
        Error::NotFound(format!("entry {} on board {}", id, board))
    }

    /// Whether the failure is caused by the backing data service
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_))
    }
}
