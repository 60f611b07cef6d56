//! Store error types

use thiserror::Error;

/// Error type for store operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing data service could not be reached
    #[error("backing store unreachable: {0}")]
    Unavailable(String),

    /// The backing data service answered with something unexpected
    #[error("unexpected store reply: {0}")]
    Protocol(String),
}
