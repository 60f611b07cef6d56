//! Media handling for image entries
//!
//! - Accepted media types (PNG, JPEG)
//! - Inline preview generation

pub mod kind;
pub mod preview;

pub use kind::MediaType;
pub use preview::{Preview, PreviewError, Previewer, ThumbnailPreviewer};
