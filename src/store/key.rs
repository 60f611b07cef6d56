//! Board identifiers and the backing-store key schema
//!
//! A board has no record of its own. It exists only as the union of the
//! sub-records addressed by these keys:
//!
//! ```text
//! board:{slug}:entries   ordered set, score = creation time (ms)
//! board:{slug}:seq       insertion counter for tie-breaking
//! board:{slug}:authkey   optional access key
//! board:{slug}:channel   pub/sub channel name (not stored)
//! ```

use serde::{Deserialize, Serialize};

const PREFIX: &str = "board:";
const ENTRIES_SUFFIX: &str = ":entries";
const CHANNEL_SUFFIX: &str = ":channel";

/// Slug identifying a board
///
/// Slugs are validated by the router before they reach the core, so this
/// type treats them as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BoardId(String);

impl BoardId {
    /// Create a board id from an already validated slug
    pub fn new(slug: impl Into<String>) -> Self {
        Self(slug.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key of the ordered entry history
    pub fn entries_key(&self) -> String {
        format!("{PREFIX}{}{ENTRIES_SUFFIX}", self.0)
    }

    /// Key of the insertion counter
    pub fn seq_key(&self) -> String {
        format!("{PREFIX}{}:seq", self.0)
    }

    /// Key of the optional access key
    pub fn authkey_key(&self) -> String {
        format!("{PREFIX}{}:authkey", self.0)
    }

    /// Pub/sub channel carrying this board's events
    pub fn channel(&self) -> String {
        format!("{PREFIX}{}{CHANNEL_SUFFIX}", self.0)
    }

    /// Glob matching every board's history key
    pub fn entries_pattern() -> String {
        format!("{PREFIX}*{ENTRIES_SUFFIX}")
    }

    /// Glob matching every board's channel
    pub fn channel_pattern() -> String {
        format!("{PREFIX}*{CHANNEL_SUFFIX}")
    }

    /// Recover the board from a channel name
    pub fn from_channel(channel: &str) -> Option<Self> {
        Self::strip(channel, CHANNEL_SUFFIX)
    }

    fn strip(raw: &str, suffix: &str) -> Option<Self> {
        let slug = raw.strip_prefix(PREFIX)?.strip_suffix(suffix)?;
        if slug.is_empty() {
            None
        } else {
            Some(Self::new(slug))
        }
    }
}

impl std::fmt::Display for BoardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BoardId {
    fn from(slug: &str) -> Self {
        Self::new(slug)
    }
}
