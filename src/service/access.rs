//! Board access keys

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;

use crate::error::{Error, Result};

/// Random bytes behind each key (16 base64 characters)
pub const KEY_BYTES: usize = 12;

/// Generate a fresh URL-safe access key
pub fn generate_key() -> String {
    let mut bytes = [0u8; KEY_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Compare keys without short-circuiting on the first differing byte
pub fn keys_match(expected: &str, provided: &str) -> bool {
    let (a, b) = (expected.as_bytes(), provided.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Gate an operation on a board's current key
///
/// Unkeyed boards are open to everyone.
pub(crate) fn check(current: Option<&str>, provided: Option<&str>) -> Result<()> {
    match (current, provided) {
        (None, _) => Ok(()),
        (Some(current), Some(provided)) if keys_match(current, provided) => Ok(()),
        (Some(_), _) => Err(Error::Unauthorized),
    }
}
