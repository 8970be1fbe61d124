//! Stable identifiers for transcode sessions.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Identifier of a transcode session.
///
/// Derived from the origin URL and the transcode profile, so every request for
/// the same source and profile maps to the same session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    /// Length of the hex identifier.
    pub const LEN: usize = 20;

    /// Derive the id for `url` transcoded with `profile`.
    pub fn derive(url: &str, profile: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        hasher.update([0u8]);
        hasher.update(profile.as_bytes());
        let digest = hex::encode(hasher.finalize());
        Self(digest[..Self::LEN].to_string())
    }

    /// Parse an id received from a client (`/proxy/stream?id=…`, `/ffmpeg_stream/{id}/…`).
    ///
    /// Only lowercase hex of the expected length is accepted, which also keeps
    /// the id safe to use as a directory name.
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = raw.len() == Self::LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self(raw.to_string()))
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
