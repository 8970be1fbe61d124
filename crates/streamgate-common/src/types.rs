//! Request descriptors carried inside proxy tokens.
//!
//! Field names are shortened on the wire to keep tokens compact. Empty and
//! absent fields are skipped, and headers live in a `BTreeMap`, so the JSON
//! form of a request is deterministic.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// What the origin URL of a request points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    /// HLS playlist or DASH MPD.
    Manifest,
    /// Media segment (including init sections and partial segments).
    Segment,
    /// Decryption key.
    Key,
    /// DRM license server.
    License,
    /// Raw passthrough or transcode source.
    Stream,
}

impl TargetKind {
    /// Lowercase name, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Manifest => "manifest",
            TargetKind::Segment => "segment",
            TargetKind::Key => "key",
            TargetKind::License => "license",
            TargetKind::Stream => "stream",
        }
    }

    /// Parse a kind name as accepted by `/generate_urls` and the CLI.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "manifest" | "hls" | "mpd" | "dash" => Some(TargetKind::Manifest),
            "segment" => Some(TargetKind::Segment),
            "key" => Some(TargetKind::Key),
            "license" => Some(TargetKind::License),
            "stream" | "raw" => Some(TargetKind::Stream),
            _ => None,
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Block cipher mode used to protect segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CipherMode {
    /// AES-128 in CBC mode with PKCS#7 padding (HLS `METHOD=AES-128`).
    #[default]
    #[serde(rename = "aes-128-cbc")]
    Aes128Cbc,
}

/// Where the decryption key comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeySource {
    /// Absolute URL of the key, fetched from the origin.
    Uri(String),
    /// Key bytes as 32 hex characters.
    Inline(String),
}

/// Parameters needed to decrypt a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptParams {
    /// Key location or inline key.
    #[serde(rename = "k")]
    pub key: KeySource,

    /// Explicit IV as 32 hex characters. When absent, the first cipher block
    /// of the payload is used as the IV.
    #[serde(rename = "i", default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,

    /// Cipher mode.
    #[serde(rename = "m", default)]
    pub method: CipherMode,
}

impl DecryptParams {
    /// Decrypt with a key fetched from `uri`.
    pub fn key_uri(uri: impl Into<String>) -> Self {
        Self {
            key: KeySource::Uri(uri.into()),
            iv: None,
            method: CipherMode::Aes128Cbc,
        }
    }

    /// Decrypt with an inline hex key.
    pub fn inline_key(hex_key: impl Into<String>) -> Self {
        Self {
            key: KeySource::Inline(hex_key.into()),
            iv: None,
            method: CipherMode::Aes128Cbc,
        }
    }

    /// Set an explicit IV (hex).
    pub fn with_iv(mut self, hex_iv: impl Into<String>) -> Self {
        self.iv = Some(hex_iv.into());
        self
    }
}

/// One inbound proxy request, as decoded from a token or direct query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRequest {
    /// Target kind.
    #[serde(rename = "t")]
    pub kind: TargetKind,

    /// Absolute origin URL.
    #[serde(rename = "u")]
    pub url: String,

    /// Decryption parameters for segment and stream targets.
    #[serde(rename = "d", default, skip_serializing_if = "Option::is_none")]
    pub decrypt: Option<DecryptParams>,

    /// Headers forwarded upstream.
    #[serde(rename = "h", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    /// Manifest targets only: attach key parameters to segment tokens so the
    /// proxy serves clear segments.
    #[serde(rename = "x", default, skip_serializing_if = "is_false")]
    pub decrypt_segments: bool,

    /// Stream targets only: transcode profile name.
    #[serde(rename = "p", default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl StreamRequest {
    /// Create a request for `url` with no extra parameters.
    pub fn new(kind: TargetKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
            decrypt: None,
            headers: BTreeMap::new(),
            decrypt_segments: false,
            profile: None,
        }
    }

    /// Set the transcode profile.
    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    /// Add a header to forward upstream.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Attach decryption parameters.
    pub fn with_decrypt(mut self, params: DecryptParams) -> Self {
        self.decrypt = Some(params);
        self
    }

    /// Ask the manifest rewriter to hand out decrypting segment tokens.
    pub fn with_decrypt_segments(mut self, enabled: bool) -> Self {
        self.decrypt_segments = enabled;
        self
    }

    /// Derive a request for a URI referenced by this one, inheriting headers.
    pub fn child(&self, kind: TargetKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
            decrypt: None,
            headers: self.headers.clone(),
            decrypt_segments: kind == TargetKind::Manifest && self.decrypt_segments,
            profile: None,
        }
    }
}
