//! The seam between the rewriter and proxy URL generation.
//!
//! The rewriter only decides *what* a URI is (its [`TargetKind`]), where it
//! really lives and whether it needs decryption. Turning that into a proxy URL
//! (token encoding, endpoint selection, public prefix) is the job of a
//! [`UriTokenizer`] implementation supplied by the caller.

use crate::Result;
use streamgate_common::{DecryptParams, TargetKind};
use url::Url;

/// A resolved manifest reference.
#[derive(Debug, Clone)]
pub struct ProxyTarget<'a> {
    /// What the reference points at.
    pub kind: TargetKind,
    /// Absolute origin URL. For templated DASH references this is the
    /// effective `BaseURL` the template is relative to.
    pub url: &'a Url,
    /// Key parameters for server-side decryption.
    pub decrypt: Option<DecryptParams>,
    /// Unresolved DASH template (`$Number$`, `$Time$`, ...).
    pub template: Option<&'a str>,
}

impl<'a> ProxyTarget<'a> {
    /// A plain reference to `url`.
    pub fn new(kind: TargetKind, url: &'a Url) -> Self {
        Self {
            kind,
            url,
            decrypt: None,
            template: None,
        }
    }
}

/// Turns resolved references into proxy URLs.
pub trait UriTokenizer: Send + Sync {
    /// Build the proxy URL that replaces `target` in the rewritten manifest.
    fn proxy_url(&self, target: &ProxyTarget<'_>) -> Result<String>;
}

/// Per-request rewrite switches.
#[derive(Debug, Clone, Default)]
pub struct RewriteOptions {
    /// Attach AES-128 key parameters to segment references and drop the
    /// corresponding `EXT-X-KEY` tags, so clients receive clear segments.
    pub decrypt_segments: bool,
}

impl RewriteOptions {
    /// Options with server-side decryption switched on or off.
    pub fn decrypting(enabled: bool) -> Self {
        Self {
            decrypt_segments: enabled,
        }
    }
}

/// Resolve `raw` against `base`.
///
/// Returns `None` for URIs that cannot be proxied (`skd://`, `data:` and
/// other non-HTTP schemes); those are left untouched by the rewriters.
pub(crate) fn resolve(base: &Url, raw: &str) -> Result<Option<Url>> {
    let resolved = base.join(raw.trim()).map_err(|e| crate::Error::InvalidUri {
        uri: raw.to_string(),
        reason: e.to_string(),
    })?;
    Ok(matches!(resolved.scheme(), "http" | "https").then_some(resolved))
}
