//! Streamgate-Manifest: format sniffing and URI rewriting for HLS and DASH
//!
//! Every URI a manifest references (segments, keys, init sections,
//! sub-playlists, license servers) is resolved to an absolute origin URL and
//! handed to a [`UriTokenizer`], which turns it into a proxy URL. Everything
//! else in the document is preserved.
//!
//! # Modules
//!
//! - `format` - Content sniffing and the [`ManifestDocument`] variant
//! - `hls` - Line-oriented HLS playlist model and rewriter
//! - `dash` - XML event based DASH MPD rewriter
//! - `tokenizer` - The seam between the rewriter and proxy URL generation
//!
//! # Example
//!
//! ```
//! use streamgate_manifest::{rewrite, ManifestFormat, ProxyTarget, RewriteOptions, UriTokenizer};
//! use url::Url;
//!
//! struct Prefix;
//!
//! impl UriTokenizer for Prefix {
//!     fn proxy_url(&self, target: &ProxyTarget<'_>) -> streamgate_manifest::Result<String> {
//!         Ok(format!("/p/{}?u={}", target.kind, target.url))
//!     }
//! }
//!
//! let body = b"#EXTM3U\n#EXTINF:4,\nseg0.ts\n#EXT-X-ENDLIST\n";
//! let base = Url::parse("https://origin.example/vod/index.m3u8").unwrap();
//! let out = rewrite(body, &base, &RewriteOptions::default(), &Prefix).unwrap();
//!
//! assert_eq!(out.format, ManifestFormat::Hls);
//! assert!(out.body.contains("/p/segment?u=https://origin.example/vod/seg0.ts"));
//! ```
//!
//! The rewriter keeps no state between calls and is safe to use concurrently.

pub mod dash;
pub mod error;
pub mod format;
pub mod hls;
pub mod tokenizer;

pub use dash::DashManifest;
pub use error::{Error, Result};
pub use format::{ManifestDocument, ManifestFormat};
pub use hls::HlsPlaylist;
pub use tokenizer::{ProxyTarget, RewriteOptions, UriTokenizer};

use url::Url;

/// Output of [`rewrite`].
#[derive(Debug, Clone)]
pub struct Rewritten {
    /// Detected manifest format.
    pub format: ManifestFormat,
    /// Rewritten manifest text.
    pub body: String,
}

/// Sniff, parse and rewrite a manifest in one step.
///
/// `base` must be the URL the manifest was actually served from (after
/// redirects); relative URIs are resolved against it.
pub fn rewrite(
    raw: &[u8],
    base: &Url,
    options: &RewriteOptions,
    tokenizer: &dyn UriTokenizer,
) -> Result<Rewritten> {
    let document = ManifestDocument::parse(raw)?;
    let body = document.rewrite(base, options, tokenizer)?;
    Ok(Rewritten {
        format: document.format(),
        body,
    })
}
