//! Content sniffing and the manifest document variant.
//!
//! Origins routinely mislabel manifests (`text/plain`, `application/octet-stream`,
//! `.m3u8` URLs serving MPDs), so the format is decided from the body alone.

use crate::dash::DashManifest;
use crate::hls::HlsPlaylist;
use crate::tokenizer::{RewriteOptions, UriTokenizer};
use crate::{Error, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use url::Url;

/// Supported manifest formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    /// HTTP Live Streaming playlist.
    Hls,
    /// MPEG-DASH media presentation description.
    Dash,
}

impl ManifestFormat {
    /// Sniff the format of `raw`.
    pub fn detect(raw: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(raw).ok()?;
        let trimmed = strip_bom(text).trim_start();
        if trimmed.starts_with("#EXTM3U") {
            return Some(ManifestFormat::Hls);
        }
        if trimmed.starts_with('<') && root_element_is_mpd(trimmed) {
            return Some(ManifestFormat::Dash);
        }
        None
    }

    /// MIME type served for this format.
    pub fn content_type(&self) -> &'static str {
        match self {
            ManifestFormat::Hls => "application/vnd.apple.mpegurl",
            ManifestFormat::Dash => "application/dash+xml",
        }
    }
}

/// A parsed manifest.
#[derive(Debug, Clone)]
pub enum ManifestDocument {
    /// HLS master or media playlist.
    Hls(HlsPlaylist),
    /// DASH MPD.
    Dash(DashManifest),
}

impl ManifestDocument {
    /// Sniff and parse `raw`.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let format = ManifestFormat::detect(raw).ok_or_else(|| {
            if std::str::from_utf8(raw).is_err() {
                Error::InvalidUtf8
            } else {
                Error::NotAManifest
            }
        })?;
        let text = std::str::from_utf8(raw).map_err(|_| Error::InvalidUtf8)?;
        match format {
            ManifestFormat::Hls => Ok(ManifestDocument::Hls(HlsPlaylist::parse(text)?)),
            ManifestFormat::Dash => Ok(ManifestDocument::Dash(DashManifest::parse(text)?)),
        }
    }

    /// Format of this document.
    pub fn format(&self) -> ManifestFormat {
        match self {
            ManifestDocument::Hls(_) => ManifestFormat::Hls,
            ManifestDocument::Dash(_) => ManifestFormat::Dash,
        }
    }

    /// Whether the presentation is live (sliding window / dynamic).
    pub fn is_live(&self) -> bool {
        match self {
            ManifestDocument::Hls(playlist) => playlist.info().is_live(),
            ManifestDocument::Dash(mpd) => mpd.is_dynamic(),
        }
    }

    /// Rewrite every URI reference through `tokenizer`.
    pub fn rewrite(
        &self,
        base: &Url,
        options: &RewriteOptions,
        tokenizer: &dyn UriTokenizer,
    ) -> Result<String> {
        match self {
            ManifestDocument::Hls(playlist) => playlist.rewrite(base, options, tokenizer),
            ManifestDocument::Dash(mpd) => mpd.rewrite(base, tokenizer),
        }
    }
}

pub(crate) fn strip_bom(text: &str) -> &str {
    text.strip_prefix('\u{feff}').unwrap_or(text)
}

fn root_element_is_mpd(text: &str) -> bool {
    let mut reader = Reader::from_str(text);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                return e.local_name().as_ref() == b"MPD";
            }
            Ok(Event::Eof) | Err(_) => return false,
            Ok(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_hls_with_bom_and_whitespace() {
        assert_eq!(
            ManifestFormat::detect(b"\xef\xbb\xbf\n  #EXTM3U\n#EXT-X-VERSION:3\n"),
            Some(ManifestFormat::Hls)
        );
    }

    #[test]
    fn detects_dash_after_declaration_and_comment() {
        let mpd = br#"<?xml version="1.0"?>
<!-- generated -->
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static"></MPD>"#;
        assert_eq!(ManifestFormat::detect(mpd), Some(ManifestFormat::Dash));
    }

    #[test]
    fn detects_prefixed_mpd_root() {
        let mpd = br#"<dash:MPD xmlns:dash="urn:mpeg:dash:schema:mpd:2011"/>"#;
        assert_eq!(ManifestFormat::detect(mpd), Some(ManifestFormat::Dash));
    }

    #[test]
    fn rejects_other_content() {
        assert_eq!(ManifestFormat::detect(b"<html><body>nope</body></html>"), None);
        assert_eq!(ManifestFormat::detect(b"{\"error\":\"not found\"}"), None);
        assert_eq!(ManifestFormat::detect(b""), None);
        assert_eq!(ManifestFormat::detect(&[0xff, 0xfe, 0x00]), None);
    }

    #[test]
    fn parse_reports_not_a_manifest() {
        assert!(matches!(
            ManifestDocument::parse(b"plain text"),
            Err(Error::NotAManifest)
        ));
        assert!(matches!(
            ManifestDocument::parse(&[0xc3, 0x28]),
            Err(Error::InvalidUtf8)
        ));
    }

    #[test]
    fn content_types() {
        assert_eq!(ManifestFormat::Hls.content_type(), "application/vnd.apple.mpegurl");
        assert_eq!(ManifestFormat::Dash.content_type(), "application/dash+xml");
    }
}
