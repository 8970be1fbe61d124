//! HLS playlist structures.
//!
//! The playlist is kept as its original line sequence so rewriting can emit
//! every non-URI line byte-for-byte, including line endings.

use super::attributes::AttributeList;
use crate::format::strip_bom;
use crate::tokenizer::{resolve, ProxyTarget, RewriteOptions, UriTokenizer};
use crate::{Error, Result};
use streamgate_common::{DecryptParams, KeySource, TargetKind};
use url::Url;

/// Playlist type from `EXT-X-PLAYLIST-TYPE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistType {
    /// Video on demand, the playlist will not change.
    Vod,
    /// Append-only event playlist.
    Event,
}

/// Playlist-level attributes gathered while parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaylistInfo {
    /// Master playlist (variant streams) rather than a media playlist.
    pub is_master: bool,
    /// `EXT-X-VERSION`.
    pub version: Option<u32>,
    /// `EXT-X-TARGETDURATION` in seconds.
    pub target_duration: Option<u64>,
    /// `EXT-X-MEDIA-SEQUENCE`, 0 when absent.
    pub media_sequence: u64,
    /// `EXT-X-PLAYLIST-TYPE`.
    pub playlist_type: Option<PlaylistType>,
    /// `EXT-X-ENDLIST` present.
    pub ended: bool,
    /// Number of `EXT-X-DISCONTINUITY` tags.
    pub discontinuities: usize,
    /// Number of media segments.
    pub segments: usize,
    /// Number of proxyable URI references (URI lines and `URI=` attributes).
    pub uri_references: usize,
}

impl PlaylistInfo {
    /// Live playlists have no end marker and are not VOD.
    pub fn is_live(&self) -> bool {
        !self.is_master && !self.ended && self.playlist_type != Some(PlaylistType::Vod)
    }
}

#[derive(Debug, Clone)]
struct Line {
    text: String,
    ending: &'static str,
}

enum LineKind<'a> {
    Blank,
    Comment,
    Tag { name: &'a str, value: &'a str },
    Uri(&'a str),
}

impl Line {
    fn kind(&self) -> LineKind<'_> {
        let trimmed = self.text.trim();
        if trimmed.is_empty() {
            LineKind::Blank
        } else if trimmed.starts_with("#EXT") {
            let tag = &trimmed[1..];
            match tag.split_once(':') {
                Some((name, value)) => LineKind::Tag { name, value },
                None => LineKind::Tag {
                    name: tag,
                    value: "",
                },
            }
        } else if trimmed.starts_with('#') {
            LineKind::Comment
        } else {
            LineKind::Uri(trimmed)
        }
    }
}

/// Where a tag's `URI` attribute should be routed.
fn uri_attribute_kind(tag: &str) -> Option<TargetKind> {
    match tag {
        "EXT-X-KEY" | "EXT-X-SESSION-KEY" => Some(TargetKind::Key),
        "EXT-X-MAP" | "EXT-X-PART" | "EXT-X-PRELOAD-HINT" | "EXT-X-SESSION-DATA" => {
            Some(TargetKind::Segment)
        }
        "EXT-X-MEDIA" | "EXT-X-I-FRAME-STREAM-INF" | "EXT-X-RENDITION-REPORT" => {
            Some(TargetKind::Manifest)
        }
        _ => None,
    }
}

/// An HLS master or media playlist.
#[derive(Debug, Clone)]
pub struct HlsPlaylist {
    bom: bool,
    lines: Vec<Line>,
    info: PlaylistInfo,
}

impl HlsPlaylist {
    /// Parse playlist text. The text must start with `#EXTM3U`, optionally
    /// preceded by a BOM and whitespace.
    pub fn parse(text: &str) -> Result<Self> {
        let body = strip_bom(text);
        if !body.trim_start().starts_with("#EXTM3U") {
            return Err(Error::NotAManifest);
        }

        let lines: Vec<Line> = body
            .split_inclusive('\n')
            .map(|raw| {
                if let Some(text) = raw.strip_suffix("\r\n") {
                    Line {
                        text: text.to_string(),
                        ending: "\r\n",
                    }
                } else if let Some(text) = raw.strip_suffix('\n') {
                    Line {
                        text: text.to_string(),
                        ending: "\n",
                    }
                } else {
                    Line {
                        text: raw.to_string(),
                        ending: "",
                    }
                }
            })
            .collect();

        let mut info = PlaylistInfo::default();
        let mut expect_variant = false;
        for line in &lines {
            match line.kind() {
                LineKind::Tag { name, value } => {
                    match name {
                        "EXT-X-VERSION" => info.version = value.trim().parse().ok(),
                        "EXT-X-TARGETDURATION" => info.target_duration = value.trim().parse().ok(),
                        "EXT-X-MEDIA-SEQUENCE" => {
                            info.media_sequence = value.trim().parse().unwrap_or(0)
                        }
                        "EXT-X-PLAYLIST-TYPE" => {
                            info.playlist_type = match value.trim() {
                                "VOD" => Some(PlaylistType::Vod),
                                "EVENT" => Some(PlaylistType::Event),
                                _ => None,
                            }
                        }
                        "EXT-X-ENDLIST" => info.ended = true,
                        "EXT-X-DISCONTINUITY" => info.discontinuities += 1,
                        "EXT-X-STREAM-INF" => {
                            info.is_master = true;
                            expect_variant = true;
                        }
                        "EXT-X-I-FRAME-STREAM-INF" | "EXT-X-MEDIA" => info.is_master = true,
                        _ => {}
                    }
                    if uri_attribute_kind(name).is_some()
                        && AttributeList::parse(value).get("URI").is_some()
                    {
                        info.uri_references += 1;
                    }
                }
                LineKind::Uri(_) => {
                    info.uri_references += 1;
                    if expect_variant {
                        expect_variant = false;
                    } else {
                        info.segments += 1;
                    }
                }
                LineKind::Blank | LineKind::Comment => {}
            }
        }

        Ok(Self {
            bom: text.len() != body.len(),
            lines,
            info,
        })
    }

    /// Playlist-level attributes.
    pub fn info(&self) -> &PlaylistInfo {
        &self.info
    }

    /// Rewrite every URI reference through `tokenizer`.
    pub fn rewrite(
        &self,
        base: &Url,
        options: &RewriteOptions,
        tokenizer: &dyn UriTokenizer,
    ) -> Result<String> {
        let mut out = String::with_capacity(self.lines.iter().map(|l| l.text.len() + 64).sum());
        if self.bom {
            out.push('\u{feff}');
        }

        let mut media_sequence = 0u64;
        let mut segment_index = 0u64;
        let mut expect_variant = false;
        let mut key: Option<SegmentKey> = None;

        for line in &self.lines {
            match line.kind() {
                LineKind::Tag { name, value } => {
                    match name {
                        "EXT-X-MEDIA-SEQUENCE" => {
                            media_sequence = value.trim().parse().unwrap_or(0);
                        }
                        "EXT-X-STREAM-INF" => expect_variant = true,
                        "EXT-X-KEY" if options.decrypt_segments => {
                            let attrs = AttributeList::parse(value);
                            match SegmentKey::from_tag(&attrs, base)? {
                                KeyTag::Decryptable(k) => {
                                    key = Some(k);
                                    // Clients receive clear bytes, so the tag goes.
                                    continue;
                                }
                                KeyTag::Clear => key = None,
                                KeyTag::Other => {}
                            }
                        }
                        _ => {}
                    }

                    let Some(kind) = uri_attribute_kind(name) else {
                        push_line(&mut out, &line.text, line.ending);
                        continue;
                    };
                    let attrs = AttributeList::parse(value);
                    let Some(uri) = attrs.get("URI") else {
                        push_line(&mut out, &line.text, line.ending);
                        continue;
                    };
                    let Some(resolved) = resolve(base, uri)? else {
                        push_line(&mut out, &line.text, line.ending);
                        continue;
                    };

                    let mut target = ProxyTarget::new(kind, &resolved);
                    if name == "EXT-X-MAP" {
                        // The init section has no sequence number, so only an
                        // explicit IV makes it decryptable.
                        target.decrypt = key
                            .as_ref()
                            .filter(|k| k.iv.is_some())
                            .map(|k| k.params(0));
                    }
                    let proxied = tokenizer.proxy_url(&target)?;
                    let replaced = attrs
                        .replace_value("URI", &proxied)
                        .unwrap_or_else(|| value.to_string());

                    let indent = &line.text[..line.text.len() - line.text.trim_start().len()];
                    out.push_str(indent);
                    out.push('#');
                    out.push_str(name);
                    out.push(':');
                    out.push_str(&replaced);
                    out.push_str(line.ending);
                }
                LineKind::Uri(uri) => {
                    let variant = std::mem::take(&mut expect_variant);
                    let Some(resolved) = resolve(base, uri)? else {
                        push_line(&mut out, &line.text, line.ending);
                        continue;
                    };
                    let proxied = if variant {
                        tokenizer.proxy_url(&ProxyTarget::new(TargetKind::Manifest, &resolved))?
                    } else {
                        let mut target = ProxyTarget::new(TargetKind::Segment, &resolved);
                        target.decrypt = key
                            .as_ref()
                            .map(|k| k.params(media_sequence + segment_index));
                        segment_index += 1;
                        tokenizer.proxy_url(&target)?
                    };
                    push_line(&mut out, &proxied, line.ending);
                }
                LineKind::Blank | LineKind::Comment => {
                    push_line(&mut out, &line.text, line.ending);
                }
            }
        }

        Ok(out)
    }
}

fn push_line(out: &mut String, text: &str, ending: &str) {
    out.push_str(text);
    out.push_str(ending);
}

/// AES-128 key state governing the following segments.
#[derive(Debug, Clone)]
struct SegmentKey {
    uri: Url,
    iv: Option<String>,
}

enum KeyTag {
    /// `METHOD=AES-128` with the identity key format over HTTP.
    Decryptable(SegmentKey),
    /// `METHOD=NONE`.
    Clear,
    /// Anything the proxy cannot decrypt (SAMPLE-AES, DRM key formats).
    Other,
}

impl SegmentKey {
    fn from_tag(attrs: &AttributeList<'_>, base: &Url) -> Result<KeyTag> {
        let identity = attrs
            .get("KEYFORMAT")
            .map_or(true, |format| format == "identity");
        if !identity {
            return Ok(KeyTag::Other);
        }
        match attrs.get("METHOD") {
            Some("NONE") => Ok(KeyTag::Clear),
            Some("AES-128") => {
                let Some(uri) = attrs.get("URI") else {
                    return Err(Error::invalid_attribute("EXT-X-KEY", "AES-128 without URI"));
                };
                let Some(uri) = resolve(base, uri)? else {
                    return Ok(KeyTag::Other);
                };
                let iv = attrs.get("IV").map(parse_iv).transpose()?;
                Ok(KeyTag::Decryptable(SegmentKey { uri, iv }))
            }
            _ => Ok(KeyTag::Other),
        }
    }

    /// Decrypt parameters for the segment with media sequence number `sequence`.
    fn params(&self, sequence: u64) -> DecryptParams {
        DecryptParams {
            key: KeySource::Uri(self.uri.to_string()),
            iv: Some(
                self.iv
                    .clone()
                    .unwrap_or_else(|| format!("{:032x}", u128::from(sequence))),
            ),
            method: Default::default(),
        }
    }
}

/// Normalize an `IV=0x…` attribute to 32 lowercase hex digits.
fn parse_iv(raw: &str) -> Result<String> {
    let digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);
    if digits.is_empty() || digits.len() > 32 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::invalid_attribute("EXT-X-KEY", "IV is not a 128-bit hex value"));
    }
    Ok(format!("{:0>32}", digits.to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl UriTokenizer for Echo {
        fn proxy_url(&self, target: &ProxyTarget<'_>) -> Result<String> {
            let mut out = format!("/{}?u={}", target.kind, target.url);
            if let Some(d) = &target.decrypt {
                if let KeySource::Uri(k) = &d.key {
                    out.push_str(&format!("&k={k}"));
                }
                if let Some(iv) = &d.iv {
                    out.push_str(&format!("&iv={iv}"));
                }
            }
            Ok(out)
        }
    }

    fn base() -> Url {
        Url::parse("https://origin.example/vod/index.m3u8").unwrap()
    }

    const MEDIA: &str = "#EXTM3U\n\
#EXT-X-VERSION:3\n\
#EXT-X-TARGETDURATION:6\n\
#EXT-X-MEDIA-SEQUENCE:7\n\
#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"\n\
#EXTINF:6.0,\n\
seg7.ts\n\
#EXT-X-DISCONTINUITY\n\
#EXTINF:6.0,\n\
seg8.ts\n\
#EXT-X-ENDLIST\n";

    #[test]
    fn parses_media_info() {
        let playlist = HlsPlaylist::parse(MEDIA).unwrap();
        let info = playlist.info();
        assert!(!info.is_master);
        assert_eq!(info.version, Some(3));
        assert_eq!(info.target_duration, Some(6));
        assert_eq!(info.media_sequence, 7);
        assert_eq!(info.discontinuities, 1);
        assert_eq!(info.segments, 2);
        assert_eq!(info.uri_references, 3);
        assert!(info.ended);
        assert!(!info.is_live());
    }

    #[test]
    fn rewrites_key_and_segments() {
        let playlist = HlsPlaylist::parse(MEDIA).unwrap();
        let out = playlist
            .rewrite(&base(), &RewriteOptions::default(), &Echo)
            .unwrap();
        assert!(out.contains("#EXT-X-KEY:METHOD=AES-128,URI=\"/key?u=https://origin.example/vod/key.bin\"\n"));
        assert!(out.contains("\n/segment?u=https://origin.example/vod/seg7.ts\n"));
        assert!(out.contains("\n/segment?u=https://origin.example/vod/seg8.ts\n"));
        assert!(out.contains("#EXT-X-DISCONTINUITY\n"));
        assert!(out.ends_with("#EXT-X-ENDLIST\n"));
    }

    #[test]
    fn decrypt_mode_drops_key_and_derives_sequence_iv() {
        let playlist = HlsPlaylist::parse(MEDIA).unwrap();
        let out = playlist
            .rewrite(&base(), &RewriteOptions::decrypting(true), &Echo)
            .unwrap();
        assert!(!out.contains("EXT-X-KEY"));
        assert!(out.contains(
            "seg7.ts&k=https://origin.example/vod/key.bin&iv=00000000000000000000000000000007"
        ));
        assert!(out.contains("seg8.ts&k=https://origin.example/vod/key.bin&iv=00000000000000000000000000000008"));
    }

    #[test]
    fn decrypt_mode_prefers_explicit_iv() {
        let text = "#EXTM3U\n#EXT-X-KEY:METHOD=AES-128,URI=\"k\",IV=0X0A\n#EXT-X-MAP:URI=\"init.mp4\"\n#EXTINF:4,\na.m4s\n";
        let out = HlsPlaylist::parse(text)
            .unwrap()
            .rewrite(&base(), &RewriteOptions::decrypting(true), &Echo)
            .unwrap();
        let iv = "0000000000000000000000000000000a";
        assert!(out.contains(&format!("init.mp4&k=https://origin.example/vod/k&iv={iv}")));
        assert!(out.contains(&format!("a.m4s&k=https://origin.example/vod/k&iv={iv}")));
    }

    #[test]
    fn decrypt_mode_leaves_drm_keys_alone() {
        let text = "#EXTM3U\n#EXT-X-KEY:METHOD=SAMPLE-AES,URI=\"skd://abc\",KEYFORMAT=\"com.apple.streamingkeydelivery\"\n#EXTINF:4,\na.ts\n";
        let out = HlsPlaylist::parse(text)
            .unwrap()
            .rewrite(&base(), &RewriteOptions::decrypting(true), &Echo)
            .unwrap();
        assert!(out.contains("URI=\"skd://abc\""));
        assert!(out.contains("\n/segment?u=https://origin.example/vod/a.ts\n"));
    }

    #[test]
    fn master_variants_route_to_manifest() {
        let text = "#EXTM3U\r\n\
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"a\",NAME=\"en\",URI=\"audio/en.m3u8\"\r\n\
#EXT-X-STREAM-INF:BANDWIDTH=800000,AUDIO=\"a\"\r\n\
low/index.m3u8\r\n\
#EXT-X-I-FRAME-STREAM-INF:BANDWIDTH=90000,URI=\"low/iframe.m3u8\"";
        let playlist = HlsPlaylist::parse(text).unwrap();
        assert!(playlist.info().is_master);
        let out = playlist
            .rewrite(&base(), &RewriteOptions::default(), &Echo)
            .unwrap();
        assert!(out.contains("URI=\"/manifest?u=https://origin.example/vod/audio/en.m3u8\"\r\n"));
        assert!(out.contains("\r\n/manifest?u=https://origin.example/vod/low/index.m3u8\r\n"));
        assert!(out.ends_with("URI=\"/manifest?u=https://origin.example/vod/low/iframe.m3u8\""));
    }

    #[test]
    fn bom_is_preserved() {
        let text = "\u{feff}#EXTM3U\n#EXTINF:1,\na.ts\n";
        let out = HlsPlaylist::parse(text)
            .unwrap()
            .rewrite(&base(), &RewriteOptions::default(), &Echo)
            .unwrap();
        assert!(out.starts_with("\u{feff}#EXTM3U\n"));
    }

    #[test]
    fn rejects_bad_iv() {
        let text = "#EXTM3U\n#EXT-X-KEY:METHOD=AES-128,URI=\"k\",IV=0xZZ\n#EXTINF:4,\na.ts\n";
        let err = HlsPlaylist::parse(text)
            .unwrap()
            .rewrite(&base(), &RewriteOptions::decrypting(true), &Echo)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAttribute { .. }));
    }

    #[test]
    fn parse_iv_pads_short_values() {
        assert_eq!(parse_iv("0x1").unwrap(), "00000000000000000000000000000001");
        assert!(parse_iv("0x").is_err());
        assert!(parse_iv(&format!("0x{}", "1".repeat(33))).is_err());
    }
}
