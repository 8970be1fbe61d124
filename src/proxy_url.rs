//! Proxy URL construction.
//!
//! Picks the endpoint for a request from its kind and the origin URL's
//! extension, and appends the token (and, for DASH templates, the unresolved
//! template) as query parameters.

use crate::token::TokenCodec;
use streamgate_common::{Error, Result, StreamRequest, TargetKind};
use streamgate_manifest::{ProxyTarget, UriTokenizer};

/// Endpoint path serving `request`, relative to the proxy root.
pub fn endpoint_for(request: &StreamRequest, template: Option<&str>) -> &'static str {
    let path = template.unwrap_or_else(|| url_path(&request.url));
    let ext = extension(path);
    match request.kind {
        TargetKind::Manifest if ext == "mpd" => "/proxy/mpd/manifest.m3u8",
        TargetKind::Manifest => "/proxy/hls/manifest.m3u8",
        TargetKind::Segment => match ext.as_str() {
            "m4s" | "m4a" | "m4v" | "cmfv" | "cmfa" | "cmft" => "/proxy/hls/segment.m4s",
            "mp4" => "/proxy/hls/segment.mp4",
            _ => "/proxy/hls/segment.ts",
        },
        TargetKind::Key => "/key",
        TargetKind::License => "/license",
        TargetKind::Stream => "/proxy/stream",
    }
}

fn url_path(url: &str) -> &str {
    let end = url.find(|c: char| c == '?' || c == '#').unwrap_or(url.len());
    &url[..end]
}

fn extension(path: &str) -> String {
    let file = path.rsplit('/').next().unwrap_or(path);
    match file.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => String::new(),
    }
}

/// Full proxy URL for `request`.
pub fn proxy_url_for(
    codec: &TokenCodec,
    prefix: &str,
    request: &StreamRequest,
    template: Option<&str>,
) -> Result<String> {
    let mut out = String::with_capacity(prefix.len() + 256);
    out.push_str(prefix.trim_end_matches('/'));
    out.push_str(endpoint_for(request, template));
    out.push_str("?token=");
    out.push_str(&codec.encode(request)?);
    if let Some(template) = template {
        out.push_str("&tpl=");
        out.push_str(&encode_template(template));
    }
    Ok(out)
}

/// Percent-encode a DASH template for a query value, leaving `$…$`
/// placeholders (including `%0Nd` width specifiers) readable to players.
fn encode_template(template: &str) -> String {
    let mut out = String::with_capacity(template.len() + 16);
    let mut in_placeholder = false;
    for c in template.chars() {
        match c {
            '$' => {
                in_placeholder = !in_placeholder;
                out.push(c);
            }
            '%' if in_placeholder => out.push(c),
            c if c.is_ascii_alphanumeric() || "-._~/:@!*'(),".contains(c) => out.push(c),
            c => {
                let mut buf = [0u8; 4];
                for b in c.encode_utf8(&mut buf).bytes() {
                    out.push_str(&format!("%{b:02X}"));
                }
            }
        }
    }
    out
}

/// Manifest tokenizer: child references inherit the parent request's
/// forwarded headers.
pub struct ProxyUrlBuilder<'a> {
    codec: &'a TokenCodec,
    prefix: &'a str,
    parent: &'a StreamRequest,
}

impl<'a> ProxyUrlBuilder<'a> {
    pub fn new(codec: &'a TokenCodec, prefix: &'a str, parent: &'a StreamRequest) -> Self {
        Self {
            codec,
            prefix,
            parent,
        }
    }
}

impl UriTokenizer for ProxyUrlBuilder<'_> {
    fn proxy_url(&self, target: &ProxyTarget<'_>) -> streamgate_manifest::Result<String> {
        let mut child = self.parent.child(target.kind, target.url.as_str());
        child.decrypt = target.decrypt.clone();
        proxy_url_for(self.codec, self.prefix, &child, target.template)
            .map_err(|e: Error| streamgate_manifest::Error::Tokenize(e.to_string()))
    }
}
