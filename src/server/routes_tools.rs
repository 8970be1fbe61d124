//! Token generation, channel list proxying and diagnostics.

use axum::{
    extract::{RawQuery, State},
    http::header,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use streamgate_common::{DecryptParams, Error, Result, StreamRequest, TargetKind};
use url::Url;

use super::{AppContext, AppError};
use crate::proxy_url::proxy_url_for;
use crate::token::validate_request;

/// Create tool routes.
pub fn tools_routes() -> Router<AppContext> {
    Router::new()
        .route("/generate_urls", post(generate_urls))
        .route("/playlist", get(proxy_playlist))
        .route("/api/info", get(server_info))
        .route("/proxy/ip", get(outbound_ip))
}

/// One origin source to wrap in a proxy URL.
#[derive(Debug, Clone, Deserialize)]
pub struct UrlSource {
    pub url: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub key_url: Option<String>,
    #[serde(default)]
    pub iv: Option<String>,
    #[serde(default)]
    pub decrypt_segments: bool,
    #[serde(default)]
    pub profile: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GenerateUrlsRequest {
    pub urls: Vec<UrlSource>,
}

#[derive(Debug, Serialize)]
pub struct GenerateUrlsResponse {
    pub urls: Vec<String>,
}

/// Target kind for a source without an explicit `kind`.
fn infer_kind(source: &UrlSource) -> TargetKind {
    if source.profile.is_some() {
        return TargetKind::Stream;
    }
    kind_for_url(&source.url)
}

/// Manifest for playlist and MPD extensions, raw stream otherwise.
fn kind_for_url(url: &str) -> TargetKind {
    let path = url
        .split(|c: char| c == '?' || c == '#')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    if path.ends_with(".m3u8") || path.ends_with(".m3u") || path.ends_with(".mpd") {
        TargetKind::Manifest
    } else {
        TargetKind::Stream
    }
}

fn build_request(source: &UrlSource) -> Result<StreamRequest> {
    let kind = match &source.kind {
        Some(raw) => TargetKind::parse(raw)
            .ok_or_else(|| Error::validation(format!("Unknown kind '{raw}'")))?,
        None => infer_kind(source),
    };

    let mut request = StreamRequest::new(kind, source.url.clone());
    for (name, value) in &source.headers {
        request = request.with_header(name.clone(), value.clone());
    }
    let decrypt = match (&source.key, &source.key_url) {
        (Some(key), _) => Some(DecryptParams::inline_key(key.clone())),
        (None, Some(uri)) => Some(DecryptParams::key_uri(uri.clone())),
        (None, None) => None,
    };
    if let Some(mut decrypt) = decrypt {
        decrypt.iv = source
            .iv
            .as_deref()
            .map(|iv| iv.trim_start_matches("0x").to_string());
        request = request.with_decrypt(decrypt);
    }
    if let Some(profile) = &source.profile {
        request = request.with_profile(profile.clone());
    }
    request.decrypt_segments = source.decrypt_segments;

    // Same rules as a decoded token, reported as a bad request.
    validate_request(&request).map_err(|e| match e {
        Error::Token(msg) => Error::validation(msg),
        other => other,
    })?;
    Ok(request)
}

/// `POST /generate_urls`
async fn generate_urls(
    State(ctx): State<AppContext>,
    Json(body): Json<GenerateUrlsRequest>,
) -> std::result::Result<Json<GenerateUrlsResponse>, AppError> {
    let urls = body
        .urls
        .iter()
        .map(|source| {
            let request = build_request(source)?;
            proxy_url_for(&ctx.codec, ctx.public_prefix(), &request, None)
        })
        .collect::<Result<Vec<_>>>()?;
    tracing::debug!(count = urls.len(), "Generated proxy URLs");
    Ok(Json(GenerateUrlsResponse { urls }))
}

/// Request headers carried by `#EXTVLCOPT` and `#EXTHTTP` lines.
fn channel_headers(line: &str) -> Vec<(String, String)> {
    if let Some(option) = line.strip_prefix("#EXTVLCOPT:") {
        let Some((name, value)) = option.split_once('=') else {
            return Vec::new();
        };
        let canonical = match name.trim().to_ascii_lowercase().as_str() {
            "http-referrer" | "http-referer" => "Referer",
            "http-user-agent" => "User-Agent",
            "http-origin" => "Origin",
            _ => return Vec::new(),
        };
        return vec![(canonical.to_string(), value.trim().to_string())];
    }
    if let Some(json) = line.strip_prefix("#EXTHTTP:") {
        return serde_json::from_str::<BTreeMap<String, String>>(json.trim())
            .map(|headers| headers.into_iter().collect())
            .unwrap_or_default();
    }
    Vec::new()
}

/// Append the entries of one M3U channel list to `out`, replacing every
/// channel URL with the proxy URL `proxy` returns for it. Header option lines
/// are folded into the following channel's request. Returns the number of
/// channels written.
fn proxy_channel_list(
    body: &str,
    source: &Url,
    out: &mut String,
    mut proxy: impl FnMut(&StreamRequest) -> Result<String>,
) -> Result<usize> {
    let mut pending: Vec<(String, String)> = Vec::new();
    let mut channels = 0;

    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("#EXTM3U") {
            continue;
        }
        if line.starts_with("#EXTVLCOPT:") || line.starts_with("#EXTHTTP:") {
            pending.extend(channel_headers(line));
            continue;
        }
        if line.starts_with('#') {
            out.push_str(line);
            out.push('\n');
            continue;
        }

        let headers = std::mem::take(&mut pending);
        let resolved = match source.join(line) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => url,
            _ => {
                out.push_str(line);
                out.push('\n');
                continue;
            }
        };
        let url = String::from(resolved);
        let mut request = StreamRequest::new(kind_for_url(&url), url);
        for (name, value) in headers {
            request = request.with_header(name, value);
        }
        out.push_str(&proxy(&request)?);
        out.push('\n');
        channels += 1;
    }
    Ok(channels)
}

/// `GET /playlist?url=<list>[;<list>...]`: merge M3U channel lists into one,
/// with every channel routed through the proxy.
async fn proxy_playlist(
    State(ctx): State<AppContext>,
    RawQuery(query): RawQuery,
) -> std::result::Result<Response, AppError> {
    let sources: Vec<String> = url::form_urlencoded::parse(query.unwrap_or_default().as_bytes())
        .filter(|(name, _)| name == "url")
        .flat_map(|(_, value)| {
            value
                .split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect();
    if sources.is_empty() {
        return Err(Error::validation("At least one playlist url is required").into());
    }

    let mut out = String::from("#EXTM3U\n");
    let mut channels = 0;
    let mut last_error = None;
    for source in &sources {
        let fetched = match ctx.upstream.fetch(source, &[]).await {
            Ok(fetched) => fetched,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping unavailable channel list");
                last_error = Some(e);
                continue;
            }
        };
        let body = String::from_utf8_lossy(&fetched.body);
        channels += proxy_channel_list(&body, &fetched.final_url, &mut out, |request| {
            proxy_url_for(&ctx.codec, ctx.public_prefix(), request, None)
        })?;
    }
    if let (0, Some(e)) = (channels, last_error) {
        return Err(e.into());
    }

    tracing::debug!(sources = sources.len(), channels, "Merged channel lists");
    Ok((
        [
            (header::CONTENT_TYPE, "application/x-mpegurl"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        out,
    )
        .into_response())
}

#[derive(Debug, Serialize)]
pub struct ServerInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub public_url: String,
    pub auth_enabled: bool,
    pub passthrough_status: bool,
    pub transcode_profiles: Vec<String>,
    pub default_profile: String,
    pub active_sessions: usize,
}

/// `GET /api/info`: server and configuration summary. Carries no secrets.
async fn server_info(State(ctx): State<AppContext>) -> Json<ServerInfo> {
    let transcode = ctx.transcoder.config();
    Json(ServerInfo {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        public_url: ctx.public_prefix().to_string(),
        auth_enabled: ctx.config.auth.enabled,
        passthrough_status: ctx.config.upstream.passthrough_status,
        transcode_profiles: transcode.profiles.iter().map(|p| p.name.clone()).collect(),
        default_profile: transcode.default_profile.clone(),
        active_sessions: ctx
            .transcoder
            .registry()
            .snapshot()
            .iter()
            .filter(|s| s.status().is_live())
            .count(),
    })
}

#[derive(Debug, Serialize)]
pub struct IpResponse {
    pub ip: String,
}

#[derive(Deserialize)]
struct EchoedIp {
    ip: String,
}

/// `GET /proxy/ip`: the address origins see for this proxy.
async fn outbound_ip(
    State(ctx): State<AppContext>,
) -> std::result::Result<Json<IpResponse>, AppError> {
    let fetched = ctx
        .upstream
        .fetch(&ctx.config.upstream.ip_lookup_url, &[])
        .await?;
    let ip = match serde_json::from_slice::<EchoedIp>(&fetched.body) {
        Ok(echoed) => echoed.ip,
        Err(_) => String::from_utf8_lossy(&fetched.body).trim().to_string(),
    };
    if ip.is_empty() {
        return Err(Error::validation("IP lookup returned an empty response").into());
    }
    Ok(Json(IpResponse { ip }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(url: &str) -> UrlSource {
        UrlSource {
            url: url.to_string(),
            kind: None,
            headers: BTreeMap::new(),
            key: None,
            key_url: None,
            iv: None,
            decrypt_segments: false,
            profile: None,
        }
    }

    #[test]
    fn kind_inference() {
        assert_eq!(infer_kind(&source("https://o/a/index.m3u8?x=1")), TargetKind::Manifest);
        assert_eq!(infer_kind(&source("https://o/a/stream.MPD")), TargetKind::Manifest);
        assert_eq!(infer_kind(&source("https://o/a/live.ts")), TargetKind::Stream);
        let mut transcoded = source("https://o/a/index.m3u8");
        transcoded.profile = Some("hls".into());
        assert_eq!(infer_kind(&transcoded), TargetKind::Stream);
    }

    #[test]
    fn invalid_source_is_validation_error() {
        let mut bad = source("https://o/a/1.ts");
        bad.kind = Some("segment".into());
        bad.key = Some("short".into());
        assert!(matches!(build_request(&bad), Err(Error::Validation(_))));

        let mut unknown = source("https://o/a/1.ts");
        unknown.kind = Some("video".into());
        assert!(matches!(build_request(&unknown), Err(Error::Validation(_))));
    }

    const CHANNELS: &str = "#EXTM3U x-tvg-url=\"https://epg.example/guide.xml\"
#EXTINF:-1 tvg-id=\"one\" group-title=\"News\",Channel One
#EXTVLCOPT:http-referrer=https://site.example/
#EXTVLCOPT:http-user-agent=Player/1.0
https://cdn.example/one/index.m3u8
#EXTINF:-1,Channel Two
#EXTHTTP:{\"Cookie\":\"a=b\"}
two/stream.ts

#EXTINF:-1,Radio
rtmp://radio.example/live
";

    fn describe(request: &StreamRequest) -> Result<String> {
        let headers: Vec<String> = request
            .headers
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        Ok(format!("proxy:{}:{}:[{}]", request.kind, request.url, headers.join(",")))
    }

    #[test]
    fn channel_list_is_proxied_with_option_headers() {
        let source = Url::parse("https://lists.example/tv/list.m3u").unwrap();
        let mut out = String::new();
        let channels = proxy_channel_list(CHANNELS, &source, &mut out, describe).unwrap();
        assert_eq!(channels, 2);

        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(
            lines,
            vec![
                "#EXTINF:-1 tvg-id=\"one\" group-title=\"News\",Channel One",
                "proxy:manifest:https://cdn.example/one/index.m3u8:[Referer=https://site.example/,User-Agent=Player/1.0]",
                "#EXTINF:-1,Channel Two",
                "proxy:stream:https://lists.example/tv/two/stream.ts:[Cookie=a=b]",
                "#EXTINF:-1,Radio",
                "rtmp://radio.example/live",
            ]
        );
    }

    #[test]
    fn unknown_options_are_ignored() {
        assert!(channel_headers("#EXTVLCOPT:network-caching=1000").is_empty());
        assert!(channel_headers("#EXTHTTP:not json").is_empty());
        assert_eq!(
            channel_headers("#EXTVLCOPT:http-origin=https://o.example"),
            vec![("Origin".to_string(), "https://o.example".to_string())]
        );
    }

    #[test]
    fn explicit_kind_and_headers() {
        let mut src = source("https://o/a/index.m3u8");
        src.kind = Some("hls".into());
        src.decrypt_segments = true;
        src.headers.insert("Referer".into(), "https://site/".into());
        let request = build_request(&src).unwrap();
        assert_eq!(request.kind, TargetKind::Manifest);
        assert!(request.decrypt_segments);
        assert_eq!(request.headers.len(), 1);
    }
}
