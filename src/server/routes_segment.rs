//! Segment relay with optional AES-128 decryption.

use axum::{
    body::Body,
    extract::{RawQuery, State},
    http::{header, HeaderMap, StatusCode},
    response::Response,
    routing::get,
    Router,
};
use bytes::Bytes;
use futures::StreamExt;
use streamgate_common::{Error, KeySource, Result, StreamRequest, TargetKind};
use url::Url;

use super::params::ProxyParams;
use super::{AppContext, AppError};
use crate::decrypt::{decrypt_stream, SegmentDecryptor};
use crate::token::hex16;

/// Ciphertext read before the response starts. A segment that ends inside
/// this window is fully decrypted and validated first, so a bad key becomes a
/// clean 502 instead of a truncated body.
const PRIMING_WINDOW: usize = 256 * 1024;

/// Create segment routes.
pub fn segment_routes() -> Router<AppContext> {
    Router::new()
        .route("/proxy/hls/segment.ts", get(proxy_segment))
        .route("/proxy/hls/segment.m4s", get(proxy_segment))
        .route("/proxy/hls/segment.mp4", get(proxy_segment))
        .route("/decrypt/segment.ts", get(decrypt_segment))
        .route("/decrypt/segment.mp4", get(decrypt_segment))
}

const SEGMENT_KINDS: [TargetKind; 2] = [TargetKind::Segment, TargetKind::Stream];

async fn proxy_segment(
    State(ctx): State<AppContext>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> std::result::Result<Response, AppError> {
    let (request, template) =
        ProxyParams::parse(query.as_deref(), &ctx.codec, &SEGMENT_KINDS)?.require_request()?;
    Ok(relay_segment(&ctx, &request, template.as_deref(), &headers).await?)
}

async fn decrypt_segment(
    State(ctx): State<AppContext>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> std::result::Result<Response, AppError> {
    let (request, template) =
        ProxyParams::parse(query.as_deref(), &ctx.codec, &SEGMENT_KINDS)?.require_request()?;
    if request.decrypt.is_none() {
        return Err(Error::validation("Decryption requires key parameters").into());
    }
    Ok(relay_segment(&ctx, &request, template.as_deref(), &headers).await?)
}

/// Origin URL of a segment: the token URL, or a DASH template (already
/// expanded by the player) resolved against it.
fn segment_url(request: &StreamRequest, template: Option<&str>) -> Result<String> {
    let Some(template) = template else {
        return Ok(request.url.clone());
    };
    let base = Url::parse(&request.url).map_err(|_| Error::token("url is not absolute"))?;
    let url = base
        .join(template)
        .map_err(|_| Error::validation("Unresolvable segment template"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::validation("Segment template resolves to a non-http URL"));
    }
    Ok(url.into())
}

/// Fetch a segment and stream it to the client, decrypting when the request
/// carries key parameters.
pub(crate) async fn relay_segment(
    ctx: &AppContext,
    request: &StreamRequest,
    template: Option<&str>,
    client_headers: &HeaderMap,
) -> Result<Response> {
    let url = segment_url(request, template)?;

    let Some(decrypt) = &request.decrypt else {
        let headers = ctx.upstream_headers(request, Some(client_headers));
        let upstream = ctx.upstream.open(&url, &headers).await?;
        let status = StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::OK);

        let mut response = Response::builder().status(status);
        for (name, value) in &upstream.headers {
            response = response.header(*name, value.as_str());
        }
        if upstream.header("content-type").is_none() {
            response = response.header(header::CONTENT_TYPE, guess_content_type(&url));
        }
        return response
            .body(Body::from_stream(upstream.into_stream()))
            .map_err(|e| Error::internal(format!("Failed to build response: {e}")));
    };

    let headers = ctx.whole_body_headers(request, client_headers);
    let key = match &decrypt.key {
        KeySource::Inline(hex) => hex16(hex)?,
        KeySource::Uri(uri) => fetch_key(ctx, uri, &headers).await?,
    };
    let decryptor = match &decrypt.iv {
        Some(iv) => SegmentDecryptor::new(key, hex16(iv)?),
        None => SegmentDecryptor::with_leading_iv(key),
    };

    // A single range is an `EXT-X-BYTERANGE` sub-segment, encrypted on its
    // own. Anything else is fetched whole.
    let range = client_headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(ByteRange::parse);
    let mut segment_headers = headers;
    if let Some(range) = range {
        segment_headers.push(("range".to_string(), range.header_value()));
    }

    let upstream = ctx.upstream.open(&url, &segment_headers).await?;
    let content_type = upstream
        .header("content-type")
        .filter(|ct| *ct != "application/octet-stream")
        .map(str::to_string)
        .unwrap_or_else(|| guess_content_type(&url).to_string());

    let ciphertext = match range {
        // Origin ignored the range and sent the whole resource.
        Some(range) if upstream.status != 206 => {
            slice_stream(upstream.into_stream(), range).boxed()
        }
        _ => upstream.into_stream().boxed(),
    };
    let body = prime_decryption(ciphertext, decryptor).await?;
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type);
    if let Decrypted::Complete(bytes) = &body {
        response = response.header(header::CONTENT_LENGTH, bytes.len());
    }
    response
        .body(body.into_body())
        .map_err(|e| Error::internal(format!("Failed to build response: {e}")))
}

/// Fetch a 16-byte AES key.
async fn fetch_key(ctx: &AppContext, uri: &str, headers: &[(String, String)]) -> Result<[u8; 16]> {
    let fetched = ctx.upstream.fetch(uri, headers).await?;
    <[u8; 16]>::try_from(fetched.body.as_ref()).map_err(|_| {
        Error::decryption(format!("key is {} bytes, expected 16", fetched.body.len()))
    })
}

/// A single `bytes=<start>-[<end>]` range, end inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ByteRange {
    start: u64,
    end: Option<u64>,
}

impl ByteRange {
    fn parse(value: &str) -> Option<Self> {
        let spec = value.trim().strip_prefix("bytes=")?;
        let (start, end) = spec.split_once('-')?;
        let start = start.trim().parse().ok()?;
        let end = match end.trim() {
            "" => None,
            end => Some(end.parse().ok()?),
        };
        if end.is_some_and(|end| end < start) {
            return None;
        }
        Some(Self { start, end })
    }

    fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// The bytes of `body` that fall inside `range`.
fn slice_stream<S>(body: S, range: ByteRange) -> impl futures::Stream<Item = Result<Bytes>> + Send + 'static
where
    S: futures::Stream<Item = Result<Bytes>> + Send + 'static,
{
    async_stream::try_stream! {
        futures::pin_mut!(body);
        let mut offset = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            let chunk_start = offset;
            offset += chunk.len() as u64;
            let from = range.start.max(chunk_start);
            let to = range.end.map_or(offset, |end| (end + 1).min(offset));
            if from < to {
                yield chunk.slice((from - chunk_start) as usize..(to - chunk_start) as usize);
            }
            if range.end.is_some_and(|end| offset > end) {
                break;
            }
        }
    }
}

enum Decrypted<S> {
    /// Whole segment decrypted and padding verified.
    Complete(Bytes),
    /// First plaintext chunks, then the rest of the stream.
    Streaming(Vec<Bytes>, S),
}

impl<S> Decrypted<S>
where
    S: futures::Stream<Item = Result<Bytes>> + Send + 'static,
{
    fn into_body(self) -> Body {
        match self {
            Decrypted::Complete(bytes) => Body::from(bytes),
            Decrypted::Streaming(head, rest) => {
                Body::from_stream(futures::stream::iter(head.into_iter().map(Ok)).chain(rest))
            }
        }
    }
}

async fn prime_decryption<S>(
    mut ciphertext: S,
    mut decryptor: SegmentDecryptor,
) -> Result<Decrypted<impl futures::Stream<Item = Result<Bytes>> + Send + 'static>>
where
    S: futures::Stream<Item = Result<Bytes>> + Send + Unpin + 'static,
{
    let mut head = Vec::new();
    let mut read = 0usize;
    while read < PRIMING_WINDOW {
        match ciphertext.next().await {
            Some(chunk) => {
                let chunk = chunk?;
                read += chunk.len();
                let plain = decryptor.update(&chunk);
                if !plain.is_empty() {
                    head.push(plain);
                }
            }
            None => {
                head.push(decryptor.finish()?);
                return Ok(Decrypted::Complete(Bytes::from(head.concat())));
            }
        }
    }
    Ok(Decrypted::Streaming(head, decrypt_stream(ciphertext, decryptor)))
}

pub(crate) fn guess_content_type(url: &str) -> &'static str {
    let path = url.split(|c: char| c == '?' || c == '#').next().unwrap_or(url);
    let file = path.rsplit('/').next().unwrap_or(path);
    let ext = match file.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => String::new(),
    };
    match ext.as_str() {
        "ts" => "video/mp2t",
        "m4s" | "cmfv" | "cmfa" => "video/iso.segment",
        "mp4" | "m4v" => "video/mp4",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "vtt" => "text/vtt",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};

    const KEY: [u8; 16] = [9; 16];
    const IV: [u8; 16] = [3; 16];

    fn encrypt(plain: &[u8]) -> Vec<u8> {
        cbc::Encryptor::<aes::Aes128>::new(&KEY.into(), &IV.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plain)
    }

    fn chunks(data: Vec<u8>, size: usize) -> impl futures::Stream<Item = Result<Bytes>> + Send + Unpin + 'static {
        let pieces: Vec<Result<Bytes>> = data
            .chunks(size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        futures::stream::iter(pieces)
    }

    #[test]
    fn template_resolves_against_token_url() {
        let request = StreamRequest::new(TargetKind::Segment, "https://o.example/dash/base/");
        assert_eq!(
            segment_url(&request, Some("video1/42.m4s")).unwrap(),
            "https://o.example/dash/base/video1/42.m4s"
        );
        assert_eq!(segment_url(&request, None).unwrap(), request.url);
        assert!(segment_url(&request, Some("ftp://x/y")).is_err());
    }

    #[tokio::test]
    async fn small_segment_is_validated_before_responding() {
        let plain = vec![0x47u8; 188 * 10];
        let body = prime_decryption(chunks(encrypt(&plain), 100), SegmentDecryptor::new(KEY, IV))
            .await
            .unwrap();
        match body {
            Decrypted::Complete(bytes) => assert_eq!(bytes.as_ref(), plain.as_slice()),
            Decrypted::Streaming(..) => panic!("small segment should be complete"),
        }
    }

    #[tokio::test]
    async fn wrong_key_on_small_segment_is_clean_error() {
        let cipher = encrypt(&[0x47u8; 1000]);
        let result = prime_decryption(chunks(cipher, 64), SegmentDecryptor::new([1; 16], IV)).await;
        match result {
            Err(err) => assert_eq!(err.http_status(), 502),
            Ok(Decrypted::Complete(bytes)) => assert_ne!(bytes.as_ref(), &[0x47u8; 1000][..]),
            Ok(Decrypted::Streaming(..)) => panic!("small segment should not stream"),
        }
    }

    #[tokio::test]
    async fn large_segment_streams_in_order() {
        let plain: Vec<u8> = (0..PRIMING_WINDOW * 2).map(|i| (i % 251) as u8).collect();
        let body = prime_decryption(chunks(encrypt(&plain), 4096), SegmentDecryptor::new(KEY, IV))
            .await
            .unwrap();
        let Decrypted::Streaming(head, rest) = body else {
            panic!("large segment should stream");
        };
        let mut out: Vec<u8> = head.concat();
        let rest: Vec<Bytes> = rest.map(|c| c.unwrap()).collect().await;
        out.extend(rest.concat());
        assert_eq!(out, plain);
    }

    #[test]
    fn byte_range_parsing() {
        assert_eq!(
            ByteRange::parse("bytes=100-199"),
            Some(ByteRange { start: 100, end: Some(199) })
        );
        assert_eq!(ByteRange::parse("bytes=5-"), Some(ByteRange { start: 5, end: None }));
        for bad in ["bytes=-500", "bytes=0-1,4-5", "items=0-1", "bytes=9-3"] {
            assert_eq!(ByteRange::parse(bad), None, "{bad}");
        }
        assert_eq!(ByteRange::parse("bytes=7-9").unwrap().header_value(), "bytes=7-9");
    }

    #[tokio::test]
    async fn slice_spans_chunk_boundaries() {
        let data: Vec<u8> = (0..100u8).collect();
        let range = ByteRange { start: 10, end: Some(44) };
        let sliced: Vec<Bytes> = slice_stream(chunks(data.clone(), 16), range)
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(sliced.concat(), &data[10..45]);

        let open = ByteRange { start: 90, end: None };
        let tail: Vec<Bytes> = slice_stream(chunks(data.clone(), 7), open)
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(tail.concat(), &data[90..]);
    }

    #[test]
    fn content_type_guess() {
        assert_eq!(guess_content_type("https://o/a/1.ts?x=1"), "video/mp2t");
        assert_eq!(guess_content_type("https://o/a/1.m4s"), "video/iso.segment");
        assert_eq!(guess_content_type("https://o/a/noext"), "application/octet-stream");
    }
}
