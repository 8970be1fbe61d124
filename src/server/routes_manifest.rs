//! Manifest fetch and rewrite.

use axum::{
    extract::{RawQuery, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use streamgate_common::TargetKind;
use streamgate_manifest::RewriteOptions;

use super::params::ProxyParams;
use super::{AppContext, AppError};
use crate::proxy_url::ProxyUrlBuilder;

/// Create manifest routes.
pub fn manifest_routes() -> Router<AppContext> {
    Router::new()
        .route("/proxy/manifest.m3u8", get(proxy_manifest))
        .route("/proxy/hls/manifest.m3u8", get(proxy_manifest))
        .route("/proxy/mpd/manifest.m3u8", get(proxy_manifest))
}

/// Fetch the origin manifest and point every reference back at the proxy.
async fn proxy_manifest(
    State(ctx): State<AppContext>,
    RawQuery(query): RawQuery,
    client_headers: HeaderMap,
) -> Result<Response, AppError> {
    let (request, _) =
        ProxyParams::parse(query.as_deref(), &ctx.codec, &[TargetKind::Manifest])?
            .require_request()?;

    let headers = ctx.whole_body_headers(&request, &client_headers);
    let fetched = ctx.upstream.fetch(&request.url, &headers).await?;

    let builder = ProxyUrlBuilder::new(&ctx.codec, ctx.public_prefix(), &request);
    let options = RewriteOptions::decrypting(request.decrypt_segments);
    let rewritten =
        streamgate_manifest::rewrite(&fetched.body, &fetched.final_url, &options, &builder)?;

    tracing::debug!(
        format = ?rewritten.format,
        bytes = rewritten.body.len(),
        decrypt_segments = request.decrypt_segments,
        "Rewrote manifest"
    );

    Ok((
        [
            (header::CONTENT_TYPE, rewritten.format.content_type()),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        rewritten.body,
    )
        .into_response())
}
