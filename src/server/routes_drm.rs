//! Key delivery and opaque license relay.

use axum::{
    body::Bytes,
    extract::{RawQuery, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use streamgate_common::{KeySource, TargetKind};

use super::params::ProxyParams;
use super::{AppContext, AppError};
use crate::token::hex16;

/// Create key and license routes.
pub fn drm_routes() -> Router<AppContext> {
    Router::new()
        .route("/key", get(get_key))
        .route("/license", get(relay_license).post(relay_license))
}

/// Return key bytes verbatim. Key material is never logged.
async fn get_key(
    State(ctx): State<AppContext>,
    RawQuery(query): RawQuery,
    client_headers: HeaderMap,
) -> Result<Response, AppError> {
    let (request, _) =
        ProxyParams::parse(query.as_deref(), &ctx.codec, &[TargetKind::Key])?.require_request()?;

    let key = match request.decrypt.as_ref().map(|d| &d.key) {
        Some(KeySource::Inline(hex)) => Bytes::copy_from_slice(&hex16(hex)?),
        _ => {
            let headers = ctx.whole_body_headers(&request, &client_headers);
            ctx.upstream.fetch(&request.url, &headers).await?.body
        }
    };

    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        key,
    )
        .into_response())
}

/// Forward a license exchange without looking at either body.
async fn relay_license(
    State(ctx): State<AppContext>,
    method: Method,
    RawQuery(query): RawQuery,
    client_headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let (request, _) = ProxyParams::parse(query.as_deref(), &ctx.codec, &[TargetKind::License])?
        .require_request()?;

    let mut headers = ctx.whole_body_headers(&request, &client_headers);
    if let Some(content_type) = client_headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    {
        if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("content-type")) {
            headers.push(("content-type".to_string(), content_type.to_string()));
        }
    }

    let upstream_method = if method == Method::POST {
        reqwest::Method::POST
    } else {
        reqwest::Method::GET
    };
    let fetched = ctx
        .upstream
        .forward(upstream_method, &request.url, &headers, body)
        .await?;

    let status = StatusCode::from_u16(fetched.status).unwrap_or(StatusCode::OK);
    let content_type = fetched
        .content_type
        .unwrap_or_else(|| "application/octet-stream".to_string());
    Ok((status, [(header::CONTENT_TYPE, content_type)], fetched.body).into_response())
}
