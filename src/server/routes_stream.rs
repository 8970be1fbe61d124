//! Raw stream relay, transcode sessions and session inspection.

use axum::{
    body::Body,
    extract::{Path, RawQuery, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{delete, get},
    Json, Router,
};
use streamgate_common::{Error, StreamId, TargetKind};

use super::params::ProxyParams;
use super::routes_segment::{guess_content_type, relay_segment};
use super::{AppContext, AppError};
use crate::config::OutputMode;
use crate::transcode::{SessionInfo, SessionReader, TranscodeSession};

/// Create stream and session routes.
pub fn stream_routes() -> Router<AppContext> {
    Router::new()
        .route("/proxy/stream", get(proxy_stream))
        .route("/ffmpeg_stream/:stream_id/:filename", get(session_file))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/:stream_id", delete(stop_session))
}

/// `/proxy/stream`: raw relay without a profile, transcode with one, or
/// attach to a running session by `id`.
async fn proxy_stream(
    State(ctx): State<AppContext>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let params = ProxyParams::parse(
        query.as_deref(),
        &ctx.codec,
        &[TargetKind::Stream, TargetKind::Segment],
    )?;

    if params.request.is_none() {
        if let Some(id) = &params.stream_id {
            return attach_existing(&ctx, id).await;
        }
    }

    let (request, template) = params.require_request()?;
    let Some(profile_name) = request.profile.as_deref() else {
        return Ok(relay_segment(&ctx, &request, template.as_deref(), &headers).await?);
    };

    let profile = ctx.transcoder.profile(Some(profile_name))?.clone();
    match profile.output {
        OutputMode::Pipe => {
            let reader = ctx.transcoder.get_or_start(&request, &profile).await?;
            Ok(stream_response(reader))
        }
        OutputMode::Hls => {
            let session = ctx.transcoder.ensure_started(&request, &profile).await?;
            Ok(redirect_to_playlist(&ctx, &session))
        }
    }
}

async fn attach_existing(ctx: &AppContext, id: &StreamId) -> Result<Response, AppError> {
    let session = ctx
        .transcoder
        .live_session(id)
        .ok_or_else(|| Error::not_found("Stream session", id))?;
    if session.output_mode() == OutputMode::Hls {
        return Ok(redirect_to_playlist(ctx, &session));
    }
    let reader = ctx.transcoder.attach(id).await?;
    Ok(stream_response(reader))
}

fn redirect_to_playlist(ctx: &AppContext, session: &TranscodeSession) -> Response {
    let location = format!(
        "{}/ffmpeg_stream/{}/{}",
        ctx.public_prefix().trim_end_matches('/'),
        session.id(),
        session.playlist_name()
    );
    Redirect::temporary(&location).into_response()
}

/// Stream session output until the client goes away or the session ends.
/// Dropping the body drops the reader, which detaches it.
fn stream_response(reader: SessionReader) -> Response {
    let content_type = reader.session().content_type().to_string();
    (
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        Body::from_stream(reader.into_stream()),
    )
        .into_response()
}

/// Reject anything that could leave the session directory.
fn valid_filename(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

/// `/ffmpeg_stream/{id}/{filename}`: a file from an HLS session's output
/// directory, or the live output of a piped session.
async fn session_file(
    State(ctx): State<AppContext>,
    Path((stream_id, filename)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let id = StreamId::parse(&stream_id).ok_or_else(|| Error::not_found("Stream session", &stream_id))?;
    if !valid_filename(&filename) {
        return Err(Error::validation("Invalid file name").into());
    }
    let session = ctx
        .transcoder
        .live_session(&id)
        .ok_or_else(|| Error::not_found("Stream session", &id))?;

    let Some(dir) = session.output_dir() else {
        let reader = ctx.transcoder.attach(&id).await?;
        return Ok(stream_response(reader));
    };

    let data = match tokio::fs::read(dir.join(&filename)).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::not_found("File", &filename).into());
        }
        Err(e) => return Err(Error::from(e).into()),
    };
    session.touch();

    let (content_type, cache) = if filename.ends_with(".m3u8") {
        ("application/vnd.apple.mpegurl", "no-cache")
    } else {
        (guess_content_type(&filename), "max-age=60")
    };
    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, cache),
        ],
        data,
    )
        .into_response())
}

async fn list_sessions(State(ctx): State<AppContext>) -> Json<Vec<SessionInfo>> {
    let mut sessions: Vec<SessionInfo> = ctx
        .transcoder
        .registry()
        .snapshot()
        .iter()
        .map(|s| s.info())
        .collect();
    sessions.sort_by(|a, b| a.id.cmp(&b.id));
    Json(sessions)
}

async fn stop_session(
    State(ctx): State<AppContext>,
    Path(stream_id): Path<String>,
) -> Result<StatusCode, AppError> {
    let id = StreamId::parse(&stream_id).ok_or_else(|| Error::not_found("Stream session", &stream_id))?;
    if ctx.transcoder.stop(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::not_found("Stream session", &id).into())
    }
}
