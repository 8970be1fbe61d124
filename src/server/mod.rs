use crate::config::Config;
use crate::recorder::RecordingSink;
use crate::token::TokenCodec;
use crate::transcode::{start_cleanup_task, ProcessManager};
use crate::upstream::{HeaderList, UpstreamClient};
use anyhow::{Context, Result};
use axum::{
    http::{header, HeaderMap, Method, StatusCode},
    middleware,
    response::IntoResponse,
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use streamgate_common::StreamRequest;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub mod auth;
pub mod error;
pub mod params;
pub mod routes_drm;
pub mod routes_manifest;
pub mod routes_segment;
pub mod routes_stream;
pub mod routes_tools;

pub use error::AppError;

/// Shared application context
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub codec: Arc<TokenCodec>,
    pub upstream: UpstreamClient,
    pub transcoder: Arc<ProcessManager>,
}

impl AppContext {
    /// Build the context from a validated config.
    pub fn new(config: Config) -> Result<Self> {
        let codec = TokenCodec::from_secret(config.token.secret.as_deref())?;
        let upstream = UpstreamClient::new(&config.upstream)?;
        let transcoder =
            ProcessManager::new(config.transcode.clone(), config.upstream.user_agent.clone());
        Ok(Self {
            config: Arc::new(config),
            codec: Arc::new(codec),
            upstream,
            transcoder: Arc::new(transcoder),
        })
    }

    /// Same as [`AppContext::new`], with a recorder attached to every session.
    pub fn with_recorder(config: Config, recorder: Arc<dyn RecordingSink>) -> Result<Self> {
        let mut ctx = Self::new(config)?;
        let transcoder = ProcessManager::new(
            ctx.config.transcode.clone(),
            ctx.config.upstream.user_agent.clone(),
        )
        .with_recorder(recorder);
        ctx.transcoder = Arc::new(transcoder);
        Ok(ctx)
    }

    /// Prefix for proxy URLs written into responses.
    pub fn public_prefix(&self) -> &str {
        &self.config.server.public_url
    }

    /// Headers for an origin request: the token's headers, plus the
    /// configured client headers when `client` is given.
    pub fn upstream_headers(&self, request: &StreamRequest, client: Option<&HeaderMap>) -> HeaderList {
        let mut headers: HeaderList = request
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        if let Some(client) = client {
            for name in &self.config.upstream.forward_headers {
                if headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name)) {
                    continue;
                }
                if let Some(value) = client.get(name.as_str()).and_then(|v| v.to_str().ok()) {
                    headers.push((name.clone(), value.to_string()));
                }
            }
        }
        headers
    }

    /// Headers for a fetch whose body is used whole (manifests, keys): like
    /// [`AppContext::upstream_headers`] with the client's headers, minus any
    /// range headers.
    pub fn whole_body_headers(&self, request: &StreamRequest, client: &HeaderMap) -> HeaderList {
        let mut headers = self.upstream_headers(request, Some(client));
        headers.retain(|(name, _)| {
            !name.eq_ignore_ascii_case("range") && !name.eq_ignore_ascii_case("if-range")
        });
        headers
    }
}

/// Create the Axum router with all routes
pub fn create_router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::RANGE]);

    let proxied = Router::new()
        .merge(routes_manifest::manifest_routes())
        .merge(routes_segment::segment_routes())
        .merge(routes_drm::drm_routes())
        .merge(routes_stream::stream_routes())
        .merge(routes_tools::tools_routes());

    // Apply auth middleware only if enabled
    let proxied = if ctx.config.auth.enabled {
        proxied.layer(middleware::from_fn_with_state(
            ctx.clone(),
            auth::basic_auth_middleware,
        ))
    } else {
        proxied
    };

    Router::new()
        .route("/health", get(health_check))
        .merge(proxied)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

/// Start the HTTP server and the session cleanup task; on shutdown, stop
/// every transcode session before returning.
pub async fn start_server(config: Config) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;

    let ctx = AppContext::new(config)?;
    let cancel = CancellationToken::new();
    let cleanup = start_cleanup_task(Arc::clone(&ctx.transcoder), cancel.clone());

    let app = create_router(ctx);

    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    if let Err(e) = cleanup.await {
        tracing::error!("Session cleanup task failed: {}", e);
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => {
                tracing::error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
