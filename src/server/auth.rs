//! HTTP Basic authentication gate.

use crate::config::AuthConfig;
use crate::server::AppContext;
use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::{
    headers::{authorization::Basic, Authorization},
    typed_header::{TypedHeader, TypedHeaderRejection},
};
use sha2::{Digest, Sha256};

use super::error::ErrorBody;

const REALM: &str = r#"Basic realm="streamgate""#;

/// Outcome of checking a request's credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthFailure {
    Missing,
    Malformed,
    Wrong,
}

fn check_credentials(
    auth_config: &AuthConfig,
    header: Result<TypedHeader<Authorization<Basic>>, TypedHeaderRejection>,
) -> Result<(), AuthFailure> {
    let TypedHeader(Authorization(basic)) = match header {
        Ok(header) => header,
        Err(rejection) if rejection.is_missing() => return Err(AuthFailure::Missing),
        Err(_) => return Err(AuthFailure::Malformed),
    };

    let expected_password = auth_config.password.as_deref().unwrap_or("");
    let user_ok = digest_eq(basic.username(), &auth_config.username);
    let password_ok = digest_eq(basic.password(), expected_password);
    if user_ok && password_ok && !expected_password.is_empty() {
        Ok(())
    } else {
        Err(AuthFailure::Wrong)
    }
}

/// Compare digests so the comparison time does not depend on where the
/// inputs first differ.
fn digest_eq(a: &str, b: &str) -> bool {
    let a = Sha256::digest(a.as_bytes());
    let b = Sha256::digest(b.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn reject(failure: AuthFailure) -> Response {
    let (status, error, message) = match failure {
        AuthFailure::Missing => (StatusCode::UNAUTHORIZED, "unauthorized", "Authentication required"),
        AuthFailure::Malformed => (
            StatusCode::BAD_REQUEST,
            "bad_authorization",
            "Malformed Authorization header",
        ),
        AuthFailure::Wrong => (StatusCode::FORBIDDEN, "forbidden", "Invalid credentials"),
    };
    let body = Json(ErrorBody {
        error,
        message: message.to_string(),
    });
    if status == StatusCode::UNAUTHORIZED {
        (status, [(header::WWW_AUTHENTICATE, REALM)], body).into_response()
    } else {
        (status, body).into_response()
    }
}

/// Middleware enforcing Basic credentials on the proxy routes.
pub async fn basic_auth_middleware(
    State(ctx): State<AppContext>,
    credentials: Result<TypedHeader<Authorization<Basic>>, TypedHeaderRejection>,
    request: Request<Body>,
    next: Next,
) -> Response {
    match check_credentials(&ctx.config.auth, credentials) {
        Ok(()) => next.run(request).await,
        Err(failure) => {
            tracing::debug!(?failure, path = %request.uri().path(), "Rejected request");
            reject(failure)
        }
    }
}
