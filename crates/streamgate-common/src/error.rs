//! Error taxonomy shared by every streamgate component.
//!
//! Each variant knows the HTTP status it surfaces as ([`Error::http_status`])
//! and a public message that never carries URLs, tokens, key bytes or file
//! paths ([`Error::public_message`]). The `Display` output is meant for logs.

use std::fmt;

/// Unified error type for the proxy engine and process manager.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A proxy token (or its direct-query equivalent) was malformed.
    #[error("Invalid token: {0}")]
    Token(String),

    /// The upstream body is neither an HLS playlist nor a DASH MPD.
    #[error("Manifest parse error: {0}")]
    ManifestParse(String),

    /// The origin answered with a non-success status.
    #[error("Upstream returned {status} for {url}")]
    Upstream {
        /// Status returned by the origin.
        status: u16,
        /// Origin URL that was requested.
        url: String,
        /// Whether the origin status is relayed to the client as-is.
        relay_status: bool,
    },

    /// The origin did not answer within the configured timeout.
    #[error("Upstream timed out: {url}")]
    UpstreamTimeout {
        /// Origin URL that was requested.
        url: String,
    },

    /// The origin could not be reached at all.
    #[error("Upstream connection failed for {url}: {message}")]
    UpstreamConnect {
        /// Origin URL that was requested.
        url: String,
        /// Transport error description.
        message: String,
    },

    /// The origin redirected more often than allowed.
    #[error("Too many redirects: {url}")]
    TooManyRedirects {
        /// Origin URL that was requested.
        url: String,
    },

    /// The transcoder executable could not be launched.
    #[error("Failed to spawn transcoder: {0}")]
    Spawn(String),

    /// A transcode session did not produce output in time.
    #[error("Transcode session {stream_id} did not start in time")]
    StartTimeout {
        /// Identifier of the session that timed out.
        stream_id: String,
    },

    /// Decryption failed (bad key, IV or padding).
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "session", "file").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// Request data failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map this error to an HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Token(_) => 400,
            Error::ManifestParse(_) => 502,
            Error::Upstream {
                status,
                relay_status,
                ..
            } => {
                if *relay_status && (400..=599).contains(status) {
                    *status
                } else {
                    502
                }
            }
            Error::UpstreamTimeout { .. } => 504,
            Error::UpstreamConnect { .. } => 502,
            Error::TooManyRedirects { .. } => 502,
            Error::Spawn(_) => 502,
            Error::StartTimeout { .. } => 504,
            Error::Decryption(_) => 502,
            Error::NotFound { .. } => 404,
            Error::Validation(_) => 400,
            Error::Io { .. } => 500,
            Error::Internal(_) => 500,
        }
    }

    /// Short machine-readable code for response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Token(_) => "invalid_token",
            Error::ManifestParse(_) => "manifest_parse_error",
            Error::Upstream { .. } => "upstream_error",
            Error::UpstreamTimeout { .. } => "upstream_timeout",
            Error::UpstreamConnect { .. } => "upstream_unreachable",
            Error::TooManyRedirects { .. } => "too_many_redirects",
            Error::Spawn(_) => "spawn_error",
            Error::StartTimeout { .. } => "start_timeout",
            Error::Decryption(_) => "decryption_error",
            Error::NotFound { .. } => "not_found",
            Error::Validation(_) => "validation_error",
            Error::Io { .. } => "io_error",
            Error::Internal(_) => "internal_error",
        }
    }

    /// Client-facing description. Contains no URLs, tokens, keys or paths.
    pub fn public_message(&self) -> String {
        match self {
            Error::Token(_) => "Malformed or tampered proxy token".to_string(),
            Error::ManifestParse(_) => "Upstream content is not a recognizable manifest".to_string(),
            Error::Upstream { status, .. } => format!("Upstream responded with status {status}"),
            Error::UpstreamTimeout { .. } => "Upstream did not respond in time".to_string(),
            Error::UpstreamConnect { .. } => "Upstream could not be reached".to_string(),
            Error::TooManyRedirects { .. } => "Upstream redirected too many times".to_string(),
            Error::Spawn(_) => "Transcoder could not be started".to_string(),
            Error::StartTimeout { .. } => "Transcoder did not produce output in time".to_string(),
            Error::Decryption(_) => "Segment could not be decrypted".to_string(),
            Error::NotFound { entity, .. } => format!("{entity} not found"),
            Error::Validation(msg) => msg.clone(),
            Error::Io { .. } | Error::Internal(_) => "Internal server error".to_string(),
        }
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Token`].
    pub fn token(msg: impl Into<String>) -> Self {
        Error::Token(msg.into())
    }

    /// Convenience constructor for [`Error::Decryption`].
    pub fn decryption(msg: impl Into<String>) -> Self {
        Error::Decryption(msg.into())
    }

    /// Convenience constructor for [`Error::Validation`].
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Convenience constructor for [`Error::Internal`].
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }
}

/// Result type alias using the common Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_error_is_bad_request() {
        assert_eq!(Error::token("truncated").http_status(), 400);
    }

    #[test]
    fn upstream_status_relayed_when_enabled() {
        let err = Error::Upstream {
            status: 404,
            url: "https://origin.example/a.m3u8".into(),
            relay_status: true,
        };
        assert_eq!(err.http_status(), 404);
    }

    #[test]
    fn upstream_status_masked_when_disabled() {
        let err = Error::Upstream {
            status: 404,
            url: "https://origin.example/a.m3u8".into(),
            relay_status: false,
        };
        assert_eq!(err.http_status(), 502);
    }

    #[test]
    fn upstream_success_status_never_relayed() {
        let err = Error::Upstream {
            status: 304,
            url: "https://origin.example/a.m3u8".into(),
            relay_status: true,
        };
        assert_eq!(err.http_status(), 502);
    }

    #[test]
    fn timeouts_are_gateway_timeouts() {
        assert_eq!(
            Error::UpstreamTimeout { url: "u".into() }.http_status(),
            504
        );
        assert_eq!(
            Error::StartTimeout { stream_id: "abc".into() }.http_status(),
            504
        );
    }

    #[test]
    fn public_message_hides_url() {
        let err = Error::Upstream {
            status: 500,
            url: "https://secret-origin.example/path?token=abc".into(),
            relay_status: true,
        };
        let msg = err.public_message();
        assert!(!msg.contains("secret-origin"));
        assert!(!msg.contains("token"));
        assert!(err.to_string().contains("secret-origin"));
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::Io { .. }));
        assert_eq!(err.http_status(), 500);
    }
}
