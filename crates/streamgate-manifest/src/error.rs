//! Error types for streamgate-manifest.

use thiserror::Error;

/// Result type for manifest operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for manifest operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Content is neither an HLS playlist nor a DASH MPD.
    #[error("Content is not a recognizable HLS or DASH manifest")]
    NotAManifest,

    /// Manifest bytes are not valid UTF-8.
    #[error("Manifest is not valid UTF-8")]
    InvalidUtf8,

    /// The MPD is not well-formed XML.
    #[error("XML error at byte {position}: {message}")]
    Xml { position: usize, message: String },

    /// A URI in the manifest could not be resolved against its base.
    #[error("Unresolvable URI {uri:?}: {reason}")]
    InvalidUri { uri: String, reason: String },

    /// A tag attribute has an unusable value.
    #[error("Invalid {tag} attribute: {reason}")]
    InvalidAttribute { tag: String, reason: String },

    /// The tokenizer refused a target.
    #[error("Failed to build proxy URL: {0}")]
    Tokenize(String),
}

impl Error {
    /// Create an invalid attribute error.
    pub fn invalid_attribute(tag: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAttribute {
            tag: tag.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn xml(position: usize, err: impl std::fmt::Display) -> Self {
        Self::Xml {
            position,
            message: err.to_string(),
        }
    }
}

impl From<Error> for streamgate_common::Error {
    fn from(err: Error) -> Self {
        streamgate_common::Error::ManifestParse(err.to_string())
    }
}
