//! Proxy token encoding.
//!
//! A token is `base64url(json(StreamRequest)) "." base64url(tag)` where `tag`
//! is the first 16 bytes of HMAC-SHA256 over the encoded payload. Tokens are
//! tamper-evident but not encrypted, and decode without any server state.

use axum::http::{HeaderName, HeaderValue};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use streamgate_common::{DecryptParams, Error, KeySource, Result, StreamRequest, TargetKind};

type HmacSha256 = Hmac<Sha256>;

const TAG_LEN: usize = 16;
const MAX_TOKEN_LEN: usize = 16 * 1024;

/// Encodes and decodes proxy tokens with a shared secret.
#[derive(Clone)]
pub struct TokenCodec {
    mac: HmacSha256,
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec").finish_non_exhaustive()
    }
}

impl TokenCodec {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self> {
        let mac = HmacSha256::new_from_slice(secret.as_ref())
            .map_err(|e| Error::internal(format!("Unusable token secret: {e}")))?;
        Ok(Self { mac })
    }

    /// Codec for the configured secret, or a random one.
    pub fn from_secret(secret: Option<&str>) -> Result<Self> {
        match secret {
            Some(secret) => Self::new(secret),
            None => {
                tracing::warn!(
                    "No token secret configured, generated a random one; proxy URLs will not survive a restart"
                );
                Self::new(generate_secret())
            }
        }
    }

    fn mac(&self) -> HmacSha256 {
        self.mac.clone()
    }

    /// Encode a request. Equal requests always yield equal tokens.
    pub fn encode(&self, request: &StreamRequest) -> Result<String> {
        let json = serde_json::to_vec(request)
            .map_err(|e| Error::internal(format!("Failed to serialize request: {e}")))?;
        let payload = URL_SAFE_NO_PAD.encode(json);

        let mut mac = self.mac();
        mac.update(payload.as_bytes());
        let tag = mac.finalize().into_bytes();

        Ok(format!("{payload}.{}", URL_SAFE_NO_PAD.encode(&tag[..TAG_LEN])))
    }

    /// Decode and validate a token.
    pub fn decode(&self, token: &str) -> Result<StreamRequest> {
        if token.len() > MAX_TOKEN_LEN {
            return Err(Error::token("token too long"));
        }
        let (payload, tag) = token
            .split_once('.')
            .ok_or_else(|| Error::token("missing signature"))?;
        if payload.is_empty() || tag.is_empty() {
            return Err(Error::token("empty token part"));
        }

        let tag = URL_SAFE_NO_PAD
            .decode(tag)
            .map_err(|_| Error::token("signature is not base64url"))?;
        if tag.len() != TAG_LEN {
            return Err(Error::token("signature has wrong length"));
        }
        let mut mac = self.mac();
        mac.update(payload.as_bytes());
        mac.verify_truncated_left(&tag)
            .map_err(|_| Error::token("signature mismatch"))?;

        let json = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| Error::token("payload is not base64url"))?;
        let request: StreamRequest = serde_json::from_slice(&json)
            .map_err(|e| Error::token(format!("payload is not a request: {e}")))?;

        validate_request(&request)?;
        Ok(request)
    }
}

/// Structural checks shared by token decoding and the direct query form.
pub fn validate_request(request: &StreamRequest) -> Result<()> {
    check_http_url(&request.url, "url")?;

    if let Some(decrypt) = &request.decrypt {
        // Key targets may carry an inline key to hand out instead of fetching.
        let allowed = match request.kind {
            TargetKind::Segment | TargetKind::Stream => true,
            TargetKind::Key => matches!(decrypt.key, KeySource::Inline(_)),
            _ => false,
        };
        if !allowed {
            return Err(Error::token(format!(
                "decryption parameters on a {} target",
                request.kind
            )));
        }
        check_decrypt(decrypt)?;
    }

    if request.decrypt_segments && request.kind != TargetKind::Manifest {
        return Err(Error::token("decrypt_segments on a non-manifest target"));
    }

    if let Some(profile) = &request.profile {
        if request.kind != TargetKind::Stream {
            return Err(Error::token("profile on a non-stream target"));
        }
        if profile.is_empty() {
            return Err(Error::token("empty profile"));
        }
    }

    for (name, value) in &request.headers {
        HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| Error::token("invalid header name"))?;
        HeaderValue::from_str(value).map_err(|_| Error::token("invalid header value"))?;
    }

    Ok(())
}

fn check_decrypt(decrypt: &DecryptParams) -> Result<()> {
    match &decrypt.key {
        KeySource::Uri(uri) => check_http_url(uri, "key url")?,
        KeySource::Inline(key) => check_hex16(key, "key")?,
    }
    if let Some(iv) = &decrypt.iv {
        check_hex16(iv, "iv")?;
    }
    Ok(())
}

fn check_http_url(raw: &str, what: &str) -> Result<()> {
    let url = url::Url::parse(raw).map_err(|_| Error::token(format!("{what} is not absolute")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::token(format!("{what} is not http(s)")));
    }
    Ok(())
}

fn check_hex16(raw: &str, what: &str) -> Result<()> {
    if raw.len() != 32 || !raw.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::token(format!("{what} must be 32 hex characters")));
    }
    Ok(())
}

/// Parse a 32-character hex string into 16 bytes.
pub fn hex16(raw: &str) -> Result<[u8; 16]> {
    let mut out = [0u8; 16];
    hex::decode_to_slice(raw, &mut out).map_err(|_| Error::token("expected 32 hex characters"))?;
    Ok(out)
}

/// Generate a random token secret
pub fn generate_secret() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: [u8; 32] = rng.gen();
    hex::encode(bytes)
}
