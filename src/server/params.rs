//! Query parameters shared by the proxy endpoints.
//!
//! A request is described either by `token=<proxy token>` or by the direct
//! form `d=<url>&h_<header>=<value>&key=<hex>&key_url=<url>&iv=<hex>&profile=<name>`,
//! which is validated exactly like a decoded token.

use streamgate_common::{DecryptParams, Error, Result, StreamId, StreamRequest, TargetKind};

use crate::token::{validate_request, TokenCodec};

/// Parsed proxy query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyParams {
    /// The request, if a token or direct URL was supplied.
    pub request: Option<StreamRequest>,
    /// Unresolved DASH segment template (`tpl`).
    pub template: Option<String>,
    /// Existing session to attach to (`id`).
    pub stream_id: Option<StreamId>,
}

impl ProxyParams {
    /// Parse `query` for an endpoint accepting `accepted` target kinds. The
    /// direct form builds a request of the first accepted kind.
    pub fn parse(query: Option<&str>, codec: &TokenCodec, accepted: &[TargetKind]) -> Result<Self> {
        let mut token = None;
        let mut direct = None;
        let mut key = None;
        let mut key_url = None;
        let mut iv = None;
        let mut profile = None;
        let mut decrypt_segments = false;
        let mut template = None;
        let mut stream_id = None;
        let mut headers = Vec::new();

        for (name, value) in url::form_urlencoded::parse(query.unwrap_or("").as_bytes()) {
            match name.as_ref() {
                "token" => token = Some(value.into_owned()),
                "d" | "url" => direct = Some(value.into_owned()),
                "key" => key = Some(value.into_owned()),
                "key_url" => key_url = Some(value.into_owned()),
                "iv" => iv = Some(value.into_owned()),
                "profile" => profile = Some(value.into_owned()),
                "decrypt" => decrypt_segments = matches!(value.as_ref(), "1" | "true"),
                "tpl" => template = Some(value.into_owned()),
                "id" => {
                    stream_id = Some(
                        StreamId::parse(&value)
                            .ok_or_else(|| Error::validation("Invalid stream id"))?,
                    )
                }
                other => {
                    if let Some(header) = other.strip_prefix("h_") {
                        headers.push((header.replace('_', "-"), value.into_owned()));
                    }
                }
            }
        }

        let request = match (token, direct) {
            (Some(token), _) => {
                let request = codec.decode(&token)?;
                if !accepted.contains(&request.kind) {
                    return Err(Error::token(format!(
                        "{} token used on the wrong endpoint",
                        request.kind
                    )));
                }
                Some(request)
            }
            (None, Some(url)) => {
                let kind = accepted
                    .first()
                    .copied()
                    .ok_or_else(|| Error::internal("endpoint accepts no target kind"))?;
                let mut request = StreamRequest::new(kind, url);
                for (name, value) in headers {
                    request = request.with_header(name, value);
                }
                let decrypt = match (key, key_url) {
                    (Some(key), _) => Some(DecryptParams::inline_key(key)),
                    (None, Some(uri)) => Some(DecryptParams::key_uri(uri)),
                    (None, None) => None,
                };
                if let Some(mut decrypt) = decrypt {
                    decrypt.iv = iv.map(|iv| iv.trim_start_matches("0x").to_string());
                    request = request.with_decrypt(decrypt);
                }
                if let Some(profile) = profile {
                    request = request.with_profile(profile);
                }
                request.decrypt_segments = decrypt_segments;
                validate_request(&request)?;
                Some(request)
            }
            (None, None) => None,
        };

        Ok(Self {
            request,
            template,
            stream_id,
        })
    }

    /// The request, or a 400 when neither a token nor a URL was given.
    pub fn require_request(self) -> Result<(StreamRequest, Option<String>)> {
        match self.request {
            Some(request) => Ok((request, self.template)),
            None => Err(Error::token("missing token")),
        }
    }
}
