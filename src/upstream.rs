//! HTTP client for origin requests.
//!
//! Wraps a shared `reqwest::Client` with the configured connect timeout,
//! redirect limit and user agent, and maps transport failures onto the
//! proxy's error taxonomy. Manifest, key and license fetches are bounded by a
//! whole-request timeout; streamed bodies get a per-chunk timeout instead, so
//! long segments are fine as long as bytes keep flowing.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::redirect::Policy;
use std::time::Duration;
use streamgate_common::{Error, Result};
use url::Url;

use crate::config::UpstreamConfig;

/// Extra request headers as `(name, value)` pairs.
pub type HeaderList = Vec<(String, String)>;

/// A fully buffered origin response.
#[derive(Debug, Clone)]
pub struct Fetched {
    /// URL the body was served from, after redirects.
    pub final_url: Url,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// An origin response whose body is still to be read.
pub struct UpstreamStream {
    pub final_url: Url,
    pub status: u16,
    /// Response headers worth relaying to the client.
    pub headers: Vec<(&'static str, String)>,
    response: reqwest::Response,
    read_timeout: Duration,
}

/// Response headers copied onto relayed segment responses.
const RELAYED_HEADERS: [&str; 6] = [
    "content-type",
    "content-length",
    "content-range",
    "accept-ranges",
    "last-modified",
    "etag",
];

impl UpstreamStream {
    /// Body chunks, each bounded by the read timeout.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes>> + Send + 'static {
        let url = self.final_url.to_string();
        let read_timeout = self.read_timeout;
        let mut body = Box::pin(self.response.bytes_stream());
        async_stream::try_stream! {
            loop {
                let next = tokio::time::timeout(read_timeout, body.next())
                    .await
                    .map_err(|_| Error::UpstreamTimeout { url: url.clone() })?;
                match next {
                    Some(chunk) => {
                        yield chunk.map_err(|e| map_transport_error(e, &url))?;
                    }
                    None => break,
                }
            }
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }
}

impl std::fmt::Debug for UpstreamStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamStream")
            .field("final_url", &self.final_url.as_str())
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Client for all origin traffic.
#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    read_timeout: Duration,
    passthrough_status: bool,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .redirect(Policy::limited(config.max_redirects))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| Error::internal(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            read_timeout: config.read_timeout(),
            passthrough_status: config.passthrough_status,
        })
    }

    fn request(
        &self,
        method: reqwest::Method,
        url: &str,
        headers: &[(String, String)],
    ) -> reqwest::RequestBuilder {
        headers
            .iter()
            .fold(self.client.request(method, url), |req, (name, value)| {
                req.header(name.as_str(), value.as_str())
            })
    }

    fn check_status(&self, response: &reqwest::Response, url: &str) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(Error::Upstream {
            status: status.as_u16(),
            url: url.to_string(),
            relay_status: self.passthrough_status,
        })
    }

    /// GET `url` and buffer the body (manifests, keys, diagnostics).
    pub async fn fetch(&self, url: &str, headers: &[(String, String)]) -> Result<Fetched> {
        self.buffered(self.request(reqwest::Method::GET, url, headers), url)
            .await
    }

    /// Forward a request with an opaque body (license relay).
    pub async fn forward(
        &self,
        method: reqwest::Method,
        url: &str,
        headers: &[(String, String)],
        body: Bytes,
    ) -> Result<Fetched> {
        let mut request = self.request(method, url, headers);
        if !body.is_empty() {
            request = request.body(body);
        }
        self.buffered(request, url).await
    }

    async fn buffered(&self, request: reqwest::RequestBuilder, url: &str) -> Result<Fetched> {
        let read_timeout = self.read_timeout;
        let fetch = async {
            let response = request
                .send()
                .await
                .map_err(|e| map_transport_error(e, url))?;
            self.check_status(&response, url)?;

            let final_url = response.url().clone();
            let status = response.status().as_u16();
            let content_type = header_string(&response, "content-type");
            let body = response
                .bytes()
                .await
                .map_err(|e| map_transport_error(e, url))?;
            Ok(Fetched {
                final_url,
                status,
                content_type,
                body,
            })
        };
        tokio::time::timeout(read_timeout, fetch)
            .await
            .map_err(|_| Error::UpstreamTimeout {
                url: url.to_string(),
            })?
    }

    /// GET `url` and hand back the unread body (segments, raw streams).
    pub async fn open(&self, url: &str, headers: &[(String, String)]) -> Result<UpstreamStream> {
        let request = self.request(reqwest::Method::GET, url, headers);
        let response = tokio::time::timeout(self.read_timeout, request.send())
            .await
            .map_err(|_| Error::UpstreamTimeout {
                url: url.to_string(),
            })?
            .map_err(|e| map_transport_error(e, url))?;
        self.check_status(&response, url)?;

        let relayed = RELAYED_HEADERS
            .iter()
            .filter_map(|name| header_string(&response, name).map(|v| (*name, v)))
            .collect();

        Ok(UpstreamStream {
            final_url: response.url().clone(),
            status: response.status().as_u16(),
            headers: relayed,
            response,
            read_timeout: self.read_timeout,
        })
    }
}

impl std::fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamClient")
            .field("read_timeout", &self.read_timeout)
            .field("passthrough_status", &self.passthrough_status)
            .finish_non_exhaustive()
    }
}

fn header_string(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn map_transport_error(err: reqwest::Error, url: &str) -> Error {
    if err.is_timeout() {
        Error::UpstreamTimeout {
            url: url.to_string(),
        }
    } else if err.is_redirect() {
        Error::TooManyRedirects {
            url: url.to_string(),
        }
    } else {
        Error::UpstreamConnect {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}
