//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`], which builds a full [`AppContext`] from a test
//! config and serves the router on a random port. The public URL is set to
//! the bound address, so proxy URLs found in rewritten manifests can be
//! requested directly.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;

use streamgate::config::Config;
use streamgate::proxy_url::proxy_url_for;
use streamgate::server::{create_router, AppContext};
use streamgate::StreamRequest;
use tempfile::TempDir;

pub const TEST_SECRET: &str = "integration-test-secret-0123456789";

/// Config with a fixed token secret and a private transcode output root.
pub fn test_config(output_root: PathBuf) -> Config {
    let mut config = Config::default();
    config.token.secret = Some(TEST_SECRET.to_string());
    config.transcode.output_root = output_root;
    config.upstream.read_timeout_secs = 5;
    config
}

/// A running proxy with its context.
pub struct TestHarness {
    pub ctx: AppContext,
    pub addr: SocketAddr,
    pub client: reqwest::Client,
    _dir: TempDir,
}

impl TestHarness {
    /// Start a server with the default test configuration.
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    /// Start a server after letting `customize` adjust the test config.
    pub async fn start_with(customize: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind random port");
        let addr = listener.local_addr().expect("failed to get local addr");

        let mut config = test_config(dir.path().join("sessions"));
        config.server.public_url = format!("http://{addr}");
        customize(&mut config);

        let ctx = AppContext::new(config).expect("failed to build app context");
        let app = create_router(ctx.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("failed to build client");

        Self {
            ctx,
            addr,
            client,
            _dir: dir,
        }
    }

    /// Absolute URL for a path on the proxy.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Proxy URL carrying a token for `request`.
    pub fn proxy_url(&self, request: &StreamRequest) -> String {
        proxy_url_for(
            &self.ctx.codec,
            self.ctx.public_prefix(),
            request,
            None,
        )
        .expect("failed to encode token")
    }

    pub async fn get(&self, url: &str) -> reqwest::Response {
        self.client.get(url).send().await.expect("request failed")
    }
}

/// Proxy URLs found on non-comment lines and in `URI="..."` attributes of a
/// rewritten playlist.
pub fn playlist_urls(body: &str) -> Vec<String> {
    let mut urls = Vec::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(start) = line.find("URI=\"") {
            let rest = &line[start + 5..];
            if let Some(end) = rest.find('"') {
                urls.push(rest[..end].to_string());
            }
        } else if !line.starts_with('#') {
            urls.push(line.to_string());
        }
    }
    urls
}

/// Write an executable shell script standing in for the transcoder.
#[cfg(unix)]
pub fn fake_transcoder(dir: &std::path::Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("fake-transcoder.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("failed to write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("failed to chmod script");
    path
}
