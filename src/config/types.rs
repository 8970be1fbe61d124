use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub token: TokenConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub transcode: TranscodeConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Prefix for proxy URLs written into manifests (e.g. `https://proxy.example`).
    /// Empty means host-relative URLs (`/proxy/...`).
    #[serde(default)]
    pub public_url: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_url: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Require HTTP Basic credentials on every route except `/health`
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_username")]
    pub username: String,

    /// Shared password (overridden by `PROXY_PASSWORD`)
    #[serde(default)]
    pub password: Option<String>,
}

fn default_username() -> String {
    "user".to_string()
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            username: default_username(),
            password: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TokenConfig {
    /// HMAC secret for proxy tokens (overridden by `STREAMGATE_TOKEN_SECRET`).
    /// Generated at startup when unset.
    #[serde(default)]
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Whole-request timeout for manifests, keys and licenses; per-chunk
    /// timeout for segment and stream bodies
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Client request headers copied to upstream requests
    #[serde(default = "default_forward_headers")]
    pub forward_headers: Vec<String>,

    /// Relay upstream 4xx/5xx statuses as-is instead of answering 502
    #[serde(default = "default_passthrough_status")]
    pub passthrough_status: bool,

    /// IP echo service used by `/proxy/ip`
    #[serde(default = "default_ip_lookup_url")]
    pub ip_lookup_url: String,
}

fn default_connect_timeout() -> u64 {
    5
}
fn default_read_timeout() -> u64 {
    20
}
fn default_max_redirects() -> usize {
    5
}
fn default_user_agent() -> String {
    format!("streamgate/{}", env!("CARGO_PKG_VERSION"))
}
fn default_forward_headers() -> Vec<String> {
    vec!["range".to_string(), "if-range".to_string()]
}
fn default_passthrough_status() -> bool {
    true
}
fn default_ip_lookup_url() -> String {
    "https://api.ipify.org?format=json".to_string()
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            max_redirects: default_max_redirects(),
            user_agent: default_user_agent(),
            forward_headers: default_forward_headers(),
            passthrough_status: default_passthrough_status(),
            ip_lookup_url: default_ip_lookup_url(),
        }
    }
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TranscodeConfig {
    /// Transcoder executable
    #[serde(default = "default_executable")]
    pub executable: PathBuf,

    /// Stop sessions with no readers after this long
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Stop any session after this long, readers or not
    #[serde(default = "default_max_runtime")]
    pub max_runtime_secs: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// How long a request waits for a new session's first output
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,

    /// Time between SIGTERM and a forced kill
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,

    /// Parent directory of per-session HLS output directories
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,

    /// Output chunks buffered per session before slow readers are dropped
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    #[serde(default = "default_profile_name")]
    pub default_profile: String,

    #[serde(default = "default_profiles")]
    pub profiles: Vec<TranscodeProfile>,
}

fn default_executable() -> PathBuf {
    PathBuf::from("ffmpeg")
}
fn default_idle_timeout() -> u64 {
    30
}
fn default_max_runtime() -> u64 {
    6 * 60 * 60
}
fn default_sweep_interval() -> u64 {
    10
}
fn default_start_timeout() -> u64 {
    20
}
fn default_stop_grace() -> u64 {
    5
}
fn default_output_root() -> PathBuf {
    std::env::temp_dir().join("streamgate")
}
fn default_channel_capacity() -> usize {
    256
}
fn default_profile_name() -> String {
    "default".to_string()
}

fn default_profiles() -> Vec<TranscodeProfile> {
    let input: Vec<String> = [
        "-hide_banner",
        "-loglevel",
        "warning",
        "{headers}",
        "-user_agent",
        "{user_agent}",
        "-i",
        "{input}",
        "-c",
        "copy",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    let mut pipe_args = input.clone();
    pipe_args.extend(["-f", "mpegts", "pipe:1"].iter().map(|s| s.to_string()));

    let mut hls_args = input;
    hls_args.extend(
        [
            "-f",
            "hls",
            "-hls_time",
            "4",
            "-hls_list_size",
            "6",
            "-hls_flags",
            "delete_segments",
            "{output_dir}/index.m3u8",
        ]
        .iter()
        .map(|s| s.to_string()),
    );

    vec![
        TranscodeProfile {
            name: "default".to_string(),
            args: pipe_args,
            output: OutputMode::Pipe,
            content_type: default_content_type(),
            playlist_name: default_playlist_name(),
        },
        TranscodeProfile {
            name: "hls".to_string(),
            args: hls_args,
            output: OutputMode::Hls,
            content_type: "application/vnd.apple.mpegurl".to_string(),
            playlist_name: default_playlist_name(),
        },
    ]
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            idle_timeout_secs: default_idle_timeout(),
            max_runtime_secs: default_max_runtime(),
            sweep_interval_secs: default_sweep_interval(),
            start_timeout_secs: default_start_timeout(),
            stop_grace_secs: default_stop_grace(),
            output_root: default_output_root(),
            channel_capacity: default_channel_capacity(),
            default_profile: default_profile_name(),
            profiles: default_profiles(),
        }
    }
}

impl TranscodeConfig {
    pub fn profile(&self, name: &str) -> Option<&TranscodeProfile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn max_runtime(&self) -> Duration {
        Duration::from_secs(self.max_runtime_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

/// A named transcoder invocation.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TranscodeProfile {
    pub name: String,

    /// Argument template. `{input}`, `{output_dir}`, `{stream_id}` and
    /// `{user_agent}` are substituted; an argument that is exactly
    /// `{headers}` expands to `-headers <lines>` or disappears.
    pub args: Vec<String>,

    #[serde(default)]
    pub output: OutputMode,

    /// Content type of piped output
    #[serde(default = "default_content_type")]
    pub content_type: String,

    /// Playlist file written into the output directory in `hls` mode
    #[serde(default = "default_playlist_name")]
    pub playlist_name: String,
}

fn default_content_type() -> String {
    "video/mp2t".to_string()
}
fn default_playlist_name() -> String {
    "index.m3u8".to_string()
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Transcoder writes the stream to stdout
    #[default]
    Pipe,
    /// Transcoder writes an HLS playlist and segments into the session directory
    Hls,
}
