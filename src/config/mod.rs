mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Environment variable holding the Basic-Auth password
pub const PASSWORD_ENV: &str = "PROXY_PASSWORD";

/// Environment variable holding the token secret
pub const TOKEN_SECRET_ENV: &str = "STREAMGATE_TOKEN_SECRET";

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let mut config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    apply_env_overrides(&mut config);
    validate_config(&config)?;

    Ok(config)
}

/// Load config from default locations or return default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    // Try default locations
    let default_paths = [
        "./streamgate.toml",
        "~/.config/streamgate/config.toml",
        "/etc/streamgate/config.toml",
    ];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            return load_config(path);
        }
    }

    let mut config = Config::default();
    apply_env_overrides(&mut config);
    validate_config(&config)?;
    Ok(config)
}

/// Apply `PROXY_PASSWORD` and `STREAMGATE_TOKEN_SECRET`.
///
/// A password from the environment also switches the auth gate on.
pub fn apply_env_overrides(config: &mut Config) {
    if let Some(password) = non_empty_env(PASSWORD_ENV) {
        config.auth.password = Some(password);
        config.auth.enabled = true;
    }
    if let Some(secret) = non_empty_env(TOKEN_SECRET_ENV) {
        config.token.secret = Some(secret);
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    if config.server.port == 0 {
        anyhow::bail!("Server port cannot be 0");
    }

    if !config.server.public_url.is_empty() {
        let url = url::Url::parse(&config.server.public_url)
            .with_context(|| format!("Invalid public_url: {}", config.server.public_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("public_url must be an http(s) URL");
        }
    }

    if config.auth.enabled && config.auth.password.as_deref().unwrap_or("").is_empty() {
        anyhow::bail!("Auth is enabled but no password is set (use {})", PASSWORD_ENV);
    }

    if let Some(secret) = &config.token.secret {
        if secret.len() < 16 {
            anyhow::bail!("Token secret must be at least 16 characters");
        }
    }

    let upstream = &config.upstream;
    if upstream.connect_timeout_secs == 0 || upstream.read_timeout_secs == 0 {
        anyhow::bail!("Upstream timeouts must be greater than 0");
    }
    url::Url::parse(&upstream.ip_lookup_url)
        .with_context(|| format!("Invalid ip_lookup_url: {}", upstream.ip_lookup_url))?;

    let transcode = &config.transcode;
    if transcode.sweep_interval_secs == 0 {
        anyhow::bail!("Transcode sweep interval must be greater than 0");
    }
    if transcode.idle_timeout_secs == 0 || transcode.start_timeout_secs == 0 {
        anyhow::bail!("Transcode idle and start timeouts must be greater than 0");
    }
    if transcode.max_runtime_secs < transcode.idle_timeout_secs {
        anyhow::bail!("Transcode max runtime cannot be shorter than the idle timeout");
    }
    if transcode.channel_capacity == 0 {
        anyhow::bail!("Transcode channel capacity must be greater than 0");
    }

    for (i, profile) in transcode.profiles.iter().enumerate() {
        if profile.name.is_empty() {
            anyhow::bail!("Transcode profile #{} has no name", i + 1);
        }
        if transcode.profiles[..i].iter().any(|p| p.name == profile.name) {
            anyhow::bail!("Duplicate transcode profile '{}'", profile.name);
        }
        if !profile.args.iter().any(|a| a.contains("{input}")) {
            anyhow::bail!("Transcode profile '{}' never references {{input}}", profile.name);
        }
        if profile.output == OutputMode::Hls && !profile.args.iter().any(|a| a.contains("{output_dir}")) {
            anyhow::bail!(
                "Transcode profile '{}' writes HLS but never references {{output_dir}}",
                profile.name
            );
        }
        if profile.playlist_name.contains('/') || profile.playlist_name.contains("..") {
            anyhow::bail!("Transcode profile '{}' has an invalid playlist name", profile.name);
        }
    }

    if !transcode.profiles.is_empty() && transcode.profile(&transcode.default_profile).is_none() {
        anyhow::bail!(
            "Default transcode profile '{}' is not defined",
            transcode.default_profile
        );
    }

    Ok(())
}
