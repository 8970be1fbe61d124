mod cli;

use streamgate::{
    config,
    proxy_url::proxy_url_for,
    server,
    token::{self, validate_request, TokenCodec},
    StreamRequest, TargetKind,
};

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};

async fn start_server(
    host: Option<String>,
    port: Option<u16>,
    config_path: Option<&std::path::Path>,
) -> Result<()> {
    let mut config = config::load_config_or_default(config_path)?;

    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        auth = config.auth.enabled,
        profiles = config.transcode.profiles.len(),
        "Starting streamgate"
    );

    server::start_server(config).await
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "streamgate=trace,streamgate_manifest=trace,tower_http=debug".to_string()
        } else {
            "streamgate=debug,streamgate_manifest=debug,tower_http=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .init();

    match cli.command {
        Commands::Start { host, port } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(start_server(host, port, cli.config.as_deref()))
        }
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::EncodeToken {
            url,
            kind,
            headers,
            profile,
        } => encode_token(cli.config.as_deref(), &url, &kind, &headers, profile),
        Commands::GenerateSecret => {
            println!("{}", token::generate_secret());
            Ok(())
        }
        Commands::Version => {
            println!("streamgate {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn validate_config(path: Option<&std::path::Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            config::load_config(p)?
        }
        None => {
            println!("No config file specified, checking defaults");
            config::load_config_or_default(None)?
        }
    };

    println!("✓ Configuration is valid");
    println!("  Server: {}:{}", config.server.host, config.server.port);
    if !config.server.public_url.is_empty() {
        println!("  Public URL: {}", config.server.public_url);
    }
    println!("  Auth enabled: {}", config.auth.enabled);
    println!(
        "  Token secret: {}",
        if config.token.secret.is_some() { "configured" } else { "random per run" }
    );
    println!("  Transcoder: {}", config.transcode.executable.display());
    for profile in &config.transcode.profiles {
        let marker = if profile.name == config.transcode.default_profile { " (default)" } else { "" };
        println!("    {} [{:?}]{}", profile.name, profile.output, marker);
    }

    Ok(())
}

fn encode_token(
    config_path: Option<&std::path::Path>,
    url: &str,
    kind: &str,
    headers: &[String],
    profile: Option<String>,
) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;
    if config.token.secret.is_none() {
        anyhow::bail!(
            "No token secret configured; a token from a random secret would never validate (set {})",
            config::TOKEN_SECRET_ENV
        );
    }
    let codec = TokenCodec::from_secret(config.token.secret.as_deref())?;

    let kind = TargetKind::parse(kind).with_context(|| format!("Unknown kind '{kind}'"))?;
    let mut request = StreamRequest::new(kind, url);
    for header in headers {
        let (name, value) = header
            .split_once(':')
            .with_context(|| format!("Header must look like 'Name: value': {header}"))?;
        request = request.with_header(name.trim(), value.trim());
    }
    if let Some(profile) = profile {
        request = request.with_profile(profile);
    }
    validate_request(&request)?;

    println!(
        "{}",
        proxy_url_for(&codec, &config.server.public_url, &request, None)?
    );
    Ok(())
}
