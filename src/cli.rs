use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "streamgate")]
#[command(author, version, about = "HLS/DASH streaming reverse proxy")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the proxy server
    Start {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        config: Option<PathBuf>,
    },

    /// Print a proxy URL for an origin URL
    EncodeToken {
        /// Origin URL
        #[arg(long)]
        url: String,

        /// Target kind: manifest, segment, key, license or stream
        #[arg(long, default_value = "manifest")]
        kind: String,

        /// Header to send upstream, as `Name: value` (repeatable)
        #[arg(long = "header", value_name = "NAME:VALUE")]
        headers: Vec<String>,

        /// Transcode profile (stream targets only)
        #[arg(long)]
        profile: Option<String>,
    },

    /// Generate a random token secret
    GenerateSecret,

    /// Display version information
    Version,
}
