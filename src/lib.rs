//! Streamgate - HLS/DASH reverse proxy
//!
//! This library crate exposes the proxy internals for integration testing.

pub mod config;
pub mod decrypt;
pub mod proxy_url;
pub mod recorder;
pub mod server;
pub mod token;
pub mod transcode;
pub mod upstream;

pub use streamgate_common::{Error, Result, StreamId, StreamRequest, TargetKind};
