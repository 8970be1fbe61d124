//! Streamgate-Common: request descriptors, identifiers and the error taxonomy.
//!
//! This crate provides functionality shared by the proxy binary and the
//! manifest rewriter:
//!
//! - **Request Types**: [`StreamRequest`], the value a proxy token decodes to,
//!   together with its [`TargetKind`] and [`DecryptParams`]
//! - **Stream IDs**: [`StreamId`], the stable identity of a transcode session
//! - **Error Handling**: [`Error`] with an HTTP status mapping, and a result alias
//!
//! # Examples
//!
//! ```
//! use streamgate_common::{StreamId, StreamRequest, TargetKind};
//!
//! let request = StreamRequest::new(TargetKind::Stream, "https://origin.example/live.m3u8")
//!     .with_profile("default");
//!
//! let id = StreamId::derive(&request.url, "default");
//! assert_eq!(id, StreamId::derive("https://origin.example/live.m3u8", "default"));
//! ```

pub mod error;
pub mod ids;
pub mod types;

pub use error::{Error, Result};
pub use ids::StreamId;
pub use types::*;
