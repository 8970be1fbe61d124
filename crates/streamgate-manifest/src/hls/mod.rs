//! HLS playlist model and rewriter.
//!
//! - `attributes` - Tag attribute lists with span-preserving replacement
//! - `playlist` - Line model, playlist-level info and URI rewriting

pub mod attributes;
pub mod playlist;

pub use attributes::{Attribute, AttributeList};
pub use playlist::{HlsPlaylist, PlaylistInfo, PlaylistType};
