//! On-demand transcoder sessions.
//!
//! One subprocess per stream id, shared by every client asking for that
//! stream. The [`ProcessManager`] owns the processes; the [`SessionRegistry`]
//! answers "is this stream already running" atomically.

mod command;
mod manager;
mod registry;
mod session;

pub use command::{build_args, CommandContext};
pub use manager::{start_cleanup_task, ProcessManager, SweepReport};
pub use registry::{Lookup, SessionRegistry};
pub use session::{SessionInfo, SessionReader, SessionStatus, TranscodeSession};
