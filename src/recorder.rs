//! Hook for an optional recording subsystem.
//!
//! A recorder sees every transcode session the manager launches and may
//! attach its own reader to the session output. It does not affect session
//! lifetime beyond that reader.

use std::sync::Arc;
use streamgate_common::StreamId;

use crate::transcode::{SessionStatus, TranscodeSession};

pub trait RecordingSink: Send + Sync {
    /// A session was launched.
    fn session_started(&self, session: &Arc<TranscodeSession>);

    /// A session reached a terminal state.
    fn session_ended(&self, _id: &StreamId, _status: SessionStatus) {}
}

/// Recorder used when recording is not configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

impl RecordingSink for NoopRecorder {
    fn session_started(&self, _session: &Arc<TranscodeSession>) {}
}
