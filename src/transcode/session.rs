//! A single transcoder subprocess and its attached readers.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use streamgate_common::StreamId;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::config::{OutputMode, TranscodeProfile};

/// Lifecycle of a transcode session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl SessionStatus {
    /// Sessions that new readers may join.
    pub fn is_live(self) -> bool {
        matches!(self, SessionStatus::Starting | SessionStatus::Running)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Stopped | SessionStatus::Crashed)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Stopping => "stopping",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// Serializable view of a session for the sessions API.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: StreamId,
    pub profile: String,
    pub status: SessionStatus,
    pub readers: usize,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub age_secs: u64,
    pub idle_secs: u64,
}

/// One transcoder process bound to a stream id.
///
/// Owned by the process manager; the registry and attached readers hold
/// shared references.
pub struct TranscodeSession {
    id: StreamId,
    profile: String,
    output_mode: OutputMode,
    content_type: String,
    output_dir: Option<PathBuf>,
    playlist_name: String,
    started_at: DateTime<Utc>,
    started: Instant,
    /// Last output chunk, attach, detach or served file.
    last_activity: Mutex<Instant>,
    /// Last attach, detach or served file. Drives idle accounting, so a live
    /// transcode nobody watches still goes idle.
    last_reader_activity: Mutex<Instant>,
    readers: AtomicUsize,
    produced_output: AtomicBool,
    status: watch::Sender<SessionStatus>,
    /// Taken when the process ends so readers see end-of-stream.
    output: Mutex<Option<broadcast::Sender<Bytes>>>,
    cancel: CancellationToken,
    /// Fired once the process is gone and its output torn down.
    finished: CancellationToken,
    pid: Mutex<Option<u32>>,
}

impl TranscodeSession {
    pub fn new(
        id: StreamId,
        profile: &TranscodeProfile,
        output_dir: Option<PathBuf>,
        channel_capacity: usize,
    ) -> Arc<Self> {
        let now = Instant::now();
        let (status, _) = watch::channel(SessionStatus::Starting);
        let (output, _) = broadcast::channel(channel_capacity.max(1));
        Arc::new(Self {
            id,
            profile: profile.name.clone(),
            output_mode: profile.output,
            content_type: profile.content_type.clone(),
            output_dir,
            playlist_name: profile.playlist_name.clone(),
            started_at: Utc::now(),
            started: now,
            last_activity: Mutex::new(now),
            last_reader_activity: Mutex::new(now),
            readers: AtomicUsize::new(0),
            produced_output: AtomicBool::new(false),
            status,
            output: Mutex::new(Some(output)),
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
            pid: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &StreamId {
        &self.id
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn output_mode(&self) -> OutputMode {
        self.output_mode
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Per-session output directory (HLS output mode only).
    pub fn output_dir(&self) -> Option<&Path> {
        self.output_dir.as_deref()
    }

    pub fn playlist_name(&self) -> &str {
        &self.playlist_name
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub(crate) fn set_status(&self, status: SessionStatus) {
        self.status.send_replace(status);
    }

    /// Move `Starting` to `Running` on the first sign of output.
    pub(crate) fn mark_running(&self) {
        if !self.produced_output.swap(true, Ordering::AcqRel) {
            self.status.send_if_modified(|s| {
                if *s == SessionStatus::Starting {
                    *s = SessionStatus::Running;
                    true
                } else {
                    false
                }
            });
            tracing::info!(stream_id = %self.id, "Transcode session running");
        }
    }

    pub fn has_output(&self) -> bool {
        self.produced_output.load(Ordering::Acquire)
    }

    pub(crate) fn set_pid(&self, pid: Option<u32>) {
        *self.pid.lock() = pid;
    }

    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock()
    }

    pub fn readers(&self) -> usize {
        self.readers.load(Ordering::Acquire)
    }

    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time since a reader last attached, detached or fetched a file.
    pub fn idle_for(&self) -> Duration {
        self.last_reader_activity.lock().elapsed()
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Record reader-side activity (attach, detach, served HLS file).
    pub fn touch(&self) {
        let now = Instant::now();
        *self.last_activity.lock() = now;
        *self.last_reader_activity.lock() = now;
    }

    /// Deliver an output chunk to every attached reader, in order.
    pub(crate) fn publish(&self, chunk: Bytes) {
        *self.last_activity.lock() = Instant::now();
        self.mark_running();
        if let Some(tx) = self.output.lock().as_ref() {
            // No receivers is fine; output is dropped until someone attaches.
            let _ = tx.send(chunk);
        }
    }

    /// Close the output channel. Readers drain what is buffered, then end.
    pub(crate) fn close_output(&self) {
        self.output.lock().take();
    }

    /// Attach a reader. `None` once the session's output has closed.
    pub fn attach(self: &Arc<Self>) -> Option<SessionReader> {
        let receiver = self.output.lock().as_ref()?.subscribe();
        let readers = self.readers.fetch_add(1, Ordering::AcqRel) + 1;
        self.touch();
        tracing::debug!(stream_id = %self.id, readers, "Reader attached");
        Some(SessionReader {
            session: Arc::clone(self),
            receiver,
        })
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.cancel();
    }

    /// Wait until the process has exited and its output is cleaned up.
    pub async fn finished(&self) {
        self.finished.cancelled().await;
    }

    /// Ask the supervisor to terminate the process.
    pub fn request_stop(&self) {
        self.status.send_if_modified(|s| {
            if s.is_live() {
                *s = SessionStatus::Stopping;
                true
            } else {
                false
            }
        });
        self.cancel.cancel();
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            profile: self.profile.clone(),
            status: self.status(),
            readers: self.readers(),
            pid: self.pid(),
            started_at: self.started_at,
            age_secs: self.age().as_secs(),
            idle_secs: self.idle_for().as_secs(),
        }
    }
}

impl std::fmt::Debug for TranscodeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscodeSession")
            .field("id", &self.id)
            .field("profile", &self.profile)
            .field("status", &self.status())
            .field("readers", &self.readers())
            .finish_non_exhaustive()
    }
}

/// An attached consumer of session output. Detaches when dropped.
#[derive(Debug)]
pub struct SessionReader {
    session: Arc<TranscodeSession>,
    receiver: broadcast::Receiver<Bytes>,
}

impl SessionReader {
    pub fn session(&self) -> &Arc<TranscodeSession> {
        &self.session
    }

    /// Next output chunk. `None` at end of output, or when this reader fell
    /// so far behind that chunks were overwritten.
    pub async fn recv(&mut self) -> Option<Bytes> {
        match self.receiver.recv().await {
            Ok(chunk) => Some(chunk),
            Err(broadcast::error::RecvError::Closed) => None,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(
                    stream_id = %self.session.id,
                    skipped,
                    "Reader fell behind transcoder output; disconnecting"
                );
                None
            }
        }
    }

    /// Output as a byte stream for a response body.
    pub fn into_stream(mut self) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static {
        async_stream::stream! {
            while let Some(chunk) = self.recv().await {
                yield Ok(chunk);
            }
        }
    }
}

impl Drop for SessionReader {
    fn drop(&mut self) {
        let readers = self.session.readers.fetch_sub(1, Ordering::AcqRel) - 1;
        self.session.touch();
        tracing::debug!(stream_id = %self.session.id, readers, "Reader detached");
    }
}
