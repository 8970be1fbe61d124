//! Transcoder process supervision.
//!
//! The manager launches one subprocess per stream id, pumps its output into
//! the session, and runs the periodic sweep that stops idle or overlong
//! sessions and forgets finished ones.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use streamgate_common::{Error, Result, StreamId, StreamRequest};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::command::{build_args, user_agent_for, CommandContext};
use super::registry::{Lookup, SessionRegistry};
use super::session::{SessionReader, SessionStatus, TranscodeSession};
use crate::config::{OutputMode, TranscodeConfig, TranscodeProfile};
use crate::recorder::{NoopRecorder, RecordingSink};

const OUTPUT_CHUNK: usize = 64 * 1024;
const PLAYLIST_POLL: Duration = Duration::from_millis(200);

/// What a sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Sessions stopped for having no readers past the idle timeout.
    pub idle: usize,
    /// Sessions stopped for exceeding the maximum runtime.
    pub expired: usize,
    /// Finished sessions removed from the registry.
    pub reaped: usize,
}

/// Owns every transcode subprocess.
pub struct ProcessManager {
    config: TranscodeConfig,
    default_user_agent: String,
    registry: SessionRegistry,
    spawned: AtomicU64,
    recorder: Arc<dyn RecordingSink>,
}

impl ProcessManager {
    pub fn new(config: TranscodeConfig, default_user_agent: impl Into<String>) -> Self {
        Self {
            config,
            default_user_agent: default_user_agent.into(),
            registry: SessionRegistry::new(),
            spawned: AtomicU64::new(0),
            recorder: Arc::new(NoopRecorder),
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn RecordingSink>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn config(&self) -> &TranscodeConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Number of subprocesses launched so far.
    pub fn spawn_count(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    /// Resolve a profile name, falling back to the configured default.
    pub fn profile(&self, name: Option<&str>) -> Result<&TranscodeProfile> {
        let name = name.unwrap_or(&self.config.default_profile);
        self.config
            .profile(name)
            .ok_or_else(|| Error::validation(format!("Unknown transcode profile '{name}'")))
    }

    /// Attach to the session for `request`, launching it if needed, and wait
    /// until it produces output.
    pub async fn get_or_start(
        &self,
        request: &StreamRequest,
        profile: &TranscodeProfile,
    ) -> Result<SessionReader> {
        let id = StreamId::derive(&request.url, &profile.name);
        let lookup = self.lookup(&id, profile);
        // Attach before launching so the creator sees the very first chunk.
        let reader = lookup.session().attach().ok_or_else(|| {
            Error::Spawn(format!("transcode session {id} ended before it could be joined"))
        })?;
        if let Lookup::Created(session) = &lookup {
            self.launch(session, request, profile).await?;
        }
        self.wait_started(lookup.session()).await?;
        Ok(reader)
    }

    /// Launch the session for `request` if needed and wait until it produces
    /// output, without attaching a reader (HLS output mode).
    pub async fn ensure_started(
        &self,
        request: &StreamRequest,
        profile: &TranscodeProfile,
    ) -> Result<Arc<TranscodeSession>> {
        let id = StreamId::derive(&request.url, &profile.name);
        let lookup = self.lookup(&id, profile);
        if let Lookup::Created(session) = &lookup {
            self.launch(session, request, profile).await?;
        }
        let session = lookup.session();
        self.wait_started(session).await?;
        session.touch();
        Ok(Arc::clone(session))
    }

    /// Attach to an existing live session.
    pub async fn attach(&self, id: &StreamId) -> Result<SessionReader> {
        let session = self
            .live_session(id)
            .ok_or_else(|| Error::not_found("Stream session", id))?;
        let reader = session
            .attach()
            .ok_or_else(|| Error::not_found("Stream session", id))?;
        self.wait_started(&session).await?;
        Ok(reader)
    }

    /// The registry entry for `id` if it is starting or running.
    pub fn live_session(&self, id: &StreamId) -> Option<Arc<TranscodeSession>> {
        self.registry.get(id).filter(|s| s.status().is_live())
    }

    fn lookup(&self, id: &StreamId, profile: &TranscodeProfile) -> Lookup {
        self.registry.get_or_create(id, || {
            let output_dir = match profile.output {
                OutputMode::Hls => Some(self.session_dir(id)),
                OutputMode::Pipe => None,
            };
            TranscodeSession::new(
                id.clone(),
                profile,
                output_dir,
                self.config.channel_capacity,
            )
        })
    }

    fn session_dir(&self, id: &StreamId) -> PathBuf {
        // Sequence suffix keeps a replacement session clear of a predecessor
        // that is still cleaning up.
        let seq = self.spawned.load(Ordering::Relaxed);
        self.config.output_root.join(format!("{id}-{seq}"))
    }

    async fn wait_started(&self, session: &Arc<TranscodeSession>) -> Result<()> {
        let mut status = session.watch_status();
        let waited = tokio::time::timeout(self.config.start_timeout(), async {
            status
                .wait_for(|s| *s != SessionStatus::Starting)
                .await
                .map(|_| ())
        })
        .await;

        match waited {
            Err(_) => {
                warn!(stream_id = %session.id(), "Transcode session did not start in time");
                Err(Error::StartTimeout {
                    stream_id: session.id().to_string(),
                })
            }
            Ok(_) if session.has_output() => Ok(()),
            Ok(_) => Err(Error::Spawn(format!(
                "transcoder for {} exited without output",
                session.id()
            ))),
        }
    }

    async fn launch(
        &self,
        session: &Arc<TranscodeSession>,
        request: &StreamRequest,
        profile: &TranscodeProfile,
    ) -> Result<()> {
        match self.spawn_process(session, request, profile) {
            Ok(child) => {
                self.spawned.fetch_add(1, Ordering::Relaxed);
                self.recorder.session_started(session);
                tokio::spawn(supervise(
                    Arc::clone(session),
                    child,
                    self.config.stop_grace(),
                    Arc::clone(&self.recorder),
                ));
                Ok(())
            }
            Err(e) => {
                error!(stream_id = %session.id(), error = %e, "Failed to launch transcoder");
                session.set_status(SessionStatus::Crashed);
                self.registry.remove_if_same(session);
                session.close_output();
                if let Some(dir) = session.output_dir() {
                    remove_output_dir(dir).await;
                }
                session.mark_finished();
                Err(e)
            }
        }
    }

    fn spawn_process(
        &self,
        session: &Arc<TranscodeSession>,
        request: &StreamRequest,
        profile: &TranscodeProfile,
    ) -> Result<Child> {
        if let Some(dir) = session.output_dir() {
            std::fs::create_dir_all(dir)
                .map_err(|e| Error::Spawn(format!("cannot create output directory: {e}")))?;
        }

        let user_agent = user_agent_for(&request.headers, &self.default_user_agent);
        let ctx = CommandContext::for_session(
            &request.url,
            session.id().as_str(),
            user_agent,
            session.output_dir(),
        );
        let args = build_args(&profile.args, &ctx, &request.headers);

        let stdout = match profile.output {
            OutputMode::Pipe => Stdio::piped(),
            OutputMode::Hls => Stdio::null(),
        };

        let child = Command::new(&self.config.executable)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Spawn(format!(
                    "{}: {e}",
                    self.config.executable.display()
                ))
            })?;

        session.set_pid(child.id());
        info!(
            stream_id = %session.id(),
            profile = %profile.name,
            pid = ?child.id(),
            "Transcoder launched"
        );
        Ok(child)
    }

    /// One cleanup pass over the registry.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let idle_timeout = self.config.idle_timeout();
        let max_runtime = self.config.max_runtime();

        for session in self.registry.snapshot() {
            let status = session.status();
            if status.is_terminal() {
                if self.registry.remove_if_same(&session) {
                    debug!(stream_id = %session.id(), %status, "Reaped finished session");
                    report.reaped += 1;
                }
                continue;
            }
            if !status.is_live() {
                continue;
            }

            if session.age() >= max_runtime {
                info!(
                    stream_id = %session.id(),
                    age_secs = session.age().as_secs(),
                    "Stopping session at maximum runtime"
                );
                self.stop_session(&session);
                report.expired += 1;
            } else if session.readers() == 0 && session.idle_for() >= idle_timeout {
                info!(
                    stream_id = %session.id(),
                    idle_secs = session.idle_for().as_secs(),
                    "Stopping idle session"
                );
                self.stop_session(&session);
                report.idle += 1;
            }
        }

        if report != SweepReport::default() {
            debug!(?report, "Session sweep");
        }
        report
    }

    fn stop_session(&self, session: &Arc<TranscodeSession>) {
        session.request_stop();
        self.registry.remove_if_same(session);
    }

    /// Stop the session for `id`. Returns false if there is none.
    pub fn stop(&self, id: &StreamId) -> bool {
        match self.registry.get(id) {
            Some(session) => {
                info!(stream_id = %id, "Stopping session on request");
                self.stop_session(&session);
                true
            }
            None => false,
        }
    }

    /// Stop every session and wait (bounded by the stop grace period) for
    /// the processes to exit.
    pub async fn shutdown(&self) {
        let sessions = self.registry.snapshot();
        if sessions.is_empty() {
            return;
        }
        info!(count = sessions.len(), "Stopping transcode sessions");
        for session in &sessions {
            self.stop_session(session);
        }

        let deadline = self.config.stop_grace() + Duration::from_secs(1);
        let all_done = futures::future::join_all(sessions.iter().map(|s| s.finished()));
        if tokio::time::timeout(deadline, all_done).await.is_err() {
            warn!("Some transcoders did not exit before shutdown completed");
        }
    }
}

impl std::fmt::Debug for ProcessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessManager")
            .field("sessions", &self.registry.len())
            .field("spawned", &self.spawn_count())
            .finish_non_exhaustive()
    }
}

enum Exit {
    Exited(std::io::Result<ExitStatus>),
    Cancelled,
}

/// Drive one subprocess from launch to exit.
async fn supervise(
    session: Arc<TranscodeSession>,
    mut child: Child,
    grace: Duration,
    recorder: Arc<dyn RecordingSink>,
) {
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(log_stderr(session.id().clone(), stderr));
    }
    let stdout = child.stdout.take();
    if let (OutputMode::Hls, Some(dir)) = (session.output_mode(), session.output_dir()) {
        tokio::spawn(watch_playlist(
            Arc::clone(&session),
            dir.join(session.playlist_name()),
        ));
    }

    let cancel = session.cancel_token().clone();
    let outcome = tokio::select! {
        status = async {
            if let Some(stdout) = stdout {
                pump_output(&session, stdout).await;
            }
            child.wait().await
        } => Exit::Exited(status),
        _ = cancel.cancelled() => Exit::Cancelled,
    };

    let final_status = match outcome {
        Exit::Exited(Ok(status)) if status.success() => {
            info!(stream_id = %session.id(), "Transcoder exited");
            SessionStatus::Stopped
        }
        Exit::Exited(Ok(status)) => {
            warn!(stream_id = %session.id(), %status, "Transcoder crashed");
            SessionStatus::Crashed
        }
        Exit::Exited(Err(e)) => {
            error!(stream_id = %session.id(), error = %e, "Lost track of transcoder");
            SessionStatus::Crashed
        }
        Exit::Cancelled => {
            terminate(&session, &mut child, grace).await;
            SessionStatus::Stopped
        }
    };

    // Terminal before teardown: the registry must never hand out a session
    // whose output is closing.
    session.set_pid(None);
    session.set_status(final_status);
    recorder.session_ended(session.id(), final_status);
    session.close_output();
    if let Some(dir) = session.output_dir() {
        remove_output_dir(dir).await;
    }
    session.mark_finished();
}

async fn pump_output(session: &TranscodeSession, stdout: ChildStdout) {
    let mut chunks = ReaderStream::with_capacity(stdout, OUTPUT_CHUNK);
    while let Some(chunk) = chunks.next().await {
        match chunk {
            Ok(bytes) => session.publish(bytes),
            Err(e) => {
                warn!(stream_id = %session.id(), error = %e, "Transcoder output read failed");
                break;
            }
        }
    }
}

/// HLS mode has no stdout; the session is running once the playlist exists.
async fn watch_playlist(session: Arc<TranscodeSession>, playlist: PathBuf) {
    while session.status() == SessionStatus::Starting {
        if tokio::fs::try_exists(&playlist).await.unwrap_or(false) {
            session.mark_running();
            break;
        }
        tokio::time::sleep(PLAYLIST_POLL).await;
    }
}

async fn log_stderr(id: StreamId, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let lower = line.to_ascii_lowercase();
        if lower.contains("error") || lower.contains("warning") {
            warn!(stream_id = %id, "transcoder: {}", line);
        } else {
            debug!(stream_id = %id, "transcoder: {}", line);
        }
    }
}

/// Ask the process to exit, then kill it after `grace`.
async fn terminate(session: &TranscodeSession, child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(stream_id = %session.id(), error = %e, "SIGTERM failed");
        }
    }
    #[cfg(not(unix))]
    let _ = child.start_kill();

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => info!(stream_id = %session.id(), "Transcoder stopped"),
        Err(_) => {
            warn!(stream_id = %session.id(), "Transcoder ignored SIGTERM; killing");
            if let Err(e) = child.kill().await {
                error!(stream_id = %session.id(), error = %e, "Failed to kill transcoder");
            }
        }
    }
}

async fn remove_output_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %dir.display(), error = %e, "Failed to remove session output"),
    }
}

/// Run [`ProcessManager::sweep`] every `sweep_interval` until `cancel` fires,
/// then stop every session.
pub fn start_cleanup_task(
    manager: Arc<ProcessManager>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(manager.config().sweep_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    manager.sweep();
                }
                _ = cancel.cancelled() => break,
            }
        }
        manager.shutdown().await;
    })
}
