//! Lifecycle supervision of the inference service process.
//!
//! [`BackendSupervisor`] starts the service as a child process, waits
//! for it to become ready (readiness phrase on its diagnostic streams
//! or a successful health probe, whichever first), and stops it on
//! request. The supervisor *owns* the child: teardown happens through
//! [`BackendSupervisor::stop`], never as a drop side effect, and the
//! supervisor never restarts the process on its own -- restart is the
//! caller's next [`ensure_ready`](BackendSupervisor::ensure_ready).

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::api::BackendApi;

/// Literal substrings on the child's stdout/stderr that signal the
/// service is accepting connections. The server logs to stderr even on
/// a clean start, so both streams are watched.
pub const READINESS_MARKERS: &[&str] =
    &["Uvicorn running", "Application startup complete", "Started"];

/// Supervisor lifecycle states, observable through
/// [`BackendSupervisor::watch_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// No probe has run yet.
    Unknown,
    /// A health probe is in flight.
    Checking,
    /// The child was spawned and has not reported ready.
    Starting,
    /// The service answers health probes (supervised or external).
    Online,
    /// Startup failed; a later `ensure_ready` may still succeed.
    Failed,
    /// A stop was requested and is in progress.
    Stopping,
    /// No supervised process is running.
    Offline,
}

/// Errors from the supervision layer.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The runtime executable does not exist at the computed path.
    /// Reported without attempting a spawn.
    #[error("backend runtime not found at {0} (run the installer first)")]
    MissingRuntime(PathBuf),

    /// The OS refused to spawn the child process.
    #[error("failed to spawn backend process: {0}")]
    SpawnFailed(String),

    /// Neither a readiness phrase nor a health probe succeeded within
    /// the start timeout.
    #[error("backend did not become ready within {0:?}")]
    StartTimeout(Duration),

    /// The supervised process exited while it was still needed.
    #[error("backend process exited")]
    BackendExited,
}

/// Where and how to launch the service.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Project root containing the `.venv` runtime and `server/` tree.
    pub project_root: PathBuf,
    /// Local address the service binds to.
    pub host: String,
    pub port: u16,
    /// Upper bound on `ensure_ready` when a spawn is needed.
    pub start_timeout: Duration,
    /// Interval between health probes while waiting for readiness.
    pub health_poll_interval: Duration,
    /// Grace period between the termination signal and a hard kill.
    pub stop_grace: Duration,
}

impl SupervisorConfig {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            host: "127.0.0.1".to_string(),
            port: 7860,
            start_timeout: Duration::from_secs(60),
            health_poll_interval: Duration::from_secs(1),
            stop_grace: Duration::from_secs(5),
        }
    }

    /// Computed path of the virtualenv python the service runs under.
    pub fn runtime_path(&self) -> PathBuf {
        if cfg!(windows) {
            self.project_root.join(".venv").join("Scripts").join("python.exe")
        } else {
            self.project_root.join(".venv").join("bin").join("python")
        }
    }

    /// Working directory for the spawned service.
    pub fn server_dir(&self) -> PathBuf {
        self.project_root.join("server")
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Bookkeeping for the currently supervised child.
struct Supervised {
    /// Cancelled to request a graceful shutdown of the child.
    stop: CancellationToken,
    /// Cancelled by the monitor task once the child is fully gone.
    exited: CancellationToken,
}

/// Supervises the inference service as an owned child process.
pub struct BackendSupervisor {
    config: SupervisorConfig,
    api: BackendApi,
    state_tx: watch::Sender<SupervisorState>,
    child: Arc<Mutex<Option<Supervised>>>,
}

impl BackendSupervisor {
    pub fn new(config: SupervisorConfig, api: BackendApi) -> Self {
        let (state_tx, _) = watch::channel(SupervisorState::Unknown);
        Self {
            config,
            api,
            state_tx,
            child: Arc::new(Mutex::new(None)),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SupervisorState {
        *self.state_tx.borrow()
    }

    /// Subscribe to lifecycle state changes.
    pub fn watch_state(&self) -> watch::Receiver<SupervisorState> {
        self.state_tx.subscribe()
    }

    /// Resolve when the supervised process goes away.
    ///
    /// Used by in-flight remote calls to fail with
    /// [`SupervisorError::BackendExited`] instead of waiting out their
    /// full timeout. Only *transitions* to `Offline` resolve; if
    /// nothing is supervised this pends forever and the HTTP error
    /// path reports the failure instead.
    pub async fn exited(&self) {
        let mut rx = self.state_tx.subscribe();
        loop {
            if rx.changed().await.is_err() {
                // Sender dropped -- supervisor is being torn down.
                return;
            }
            if *rx.borrow() == SupervisorState::Offline {
                return;
            }
        }
    }

    /// Make the service reachable, spawning it if necessary.
    ///
    /// An immediately successful health probe short-circuits to
    /// `Online` (the service may have been started externally and is
    /// then not owned by this supervisor). Otherwise the runtime is
    /// located and launched, and readiness is awaited up to the
    /// configured start timeout.
    pub async fn ensure_ready(&self) -> Result<(), SupervisorError> {
        self.set_state(SupervisorState::Checking);

        if self.api.health().await.is_ok() {
            tracing::info!("Backend already running");
            self.set_state(SupervisorState::Online);
            return Ok(());
        }

        let runtime = self.config.runtime_path();
        if !tokio::fs::try_exists(&runtime).await.unwrap_or(false) {
            tracing::error!(runtime = %runtime.display(), "Backend runtime missing");
            self.set_state(SupervisorState::Failed);
            return Err(SupervisorError::MissingRuntime(runtime));
        }

        self.set_state(SupervisorState::Starting);
        let (ready, exited) = self.spawn_child(&runtime).await?;

        match tokio::time::timeout(
            self.config.start_timeout,
            self.await_startup(&ready, &exited),
        )
        .await
        {
            Ok(StartupOutcome::Ready) => {
                tracing::info!("Backend ready");
                self.set_state(SupervisorState::Online);
                Ok(())
            }
            Ok(StartupOutcome::Exited) => {
                self.child.lock().await.take();
                self.set_state(SupervisorState::Offline);
                Err(SupervisorError::BackendExited)
            }
            Err(_) => {
                tracing::error!(
                    timeout_secs = self.config.start_timeout.as_secs(),
                    "Backend start timed out",
                );
                self.stop().await;
                self.set_state(SupervisorState::Failed);
                Err(SupervisorError::StartTimeout(self.config.start_timeout))
            }
        }
    }

    /// Gracefully stop the supervised process.
    ///
    /// Termination signal first, hard kill after the grace period.
    /// Stopping when nothing is supervised is a no-op, never an error.
    pub async fn stop(&self) {
        let supervised = self.child.lock().await.take();
        let Some(supervised) = supervised else {
            tracing::debug!("Stop requested with no supervised process");
            return;
        };

        tracing::info!("Stopping backend");
        self.set_state(SupervisorState::Stopping);
        supervised.stop.cancel();
        supervised.exited.cancelled().await;
        self.set_state(SupervisorState::Offline);
    }

    // ---- private helpers ----

    fn set_state(&self, next: SupervisorState) {
        publish_state(&self.state_tx, next);
    }

    /// Spawn the service and wire up stream watching plus the monitor
    /// task. Returns the tokens cancelled on a readiness phrase and on
    /// child exit, respectively.
    async fn spawn_child(
        &self,
        runtime: &std::path::Path,
    ) -> Result<(CancellationToken, CancellationToken), SupervisorError> {
        let port = self.config.port.to_string();
        let mut child = Command::new(runtime)
            .args([
                "-m",
                "uvicorn",
                "main:app",
                "--host",
                self.config.host.as_str(),
                "--port",
                port.as_str(),
            ])
            .current_dir(self.config.server_dir())
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SupervisorError::SpawnFailed(e.to_string()))?;

        tracing::info!(pid = child.id(), "Backend process spawned");

        let ready = CancellationToken::new();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(watch_stream(stdout, "stdout", ready.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(watch_stream(stderr, "stderr", ready.clone()));
        }

        let stop = CancellationToken::new();
        let exited = CancellationToken::new();

        // The slot is filled before the monitor starts so an instant
        // child exit cannot leave a stale entry behind.
        *self.child.lock().await = Some(Supervised {
            stop: stop.clone(),
            exited: exited.clone(),
        });

        tokio::spawn(monitor_child(
            child,
            stop,
            exited.clone(),
            self.state_tx.clone(),
            self.child.clone(),
            self.config.stop_grace,
        ));

        Ok((ready, exited))
    }

    /// Race readiness phrase, health probes, and child exit.
    async fn await_startup(
        &self,
        ready: &CancellationToken,
        exited: &CancellationToken,
    ) -> StartupOutcome {
        let mut probe = tokio::time::interval(self.config.health_poll_interval);
        loop {
            tokio::select! {
                _ = ready.cancelled() => return StartupOutcome::Ready,
                _ = exited.cancelled() => return StartupOutcome::Exited,
                _ = probe.tick() => {
                    if self.api.health().await.is_ok() {
                        return StartupOutcome::Ready;
                    }
                }
            }
        }
    }
}

enum StartupOutcome {
    Ready,
    Exited,
}

/// Publish a state change. `send_if_modified` keeps the value fresh
/// even when nobody is subscribed yet.
fn publish_state(state_tx: &watch::Sender<SupervisorState>, next: SupervisorState) {
    state_tx.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        tracing::debug!(from = ?*current, to = ?next, "Supervisor state change");
        *current = next;
        true
    });
}

/// Forward a diagnostic stream line-by-line to tracing and flag
/// readiness when a marker phrase appears.
async fn watch_stream(
    stream: impl tokio::io::AsyncRead + Unpin,
    name: &'static str,
    ready: CancellationToken,
) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.is_empty() {
            continue;
        }
        tracing::debug!(stream = name, "{line}");
        if READINESS_MARKERS.iter().any(|marker| line.contains(marker)) {
            ready.cancel();
        }
    }
}

/// Own the child until it exits -- spontaneously, or on request.
async fn monitor_child(
    mut child: Child,
    stop: CancellationToken,
    exited: CancellationToken,
    state_tx: watch::Sender<SupervisorState>,
    slot: Arc<Mutex<Option<Supervised>>>,
    grace: Duration,
) {
    tokio::select! {
        status = child.wait() => {
            tracing::warn!(?status, "Backend process exited on its own");
            // Clear the handle so a later stop() is a clean no-op.
            slot.lock().await.take();
            publish_state(&state_tx, SupervisorState::Offline);
        }
        _ = stop.cancelled() => {
            shutdown_child(child, grace).await;
        }
    }
    exited.cancel();
}

/// Terminate the child: graceful signal, then a hard kill after the
/// grace period.
async fn shutdown_child(mut child: Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::warn!(pid, error = %e, "SIGTERM failed");
        }
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => {
                tracing::info!(?status, "Backend stopped");
                return;
            }
            Err(_) => {
                tracing::warn!(pid, "Backend ignored SIGTERM, killing");
            }
        }
    }

    if let Err(e) = child.start_kill() {
        tracing::warn!(error = %e, "Kill failed");
    }
    let status = child.wait().await;
    tracing::info!(?status, "Backend stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_path_is_under_the_venv() {
        let config = SupervisorConfig::new("/work/demo");
        let runtime = config.runtime_path();
        assert!(runtime.starts_with("/work/demo/.venv"));
        if cfg!(unix) {
            assert_eq!(runtime, PathBuf::from("/work/demo/.venv/bin/python"));
        }
    }

    #[test]
    fn base_url_uses_configured_address() {
        let config = SupervisorConfig::new("/work/demo");
        assert_eq!(config.base_url(), "http://127.0.0.1:7860");
    }

    #[test]
    fn readiness_markers_cover_both_uvicorn_phrases() {
        let line = "INFO:     Uvicorn running on http://127.0.0.1:7860";
        assert!(READINESS_MARKERS.iter().any(|m| line.contains(m)));
        let line = "INFO:     Application startup complete.";
        assert!(READINESS_MARKERS.iter().any(|m| line.contains(m)));
    }
}
