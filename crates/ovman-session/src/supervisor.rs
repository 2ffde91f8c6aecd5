//! Process Supervisor
//!
//! Spawns the OpenVPN client subprocess for a profile, tracks its lifecycle
//! state, and performs graceful-then-forced termination.
//!
//! # Lifecycle
//!
//! ```text
//! Starting ──marker seen──▶ Running ──terminate──▶ Stopping ──▶ Stopped
//!    │                         │
//!    ├─ early exit / timeout   └─ unexpected non-zero exit
//!    ▼                            ▼
//!  Failed                       Failed
//! ```
//!
//! The subprocess is kept attached instead of self-daemonizing: stdout and
//! stderr are piped and scanned for the handshake marker, and a background
//! watcher task observes the exit status after the caller has been handed
//! back control. Credentials reach the client through a `0600` temp file that
//! is deleted as soon as the handshake phase ends; they never appear on the
//! command line or in the environment.

use crate::catalog::{Profile, ProfileId};
use crate::credentials::Credential;
use crate::settings::Settings;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, error, info, warn};

/// Output line that signals a completed OpenVPN handshake.
const HANDSHAKE_SUCCESS: &str = "Initialization Sequence Completed";

/// Output lines that signal startup cannot succeed.
const FATAL_MARKERS: &[&str] = &["Connection refused", "No such file or directory", "Cannot open"];

/// Marker for rejected credentials.
const AUTH_FAILED: &str = "AUTH_FAILED";

/// How often termination polls for the watcher's exit transition.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Session identifier, unique within one supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// How the subprocess output is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Background operation; output is logged, control returns at handshake
    Daemon,
    /// Foreground troubleshooting; output is streamed to the caller
    Debug,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionMode::Daemon => write!(f, "daemon"),
            SessionMode::Debug => write!(f, "debug"),
        }
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Subprocess spawned, waiting for the handshake marker
    Starting,
    /// Handshake observed, connection is up
    Running,
    /// Termination requested, waiting for exit
    Stopping,
    /// Exited after an explicit stop or a clean exit
    Stopped,
    /// Spawn failed, handshake failed, or unexpected exit
    Failed,
}

impl SessionState {
    /// A live session occupies its profile.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SessionState::Starting | SessionState::Running | SessionState::Stopping
        )
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
            SessionState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Point-in-time snapshot of one session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub profile_id: ProfileId,
    pub mode: SessionMode,
    pub state: SessionState,
    /// Human-readable cause when the state is `Failed`
    pub reason: Option<String>,
    pub started_at: SystemTime,
}

/// Shared per-session record owned by the supervisor.
struct SessionInner {
    id: SessionId,
    profile_id: ProfileId,
    mode: SessionMode,
    started_at: SystemTime,
    state: RwLock<SessionState>,
    reason: RwLock<Option<String>>,
    /// OS pid of the subprocess; 0 until known
    pid: AtomicU32,
}

impl SessionInner {
    async fn snapshot(&self) -> Session {
        Session {
            id: self.id,
            profile_id: self.profile_id.clone(),
            mode: self.mode,
            state: *self.state.read().await,
            reason: self.reason.read().await.clone(),
            started_at: self.started_at,
        }
    }

    async fn fail(&self, reason: impl Into<String>) {
        *self.state.write().await = SessionState::Failed;
        *self.reason.write().await = Some(reason.into());
    }
}

/// Handle returned to the caller of [`ProcessSupervisor::spawn`].
///
/// Dropping the handle detaches from the session; the subprocess keeps
/// running and the watcher keeps tracking it.
pub struct SessionHandle {
    session: Session,
    output: Option<mpsc::Receiver<String>>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.session.id
    }

    pub fn profile_id(&self) -> &ProfileId {
        &self.session.profile_id
    }

    pub fn mode(&self) -> SessionMode {
        self.session.mode
    }

    /// Snapshot taken when the session reached `Running`.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Take the live output stream (Debug mode only).
    ///
    /// Returns `None` for Daemon sessions or when already taken. Dropping the
    /// receiver detaches from the output without affecting the subprocess.
    ///
    /// Delivery is lossy under backpressure: the channel is bounded, and a
    /// receiver that falls behind loses newer lines rather than stalling the
    /// session watcher. Every line is still recorded at `debug!` level.
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<String>> {
        self.output.take()
    }
}

/// Supervisor tuning knobs.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// VPN client executable (name on PATH or absolute path)
    pub binary: String,
    /// Wrap the subprocess in `sudo`
    pub use_sudo: bool,
    /// Bound on the Starting phase
    pub handshake_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL
    pub grace_period: Duration,
    /// `--verb` level for debug sessions
    pub debug_verbosity: u8,
    /// Owner-only directory for transient auth files
    pub auth_dir: PathBuf,
}

impl SupervisorConfig {
    /// Derive the supervisor configuration from loaded settings.
    ///
    /// `sudo` wrapping only applies when requested and the process is not
    /// already root, keeping the privileged boundary scoped to the spawn.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            binary: settings.openvpn_binary.clone(),
            use_sudo: settings.use_sudo && !running_as_root(),
            handshake_timeout: Duration::from_secs(settings.handshake_timeout_secs),
            grace_period: Duration::from_secs(settings.grace_period_secs),
            debug_verbosity: settings.debug_verbosity,
            auth_dir: settings.credential_dir.clone(),
        }
    }
}

/// Whether the current process runs with euid 0.
pub fn running_as_root() -> bool {
    #[cfg(unix)]
    {
        // Safety: geteuid has no failure modes.
        unsafe { libc::geteuid() == 0 }
    }
    #[cfg(not(unix))]
    {
        false
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) {
    // Safety: plain kill(2); an ESRCH result just means the process is gone.
    unsafe {
        libc::kill(pid as libc::pid_t, signal);
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: i32) {}

#[cfg(unix)]
const SIG_GRACEFUL: libc::c_int = libc::SIGTERM;
#[cfg(unix)]
const SIG_FORCED: libc::c_int = libc::SIGKILL;
#[cfg(not(unix))]
const SIG_GRACEFUL: i32 = 15;
#[cfg(not(unix))]
const SIG_FORCED: i32 = 9;

/// Supervises VPN client subprocesses.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    sessions: Arc<RwLock<HashMap<SessionId, Arc<SessionInner>>>>,
    next_id: AtomicU64,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Spawn the VPN client for `profile` and drive it to `Running`.
    ///
    /// Blocks until the handshake marker is observed, the client fails, or
    /// the handshake timeout elapses. On success the session keeps running in
    /// the background; on failure the session is recorded as `Failed` with a
    /// reason and the specific error is returned. Spawns are never retried
    /// here.
    pub async fn spawn(
        &self,
        profile: &Profile,
        credential: Option<&Credential>,
        mode: SessionMode,
    ) -> Result<SessionHandle, SupervisorError> {
        let auth_file = match credential {
            Some(credential) => Some(self.write_auth_file(credential).await?),
            None => None,
        };

        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let inner = Arc::new(SessionInner {
            id,
            profile_id: profile.id.clone(),
            mode,
            started_at: SystemTime::now(),
            state: RwLock::new(SessionState::Starting),
            reason: RwLock::new(None),
            pid: AtomicU32::new(0),
        });
        self.sessions.write().await.insert(id, inner.clone());

        let verb = match mode {
            SessionMode::Daemon => 3,
            SessionMode::Debug => self.config.debug_verbosity,
        };

        let mut cmd = if self.config.use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg(&self.config.binary);
            cmd
        } else {
            Command::new(&self.config.binary)
        };
        cmd.arg("--config")
            .arg(&profile.config_path)
            .arg("--verb")
            .arg(verb.to_string());
        if let Some(auth) = &auth_file {
            cmd.arg("--auth-user-pass").arg(auth.path());
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);

        info!("Starting {} session {} for {}", mode, id, profile.id);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let reason = format!("could not start {}: {}", self.config.binary, e);
                error!("Session {} spawn failed: {}", id, reason);
                inner.fail(&reason).await;
                return Err(SupervisorError::Spawn {
                    binary: self.config.binary.clone(),
                    source: e,
                });
            }
        };
        inner
            .pid
            .store(child.id().unwrap_or_default(), Ordering::Relaxed);

        // Merge stdout and stderr into one ordered-enough line stream.
        let (line_tx, mut line_rx) = mpsc::channel::<String>(256);
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, line_tx);
        }

        // Caller-facing stream; handshake lines are buffered into it so a
        // Debug caller sees the startup output too.
        let (out_tx, out_rx) = mpsc::channel::<String>(256);

        let handshake = tokio::time::timeout(self.config.handshake_timeout, async {
            loop {
                tokio::select! {
                    status = child.wait() => {
                        return Err(match status {
                            Ok(status) => SupervisorError::EarlyExit(describe_exit(&status)),
                            Err(e) => SupervisorError::Io(e),
                        });
                    }
                    line = line_rx.recv() => match line {
                        Some(line) => {
                            debug!(target: "ovman::openvpn", session = %id, "{}", line);
                            let _ = out_tx.try_send(line.clone());
                            if line.contains(HANDSHAKE_SUCCESS) {
                                return Ok(());
                            }
                            if line.contains(AUTH_FAILED) {
                                return Err(SupervisorError::AuthRejected);
                            }
                            if FATAL_MARKERS.iter().any(|m| line.contains(m)) {
                                return Err(SupervisorError::Startup(line));
                            }
                        }
                        None => {
                            return Err(match child.wait().await {
                                Ok(status) => SupervisorError::EarlyExit(describe_exit(&status)),
                                Err(e) => SupervisorError::Io(e),
                            });
                        }
                    }
                }
            }
        })
        .await;

        // The transient credential file has served its purpose either way.
        drop(auth_file);

        match handshake {
            Ok(Ok(())) => {
                *inner.state.write().await = SessionState::Running;
                info!("Session {} for {} is running", id, profile.id);

                let session = inner.snapshot().await;
                self.spawn_watcher(inner, child, line_rx, out_tx);

                Ok(SessionHandle {
                    session,
                    output: match mode {
                        SessionMode::Debug => Some(out_rx),
                        SessionMode::Daemon => None,
                    },
                })
            }
            Ok(Err(e)) => {
                reap(&mut child).await;
                error!("Session {} failed to start: {}", id, e);
                inner.fail(e.to_string()).await;
                Err(e)
            }
            Err(_) => {
                reap(&mut child).await;
                warn!(
                    "Session {} handshake timed out after {:?}",
                    id, self.config.handshake_timeout
                );
                inner.fail("handshake timeout").await;
                Err(SupervisorError::HandshakeTimeout)
            }
        }
    }

    /// Background watcher: forwards output and records the exit transition.
    fn spawn_watcher(
        &self,
        inner: Arc<SessionInner>,
        mut child: Child,
        mut line_rx: mpsc::Receiver<String>,
        out_tx: mpsc::Sender<String>,
    ) {
        tokio::spawn(async move {
            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    line = line_rx.recv() => match line {
                        Some(line) => {
                            debug!(target: "ovman::openvpn", session = %inner.id, "{}", line);
                            // Lossy on a full or dropped receiver; the watcher
                            // must never block on a slow consumer.
                            let _ = out_tx.try_send(line);
                        }
                        None => break child.wait().await,
                    }
                }
            };

            let was_stopping = *inner.state.read().await == SessionState::Stopping;
            match status {
                Ok(status) if was_stopping => {
                    *inner.state.write().await = SessionState::Stopped;
                    info!("Session {} stopped ({})", inner.id, describe_exit(&status));
                }
                Ok(status) if status.success() => {
                    *inner.state.write().await = SessionState::Stopped;
                    info!("Session {} exited cleanly", inner.id);
                }
                Ok(status) => {
                    let reason = format!("unexpected exit: {}", describe_exit(&status));
                    error!("Session {}: {}", inner.id, reason);
                    inner.fail(reason).await;
                }
                Err(e) => {
                    error!("Session {}: wait failed: {}", inner.id, e);
                    inner.fail(format!("wait failed: {}", e)).await;
                }
            }
        });
    }

    /// Terminate a session: SIGTERM, bounded grace wait, then SIGKILL.
    ///
    /// Terminating an already-stopped or failed session is a no-op. Safe to
    /// call from any task, including one that did not spawn the session.
    pub async fn terminate(&self, id: SessionId, force: bool) -> Result<(), SupervisorError> {
        let inner = self
            .get(id)
            .await
            .ok_or(SupervisorError::SessionNotFound(id))?;

        {
            let mut state = inner.state.write().await;
            match *state {
                SessionState::Stopped | SessionState::Failed => return Ok(()),
                SessionState::Stopping => {}
                _ => *state = SessionState::Stopping,
            }
        }

        let pid = inner.pid.load(Ordering::Relaxed);
        if pid == 0 {
            *inner.state.write().await = SessionState::Stopped;
            return Ok(());
        }

        info!(
            "Terminating session {} (pid {}, force: {})",
            id, pid, force
        );
        send_signal(pid, if force { SIG_FORCED } else { SIG_GRACEFUL });

        if self.wait_for_exit(&inner, self.config.grace_period).await {
            return Ok(());
        }

        warn!(
            "Session {} did not exit within {:?}, escalating to SIGKILL",
            id, self.config.grace_period
        );
        send_signal(pid, SIG_FORCED);

        if self.wait_for_exit(&inner, self.config.grace_period).await {
            Ok(())
        } else {
            Err(SupervisorError::Unkillable(id))
        }
    }

    async fn wait_for_exit(&self, inner: &SessionInner, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if inner.state.read().await.is_terminal() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    /// Snapshot of one session.
    pub async fn status(&self, id: SessionId) -> Option<Session> {
        let inner = self.get(id).await?;
        Some(inner.snapshot().await)
    }

    /// Snapshots of every session the supervisor has seen, including
    /// terminal ones.
    pub async fn sessions(&self) -> Vec<Session> {
        let inners: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut sessions = Vec::with_capacity(inners.len());
        for inner in inners {
            sessions.push(inner.snapshot().await);
        }
        sessions.sort_by_key(|s| s.id.0);
        sessions
    }

    /// Live sessions only.
    pub async fn active_sessions(&self) -> Vec<Session> {
        let mut sessions = self.sessions().await;
        sessions.retain(|s| s.state.is_live());
        sessions
    }

    /// The live session occupying a profile, if any.
    pub async fn active_for_profile(&self, profile_id: &ProfileId) -> Option<Session> {
        self.active_sessions()
            .await
            .into_iter()
            .find(|s| &s.profile_id == profile_id)
    }

    async fn get(&self, id: SessionId) -> Option<Arc<SessionInner>> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Write `username\nsecret\n` into a 0600 temp file inside the auth
    /// directory. The file disappears when the returned handle drops.
    async fn write_auth_file(
        &self,
        credential: &Credential,
    ) -> Result<tempfile::NamedTempFile, SupervisorError> {
        use std::io::Write as _;

        std::fs::create_dir_all(&self.config.auth_dir)?;
        let mut file = tempfile::Builder::new()
            .prefix(".auth-")
            .tempfile_in(&self.config.auth_dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600))?;
        }

        file.write_all(credential.username.as_bytes())?;
        file.write_all(b"\n")?;
        file.write_all(credential.secret.expose())?;
        file.write_all(b"\n")?;
        file.flush()?;
        Ok(file)
    }
}

fn spawn_line_reader<R>(stream: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
}

/// Kill and reap a child whose startup failed.
async fn reap(child: &mut Child) {
    if child.id().is_some() {
        let _ = child.start_kill();
    }
    let _ = child.wait().await;
}

fn describe_exit(status: &std::process::ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}

/// Supervisor errors
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("no such session: {0}")]
    SessionNotFound(SessionId),

    #[error("could not start {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("VPN client rejected the credentials")]
    AuthRejected,

    #[error("VPN client reported a fatal error: {0}")]
    Startup(String),

    #[error("VPN client exited during startup ({0})")]
    EarlyExit(String),

    #[error("timed out waiting for the VPN handshake")]
    HandshakeTimeout,

    #[error("session {0} did not exit after SIGKILL")]
    Unkillable(SessionId),

    #[error("io error talking to the VPN client: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::credentials::Secret;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn stub_binary(dir: &Path, body: &str) -> String {
        let path = dir.join("fake-openvpn");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_str().unwrap().to_string()
    }

    fn profile(dir: &Path) -> Profile {
        let config_path = dir.join("office.ovpn");
        fs::write(&config_path, "remote vpn.example.com 1194\nauth-user-pass\n").unwrap();
        Profile {
            id: ProfileId::from("office"),
            display_name: "office.ovpn".to_string(),
            config_path,
            location_group: None,
        }
    }

    fn supervisor(dir: &Path, binary: String) -> ProcessSupervisor {
        ProcessSupervisor::new(SupervisorConfig {
            binary,
            use_sudo: false,
            handshake_timeout: Duration::from_secs(5),
            grace_period: Duration::from_secs(2),
            debug_verbosity: 4,
            auth_dir: dir.join("auth"),
        })
    }

    fn credential() -> Credential {
        Credential {
            profile_id: ProfileId::from("office"),
            username: "alice".to_string(),
            secret: Secret::from("hunter2"),
        }
    }

    #[tokio::test]
    async fn test_daemon_session_reaches_running() {
        let dir = tempfile::tempdir().unwrap();
        let binary = stub_binary(
            dir.path(),
            "echo 'TLS handshake'\necho 'Initialization Sequence Completed'\nexec sleep 30",
        );
        let sup = supervisor(dir.path(), binary);
        let profile = profile(dir.path());

        let handle = sup
            .spawn(&profile, Some(&credential()), SessionMode::Daemon)
            .await
            .unwrap();

        let session = sup.status(handle.id()).await.unwrap();
        assert_eq!(session.state, SessionState::Running);
        assert_eq!(session.profile_id, ProfileId::from("office"));

        sup.terminate(handle.id(), false).await.unwrap();
        let session = sup.status(handle.id()).await.unwrap();
        assert_eq!(session.state, SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let binary = stub_binary(
            dir.path(),
            "echo 'Initialization Sequence Completed'\nexec sleep 30",
        );
        let sup = supervisor(dir.path(), binary);
        let profile = profile(dir.path());

        let handle = sup
            .spawn(&profile, Some(&credential()), SessionMode::Daemon)
            .await
            .unwrap();

        sup.terminate(handle.id(), false).await.unwrap();
        sup.terminate(handle.id(), false).await.unwrap();
        sup.terminate(handle.id(), true).await.unwrap();

        let session = sup.status(handle.id()).await.unwrap();
        assert_eq!(session.state, SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error_and_failed_state() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), "/no/such/openvpn-binary".to_string());
        let profile = profile(dir.path());

        let result = sup
            .spawn(&profile, Some(&credential()), SessionMode::Daemon)
            .await;
        assert!(matches!(result, Err(SupervisorError::Spawn { .. })));

        let sessions = sup.sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].state, SessionState::Failed);
        assert!(sessions[0].reason.is_some());
        assert!(sup.active_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn test_early_exit_is_failed() {
        let dir = tempfile::tempdir().unwrap();
        let binary = stub_binary(dir.path(), "echo 'options error' >&2\nexit 1");
        let sup = supervisor(dir.path(), binary);
        let profile = profile(dir.path());

        let result = sup
            .spawn(&profile, Some(&credential()), SessionMode::Daemon)
            .await;
        assert!(matches!(result, Err(SupervisorError::EarlyExit(_))));

        let sessions = sup.sessions().await;
        assert_eq!(sessions[0].state, SessionState::Failed);
    }

    #[tokio::test]
    async fn test_auth_failed_marker() {
        let dir = tempfile::tempdir().unwrap();
        let binary = stub_binary(dir.path(), "echo 'AUTH_FAILED'\nexec sleep 30");
        let sup = supervisor(dir.path(), binary);
        let profile = profile(dir.path());

        let result = sup
            .spawn(&profile, Some(&credential()), SessionMode::Daemon)
            .await;
        assert!(matches!(result, Err(SupervisorError::AuthRejected)));
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let binary = stub_binary(dir.path(), "exec sleep 30");
        let sup = ProcessSupervisor::new(SupervisorConfig {
            binary,
            use_sudo: false,
            handshake_timeout: Duration::from_millis(300),
            grace_period: Duration::from_secs(2),
            debug_verbosity: 4,
            auth_dir: dir.path().join("auth"),
        });
        let profile = profile(dir.path());

        let result = sup
            .spawn(&profile, Some(&credential()), SessionMode::Daemon)
            .await;
        assert!(matches!(result, Err(SupervisorError::HandshakeTimeout)));

        let sessions = sup.sessions().await;
        assert_eq!(sessions[0].state, SessionState::Failed);
    }

    #[tokio::test]
    async fn test_debug_mode_streams_output() {
        let dir = tempfile::tempdir().unwrap();
        let binary = stub_binary(
            dir.path(),
            "echo 'line one'\necho 'Initialization Sequence Completed'\nexec sleep 30",
        );
        let sup = supervisor(dir.path(), binary);
        let profile = profile(dir.path());

        let mut handle = sup
            .spawn(&profile, Some(&credential()), SessionMode::Debug)
            .await
            .unwrap();

        let mut rx = handle.take_output().unwrap();
        let mut seen = Vec::new();
        while let Some(line) = rx.recv().await {
            let done = line.contains(HANDSHAKE_SUCCESS);
            seen.push(line);
            if done {
                break;
            }
        }
        assert!(seen.iter().any(|l| l.contains("line one")));

        // Second take yields nothing
        assert!(handle.take_output().is_none());

        sup.terminate(handle.id(), false).await.unwrap();
    }

    #[tokio::test]
    async fn test_auth_file_reaches_subprocess_and_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        // $6 is the --auth-user-pass argument given the fixed argument order
        let binary = stub_binary(
            dir.path(),
            "cat \"$6\"\necho 'Initialization Sequence Completed'\nexec sleep 30",
        );
        let sup = supervisor(dir.path(), binary);
        let profile = profile(dir.path());

        let mut handle = sup
            .spawn(&profile, Some(&credential()), SessionMode::Debug)
            .await
            .unwrap();

        let mut rx = handle.take_output().unwrap();
        let mut seen = Vec::new();
        while let Some(line) = rx.recv().await {
            let done = line.contains(HANDSHAKE_SUCCESS);
            seen.push(line);
            if done {
                break;
            }
        }
        assert!(seen.iter().any(|l| l == "alice"));

        // The transient auth file is gone once spawn returned
        let leftovers: Vec<_> = fs::read_dir(dir.path().join("auth"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".auth-"))
            .collect();
        assert!(leftovers.is_empty());

        sup.terminate(handle.id(), false).await.unwrap();
    }

    #[tokio::test]
    async fn test_unexpected_exit_transitions_to_failed() {
        let dir = tempfile::tempdir().unwrap();
        let binary = stub_binary(
            dir.path(),
            "echo 'Initialization Sequence Completed'\nsleep 0.2\nexit 3",
        );
        let sup = supervisor(dir.path(), binary);
        let profile = profile(dir.path());

        let handle = sup
            .spawn(&profile, Some(&credential()), SessionMode::Daemon)
            .await
            .unwrap();

        // Watcher notices the non-zero exit asynchronously
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let session = sup.status(handle.id()).await.unwrap();
            if session.state == SessionState::Failed {
                assert!(session.reason.unwrap().contains("exit code 3"));
                break;
            }
            assert!(Instant::now() < deadline, "session never failed");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn test_terminate_unknown_session() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), "true".to_string());

        let result = sup.terminate(SessionId(999), false).await;
        assert!(matches!(result, Err(SupervisorError::SessionNotFound(_))));
    }

    #[test]
    fn test_state_predicates() {
        assert!(SessionState::Starting.is_live());
        assert!(SessionState::Running.is_live());
        assert!(SessionState::Stopping.is_live());
        assert!(SessionState::Stopped.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(!SessionState::Running.is_terminal());
    }
}
