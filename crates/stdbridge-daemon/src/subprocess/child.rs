//! Child process spawning and supervision.
//!
//! The child's stdin/stdout are piped and handed out as a [`ChildIo`]; its
//! stderr is inherited so diagnostics land on the bridge's console. A
//! supervisor task owns the [`Child`] itself, publishes its exit status and
//! performs graceful termination.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use super::resolve::resolve_program;

/// What to run and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildSpec {
    /// Program name or path. Bare names are looked up on `PATH`.
    pub program: String,
    pub args: Vec<String>,
    pub working_directory: Option<PathBuf>,
    /// Extra environment variables, added to the inherited environment.
    pub env: BTreeMap<String, String>,
    /// Grace period between SIGINT and SIGKILL.
    pub terminate_timeout: Duration,
}

impl ChildSpec {
    pub fn new(
        program: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            working_directory: None,
            env: BTreeMap::new(),
            terminate_timeout: Duration::from_secs(5),
        }
    }

    #[must_use]
    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn with_terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = timeout;
        self
    }
}

/// Whether a child serves the whole listener or a single connection.
///
/// Only affects how loudly its exit is logged: the shared child exiting
/// disables the relay, a per-connection child exiting is routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildRole {
    Shared,
    PerConnection,
}

/// Last known state of a supervised child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    Running,
    Exited(ExitStatus),
    /// The child is gone but its status could not be collected.
    Unknown,
}

impl ChildStatus {
    pub const fn has_exited(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for ChildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::Exited(status) => write!(f, "{status}"),
            Self::Unknown => f.write_str("unknown exit status"),
        }
    }
}

/// The child's piped standard streams.
#[derive(Debug)]
pub struct ChildIo {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

/// Handle to a supervised child process.
///
/// Dropping the handle asks the supervisor to terminate the child.
#[derive(Debug)]
pub struct ChildProcess {
    id: String,
    status_rx: watch::Receiver<ChildStatus>,
    terminate_tx: Option<oneshot::Sender<()>>,
}

impl ChildProcess {
    /// Spawn `spec` and start supervising it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(spec: &ChildSpec, role: ChildRole) -> Result<(Self, ChildIo), SubprocessError> {
        let program = resolve_program(&spec.program, spec.working_directory.as_deref())?;

        let mut cmd = Command::new(&program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            // Readiness notifications belong to the bridge, not the child.
            .env_remove("NOTIFY_SOCKET")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_directory {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| SubprocessError::SpawnFailed {
            program: spec.program.clone(),
            reason: e.to_string(),
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or(SubprocessError::MissingStream { stream: "stdin" })?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SubprocessError::MissingStream { stream: "stdout" })?;

        let id = uuid::Uuid::new_v4().to_string();
        let pid = child.id();
        info!(
            child_id = %id,
            pid = ?pid,
            program = %program.display(),
            args = ?spec.args,
            ?role,
            "Spawned child process"
        );

        let (status_tx, status_rx) = watch::channel(ChildStatus::Running);
        let (terminate_tx, terminate_rx) = oneshot::channel();
        tokio::spawn(supervise(
            child,
            id.clone(),
            role,
            spec.terminate_timeout,
            status_tx,
            terminate_rx,
        ));

        Ok((
            Self {
                id,
                status_rx,
                terminate_tx: Some(terminate_tx),
            },
            ChildIo { stdin, stdout },
        ))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current status without waiting.
    pub fn status(&self) -> ChildStatus {
        *self.status_rx.borrow()
    }

    /// Receiver that observes the child's exit.
    pub fn subscribe(&self) -> watch::Receiver<ChildStatus> {
        self.status_rx.clone()
    }

    /// Wait for the child to exit on its own.
    pub async fn wait(&mut self) -> ChildStatus {
        wait_exited(&mut self.status_rx).await
    }

    /// Terminate the child: SIGINT, then SIGKILL after the grace period.
    ///
    /// Returns immediately if the child has already exited.
    pub async fn terminate(mut self) -> ChildStatus {
        if let Some(tx) = self.terminate_tx.take() {
            // The supervisor is gone if the child already exited.
            let _ = tx.send(());
        }
        wait_exited(&mut self.status_rx).await
    }
}

async fn wait_exited(rx: &mut watch::Receiver<ChildStatus>) -> ChildStatus {
    match rx.wait_for(ChildStatus::has_exited).await {
        Ok(status) => *status,
        Err(_) => ChildStatus::Unknown,
    }
}

async fn supervise(
    mut child: Child,
    id: String,
    role: ChildRole,
    terminate_timeout: Duration,
    status_tx: watch::Sender<ChildStatus>,
    terminate_rx: oneshot::Receiver<()>,
) {
    let (result, requested) = tokio::select! {
        result = child.wait() => (result, false),
        // A dropped handle counts as a termination request.
        _ = terminate_rx => (stop_gracefully(&mut child, &id, terminate_timeout).await, true),
    };

    let status = match result {
        Ok(status) => {
            match (role, requested) {
                (_, true) => debug!(child_id = %id, %status, "Child process terminated"),
                (ChildRole::Shared, false) => {
                    error!(child_id = %id, %status, "Shared child process exited");
                }
                (ChildRole::PerConnection, false) => {
                    info!(child_id = %id, %status, "Child process exited");
                }
            }
            ChildStatus::Exited(status)
        }
        Err(e) => {
            warn!(child_id = %id, error = %e, "Failed to collect child exit status");
            ChildStatus::Unknown
        }
    };
    status_tx.send_replace(status);
}

async fn stop_gracefully(
    child: &mut Child,
    id: &str,
    timeout: Duration,
) -> std::io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: pid comes from our own un-reaped Child handle.
            // kill(2) with SIGINT is safe to call on any owned subprocess.
            #[allow(unsafe_code)]
            #[allow(clippy::cast_possible_wrap)]
            let ret = unsafe { libc::kill(pid as i32, libc::SIGINT) };
            if ret != 0 {
                let err = std::io::Error::last_os_error();
                warn!(child_id = %id, pid, error = %err, "Failed to send SIGINT");
            }
        }
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(result) => result,
        Err(_) => {
            warn!(child_id = %id, "Timeout waiting for graceful shutdown, killing");
            child.kill().await?;
            child.wait().await
        }
    }
}

/// Errors from subprocess operations.
#[derive(Debug, thiserror::Error)]
pub enum SubprocessError {
    #[error("Failed to spawn '{program}': {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("Child process {stream} was not captured")]
    MissingStream { stream: &'static str },
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn spawned_child_streams_are_piped() {
        let spec = ChildSpec::new("cat", Vec::<String>::new());
        let (child, mut io) = ChildProcess::spawn(&spec, ChildRole::PerConnection).unwrap();
        assert_eq!(child.status(), ChildStatus::Running);

        io.stdin.write_all(b"hello").await.unwrap();
        drop(io.stdin);

        let mut out = Vec::new();
        io.stdout.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn exit_is_published() {
        let spec = ChildSpec::new("sh", ["-c", "exit 3"]);
        let (mut child, _io) = ChildProcess::spawn(&spec, ChildRole::PerConnection).unwrap();

        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap();
        match status {
            ChildStatus::Exited(s) => assert_eq!(s.code(), Some(3)),
            other => panic!("unexpected status {other}"),
        }
    }

    #[tokio::test]
    async fn terminate_stops_long_running_child() {
        let spec = ChildSpec::new("sleep", ["30"]).with_terminate_timeout(Duration::from_secs(2));
        let (child, _io) = ChildProcess::spawn(&spec, ChildRole::Shared).unwrap();

        let status = tokio::time::timeout(Duration::from_secs(5), child.terminate())
            .await
            .unwrap();
        assert!(status.has_exited());
    }

    #[tokio::test]
    async fn environment_and_working_directory_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let spec = ChildSpec::new("sh", ["-c", "printf '%s:' \"$BRIDGE_TEST_VAR\"; pwd"])
            .with_env("BRIDGE_TEST_VAR", "set")
            .with_working_directory(dir.path());
        let (_child, mut io) = ChildProcess::spawn(&spec, ChildRole::PerConnection).unwrap();

        let mut out = String::new();
        io.stdout.read_to_string(&mut out).await.unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        assert!(out.starts_with("set:"), "got {out}");
        assert!(out.trim_end().ends_with(canonical.to_str().unwrap()), "got {out}");
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let spec = ChildSpec::new("stdbridge-no-such-program-xyz", Vec::<String>::new());
        let err = ChildProcess::spawn(&spec, ChildRole::Shared).unwrap_err();
        assert!(matches!(err, SubprocessError::SpawnFailed { .. }));
    }
}
