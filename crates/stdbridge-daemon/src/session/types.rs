//! Session types.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::watch;

/// How a session ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// The client stopped sending; child output was drained.
    ClientClosed,
    /// Reading from the client failed (e.g. connection reset).
    ClientFailed(std::io::Error),
    /// Writing to the client failed; the peer is gone.
    ClientUnwritable(std::io::Error),
    /// Writing to the child's stdin failed; the child stopped reading.
    ChildInputClosed(std::io::Error),
    /// The child closed its stdout (usually because it exited).
    ChildOutputClosed,
    /// Reading the child's stdout failed.
    ChildOutputFailed(std::io::Error),
    /// The listener is shutting down.
    Shutdown,
}

impl SessionEnd {
    /// Take the socket-side error, if the session ended on one.
    pub fn into_socket_error(self) -> Option<std::io::Error> {
        match self {
            Self::ClientFailed(e) | Self::ClientUnwritable(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientClosed => f.write_str("client closed"),
            Self::ClientFailed(e) => write!(f, "client read failed: {e}"),
            Self::ClientUnwritable(e) => write!(f, "client write failed: {e}"),
            Self::ChildInputClosed(e) => write!(f, "child stdin closed: {e}"),
            Self::ChildOutputClosed => f.write_str("child stdout closed"),
            Self::ChildOutputFailed(e) => write!(f, "child stdout read failed: {e}"),
            Self::Shutdown => f.write_str("listener shutdown"),
        }
    }
}

/// Per-session summary, logged on disconnect.
#[derive(Debug)]
pub struct SessionReport {
    pub session_id: String,
    pub peer: SocketAddr,
    /// Bytes relayed from the client to the child.
    pub bytes_in: u64,
    /// Bytes relayed from the child to the client.
    pub bytes_out: u64,
    pub duration: Duration,
    pub end: SessionEnd,
}

/// Knobs for one session's teardown.
#[derive(Debug, Clone, Copy)]
pub struct SessionParams {
    /// Close the child's stdin once the client stops sending, so the child
    /// sees end-of-input. Off when the child outlives the session.
    pub close_child_stdin_on_eof: bool,
    /// How long child output keeps flowing after the client stops sending.
    pub drain_timeout: Duration,
}

/// Signals a session listens to besides its own streams.
#[derive(Debug, Clone)]
pub struct SessionSignals {
    /// Listener shutdown.
    pub shutdown: watch::Receiver<bool>,
    /// Number of connections waiting for this session's child streams.
    /// Once the client has stopped sending, a non-zero count ends the
    /// output drain early so the streams change hands at once.
    pub contenders: Option<watch::Receiver<usize>>,
}

impl SessionSignals {
    /// Signals for a session nobody else can contend for.
    pub const fn shutdown_only(shutdown: watch::Receiver<bool>) -> Self {
        Self {
            shutdown,
            contenders: None,
        }
    }
}
