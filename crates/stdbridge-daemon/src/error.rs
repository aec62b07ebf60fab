//! Bridge error types.

use crate::subprocess::{ChildStatus, SubprocessError};

/// Errors surfaced by the bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The listening address could not be bound. Fatal at startup.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The child process could not be started. Fatal at startup.
    #[error("Failed to start child process: {0}")]
    Spawn(#[from] SubprocessError),

    /// A socket fault in one session. The listener keeps running.
    #[error("Connection error in session {session_id}: {source}")]
    Connection {
        session_id: String,
        #[source]
        source: std::io::Error,
    },

    /// A transient `accept` failure. Logged; the listener keeps accepting.
    #[error("Failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),

    /// The shared child exited and the listener was told to stop with it.
    #[error("Child process exited ({status})")]
    ChildExited { status: ChildStatus },

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] stdbridge_core::Error),

    /// The listener task panicked or was aborted.
    #[error("Listener task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
