//! TCP bridge server.
//!
//! Binds the listener, starts the shared child (in `exclusive` mode) and runs
//! the accept loop. Each accepted connection becomes a session task; the
//! [`ListenerHandle`] returned by [`BridgeServer::start`] observes and stops
//! the whole thing.

mod config;
mod state;

pub use config::BridgeConfig;
pub use state::ListenerState;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use stdbridge_core::{ChildExitPolicy, SessionPolicy};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::error::BridgeError;
use crate::session::{SessionManager, log_connection_error, wait_for_shutdown};
use crate::subprocess::{ChildProcess, ChildRole, ChildStatus, resolve_program};
use state::StateTracker;

/// Pause after a failed `accept` (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Entry point for starting a bridge.
pub struct BridgeServer;

impl BridgeServer {
    /// Bind the listener, start the child and begin accepting connections.
    ///
    /// The port is bound before any child is spawned, so a bind failure
    /// leaves nothing running.
    pub async fn start(config: BridgeConfig) -> Result<ListenerHandle, BridgeError> {
        let bind_target = config.bind_target();
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .map_err(|source| BridgeError::Bind {
                addr: bind_target.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| BridgeError::Bind {
            addr: bind_target,
            source,
        })?;

        let (manager, shared_child) = match config.policy {
            SessionPolicy::Exclusive => {
                let (child, io) = ChildProcess::spawn(&config.child, ChildRole::Shared)?;
                (
                    SessionManager::exclusive(io, config.drain_timeout),
                    Some(child),
                )
            }
            SessionPolicy::PerConnection => {
                // Fail now rather than on the first connection.
                resolve_program(
                    &config.child.program,
                    config.child.working_directory.as_deref(),
                )?;
                (
                    SessionManager::per_connection(
                        config.child.clone(),
                        config.max_sessions,
                        config.drain_timeout,
                    ),
                    None,
                )
            }
        };

        info!(
            addr = %local_addr,
            policy = %config.policy,
            program = %config.child.program,
            "TCP bridge listening on port {}",
            local_addr.port()
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (tracker, state_rx) = StateTracker::new();
        let accept_loop = AcceptLoop {
            listener,
            manager: Arc::new(manager),
            shared_child,
            on_child_exit: config.on_child_exit,
            tracker: Arc::new(tracker),
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(accept_loop.run());

        Ok(ListenerHandle {
            local_addr,
            shutdown_tx: Arc::new(shutdown_tx),
            state_rx,
            task,
        })
    }
}

/// Handle to a running bridge.
///
/// Dropping every handle and [`ShutdownTrigger`] stops the listener, the
/// same as calling [`ListenerHandle::shutdown`].
#[derive(Debug)]
pub struct ListenerHandle {
    local_addr: SocketAddr,
    shutdown_tx: Arc<watch::Sender<bool>>,
    state_rx: watch::Receiver<ListenerState>,
    task: JoinHandle<Result<(), BridgeError>>,
}

impl ListenerHandle {
    /// The bound address (with the real port when started on port 0).
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> ListenerState {
        *self.state_rx.borrow()
    }

    /// Receiver that observes listener state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ListenerState> {
        self.state_rx.clone()
    }

    /// Cloneable trigger, e.g. for a signal handler task.
    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Stop accepting, cancel active sessions and terminate the child.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the listener to stop and return how it ended.
    pub async fn wait(self) -> Result<(), BridgeError> {
        let Self {
            shutdown_tx, task, ..
        } = self;
        let result = task.await;
        drop(shutdown_tx);
        result?
    }
}

/// Stops a bridge from anywhere.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownTrigger {
    pub fn fire(&self) {
        self.tx.send_replace(true);
    }
}

struct AcceptLoop {
    listener: TcpListener,
    manager: Arc<SessionManager>,
    shared_child: Option<ChildProcess>,
    on_child_exit: ChildExitPolicy,
    tracker: Arc<StateTracker>,
    shutdown: watch::Receiver<bool>,
}

/// Resolves when the watched child exits; never resolves for `None`.
async fn child_exited(status: Option<&mut watch::Receiver<ChildStatus>>) -> ChildStatus {
    let Some(rx) = status else {
        return std::future::pending().await;
    };
    match rx.wait_for(ChildStatus::has_exited).await {
        Ok(status) => *status,
        Err(_) => ChildStatus::Unknown,
    }
}

impl AcceptLoop {
    async fn run(mut self) -> Result<(), BridgeError> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut sessions = JoinSet::new();
        let mut child_status = self.shared_child.as_ref().map(ChildProcess::subscribe);

        let result = loop {
            tokio::select! {
                () = wait_for_shutdown(&mut self.shutdown) => {
                    info!(
                        active_sessions = self.tracker.active_sessions(),
                        "Shutdown requested, closing listener"
                    );
                    break Ok(());
                }
                status = child_exited(child_status.as_mut()) => {
                    child_status = None;
                    self.manager.disable_relay();
                    match self.on_child_exit {
                        ChildExitPolicy::Shutdown => {
                            error!(%status, "Shared child exited, stopping listener");
                            break Err(BridgeError::ChildExited { status });
                        }
                        ChildExitPolicy::KeepListening => {
                            warn!(%status, "Shared child exited, new connections will be refused");
                        }
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer)) => self.admit(socket, peer, &mut sessions, &cancel_rx),
                    Err(e) => {
                        let err = BridgeError::Accept(e);
                        warn!(error = %err, "Accept failed, backing off");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(joined) = sessions.join_next() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Session task failed");
                    }
                }
            }
        };

        let _ = cancel_tx.send(true);
        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Session task failed");
            }
        }
        if let Some(child) = self.shared_child.take() {
            let status = child.terminate().await;
            info!(%status, "Shared child stopped");
        }
        info!(addr = ?self.listener.local_addr().ok(), "Listener stopped");
        result
    }

    /// Hand `socket` to a session task. The task waits for a lease (which
    /// in `exclusive` mode may take until the previous session hands over),
    /// so the accept loop itself never blocks.
    fn admit(
        &self,
        socket: TcpStream,
        peer: SocketAddr,
        sessions: &mut JoinSet<()>,
        cancel: &watch::Receiver<bool>,
    ) {
        if let Err(e) = socket.set_nodelay(true) {
            debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let manager = Arc::clone(&self.manager);
        let tracker = Arc::clone(&self.tracker);
        let mut cancel = cancel.clone();
        sessions.spawn(async move {
            let acquired = tokio::select! {
                acquired = manager.acquire() => acquired,
                () = wait_for_shutdown(&mut cancel) => return,
            };
            let lease = match acquired {
                Ok(lease) => lease,
                Err(rejection) => {
                    warn!(%peer, reason = %rejection, "Rejecting connection");
                    #[cfg(feature = "metrics")]
                    stdbridge_core::metrics::record_session_rejected(rejection.as_str());
                    drop(socket);
                    return;
                }
            };

            let session_id = uuid::Uuid::new_v4().to_string();
            info!(%session_id, %peer, "Client connected");
            #[cfg(feature = "metrics")]
            stdbridge_core::metrics::record_session_opened();

            tracker.session_started();
            let report = manager.serve(lease, socket, peer, session_id, cancel).await;
            tracker.session_finished();
            log_connection_error(report);
        });
    }
}
