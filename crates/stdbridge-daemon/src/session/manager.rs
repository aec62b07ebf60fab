//! Session manager: decides which child serves an accepted connection.
//!
//! In `exclusive` mode the single shared child's streams are leased to one
//! session at a time. Between sessions the manager holds them and discards
//! whatever the child writes, so a client never receives output produced for
//! or after an earlier one. In `per-connection` mode every session gets a
//! dedicated child, bounded by a semaphore.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use stdbridge_core::SessionPolicy;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connection::run_session;
use super::types::{SessionParams, SessionReport, SessionSignals};
use crate::error::BridgeError;
use crate::relay::PUMP_BUFFER_SIZE;
use crate::subprocess::{ChildIo, ChildProcess, ChildRole, ChildSpec, SubprocessError};

/// Why a connection was turned away.
#[derive(Debug)]
pub enum Rejection {
    /// Another client held the shared child for the whole handover wait.
    Busy,
    /// The shared child has exited or its streams are unusable.
    RelayDisabled,
    /// `max_sessions` dedicated children are already running.
    PoolExhausted { max: usize },
    /// The dedicated child could not be started.
    Spawn(SubprocessError),
}

impl Rejection {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Busy => "busy",
            Self::RelayDisabled => "relay_disabled",
            Self::PoolExhausted { .. } => "pool_exhausted",
            Self::Spawn(_) => "spawn_failed",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => f.write_str("another client is connected"),
            Self::RelayDisabled => f.write_str("child process is gone; relay disabled"),
            Self::PoolExhausted { max } => write!(f, "session limit reached ({max})"),
            Self::Spawn(e) => write!(f, "{e}"),
        }
    }
}

/// Shared child streams while no session holds them.
#[derive(Debug)]
struct Parked {
    stdin: ChildStdin,
    stop: oneshot::Sender<()>,
    discard: JoinHandle<Option<ChildStdout>>,
}

impl Parked {
    fn park(io: ChildIo) -> Self {
        let (stop, stop_rx) = oneshot::channel();
        Self {
            stdin: io.stdin,
            stop,
            discard: tokio::spawn(discard_output(io.stdout, stop_rx)),
        }
    }

    /// Stop discarding and take the streams back. `None` once stdout is gone.
    async fn unpark(self) -> Option<ChildIo> {
        let _ = self.stop.send(());
        let stdout = self.discard.await.ok().flatten()?;
        Some(ChildIo {
            stdin: self.stdin,
            stdout,
        })
    }
}

/// Read and drop child output until told to stop; returns the stream unless
/// it ended.
async fn discard_output(
    mut stdout: ChildStdout,
    mut stop: oneshot::Receiver<()>,
) -> Option<ChildStdout> {
    let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
    let mut discarded: u64 = 0;
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            res = stdout.read(&mut buf) => match res {
                Ok(0) => {
                    debug!(discarded, "Shared child output closed while idle");
                    return None;
                }
                Ok(n) => discarded += n as u64,
                Err(e) => {
                    warn!(error = %e, "Failed to read shared child output while idle");
                    return None;
                }
            },
        }
    }
    if discarded > 0 {
        info!(
            bytes = discarded,
            "Discarded child output written while no client was connected"
        );
    }
    Some(stdout)
}

/// Counts a connection as waiting for the shared streams while alive.
struct Contender<'a>(&'a watch::Sender<usize>);

impl<'a> Contender<'a> {
    fn register(waiting: &'a watch::Sender<usize>) -> Self {
        waiting.send_modify(|n| *n += 1);
        Self(waiting)
    }
}

impl Drop for Contender<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// The shared child's streams, leased to one session.
#[derive(Debug)]
pub struct SharedLease {
    io: ChildIo,
    slot: OwnedMutexGuard<Option<Parked>>,
}

/// Child streams granted to one session.
#[derive(Debug)]
pub enum Lease {
    /// The shared child's streams; handed back when the session ends.
    Shared(SharedLease),
    /// A child started for this session alone.
    Dedicated {
        io: ChildIo,
        child: ChildProcess,
        permit: OwnedSemaphorePermit,
    },
}

#[derive(Debug)]
enum Mode {
    Exclusive {
        slot: Arc<Mutex<Option<Parked>>>,
        relay_disabled: AtomicBool,
        contenders: watch::Sender<usize>,
    },
    PerConnection {
        spec: ChildSpec,
        permits: Arc<Semaphore>,
        max_sessions: usize,
    },
}

/// Hands out child streams to sessions and takes them back.
#[derive(Debug)]
pub struct SessionManager {
    mode: Mode,
    drain_timeout: Duration,
}

impl SessionManager {
    /// Manager for a single shared child whose streams are `io`.
    ///
    /// Output the child writes before the first client connects is
    /// discarded. Must be called from within a Tokio runtime.
    pub fn exclusive(io: ChildIo, drain_timeout: Duration) -> Self {
        Self {
            mode: Mode::Exclusive {
                slot: Arc::new(Mutex::new(Some(Parked::park(io)))),
                relay_disabled: AtomicBool::new(false),
                contenders: watch::Sender::new(0),
            },
            drain_timeout,
        }
    }

    /// Manager that spawns `spec` for every session, at most `max_sessions`
    /// at once.
    pub fn per_connection(spec: ChildSpec, max_sessions: usize, drain_timeout: Duration) -> Self {
        Self {
            mode: Mode::PerConnection {
                spec,
                permits: Arc::new(Semaphore::new(max_sessions)),
                max_sessions,
            },
            drain_timeout,
        }
    }

    pub const fn policy(&self) -> SessionPolicy {
        match self.mode {
            Mode::Exclusive { .. } => SessionPolicy::Exclusive,
            Mode::PerConnection { .. } => SessionPolicy::PerConnection,
        }
    }

    /// Stop leasing the shared child. Has no effect in `per-connection` mode.
    pub fn disable_relay(&self) {
        if let Mode::Exclusive {
            slot,
            relay_disabled,
            ..
        } = &self.mode
        {
            relay_disabled.store(true, Ordering::SeqCst);
            // Idle streams are dropped now; leased ones when their session ends.
            if let Ok(mut parked) = slot.try_lock() {
                parked.take();
            }
        }
    }

    /// Grant child streams to a new session, or say why not.
    ///
    /// In `exclusive` mode this waits up to the drain timeout for the current
    /// session to hand the streams over. A session whose client has stopped
    /// sending does so at once; an active one keeps them.
    pub async fn acquire(&self) -> Result<Lease, Rejection> {
        match &self.mode {
            Mode::Exclusive {
                slot,
                relay_disabled,
                contenders,
            } => {
                if relay_disabled.load(Ordering::SeqCst) {
                    return Err(Rejection::RelayDisabled);
                }
                let mut guard = {
                    let _waiting = Contender::register(contenders);
                    tokio::time::timeout(self.drain_timeout, Arc::clone(slot).lock_owned())
                        .await
                        .map_err(|_| Rejection::Busy)?
                };
                if relay_disabled.load(Ordering::SeqCst) {
                    return Err(Rejection::RelayDisabled);
                }
                let parked = guard.take().ok_or(Rejection::RelayDisabled)?;
                match parked.unpark().await {
                    Some(io) => Ok(Lease::Shared(SharedLease { io, slot: guard })),
                    None => {
                        warn!("Shared child output closed; relay disabled");
                        relay_disabled.store(true, Ordering::SeqCst);
                        Err(Rejection::RelayDisabled)
                    }
                }
            }
            Mode::PerConnection {
                spec,
                permits,
                max_sessions,
            } => {
                let permit = Arc::clone(permits)
                    .try_acquire_owned()
                    .map_err(|_| Rejection::PoolExhausted { max: *max_sessions })?;
                let (child, io) =
                    ChildProcess::spawn(spec, ChildRole::PerConnection).map_err(Rejection::Spawn)?;
                Ok(Lease::Dedicated { io, child, permit })
            }
        }
    }

    /// Park returned shared streams for the next session, or disable the
    /// relay if they did not survive.
    fn release(&self, mut slot: OwnedMutexGuard<Option<Parked>>, io: Option<ChildIo>) {
        let Mode::Exclusive { relay_disabled, .. } = &self.mode else {
            return;
        };
        match io {
            Some(io) if !relay_disabled.load(Ordering::SeqCst) => {
                *slot = Some(Parked::park(io));
            }
            Some(_) => {}
            None => {
                warn!("Shared child streams closed; relay disabled");
                relay_disabled.store(true, Ordering::SeqCst);
            }
        }
    }

    fn signals(&self, shutdown: watch::Receiver<bool>) -> SessionSignals {
        let contenders = match &self.mode {
            Mode::Exclusive { contenders, .. } => Some(contenders.subscribe()),
            Mode::PerConnection { .. } => None,
        };
        SessionSignals {
            shutdown,
            contenders,
        }
    }

    /// Run one session on `lease` and clean up after it.
    pub async fn serve(
        self: Arc<Self>,
        lease: Lease,
        socket: TcpStream,
        peer: SocketAddr,
        session_id: String,
        shutdown: watch::Receiver<bool>,
    ) -> SessionReport {
        let (io, shared_slot, dedicated) = match lease {
            Lease::Shared(SharedLease { io, slot }) => (io, Some(slot), None),
            Lease::Dedicated { io, child, permit } => (io, None, Some((child, permit))),
        };
        let params = SessionParams {
            close_child_stdin_on_eof: dedicated.is_some(),
            drain_timeout: self.drain_timeout,
        };

        let (report, returned) = run_session(
            &session_id,
            peer,
            socket,
            io.stdin,
            io.stdout,
            params,
            self.signals(shutdown),
        )
        .await;
        let returned = returned.map(|(stdin, stdout)| ChildIo { stdin, stdout });

        info!(
            session_id = %report.session_id,
            %peer,
            bytes_in = report.bytes_in,
            bytes_out = report.bytes_out,
            duration_ms = u64::try_from(report.duration.as_millis()).unwrap_or(u64::MAX),
            end = %report.end,
            "Client disconnected"
        );

        if let Some(slot) = shared_slot {
            self.release(slot, returned);
        } else if let Some((child, permit)) = dedicated {
            // Closing stdin first gives the child a chance to exit cleanly.
            drop(returned);
            let child_id = child.id().to_string();
            let status = child.terminate().await;
            debug!(session_id = %report.session_id, %child_id, %status, "Dedicated child finished");
            drop(permit);
        }

        report
    }
}

/// Log a session's socket fault as a connection error.
pub(crate) fn log_connection_error(report: SessionReport) {
    let session_id = report.session_id;
    if let Some(source) = report.end.into_socket_error() {
        let err = BridgeError::Connection { session_id, source };
        warn!(error = %err, "Connection error");
    }
}
