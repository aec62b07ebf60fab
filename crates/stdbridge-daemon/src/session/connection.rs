//! One relay session: a client socket wired to a child's stdin/stdout.
//!
//! Teardown is deterministic. Whichever direction stops first decides what
//! happens to the other:
//!
//! | first to stop                 | other direction                   |
//! |-------------------------------|-----------------------------------|
//! | inbound, client EOF           | drains up to `drain_timeout`      |
//! | inbound, client read error    | cancelled                         |
//! | inbound, child stdin error    | drains up to `drain_timeout`      |
//! | outbound, child EOF / error   | socket write shut down, cancelled |
//! | outbound, client write error  | cancelled                         |
//! | listener shutdown             | both cancelled                    |
//!
//! A drain also ends as soon as another connection is waiting for the same
//! child streams.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::debug;

use super::state::{SessionPhase, SessionState};
use super::types::{SessionEnd, SessionParams, SessionReport, SessionSignals};
use crate::relay::{Direction, PumpEnd, pump};

enum First<A, B> {
    Inbound(A),
    Outbound(B),
    Shutdown,
}

/// What is left once both directions have stopped.
struct Settled<I, O> {
    stdin: Option<I>,
    stdout: Option<O>,
    bytes_in: u64,
    bytes_out: u64,
    dropped_in: usize,
    dropped_out: usize,
    end: SessionEnd,
}

/// Resolves once `shutdown` is set to `true` or its sender is dropped.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Resolves once somebody is waiting for the session's streams. Never
/// resolves without a contender channel.
async fn wait_for_contender(contenders: Option<&mut watch::Receiver<usize>>) {
    if let Some(rx) = contenders {
        if rx.wait_for(|waiting| *waiting > 0).await.is_ok() {
            return;
        }
    }
    std::future::pending().await
}

fn cancel(tx: &watch::Sender<bool>) {
    // The pump may already have stopped and dropped its receiver.
    let _ = tx.send(true);
}

/// Child stdin survives unless a write to it failed or was cut short.
fn reusable_stdin<I>(writer: I, end: &PumpEnd) -> Option<I> {
    end.writer_is_clean().then_some(writer)
}

/// Child stdout survives unless it reached end-of-stream or failed.
fn reusable_stdout<O>(reader: O, end: &PumpEnd) -> Option<O> {
    matches!(
        end,
        PumpEnd::WriteFailed(_) | PumpEnd::Cancelled | PumpEnd::Interrupted
    )
    .then_some(reader)
}

/// Let `pending` run for up to `timeout`, then cancel it and collect it.
async fn drain<F: Future>(
    mut pending: Pin<&mut F>,
    timeout: Duration,
    cancel_tx: &watch::Sender<bool>,
    signals: &mut SessionSignals,
) -> F::Output {
    tokio::select! {
        out = pending.as_mut() => out,
        () = tokio::time::sleep(timeout) => {
            cancel(cancel_tx);
            pending.await
        }
        () = wait_for_shutdown(&mut signals.shutdown) => {
            cancel(cancel_tx);
            pending.await
        }
        () = wait_for_contender(signals.contenders.as_mut()) => {
            cancel(cancel_tx);
            pending.await
        }
    }
}

/// Relay between `socket` and the child's streams until the session ends.
///
/// Returns the session report and, when both child streams are still usable,
/// the streams themselves so another session can reuse them.
pub async fn run_session<S, I, O>(
    session_id: &str,
    peer: SocketAddr,
    socket: S,
    child_stdin: I,
    child_stdout: O,
    params: SessionParams,
    mut signals: SessionSignals,
) -> (SessionReport, Option<(I, O)>)
where
    S: AsyncRead + AsyncWrite,
    I: AsyncWrite + Unpin,
    O: AsyncRead + Unpin,
{
    let started = Instant::now();
    let mut state = SessionState::new(session_id);
    let (sock_rd, sock_wr) = tokio::io::split(socket);

    let (cancel_in_tx, cancel_in_rx) = watch::channel(false);
    let (cancel_out_tx, cancel_out_rx) = watch::channel(false);

    let inbound = pump(sock_rd, child_stdin, Direction::Inbound, session_id, cancel_in_rx);
    let outbound = pump(child_stdout, sock_wr, Direction::Outbound, session_id, cancel_out_rx);
    tokio::pin!(inbound);
    tokio::pin!(outbound);

    let first = tokio::select! {
        done = &mut inbound => First::Inbound(done),
        done = &mut outbound => First::Outbound(done),
        () = wait_for_shutdown(&mut signals.shutdown) => First::Shutdown,
    };
    state.advance(SessionPhase::Closing);

    let settled = match first {
        First::Inbound(inb) => {
            let (stdin, end) = match inb.end {
                PumpEnd::Eof => {
                    // Dropping stdin here is what lets a dedicated child see
                    // end-of-input and finish its output.
                    let stdin = (!params.close_child_stdin_on_eof).then_some(inb.writer);
                    (stdin, SessionEnd::ClientClosed)
                }
                PumpEnd::ReadFailed(e) => {
                    cancel(&cancel_out_tx);
                    (Some(inb.writer), SessionEnd::ClientFailed(e))
                }
                PumpEnd::WriteFailed(e) => (None, SessionEnd::ChildInputClosed(e)),
                end @ (PumpEnd::Cancelled | PumpEnd::Interrupted) => {
                    (reusable_stdin(inb.writer, &end), SessionEnd::Shutdown)
                }
            };

            let outb = drain(
                outbound.as_mut(),
                params.drain_timeout,
                &cancel_out_tx,
                &mut signals,
            )
            .await;
            let stdout = reusable_stdout(outb.reader, &outb.end);
            let end = match (outb.end, end) {
                (PumpEnd::ReadFailed(e), SessionEnd::ClientClosed) => {
                    SessionEnd::ChildOutputFailed(e)
                }
                (_, end) => end,
            };

            Settled {
                stdin,
                stdout,
                bytes_in: inb.bytes,
                bytes_out: outb.bytes,
                dropped_in: inb.dropped,
                dropped_out: outb.dropped,
                end,
            }
        }
        First::Outbound(outb) => {
            let mut sock_wr = outb.writer;
            let stdout = reusable_stdout(outb.reader, &outb.end);
            let end = match outb.end {
                PumpEnd::Eof => {
                    // Let the client see end-of-stream before the socket goes.
                    let _ = sock_wr.shutdown().await;
                    SessionEnd::ChildOutputClosed
                }
                PumpEnd::ReadFailed(e) => SessionEnd::ChildOutputFailed(e),
                PumpEnd::WriteFailed(e) => SessionEnd::ClientUnwritable(e),
                PumpEnd::Cancelled | PumpEnd::Interrupted => SessionEnd::Shutdown,
            };

            cancel(&cancel_in_tx);
            let inb = inbound.as_mut().await;
            Settled {
                stdin: reusable_stdin(inb.writer, &inb.end),
                stdout,
                bytes_in: inb.bytes,
                bytes_out: outb.bytes,
                dropped_in: inb.dropped,
                dropped_out: outb.dropped,
                end,
            }
        }
        First::Shutdown => {
            cancel(&cancel_in_tx);
            cancel(&cancel_out_tx);
            let inb = inbound.as_mut().await;
            let outb = outbound.as_mut().await;
            Settled {
                stdin: reusable_stdin(inb.writer, &inb.end),
                stdout: reusable_stdout(outb.reader, &outb.end),
                bytes_in: inb.bytes,
                bytes_out: outb.bytes,
                dropped_in: inb.dropped,
                dropped_out: outb.dropped,
                end: SessionEnd::Shutdown,
            }
        }
    };
    state.advance(SessionPhase::Closed);
    debug_assert_eq!(state.phase(), SessionPhase::Closed);

    let Settled {
        stdin,
        stdout,
        bytes_in,
        bytes_out,
        dropped_in,
        dropped_out,
        end,
    } = settled;
    if dropped_in > 0 || dropped_out > 0 {
        debug!(
            session_id,
            dropped_in, dropped_out, "Chunks cut off by session teardown"
        );
    }
    let report = SessionReport {
        session_id: session_id.to_string(),
        peer,
        bytes_in,
        bytes_out,
        duration: started.elapsed(),
        end,
    };
    (report, stdin.zip(stdout))
}
