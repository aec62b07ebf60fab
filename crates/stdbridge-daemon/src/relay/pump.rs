//! Byte pump between an async reader and an async writer.

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::trace;

/// Read buffer size for each pump.
pub const PUMP_BUFFER_SIZE: usize = 8 * 1024;

/// Which way bytes flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Socket to child stdin.
    Inbound,
    /// Child stdout to socket.
    Outbound,
}

impl Direction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a pump stopped.
#[derive(Debug)]
pub enum PumpEnd {
    /// The reader reached end-of-stream.
    Eof,
    ReadFailed(std::io::Error),
    WriteFailed(std::io::Error),
    /// The cancel signal fired (or its sender was dropped) while no chunk
    /// was partly written. The writer is clean.
    Cancelled,
    /// The cancel signal fired after part of a chunk had been written. The
    /// writer's peer holds a truncated chunk.
    Interrupted,
}

impl PumpEnd {
    pub const fn is_eof(&self) -> bool {
        matches!(self, Self::Eof)
    }

    /// Whether the writer can carry another stream's bytes afterwards.
    pub const fn writer_is_clean(&self) -> bool {
        !matches!(self, Self::WriteFailed(_) | Self::Interrupted)
    }
}

impl fmt::Display for PumpEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eof => f.write_str("end of stream"),
            Self::ReadFailed(e) => write!(f, "read failed: {e}"),
            Self::WriteFailed(e) => write!(f, "write failed: {e}"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Interrupted => f.write_str("cancelled mid-chunk"),
        }
    }
}

/// A finished pump: its endpoints, the byte counts and the reason it stopped.
#[derive(Debug)]
pub struct Pumped<R, W> {
    pub reader: R,
    pub writer: W,
    /// Bytes written to `writer`.
    pub bytes: u64,
    /// Bytes taken from `reader` that never reached `writer`.
    pub dropped: usize,
    pub end: PumpEnd,
}

/// Copy bytes from `reader` to `writer` until end-of-stream, an I/O error or
/// cancellation.
///
/// Every chunk is written in full and flushed before the next read, so order
/// is preserved and nothing sits in a buffer between the two ends. The cancel
/// signal is observed while waiting on either side. A chunk cut off by
/// cancellation is accounted for in [`Pumped::dropped`], and
/// [`PumpEnd::Interrupted`] marks a writer left holding part of it.
pub async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    direction: Direction,
    session_id: &str,
    mut cancel: watch::Receiver<bool>,
) -> Pumped<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
    let mut bytes: u64 = 0;
    let mut dropped = 0;

    let end = 'relay: loop {
        if *cancel.borrow_and_update() {
            break PumpEnd::Cancelled;
        }

        let n = tokio::select! {
            biased;
            _ = cancel.changed() => break PumpEnd::Cancelled,
            res = reader.read(&mut buf) => match res {
                Ok(0) => break PumpEnd::Eof,
                Ok(n) => n,
                Err(e) => break PumpEnd::ReadFailed(e),
            },
        };

        // `write` is cancel-safe, so progress through the chunk is exact.
        let mut written = 0;
        while written < n {
            tokio::select! {
                biased;
                _ = cancel.changed() => {
                    dropped = n - written;
                    bytes += written as u64;
                    break 'relay if written == 0 {
                        PumpEnd::Cancelled
                    } else {
                        PumpEnd::Interrupted
                    };
                }
                res = writer.write(&buf[written..n]) => match res {
                    Ok(0) => {
                        dropped = n - written;
                        bytes += written as u64;
                        break 'relay PumpEnd::WriteFailed(std::io::ErrorKind::WriteZero.into());
                    }
                    Ok(k) => written += k,
                    Err(e) => {
                        dropped = n - written;
                        bytes += written as u64;
                        break 'relay PumpEnd::WriteFailed(e);
                    }
                },
            }
        }
        bytes += n as u64;

        // The chunk is fully handed over; a cancel during flush ends the
        // pump cleanly on the next iteration.
        tokio::select! {
            biased;
            _ = cancel.changed() => break PumpEnd::Cancelled,
            res = writer.flush() => {
                if let Err(e) = res {
                    break PumpEnd::WriteFailed(e);
                }
            }
        }

        trace!(session_id, %direction, chunk = n, total = bytes, "Relayed chunk");
        #[cfg(feature = "metrics")]
        stdbridge_core::metrics::record_bytes_relayed(direction.as_str(), n as u64);
    };

    trace!(session_id, %direction, total = bytes, dropped, %end, "Pump stopped");
    Pumped {
        reader,
        writer,
        bytes,
        dropped,
        end,
    }
}
