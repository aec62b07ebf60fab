//! Session phase tracking.

use std::fmt;

use tracing::debug;

/// Lifecycle phase of a relay session. Phases only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionPhase {
    /// Both directions are relaying.
    Connected,
    /// One direction has stopped; the other is draining or being cancelled.
    Closing,
    /// Both directions have stopped.
    Closed,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connected => "connected",
            Self::Closing => "closing",
            Self::Closed => "closed",
        })
    }
}

/// Current phase of one session.
#[derive(Debug)]
pub(crate) struct SessionState {
    session_id: String,
    phase: SessionPhase,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            phase: SessionPhase::Connected,
        }
    }

    pub const fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Move to `next` if it is later than the current phase.
    ///
    /// Returns `false` (and stays put) for backwards or repeated moves.
    pub fn advance(&mut self, next: SessionPhase) -> bool {
        if next <= self.phase {
            return false;
        }
        debug!(session_id = %self.session_id, from = %self.phase, to = %next, "Session phase change");
        self.phase = next;
        true
    }
}
