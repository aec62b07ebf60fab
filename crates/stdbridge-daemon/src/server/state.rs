//! Listener state machine.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::watch;

/// Listener state: `Listening → Connected → Idle → Connected → ...`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Bound, no session has started yet.
    Listening,
    /// At least one session is active.
    Connected,
    /// All sessions have ended; waiting for the next connection.
    Idle,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Listening => "listening",
            Self::Connected => "connected",
            Self::Idle => "idle",
        })
    }
}

/// Counts active sessions and publishes the resulting [`ListenerState`].
#[derive(Debug)]
pub(crate) struct StateTracker {
    active: AtomicUsize,
    tx: watch::Sender<ListenerState>,
}

impl StateTracker {
    pub fn new() -> (Self, watch::Receiver<ListenerState>) {
        let (tx, rx) = watch::channel(ListenerState::Listening);
        (
            Self {
                active: AtomicUsize::new(0),
                tx,
            },
            rx,
        )
    }

    pub fn session_started(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
        self.tx.send_replace(ListenerState::Connected);
    }

    pub fn session_finished(&self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tx.send_replace(ListenerState::Idle);
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}
