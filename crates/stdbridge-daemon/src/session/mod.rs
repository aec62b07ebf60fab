//! Relay sessions: one accepted connection and its two relay directions.

mod connection;
mod manager;
mod state;
mod types;

pub(crate) use connection::wait_for_shutdown;
pub(crate) use manager::log_connection_error;

pub use connection::run_session;
pub use manager::{Lease, Rejection, SessionManager, SharedLease};
pub use state::SessionPhase;
pub use types::{SessionEnd, SessionParams, SessionReport, SessionSignals};
