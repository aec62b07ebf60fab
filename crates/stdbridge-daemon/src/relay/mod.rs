//! Relay module: one unidirectional byte pump per direction.
//!
//! A session runs two pumps, socket to child stdin and child stdout to
//! socket. Each pump owns its reader and writer and hands them back when it
//! stops, so the session can decide what to close and what to keep.

mod pump;

pub use pump::{Direction, PUMP_BUFFER_SIZE, PumpEnd, Pumped, pump};
