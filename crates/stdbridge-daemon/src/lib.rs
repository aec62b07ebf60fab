//! stdbridge daemon library
//!
//! Relays one TCP connection at a time to a child process's standard
//! streams:
//! - Listener and accept loop with an observable state machine
//! - Child process spawning, supervision and termination
//! - Relay sessions with deterministic two-direction teardown
//! - Byte pumps that preserve order and content exactly

pub mod error;
pub mod relay;
pub mod server;
pub mod session;
pub mod subprocess;

pub use error::BridgeError;
pub use server::{BridgeConfig, BridgeServer, ListenerHandle, ListenerState, ShutdownTrigger};
pub use subprocess::ChildSpec;

/// Start a bridge on `0.0.0.0:port` relaying to `command args...`, with one
/// shared child and one client at a time.
pub async fn start<A, S>(
    port: u16,
    command: impl Into<String>,
    args: A,
) -> Result<ListenerHandle, BridgeError>
where
    A: IntoIterator<Item = S>,
    S: Into<String>,
{
    BridgeServer::start(BridgeConfig::new(port, ChildSpec::new(command, args))).await
}
