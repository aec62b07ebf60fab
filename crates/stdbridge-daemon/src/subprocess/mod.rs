//! Child process management: spawning, supervision, termination.

pub mod child;
pub mod resolve;

pub use child::{ChildIo, ChildProcess, ChildRole, ChildSpec, ChildStatus, SubprocessError};
pub use resolve::resolve_program;
