//! stdbridge Core Library
//!
//! Shared functionality for the stdbridge daemon:
//! - Layered configuration (defaults, TOML files, environment)
//! - Tracing initialisation
//! - Optional `OpenTelemetry` metrics (`metrics` feature)
//! - Common error types

pub mod config;
pub mod error;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod tracing_init;

pub use config::{ChildExitPolicy, Config, SessionPolicy};
pub use error::{Error, Result};
