//! Bridge server configuration.

use std::time::Duration;

use stdbridge_core::{ChildExitPolicy, Config, SessionPolicy};

use crate::subprocess::ChildSpec;

/// Runtime configuration for [`BridgeServer`](super::BridgeServer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Host or IP to bind.
    pub host: String,
    /// TCP port; `0` picks a free one.
    pub port: u16,
    /// Child process to relay to.
    pub child: ChildSpec,
    /// How connections map onto children.
    pub policy: SessionPolicy,
    /// Concurrent session limit for `per-connection` mode.
    pub max_sessions: usize,
    /// How long child output keeps flowing after the client stops sending.
    pub drain_timeout: Duration,
    /// What to do when the shared child exits.
    pub on_child_exit: ChildExitPolicy,
}

impl BridgeConfig {
    /// Bridge on all interfaces at `port`, relaying to `child`.
    pub fn new(port: u16, child: ChildSpec) -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port,
            child,
            policy: SessionPolicy::default(),
            max_sessions: 8,
            drain_timeout: Duration::from_secs(1),
            on_child_exit: ChildExitPolicy::default(),
        }
    }

    /// Build from a loaded and validated [`Config`].
    pub fn from_config(config: &Config) -> stdbridge_core::Result<Self> {
        config.validate()?;
        let program = config
            .child
            .command
            .clone()
            .ok_or_else(|| stdbridge_core::Error::Config("no child command".to_string()))?;

        let mut child = ChildSpec::new(program, config.child.args.iter().cloned())
            .with_terminate_timeout(Duration::from_secs(config.child.terminate_timeout_secs));
        child.working_directory.clone_from(&config.child.working_directory);
        child.env.clone_from(&config.child.env);

        Ok(Self {
            host: config.listener.host.clone(),
            port: config.listener.port,
            child,
            policy: config.sessions.policy,
            max_sessions: config.sessions.max_sessions,
            drain_timeout: Duration::from_millis(config.sessions.drain_timeout_ms),
            on_child_exit: config.child.on_exit,
        })
    }

    /// Set the bind host.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the session policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: SessionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set max concurrent sessions (`per-connection` mode).
    #[must_use]
    pub const fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    /// Set the output drain timeout.
    #[must_use]
    pub const fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Set the shared child exit policy.
    #[must_use]
    pub const fn with_child_exit_policy(mut self, policy: ChildExitPolicy) -> Self {
        self.on_child_exit = policy;
        self
    }

    /// `host:port` as given, for logs and errors.
    pub fn bind_target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
