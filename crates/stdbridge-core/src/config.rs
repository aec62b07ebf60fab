//! Configuration resolution for stdbridge.
//!
//! Implements layered config resolution:
//! 1. Built-in defaults
//! 2. Global config (`<config_dir>/stdbridge/config.toml`)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)
//!
//! File layers are merged key by key, so a file only needs to mention the
//! values it changes.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Complete stdbridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub listener: ListenerConfig,
    pub child: ChildConfig,
    pub sessions: SessionConfig,
    pub log: LogConfig,
}

/// Where the bridge listens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ListenerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

/// The child process the bridge relays to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChildConfig {
    /// Program to run. Required, either here or on the command line.
    pub command: Option<String>,
    pub args: Vec<String>,
    pub working_directory: Option<PathBuf>,
    /// Extra environment variables for the child.
    pub env: BTreeMap<String, String>,
    /// Seconds to wait after SIGINT before killing the child.
    pub terminate_timeout_secs: u64,
    pub on_exit: ChildExitPolicy,
}

impl Default for ChildConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            working_directory: None,
            env: BTreeMap::new(),
            terminate_timeout_secs: 5,
            on_exit: ChildExitPolicy::default(),
        }
    }
}

/// How accepted connections map onto child processes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    pub policy: SessionPolicy,
    /// Concurrent session limit for `per-connection` mode.
    pub max_sessions: usize,
    /// How long child output keeps flowing after the client stops sending.
    pub drain_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            policy: SessionPolicy::default(),
            max_sessions: 8,
            drain_timeout_ms: 1000,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Connection-to-child mapping.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SessionPolicy {
    /// One child for the lifetime of the listener, one client at a time.
    /// Connections arriving while a client is active are rejected.
    #[default]
    Exclusive,
    /// A fresh child for every accepted connection.
    PerConnection,
}

impl SessionPolicy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Exclusive => "exclusive",
            Self::PerConnection => "per-connection",
        }
    }
}

impl fmt::Display for SessionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "exclusive" => Ok(Self::Exclusive),
            "per-connection" => Ok(Self::PerConnection),
            other => Err(format!(
                "unknown session policy '{other}' (expected 'exclusive' or 'per-connection')"
            )),
        }
    }
}

/// What the listener does when the shared child exits.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ChildExitPolicy {
    /// Log the exit and keep accepting; new connections are closed at once.
    #[default]
    KeepListening,
    /// Stop the listener.
    Shutdown,
}

impl ChildExitPolicy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::KeepListening => "keep-listening",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for ChildExitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChildExitPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "keep-listening" => Ok(Self::KeepListening),
            "shutdown" => Ok(Self::Shutdown),
            other => Err(format!(
                "unknown child exit policy '{other}' (expected 'keep-listening' or 'shutdown')"
            )),
        }
    }
}

impl Config {
    /// Check values that serde alone cannot reject.
    pub fn validate(&self) -> Result<()> {
        match self.child.command.as_deref() {
            None => {
                return Err(Error::Config(
                    "no child command configured (pass it after `--` or set child.command)"
                        .to_string(),
                ));
            }
            Some(cmd) if cmd.trim().is_empty() => {
                return Err(Error::Config("child.command is empty".to_string()));
            }
            Some(_) => {}
        }
        if self.sessions.max_sessions == 0 {
            return Err(Error::Config(
                "sessions.max_sessions must be at least 1".to_string(),
            ));
        }
        if self.listener.host.trim().is_empty() {
            return Err(Error::Config("listener.host is empty".to_string()));
        }
        Ok(())
    }
}

/// Load configuration with layered resolution.
///
/// `explicit` is the path given with `--config`; unlike the global file it
/// must exist.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    load_layered(global_config_path().as_deref(), explicit, |key| {
        std::env::var(key).ok()
    })
}

/// Resolve `global` file, then `explicit` file, then `lookup` overrides on
/// top of the defaults. A missing global file is skipped.
pub fn load_layered<F>(global: Option<&Path>, explicit: Option<&Path>, lookup: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let mut merged = toml::Table::new();

    if let Some(global_path) = global {
        if global_path.exists() {
            merge_tables(&mut merged, read_table(global_path)?);
        }
    }

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(Error::Config(format!(
                "Config file {} does not exist",
                path.display()
            )));
        }
        merge_tables(&mut merged, read_table(path)?);
    }

    let mut config: Config = toml::Value::Table(merged).try_into()?;
    apply_env_overrides(&mut config, lookup)?;
    Ok(config)
}

/// Global config file path: `<config_dir>/stdbridge/config.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("stdbridge").join("config.toml"))
}

fn read_table(path: &Path) -> Result<toml::Table> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    content.parse::<toml::Table>().map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Apply `STDBRIDGE_*` overrides read through `lookup`.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = lookup("STDBRIDGE_HOST") {
        config.listener.host = val;
    }
    if let Some(val) = lookup("STDBRIDGE_PORT") {
        config.listener.port = val
            .parse()
            .map_err(|e| Error::Config(format!("STDBRIDGE_PORT '{val}': {e}")))?;
    }
    if let Some(val) = lookup("STDBRIDGE_LOG_LEVEL") {
        config.log.level = val;
    }
    if let Some(val) = lookup("STDBRIDGE_SESSION_POLICY") {
        config.sessions.policy = val.parse().map_err(Error::Config)?;
    }
    if let Some(val) = lookup("STDBRIDGE_MAX_SESSIONS") {
        config.sessions.max_sessions = val
            .parse()
            .map_err(|e| Error::Config(format!("STDBRIDGE_MAX_SESSIONS '{val}': {e}")))?;
    }
    Ok(())
}
