//! stdbridge
//!
//! Listens on a TCP port and relays each connection to a child process's
//! stdin/stdout, e.g. to expose a stdio MCP server over the network:
//!
//! ```text
//! stdbridge --port 3000 -- mcp-server-filesystem /personal
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use stdbridge_core::{ChildExitPolicy, Config, SessionPolicy};
use stdbridge_daemon::{BridgeConfig, BridgeServer};

#[derive(Parser, Debug)]
#[command(name = "stdbridge")]
#[command(version, about = "Relay a TCP connection to a child process's stdin/stdout")]
struct Args {
    /// TOML config file, layered over the global config
    #[arg(long, env = "STDBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Host or IP to bind
    #[arg(long, env = "STDBRIDGE_HOST")]
    host: Option<String>,

    /// TCP port to listen on (default 3000)
    #[arg(short, long, env = "STDBRIDGE_PORT")]
    port: Option<u16>,

    /// How connections map onto child processes.
    #[arg(long, env = "STDBRIDGE_SESSION_POLICY", value_parser = ["exclusive", "per-connection"])]
    session_policy: Option<String>,

    /// Maximum concurrent sessions in per-connection mode
    #[arg(long, env = "STDBRIDGE_MAX_SESSIONS")]
    max_sessions: Option<usize>,

    /// Milliseconds child output keeps flowing after the client stops sending
    #[arg(long, env = "STDBRIDGE_DRAIN_TIMEOUT_MS")]
    drain_timeout_ms: Option<u64>,

    /// What to do when the shared child exits.
    #[arg(long, env = "STDBRIDGE_ON_CHILD_EXIT", value_parser = ["keep-listening", "shutdown"])]
    on_child_exit: Option<String>,

    /// Seconds to wait for graceful child shutdown before SIGKILL.
    #[arg(long, env = "STDBRIDGE_TERMINATE_TIMEOUT")]
    terminate_timeout: Option<u64>,

    /// Working directory for the child process
    #[arg(long, env = "STDBRIDGE_WORKING_DIR")]
    working_dir: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, env = "STDBRIDGE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "STDBRIDGE_LOG_JSON")]
    log_json: bool,

    /// OpenTelemetry OTLP endpoint for traces and metrics export
    /// (e.g. `http://localhost:4317`). Requires the `metrics` feature.
    #[cfg(feature = "metrics")]
    #[arg(long, env = "STDBRIDGE_METRICS_ENDPOINT")]
    metrics_endpoint: Option<String>,

    /// Child command and its arguments, after `--`
    #[arg(last = true)]
    command: Vec<String>,
}

impl Args {
    /// CLI values override everything loaded from files and the environment.
    fn apply_to(&self, config: &mut Config) -> anyhow::Result<()> {
        if let Some(host) = &self.host {
            config.listener.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.listener.port = port;
        }
        if let Some(policy) = &self.session_policy {
            config.sessions.policy = policy.parse::<SessionPolicy>().map_err(anyhow::Error::msg)?;
        }
        if let Some(max) = self.max_sessions {
            config.sessions.max_sessions = max;
        }
        if let Some(ms) = self.drain_timeout_ms {
            config.sessions.drain_timeout_ms = ms;
        }
        if let Some(policy) = &self.on_child_exit {
            config.child.on_exit = policy.parse::<ChildExitPolicy>().map_err(anyhow::Error::msg)?;
        }
        if let Some(secs) = self.terminate_timeout {
            config.child.terminate_timeout_secs = secs;
        }
        if let Some(dir) = &self.working_dir {
            config.child.working_directory = Some(dir.clone());
        }
        if let Some(level) = &self.log_level {
            config.log.level.clone_from(level);
        }
        if self.log_json {
            config.log.json = true;
        }
        if let Some((program, args)) = self.command.split_first() {
            config.child.command = Some(program.clone());
            config.child.args = args.to_vec();
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = stdbridge_core::config::load_config(args.config.as_deref())?;
    args.apply_to(&mut config)?;

    let level = &config.log.level;
    let log_filter = format!("stdbridge={level},stdbridge_daemon={level},stdbridge_core={level}");
    // Hold the guard so the OTel pipeline stays alive for the process lifetime.
    #[cfg(feature = "metrics")]
    let _metrics_guard = stdbridge_core::tracing_init::init_tracing_with_metrics(
        &log_filter,
        config.log.json,
        args.metrics_endpoint.as_deref(),
    );
    #[cfg(not(feature = "metrics"))]
    stdbridge_core::tracing_init::init_tracing(&log_filter, config.log.json);

    let bridge_config = BridgeConfig::from_config(&config)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        target = %bridge_config.bind_target(),
        program = %bridge_config.child.program,
        args = ?bridge_config.child.args,
        policy = %bridge_config.policy,
        "Starting stdbridge"
    );

    let handle = BridgeServer::start(bridge_config).await?;

    // Notify systemd that the bridge is ready to serve (unix only).
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    let trigger = handle.shutdown_trigger();
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(()) => trigger.fire(),
            Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signals"),
        }
    });

    handle.wait().await?;
    info!("stdbridge stopped");
    Ok(())
}

/// Resolve on Ctrl+C or (unix) SIGTERM.
async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }
    Ok(())
}
