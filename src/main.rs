//! fishbowl: policy-gated mediation service for sandboxed agents.
//!
//! This is the binary entry point. With no subcommand it starts the
//! mediation server: the control plane (HTTP + WebSocket, default port
//! 3700), the network proxy (default port 3701), the live
//! workspace-to-host mirror, and the max-uptime timer. With a
//! subcommand it acts as an operator client against a running server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use fishbowl::{
    audit::AuditLog,
    brokers::{ExecBroker, PackageBroker},
    cli::Cli,
    cli_handler,
    config::ConfigStore,
    control::{self, AppState},
    proxy::{ProxyPolicy, ProxyServer},
    queue::PermissionQueue,
    sync::{FileSync, GitSync, LiveMirror},
};
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    match cli.command {
        Some(command) => {
            let server = cli
                .server
                .clone()
                .unwrap_or_else(|| format!("http://127.0.0.1:{}", env_port("SERVER_PORT", 3700)));
            runtime.block_on(cli_handler::run(command, &server))
        }
        None => runtime.block_on(run_server()),
    }
}

/// Initialize the tracing subscriber for debug logging (stderr).
///
/// # Verbosity Levels
/// - 0 (default): warnings and errors
/// - 1 (-v): info
/// - 2 (-vv): debug
/// - 3+ (-vvv): trace
fn init_tracing(verbose: u8) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}

fn env_port(name: &str, default: u16) -> u16 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_path(name: &str, default: &str) -> PathBuf {
    std::env::var(name)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => !matches!(value.as_str(), "false" | "0" | "no"),
        Err(_) => default,
    }
}

async fn run_server() -> Result<()> {
    let server_port = env_port("SERVER_PORT", 3700);
    let proxy_port = env_port("PROXY_PORT", 3701);
    let proxy_inline = env_flag("PROXY_INLINE", true);
    let workspace = env_path("WORKSPACE", "/workspace/merged");
    let host_project = env_path("HOST_PROJECT", "/workspace/lower");

    let max_uptime_ms = match std::env::var("MAX_UPTIME") {
        Ok(raw) => match control::parse_duration(&raw) {
            Some(ms) => Some(ms),
            None => {
                warn!("Ignoring unparseable MAX_UPTIME: {:?}", raw);
                None
            }
        },
        Err(_) => None,
    };

    let audit = AuditLog::new(PathBuf::from("data/audit.log"));
    let config = Arc::new(ConfigStore::new(PathBuf::from("sandbox.config.json")));
    config.load();

    let queue = PermissionQueue::new(Some(PathBuf::from("data/queue.json")), audit.clone());
    queue.init();

    let exec = ExecBroker::new(queue.clone(), config.clone());
    let packages = PackageBroker::new(queue.clone(), config.clone());
    let files = Arc::new(FileSync::new(
        workspace.clone(),
        host_project.clone(),
        queue.clone(),
        config.clone(),
    ));
    let git = GitSync::new(queue.clone(), config.clone());
    let mirror = LiveMirror::new(workspace.clone(), host_project.clone());
    mirror.spawn();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (events, _) = broadcast::channel(256);

    let state = Arc::new(AppState {
        queue: queue.clone(),
        config: config.clone(),
        audit: audit.clone(),
        exec,
        packages,
        files,
        git,
        mirror,
        workspace,
        host_project,
        started_at_ms: chrono::Utc::now().timestamp_millis(),
        started_at: Instant::now(),
        max_uptime_ms,
        shutdown_tx,
        events,
    });

    if proxy_inline {
        let policy = ProxyPolicy::new(config.clone(), queue.clone(), audit.clone());
        let proxy_addr: SocketAddr = ([0, 0, 0, 0], proxy_port).into();
        let proxy = ProxyServer::new(proxy_addr, policy, shutdown_rx.clone());
        tokio::spawn(async move {
            if let Err(e) = proxy.run().await {
                warn!("Proxy server exited with error: {}", e);
            }
        });
    } else {
        info!("PROXY_INLINE disabled, not starting the in-process proxy");
    }

    control::spawn_uptime_timer(state.clone());
    tokio::spawn(control::signal_handler(state.clone()));

    let app = control::router(state);
    let addr: SocketAddr = ([0, 0, 0, 0], server_port).into();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind control plane to {}", addr))?;
    info!("Control plane listening on {}", addr);

    axum::serve(listener, app)
        .await
        .context("Control plane server failed")?;

    Ok(())
}
