//! Workspace agent daemon CLI entry point.
//!
//! See `wsagent_core` for the actual implementation. This binary only wires
//! up flag parsing, file logging, signal handling, and the supervisor loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use wsagent_core::config::AgentConfig;
use wsagent_core::controlplane::HttpControlPlaneClient;
use wsagent_core::overlay::TcpOverlayNetwork;
use wsagent_core::Agent;

/// Global flag for signal-triggered shutdown (as Arc for signal-hook compatibility).
static SHUTDOWN_FLAG: std::sync::LazyLock<Arc<AtomicBool>> =
    std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

#[derive(Parser)]
#[command(name = "wsagentd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Workspace agent: SSH/PTY/file-transfer access to a remote workspace over an overlay network")]
struct Cli {
    /// Control plane base URL.
    #[arg(long, env = "WSAGENT_CONTROL_PLANE_URL", default_value = "http://localhost:3000")]
    control_plane_url: String,

    /// Override the scratch directory used for scrollback and temp files.
    #[arg(long, env = "WSAGENT_TEMP_DIR")]
    temp_dir: Option<std::path::PathBuf>,

    /// Override how long an idle reconnecting-PTY session survives before eviction.
    #[arg(long, env = "WSAGENT_IDLE_TIMEOUT_SECS")]
    idle_timeout_secs: Option<u64>,

    /// Base TCP port the stand-in overlay network binds its four listener
    /// ports against (`base + port`, see `overlay::ports`).
    #[arg(long, env = "WSAGENT_OVERLAY_BASE_PORT", default_value_t = 9000)]
    overlay_base_port: u16,
}

fn init_logging() {
    let log_path = std::env::var("WSAGENT_LOG_FILE")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir().join("wsagentd.log"));
    let log_file = std::fs::File::create(&log_path)
        .unwrap_or_else(|_| panic!("failed to create log file at {log_path:?}"));
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Pipe(Box::new(log_file)))
        .format_timestamp_secs()
        .init();
}

fn register_signal_handlers() -> Result<()> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::flag;
    flag::register(SIGINT, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGTERM, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGHUP, Arc::clone(&SHUTDOWN_FLAG))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        log::error!("PANIC: {panic_info:?}");
        default_hook(panic_info);
    }));

    let cli = Cli::parse();
    register_signal_handlers()?;

    let control_plane = Arc::new(HttpControlPlaneClient::new(cli.control_plane_url));
    let mut config = AgentConfig::new(control_plane);
    if let Some(temp_dir) = cli.temp_dir {
        config.temp_dir = temp_dir;
    }
    if let Some(secs) = cli.idle_timeout_secs {
        config.idle_timeout = std::time::Duration::from_secs(secs);
    }

    let overlay = Arc::new(TcpOverlayNetwork::new(cli.overlay_base_port));
    let agent = Arc::new(Agent::new(config, overlay));

    log::info!("wsagentd v{} starting", env!("CARGO_PKG_VERSION"));

    let shutdown_watcher = {
        let agent = Arc::clone(&agent);
        tokio::spawn(async move {
            loop {
                if SHUTDOWN_FLAG.load(Ordering::Relaxed) {
                    log::info!("shutdown signal received, closing agent");
                    agent.close();
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            }
        })
    };

    agent.run().await;
    shutdown_watcher.abort();

    log::info!("wsagentd shut down cleanly");
    Ok(())
}
