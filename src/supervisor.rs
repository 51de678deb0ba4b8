//! Connection supervisor (C5, §4.1) — the agent's run loop.
//!
//! Drives one iteration of token exchange → version report → metadata
//! fetch → side effects → overlay lifecycle → coordinator stream, retrying
//! with exponential backoff on failure. Grounded on the teacher's
//! `hub::run::run_event_loop`: a `tokio::select!`-driven loop checked
//! against an external shutdown signal, here a `CancellationToken` instead
//! of an `AtomicBool` (this agent has no TUI thread to share a flag with).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::dispatcher::{self, DispatcherContext};
use crate::metadata::{MetadataSlot, SessionTokenSlot};
use crate::overlay::{ports, OverlayNetwork};
use crate::reconnect::{self, registry::PtyRegistry};
use crate::ssh;
use crate::stats;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(10);
const STARTUP_SCRIPT_LOG_NAME: &str = "coder-startup-script.log";

/// Top-level agent state, built once at process start and shared by the
/// supervisor loop and every connection handler.
pub struct Agent {
    pub config: Arc<AgentConfig>,
    pub metadata: Arc<MetadataSlot>,
    pub session_token: Arc<SessionTokenSlot>,
    pub pty_registry: Arc<PtyRegistry>,
    overlay: Arc<dyn OverlayNetwork>,
    close: CancellationToken,
    startup_script_ran: AtomicBool,
}

impl Agent {
    #[must_use]
    pub fn new(config: AgentConfig, overlay: Arc<dyn OverlayNetwork>) -> Self {
        Self {
            config: Arc::new(config),
            metadata: Arc::new(MetadataSlot::new()),
            session_token: Arc::new(SessionTokenSlot::new()),
            pty_registry: Arc::new(PtyRegistry::new()),
            overlay,
            close: CancellationToken::new(),
            startup_script_ran: AtomicBool::new(false),
        }
    }

    /// Signal shutdown; the run loop and every listener observe this and
    /// unwind within one iteration.
    pub fn close(&self) {
        self.close.cancel();
    }

    /// Run the supervisor loop until [`Agent::close`] is called. Never
    /// returns an error — every failure is logged and retried with
    /// exponential backoff, per spec.md §4.1's contract.
    pub async fn run(self: &Arc<Self>) {
        let mut backoff = INITIAL_BACKOFF;
        let mut listeners: Option<tokio::task::JoinSet<()>> = None;

        while !self.close.is_cancelled() {
            match self.run_iteration(&mut listeners).await {
                Ok(()) => backoff = INITIAL_BACKOFF,
                Err(e) => {
                    if is_benign_disconnect(&e) {
                        log::info!("coordinator stream disconnected, reconnecting");
                    } else {
                        log::warn!("supervisor iteration failed: {e}");
                    }
                }
            }

            if self.close.is_cancelled() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                () = self.close.cancelled() => break,
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }

        if let Some(mut listeners) = listeners {
            while listeners.join_next().await.is_some() {}
        }
    }

    async fn run_iteration(self: &Arc<Self>, listeners: &mut Option<tokio::task::JoinSet<()>>) -> Result<()> {
        // 1. Token exchange.
        let token = self.config.control_plane.exchange_token().await?;
        self.session_token.set(token.clone());

        // 2. Version report.
        if let Err(e) = self.config.control_plane.post_version(&token, env!("CARGO_PKG_VERSION")).await {
            log::warn!("failed to report version: {e}");
        }

        // 3. Metadata fetch and atomic swap.
        let metadata = self.config.control_plane.fetch_metadata(&token).await?;
        let previous = self.metadata.swap(metadata.clone());

        // 4. First-ever fetch: run the startup script exactly once.
        if previous.is_none() && !self.startup_script_ran.swap(true, Ordering::SeqCst) {
            let agent = Arc::clone(self);
            let script = metadata.startup_script.clone();
            tokio::spawn(async move {
                if let Err(e) = agent.run_startup_script(&script).await {
                    log::warn!("startup script failed: {e}");
                }
            });
        }

        // 5. Editor-config override side effect.
        if metadata.git_auth_config_count > 0 {
            log::info!("{} git-auth config(s) reported; applying editor override", metadata.git_auth_config_count);
            apply_editor_config_override(&metadata);
        }

        // 6. App-health / statistics reporter, scoped to this iteration.
        let stats_cancel = CancellationToken::new();
        {
            let overlay = Arc::clone(&self.overlay);
            let config = Arc::clone(&self.config);
            let token = token.clone();
            let cancel = stats_cancel.clone();
            tokio::spawn(async move { stats::run_reporter(overlay, config, token, cancel).await });
        }
        {
            let config = Arc::clone(&self.config);
            let token = token.clone();
            let cancel = stats_cancel.clone();
            tokio::spawn(async move { stats::run_app_health_reporter(config, token, cancel).await });
        }

        // 7. Overlay lifecycle: create once, otherwise just refresh.
        self.overlay.create_or_update(&hostname()).await?;
        if listeners.is_none() {
            let ctx = Arc::new(DispatcherContext {
                config: Arc::clone(&self.config),
                metadata: Arc::clone(&self.metadata),
                session_token: Arc::clone(&self.session_token),
                pty_registry: Arc::clone(&self.pty_registry),
                ssh_config: ssh::server_config(ssh::generate_host_key()?),
            });
            let mut joinset = dispatcher::spawn_listeners(Arc::clone(&self.overlay), ctx, self.close.clone());

            joinset.spawn(stats::serve_http(Arc::clone(&self.overlay), ports::STATISTICS, self.close.clone()));

            let sweeper_registry = Arc::clone(&self.pty_registry);
            let sweeper_config = (*self.config).clone();
            let sweeper_cancel = self.close.clone();
            joinset.spawn(reconnect::run_idle_sweeper(sweeper_registry, sweeper_config, sweeper_cancel));

            *listeners = Some(joinset);
        }

        // 8. Coordinator stream: block until it errors or we're closing.
        let result = self.pump_coordinator_stream(&token, &stats_cancel).await;
        stats_cancel.cancel();
        result
    }

    async fn pump_coordinator_stream(&self, token: &str, _stats_cancel: &CancellationToken) -> Result<()> {
        let mut stream = self.config.control_plane.open_coordinator_stream(token).await?;
        let mut buf = [0u8; 4096];
        loop {
            tokio::select! {
                n = stream.read(&mut buf) => {
                    let n = n?;
                    if n == 0 {
                        return Err(anyhow::anyhow!("EOF"));
                    }
                    // A real overlay implementation would decode and apply
                    // the node update here; out of scope per spec.
                }
                () = self.close.cancelled() => {
                    let _ = stream.shutdown().await;
                    return Ok(());
                }
            }
        }
    }

    async fn run_startup_script(&self, script: &str) -> Result<()> {
        if script.is_empty() {
            return Ok(());
        }
        let metadata = self.metadata.get();
        let token = self.session_token.get().map(|t| t.to_string()).unwrap_or_default();
        let spec = crate::command::build(script, &std::collections::HashMap::new(), metadata.as_deref(), &token, &self.config)?;

        let log_path = self.config.temp_dir.join(STARTUP_SCRIPT_LOG_NAME);
        let log_file = open_log_file(&log_path).await?;

        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args).current_dir(&spec.cwd).env_clear().envs(&spec.env);
        cmd.stdout(std::process::Stdio::from(log_file.try_clone().await?.into_std().await));
        cmd.stderr(std::process::Stdio::from(log_file.into_std().await));

        let status = cmd.status().await?;
        if !status.success() {
            log::warn!("startup script exited with {status}");
        }
        Ok(())
    }
}

async fn open_log_file(path: &std::path::Path) -> Result<tokio::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .append(true)
        .mode(0o600)
        .open(path)
        .await?;
    Ok(file)
}

fn apply_editor_config_override(_metadata: &crate::metadata::WorkspaceMetadata) {
    // Git-auth-config editor override is an external collaborator's
    // concern per spec.md's Non-goals; this hook exists so the supervisor
    // drives the side effect at the right point in the iteration.
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "workspace".to_string())
}

fn is_benign_disconnect(err: &anyhow::Error) -> bool {
    err.to_string().contains("EOF")
}
