//! Agent configuration (§3).
//!
//! Logging is process-global (`log` + `env_logger`, initialized once in
//! `main`) rather than a field threaded through `AgentConfig` — matching the
//! teacher's own `main.rs`, which calls `env_logger::Builder::new().init()`
//! once and lets every module reach for `log::info!`/`log::warn!` directly.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::controlplane::{ControlPlaneClient, CoordinatorStream};
use crate::metadata::WorkspaceMetadata;

/// Default idle timeout for a reconnecting-PTY session with zero attached
/// subscribers before it is killed and reaped (§4.5, §8 scenario S4).
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Everything the supervisor, dispatcher and command factory need that
/// isn't itself part of the live connection state.
#[derive(Clone)]
pub struct AgentConfig {
    /// Scratch directory for the reconnecting-PTY engine and SFTP temp
    /// files; defaults to the platform temp dir.
    pub temp_dir: PathBuf,
    /// How long a reconnecting-PTY session survives with no subscribers
    /// attached before it is torn down.
    pub idle_timeout: Duration,
    /// Static environment-variable overrides, applied last in the command
    /// factory's five-layer assembly order (§4.4 layer 5).
    pub env_overrides: HashMap<String, String>,
    /// Handle to the control plane used for token exchange, metadata
    /// fetches, health/version reporting and the coordinator stream.
    pub control_plane: Arc<dyn ControlPlaneClient>,
}

impl std::fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConfig")
            .field("temp_dir", &self.temp_dir)
            .field("idle_timeout", &self.idle_timeout)
            .field("env_overrides", &self.env_overrides)
            .field("control_plane", &"<dyn ControlPlaneClient>")
            .finish()
    }
}

impl AgentConfig {
    /// Build a config from CLI flags and environment, falling back to
    /// compiled defaults. There is no on-disk config file (§10.3).
    #[must_use]
    pub fn new(control_plane: Arc<dyn ControlPlaneClient>) -> Self {
        let temp_dir = std::env::var("WSAGENT_TEMP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir());

        let idle_timeout = std::env::var("WSAGENT_IDLE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_IDLE_TIMEOUT);

        Self {
            temp_dir,
            idle_timeout,
            env_overrides: HashMap::new(),
            control_plane,
        }
    }

    /// A config suitable for unit tests: an in-memory control plane stub,
    /// the platform temp dir, and no overrides.
    #[must_use]
    pub fn for_test() -> Self {
        Self {
            temp_dir: std::env::temp_dir(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            env_overrides: HashMap::new(),
            control_plane: Arc::new(StubControlPlaneClient::default()),
        }
    }
}

/// No-op control plane used only by `AgentConfig::for_test` and the test
/// modules of callers that need an `AgentConfig` but never drive it.
#[derive(Debug, Default)]
struct StubControlPlaneClient;

#[async_trait]
impl ControlPlaneClient for StubControlPlaneClient {
    async fn exchange_token(&self) -> Result<String> {
        Ok("test-token".to_string())
    }

    async fn fetch_metadata(&self, _token: &str) -> Result<WorkspaceMetadata> {
        Ok(WorkspaceMetadata::default())
    }

    async fn post_version(&self, _token: &str, _version: &str) -> Result<()> {
        Ok(())
    }

    async fn post_app_health(&self, _token: &str, _healthy: bool) -> Result<()> {
        Ok(())
    }

    async fn report_stats(&self, _token: &str, _snapshot: serde_json::Value) -> Result<()> {
        Ok(())
    }

    async fn open_coordinator_stream(&self, _token: &str) -> Result<CoordinatorStream> {
        anyhow::bail!("stub control plane has no coordinator stream")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_test_config_has_sane_defaults() {
        let config = AgentConfig::for_test();
        assert_eq!(config.idle_timeout, DEFAULT_IDLE_TIMEOUT);
        assert!(config.env_overrides.is_empty());
    }

    #[tokio::test]
    async fn test_stub_control_plane_round_trips_token() {
        let config = AgentConfig::for_test();
        let token = config.control_plane.exchange_token().await.unwrap();
        assert_eq!(token, "test-token");
    }
}
