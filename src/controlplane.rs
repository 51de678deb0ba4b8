//! Control-plane client interface (§6, consumed collaborator).
//!
//! The HTTP client to the control plane itself is out of scope per spec.md
//! — this module specifies only the interface the supervisor (C5) drives,
//! plus one concrete `reqwest`-backed implementation so the crate is
//! runnable end to end.

use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;

use crate::metadata::WorkspaceMetadata;

/// A duplex byte stream standing in for the coordinator stream's framed
/// node-update channel. The overlay network feeds remote updates in and
/// reads local updates out; the concrete shape of a "node update" is an
/// overlay-network concern and is intentionally left opaque here (raw
/// bytes of an already-serialized update).
pub type CoordinatorStream = Pin<Box<dyn crate::overlay::OverlayStream>>;

/// Everything the connection supervisor (C5) needs from the control plane.
#[async_trait]
pub trait ControlPlaneClient: Send + Sync {
    /// Exchange credentials for a fresh bearer token (§4.1 step 1).
    async fn exchange_token(&self) -> Result<String>;

    /// Fetch the current workspace metadata snapshot (§4.1 step 3).
    async fn fetch_metadata(&self, token: &str) -> Result<WorkspaceMetadata>;

    /// Report the running build version (§4.1 step 2).
    async fn post_version(&self, token: &str, version: &str) -> Result<()>;

    /// Report application health for the apps list in the current metadata.
    async fn post_app_health(&self, token: &str, healthy: bool) -> Result<()>;

    /// Report an aggregated traffic-counter snapshot (C6, §4.6).
    async fn report_stats(&self, token: &str, snapshot: serde_json::Value) -> Result<()>;

    /// Open the long-lived bidirectional coordinator stream (§4.1 step 8).
    async fn open_coordinator_stream(&self, token: &str) -> Result<CoordinatorStream>;
}

/// Reqwest-backed implementation for a control plane exposing a
/// conventional JSON/HTTP(S) API alongside a WebSocket coordinator.
#[derive(Debug, Clone)]
pub struct HttpControlPlaneClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpControlPlaneClient {
    /// Build a client pointed at `base_url` (e.g. `https://coder.example.com`).
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("reqwest client builds with static config"),
        }
    }
}

#[async_trait]
impl ControlPlaneClient for HttpControlPlaneClient {
    async fn exchange_token(&self) -> Result<String> {
        #[derive(serde::Deserialize)]
        struct TokenResponse {
            token: String,
        }
        let resp: TokenResponse = self
            .http
            .post(format!("{}/api/v2/workspaceagents/me/token", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.token)
    }

    async fn fetch_metadata(&self, token: &str) -> Result<WorkspaceMetadata> {
        #[derive(serde::Deserialize, Default)]
        struct MetadataResponse {
            #[serde(default)]
            directory: String,
            #[serde(default)]
            env: std::collections::HashMap<String, String>,
            #[serde(default)]
            motd_path: String,
            #[serde(default)]
            startup_script: String,
            #[serde(default)]
            vscode_proxy_uri: String,
            #[serde(default)]
            git_auth_config_count: u32,
        }
        let resp: MetadataResponse = self
            .http
            .get(format!("{}/api/v2/workspaceagents/me/metadata", self.base_url))
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(WorkspaceMetadata {
            directory: resp.directory,
            env: resp.env,
            motd_path: resp.motd_path,
            startup_script: resp.startup_script,
            vscode_proxy_uri: resp.vscode_proxy_uri,
            git_auth_config_count: resp.git_auth_config_count,
        })
    }

    async fn post_version(&self, token: &str, version: &str) -> Result<()> {
        self.http
            .post(format!("{}/api/v2/workspaceagents/me/version", self.base_url))
            .bearer_auth(token)
            .json(&serde_json::json!({ "version": version }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn post_app_health(&self, token: &str, healthy: bool) -> Result<()> {
        self.http
            .post(format!("{}/api/v2/workspaceagents/me/app-health", self.base_url))
            .bearer_auth(token)
            .json(&serde_json::json!({ "healthy": healthy }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn report_stats(&self, token: &str, snapshot: serde_json::Value) -> Result<()> {
        self.http
            .post(format!("{}/api/v2/workspaceagents/me/report-stats", self.base_url))
            .bearer_auth(token)
            .json(&snapshot)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn open_coordinator_stream(&self, _token: &str) -> Result<CoordinatorStream> {
        anyhow::bail!("coordinator stream transport is an overlay-network concern, not implemented by the plain HTTP client")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_exchange_token_parses_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/workspaceagents/me/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "token": "tok-123" })))
            .mount(&server)
            .await;

        let client = HttpControlPlaneClient::new(server.uri());
        let token = client.exchange_token().await.unwrap();
        assert_eq!(token, "tok-123");
    }

    #[tokio::test]
    async fn test_fetch_metadata_defaults_missing_fields() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/workspaceagents/me/metadata"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "directory": "/workspace" })))
            .mount(&server)
            .await;

        let client = HttpControlPlaneClient::new(server.uri());
        let metadata = client.fetch_metadata("tok").await.unwrap();
        assert_eq!(metadata.directory, "/workspace");
        assert_eq!(metadata.git_auth_config_count, 0);
    }

    #[tokio::test]
    async fn test_post_version_surfaces_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/workspaceagents/me/version"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = HttpControlPlaneClient::new(server.uri());
        assert!(client.post_version("tok", "0.1.0").await.is_err());
    }

    #[tokio::test]
    async fn test_report_stats_posts_snapshot_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/workspaceagents/me/report-stats"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = HttpControlPlaneClient::new(server.uri());
        let snapshot = serde_json::json!({ "num_conns": 1 });
        client.report_stats("tok", snapshot).await.unwrap();
    }
}
