//! Statistics reporter (C6, §4.6).
//!
//! Periodically snapshots per-connection traffic counters from the overlay
//! network, aggregates them into the shape the control plane expects, and
//! reports them. Also serves the `Statistics` overlay port as a small HTTP
//! endpoint with fixed 20 s read/write/header timeouts (§4.2), independent
//! of the accept-loop-per-task pattern the other three listeners use, since
//! HTTP request/response framing is its own concern.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::overlay::OverlayNetwork;

const REPORT_INTERVAL: Duration = Duration::from_secs(10);
const APP_HEALTH_INTERVAL: Duration = Duration::from_secs(10);
const HTTP_TIMEOUT: Duration = Duration::from_secs(20);

/// Aggregated traffic snapshot, reported to the control plane and served on
/// the `Statistics` overlay port as JSON.
#[derive(Debug, Default, Clone, Serialize)]
pub struct TrafficSnapshot {
    pub num_conns: u64,
    pub conns_by_proto: HashMap<String, u64>,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
}

/// Periodically poll `overlay`'s connection counters, aggregate them, and
/// report the result via `config.control_plane`, until `cancel` fires.
///
/// Scoped to a single supervisor iteration (§4.1 step 6): a fresh task is
/// spawned every iteration and it exits on `cancel`, the same way the
/// teacher's `hub::polling` heartbeat is scoped to one connected session.
pub async fn run_reporter(
    overlay: Arc<dyn OverlayNetwork>,
    config: Arc<AgentConfig>,
    token: String,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(REPORT_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match snapshot(&overlay).await {
                    Ok(snap) => {
                        log::debug!(
                            "traffic snapshot: {} conns, rx {}B, tx {}B",
                            snap.num_conns, snap.rx_bytes, snap.tx_bytes
                        );
                        let payload = serde_json::to_value(&snap).unwrap_or(serde_json::Value::Null);
                        if let Err(e) = config.control_plane.report_stats(&token, payload).await {
                            log::warn!("traffic stats report failed: {e}");
                        }
                    }
                    Err(e) => log::warn!("failed to snapshot overlay connection stats: {e}"),
                }
            }
            () = cancel.cancelled() => break,
        }
    }
}

/// Periodically report the app as healthy via `config.control_plane`, until
/// `cancel` fires. Scoped to a single supervisor iteration (§4.1 step 6),
/// the same lifetime as [`run_reporter`].
pub async fn run_app_health_reporter(config: Arc<AgentConfig>, token: String, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(APP_HEALTH_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = config.control_plane.post_app_health(&token, true).await {
                    log::warn!("app-health report failed: {e}");
                }
            }
            () = cancel.cancelled() => break,
        }
    }
}

async fn snapshot(overlay: &Arc<dyn OverlayNetwork>) -> Result<TrafficSnapshot> {
    let conns = overlay.connection_stats().await?;
    let mut snap = TrafficSnapshot { num_conns: conns.len() as u64, ..Default::default() };
    for (_id, proto, stats) in conns {
        *snap.conns_by_proto.entry(proto).or_insert(0) += 1;
        snap.rx_packets += stats.rx_packets;
        snap.rx_bytes += stats.rx_bytes;
        snap.tx_packets += stats.tx_packets;
        snap.tx_bytes += stats.tx_bytes;
    }
    Ok(snap)
}

/// Serve the `Statistics` overlay port: accept connections, read one HTTP
/// request, respond with the latest snapshot as JSON, close. Every I/O step
/// is bounded by [`HTTP_TIMEOUT`] so a stalled client can't pin a task
/// forever.
pub async fn serve_http(overlay: Arc<dyn OverlayNetwork>, port: u16, cancel: CancellationToken) {
    loop {
        tokio::select! {
            accepted = overlay.accept(port) => {
                match accepted {
                    Ok(conn) => {
                        let overlay = Arc::clone(&overlay);
                        tokio::spawn(async move {
                            if let Err(e) = tokio::time::timeout(HTTP_TIMEOUT, serve_one(conn, overlay)).await {
                                log::warn!("statistics request timed out: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        log::error!("statistics listener accept loop terminating: {e}");
                        break;
                    }
                }
            }
            () = cancel.cancelled() => break,
        }
    }
}

async fn serve_one(mut conn: crate::overlay::OverlayConn, overlay: Arc<dyn OverlayNetwork>) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut buf = [0u8; 1024];
    let _ = conn.read(&mut buf).await?;

    let snap = snapshot(&overlay).await.unwrap_or_default();
    let body = serde_json::to_vec(&snap)?;
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    conn.write_all(response.as_bytes()).await?;
    conn.write_all(&body).await?;
    conn.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::ConnectionStats;

    #[tokio::test]
    async fn test_snapshot_aggregates_across_protocols() {
        struct FakeOverlay;
        #[async_trait::async_trait]
        impl OverlayNetwork for FakeOverlay {
            async fn create_or_update(&self, _hostname: &str) -> Result<()> {
                Ok(())
            }
            async fn accept(&self, _port: u16) -> Result<crate::overlay::OverlayConn> {
                anyhow::bail!("not used in this test")
            }
            async fn connection_stats(&self) -> Result<Vec<(String, String, ConnectionStats)>> {
                Ok(vec![
                    ("a".to_string(), "tcp".to_string(), ConnectionStats { rx_bytes: 10, tx_bytes: 20, ..Default::default() }),
                    ("b".to_string(), "derp".to_string(), ConnectionStats { rx_bytes: 5, tx_bytes: 7, ..Default::default() }),
                ])
            }
        }

        let overlay: Arc<dyn OverlayNetwork> = Arc::new(FakeOverlay);
        let snap = snapshot(&overlay).await.unwrap();
        assert_eq!(snap.num_conns, 2);
        assert_eq!(snap.rx_bytes, 15);
        assert_eq!(snap.tx_bytes, 27);
        assert_eq!(snap.conns_by_proto.get("tcp"), Some(&1));
        assert_eq!(snap.conns_by_proto.get("derp"), Some(&1));
    }
}
