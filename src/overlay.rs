//! Overlay network seam (§6).
//!
//! The mesh/overlay network itself — NAT traversal, wireguard-style tunnels,
//! DERP-relayed fallback — is an external collaborator per spec.md's
//! Non-goals. This module specifies only the listener ports the dispatcher
//! (C4) binds on the overlay interface and the trait the supervisor (C5)
//! uses to keep the overlay's view of this node current.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};

/// Overlay-network listener ports, fixed by convention so clients can dial
/// a workspace without an extra service-discovery round trip.
pub mod ports {
    /// SSH server (C3/§4.3).
    pub const SSH: u16 = 1;
    /// Reconnecting-PTY listener (C1/§4.5).
    pub const RECONNECTING_PTY: u16 = 2;
    /// Bandwidth probe, answers with a fixed-size sink/source (§6).
    pub const SPEEDTEST: u16 = 3;
    /// Per-connection traffic statistics endpoint (C6/§4.6).
    pub const STATISTICS: u16 = 4;
}

/// One accepted overlay connection, already demultiplexed to a single
/// logical port. Boxed so the dispatcher can treat every transport (real
/// mesh socket, or an in-process duplex pipe in tests) uniformly.
pub type OverlayConn = Box<dyn OverlayStream>;

/// Marker supertrait bundling the bidirectional-stream bounds the
/// dispatcher and its handlers need.
pub trait OverlayStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> OverlayStream for T {}

/// Per-connection traffic counters, reported by the overlay network and
/// aggregated by the statistics reporter (C6).
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ConnectionStats {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
}

/// What the connection supervisor (C5) and statistics reporter (C6) need
/// from the overlay network, independent of its actual transport.
#[async_trait]
pub trait OverlayNetwork: Send + Sync {
    /// Create the node if absent, or update its advertised metadata
    /// (hostname, routes) if present. Idempotent (§4.1 step 6).
    async fn create_or_update(&self, hostname: &str) -> Result<()>;

    /// Accept the next connection dialed at `port` (one of the constants
    /// in [`ports`]).
    async fn accept(&self, port: u16) -> Result<OverlayConn>;

    /// Snapshot per-connection counters across the whole node, keyed by a
    /// transport-defined connection identifier and tagged with a protocol
    /// label (`"tcp"`, `"derp"`, ...).
    async fn connection_stats(&self) -> Result<Vec<(String, String, ConnectionStats)>>;
}

type StatsEntry = Arc<Mutex<(String, ConnectionStats)>>;

/// Plain-TCP stand-in for the real mesh overlay, so the agent is runnable
/// end to end without a wireguard/DERP stack on hand. One listener per
/// [`ports`] constant, bound lazily on first [`OverlayNetwork::create_or_update`]
/// call, at `base_port + port`. Grounded on the teacher's
/// `socket::server::SocketServer`: bind, spawn an accept loop per listener,
/// hand back the raw stream.
pub struct TcpOverlayNetwork {
    base_port: u16,
    listeners: Mutex<HashMap<u16, Arc<TcpListener>>>,
    stats: Arc<Mutex<HashMap<String, StatsEntry>>>,
}

impl TcpOverlayNetwork {
    /// Build a network that will bind `base_port + port` for each overlay
    /// port the dispatcher asks for.
    #[must_use]
    pub fn new(base_port: u16) -> Self {
        Self {
            base_port,
            listeners: Mutex::new(HashMap::new()),
            stats: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn listener_for(&self, port: u16) -> Result<Arc<TcpListener>> {
        if let Some(l) = self.listeners.lock().expect("overlay listener lock poisoned").get(&port) {
            return Ok(Arc::clone(l));
        }
        let addr = format!("127.0.0.1:{}", self.base_port + port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding overlay port {port} on {addr}"))?;
        log::info!("overlay port {port} listening on {addr}");
        let listener = Arc::new(listener);
        self.listeners
            .lock()
            .expect("overlay listener lock poisoned")
            .insert(port, Arc::clone(&listener));
        Ok(listener)
    }
}

#[async_trait]
impl OverlayNetwork for TcpOverlayNetwork {
    async fn create_or_update(&self, hostname: &str) -> Result<()> {
        for port in [ports::SSH, ports::RECONNECTING_PTY, ports::SPEEDTEST, ports::STATISTICS] {
            self.listener_for(port).await?;
        }
        log::debug!("overlay node advertised as {hostname}");
        Ok(())
    }

    async fn accept(&self, port: u16) -> Result<OverlayConn> {
        let listener = self.listener_for(port).await?;
        let (stream, addr) = listener.accept().await.context("accepting overlay connection")?;
        let id = format!("{port}:{addr}");
        let entry: StatsEntry = Arc::new(Mutex::new(("tcp".to_string(), ConnectionStats::default())));
        self.stats
            .lock()
            .expect("overlay stats lock poisoned")
            .insert(id.clone(), Arc::clone(&entry));
        Ok(Box::new(CountingStream {
            inner: stream,
            id,
            stats: Arc::clone(&self.stats),
            entry,
        }))
    }

    async fn connection_stats(&self) -> Result<Vec<(String, String, ConnectionStats)>> {
        Ok(self
            .stats
            .lock()
            .expect("overlay stats lock poisoned")
            .iter()
            .map(|(id, entry)| {
                let (proto, stats) = *entry.lock().expect("overlay stats entry lock poisoned");
                (id.clone(), proto, stats)
            })
            .collect())
    }
}

/// Wraps a [`TcpStream`] to maintain the byte/packet counters the
/// statistics reporter (C6) polls, removing itself from the shared map when
/// the connection closes.
struct CountingStream {
    inner: TcpStream,
    id: String,
    stats: Arc<Mutex<HashMap<String, StatsEntry>>>,
    entry: StatsEntry,
}

impl AsyncRead for CountingStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let n = buf.filled().len() - before;
            if n > 0 {
                let mut entry = self.entry.lock().expect("overlay stats entry lock poisoned");
                entry.1.rx_bytes += n as u64;
                entry.1.rx_packets += 1;
            }
        }
        poll
    }
}

impl AsyncWrite for CountingStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            if *n > 0 {
                let mut entry = self.entry.lock().expect("overlay stats entry lock poisoned");
                entry.1.tx_bytes += *n as u64;
                entry.1.tx_packets += 1;
            }
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl Drop for CountingStream {
    fn drop(&mut self) {
        self.stats.lock().expect("overlay stats lock poisoned").remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_tcp_overlay_accepts_and_tracks_bytes() {
        let net = TcpOverlayNetwork::new(18000);
        net.create_or_update("test-host").await.unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect("127.0.0.1:18001").await.unwrap();
            stream.write_all(b"hello").await.unwrap();
        });

        let mut conn = net.accept(ports::SSH).await.unwrap();
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        client.await.unwrap();

        let stats = net.connection_stats().await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].1, "tcp");
        assert_eq!(stats[0].2.rx_bytes, 5);
    }
}
