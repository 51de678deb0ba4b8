//! Multi-listener dispatcher (C4, §4.2).
//!
//! Binds one accept loop per overlay port, each in its own task, and routes
//! accepted connections to the SSH (C2) or reconnecting-PTY (C1) handler.
//! Speedtest connections are accepted here and handed off to the external
//! speedtest protocol implementation (outside this crate per spec); this
//! dispatcher's job ends at accepting the raw stream so a client dialing the
//! port never hangs with nothing listening. Statistics is served by
//! [`crate::stats`]'s own HTTP listener rather than this dispatcher, since it
//! speaks HTTP with its own timeout policy instead of a bare
//! accept-and-hand-off loop.
//!
//! Grounded on the teacher's `socket::server::SocketServer::start`
//! accept-loop-per-task shape, generalized from one Unix-socket listener to
//! four overlay-port listeners sharing a single shutdown handle.

use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::metadata::{MetadataSlot, SessionTokenSlot};
use crate::overlay::{ports, OverlayNetwork};
use crate::reconnect;
use crate::reconnect::registry::PtyRegistry;
use crate::ssh;

/// Everything the dispatcher's accept loops need to route a connection.
pub struct DispatcherContext {
    pub config: Arc<AgentConfig>,
    pub metadata: Arc<MetadataSlot>,
    pub session_token: Arc<SessionTokenSlot>,
    pub pty_registry: Arc<PtyRegistry>,
    pub ssh_config: Arc<russh::server::Config>,
}

/// Bind and run all four overlay listeners, returning the `JoinSet` tracking
/// their accept-loop tasks (the "shared wait-group" from spec.md §4.2) so
/// callers can join them on shutdown.
pub fn spawn_listeners(
    overlay: Arc<dyn OverlayNetwork>,
    ctx: Arc<DispatcherContext>,
    cancel: CancellationToken,
) -> JoinSet<()> {
    let mut tasks = JoinSet::new();

    tasks.spawn(accept_loop(Arc::clone(&overlay), ports::SSH, "ssh", cancel.clone(), {
        let ctx = Arc::clone(&ctx);
        move |conn| {
            let ctx = Arc::clone(&ctx);
            async move {
                let ssh_ctx = ssh::SshContext {
                    config: Arc::clone(&ctx.config),
                    metadata: Arc::clone(&ctx.metadata),
                    session_token: Arc::clone(&ctx.session_token),
                    pty_registry: Arc::clone(&ctx.pty_registry),
                };
                if let Err(e) = ssh::serve_connection(conn, Arc::clone(&ctx.ssh_config), ssh_ctx).await {
                    log::warn!("ssh connection ended with error: {e}");
                }
            }
        }
    }));

    tasks.spawn(accept_loop(
        Arc::clone(&overlay),
        ports::RECONNECTING_PTY,
        "reconnecting-pty",
        cancel.clone(),
        {
            let ctx = Arc::clone(&ctx);
            move |conn| {
                let ctx = Arc::clone(&ctx);
                async move {
                    if let Err(e) = reconnect::handle_connection(
                        conn,
                        &ctx.pty_registry,
                        &ctx.metadata,
                        &ctx.session_token,
                        &ctx.config,
                    )
                    .await
                    {
                        log::warn!("reconnecting-pty connection ended with error: {e}");
                    }
                }
            }
        },
    ));

    tasks.spawn(accept_loop(Arc::clone(&overlay), ports::SPEEDTEST, "speedtest", cancel.clone(), |conn| async move {
        // The bandwidth-probe protocol itself is an external collaborator
        // (spec.md §4.2: "delegated to external library"); this hand-off
        // point exists so the accept loop never leaves a dial hanging.
        handle_speedtest_conn(conn).await;
    }));

    tasks
}

/// Hand off one accepted speedtest connection. No probe protocol is
/// implemented in this crate; the stream is closed immediately so the
/// accept loop still completes its side of the handshake.
async fn handle_speedtest_conn(mut conn: crate::overlay::OverlayConn) {
    use tokio::io::AsyncWriteExt;
    if let Err(e) = conn.shutdown().await {
        log::debug!("speedtest connection shutdown: {e}");
    }
}

/// Run a single overlay port's accept loop until `accept` errors or `cancel`
/// fires, spawning `handle` for each accepted connection.
async fn accept_loop<F, Fut>(
    overlay: Arc<dyn OverlayNetwork>,
    port: u16,
    label: &'static str,
    cancel: CancellationToken,
    handle: F,
) where
    F: Fn(crate::overlay::OverlayConn) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    loop {
        tokio::select! {
            accepted = overlay.accept(port) => {
                match accepted {
                    Ok(conn) => {
                        let fut = handle(conn);
                        tokio::spawn(fut);
                    }
                    Err(e) => {
                        log::error!("{label} listener accept loop terminating: {e}");
                        break;
                    }
                }
            }
            () = cancel.cancelled() => {
                log::info!("{label} listener shutting down on close signal");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_constants_are_distinct() {
        let all = [ports::SSH, ports::RECONNECTING_PTY, ports::SPEEDTEST, ports::STATISTICS];
        let mut sorted = all;
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), all.len());
    }
}
