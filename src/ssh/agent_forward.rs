//! SSH agent forwarding (§4.3 step 2).
//!
//! When a client requests `auth-agent-req@openssh.com` on a session
//! channel, the server opens a Unix domain socket in the agent's temp
//! directory, injects its path into the child's environment as
//! `SSH_AUTH_SOCK`, and bridges every local connection on that socket to a
//! freshly opened `auth-agent@openssh.com` channel back to the client —
//! exactly the way OpenSSH's own `ssh -A` forwarding works. Bridging itself
//! reuses [`crate::util::bicopy`].

use std::path::PathBuf;

use anyhow::{Context, Result};
use russh::server::Handle;
use russh::ChannelId;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::util::bicopy;

/// A live agent-forward listener for one SSH session.
pub struct AgentForwardListener {
    pub socket_path: PathBuf,
    cancel: CancellationToken,
}

impl AgentForwardListener {
    /// Bind a fresh Unix socket under `temp_dir` and start accepting local
    /// connections, bridging each to a new `auth-agent@openssh.com` channel
    /// opened on `handle` back to the originating client channel.
    pub fn start(temp_dir: &std::path::Path, handle: Handle, origin_channel: ChannelId) -> Result<Self> {
        let socket_path = temp_dir.join(format!("wsagent-ssh-auth-{}.sock", Uuid::new_v4()));
        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("binding agent-forward socket at {}", socket_path.display()))?;
        let cancel = CancellationToken::new();

        let task_cancel = cancel.clone();
        let task_path = socket_path.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((local_conn, _)) => {
                                let handle = handle.clone();
                                tokio::spawn(bridge_one_connection(local_conn, handle, origin_channel));
                            }
                            Err(e) => {
                                log::warn!("agent-forward accept failed on {}: {e}", task_path.display());
                                break;
                            }
                        }
                    }
                    () = task_cancel.cancelled() => break,
                }
            }
            let _ = tokio::fs::remove_file(&task_path).await;
        });

        Ok(Self { socket_path, cancel })
    }

    /// Stop accepting and remove the socket file.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for AgentForwardListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn bridge_one_connection(local_conn: tokio::net::UnixStream, handle: Handle, origin_channel: ChannelId) {
    let agent_channel = match handle
        .channel_open_forwarded_tcpip("auth-agent@openssh.com", 0, "127.0.0.1", 0, "127.0.0.1")
        .await
    {
        Ok(ch) => ch,
        Err(e) => {
            log::warn!("failed to open auth-agent@openssh.com channel for {origin_channel:?}: {e:?}");
            return;
        }
    };
    let remote = agent_channel.into_stream();
    bicopy::bicopy(local_conn, remote, CancellationToken::new()).await;
}
