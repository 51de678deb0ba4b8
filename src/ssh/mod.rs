//! SSH session handler (C2, §4.3).
//!
//! Host-key policy is fixed by spec: a fresh 2048-bit RSA key every process
//! start, and `NoClientAuth` — the overlay network is the trust boundary,
//! not SSH. There is no russh server anywhere in the teacher's codebase to
//! crib from, so this module is written directly against the `russh`/
//! `russh-keys` public API; the surrounding shape (one handler struct per
//! connection, `tokio::select!`-driven bridging, magic exit-code mapping)
//! follows the same idioms the teacher uses for its own socket server in
//! `socket::server`.

pub mod agent_forward;
pub mod session;
pub mod sftp;

use std::sync::Arc;

use anyhow::{Context, Result};
use russh_keys::key::KeyPair;

use crate::command;
use crate::config::AgentConfig;
use crate::metadata::{MetadataSlot, SessionTokenSlot};
use crate::reconnect::registry::PtyRegistry;

/// Shared, read-only state every SSH connection handler needs. Cloned
/// (cheaply, via `Arc`s) into each `session::SessionHandler`.
#[derive(Clone)]
pub struct SshContext {
    pub config: Arc<AgentConfig>,
    pub metadata: Arc<MetadataSlot>,
    pub session_token: Arc<SessionTokenSlot>,
    pub pty_registry: Arc<PtyRegistry>,
}

/// Generate a fresh 2048-bit RSA host key, per spec.md §4.2: no on-disk
/// persistence, a new identity every process start.
pub fn generate_host_key() -> Result<KeyPair> {
    KeyPair::generate_rsa(2048, russh_keys::key::SignatureHash::SHA2_256)
        .context("generating SSH host key")
}

/// Build the `russh` server configuration: fresh host key, no client
/// authentication (the overlay already authenticated the peer).
pub fn server_config(host_key: KeyPair) -> Arc<russh::server::Config> {
    Arc::new(russh::server::Config {
        auth_rejection_time: std::time::Duration::from_secs(0),
        methods: russh::MethodSet::NONE,
        keys: vec![host_key],
        ..Default::default()
    })
}

/// Run the SSH server over one already-accepted overlay connection. `russh`
/// owns the connection loop from here; `ctx` is moved into a single
/// `session::SessionHandler` that tracks per-channel state for the whole
/// connection's lifetime.
pub async fn serve_connection<S>(
    stream: S,
    config: Arc<russh::server::Config>,
    ctx: SshContext,
) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let handler = session::SessionHandler::new(ctx);
    russh::server::run_stream(config, stream, handler)
        .await
        .context("running SSH connection")
}

pub(crate) fn abnormal_exit_code() -> u32 {
    crate::error::ABNORMAL_EXIT_CODE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_key_generation_succeeds() {
        let key = generate_host_key().unwrap();
        assert!(matches!(key, KeyPair::RSA { .. }));
    }
}
