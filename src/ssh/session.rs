//! Per-connection SSH session handler (§4.3).
//!
//! One [`SessionHandler`] is constructed per accepted SSH connection and
//! lives for its whole lifetime; `russh` calls back into it once per
//! channel request. Per-channel mutable state (requested PTY size,
//! forwarded environment, agent-forward listener) is tracked in
//! [`ChannelState`], keyed by `ChannelId`, mirroring the way the teacher's
//! `socket::server` keeps one state struct per accepted connection rather
//! than relying on closures capturing shared mutability.

use std::collections::HashMap;

use anyhow::Result;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use russh::server::{Handle, Msg, Session};
use russh::{Channel, ChannelId, Pty};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::agent_forward::AgentForwardListener;
use super::sftp;
use super::SshContext;
use crate::command::{self, CommandSpec};
use crate::error::ABNORMAL_EXIT_CODE;
use crate::util::{bicopy, homedir, motd};

#[derive(Default)]
struct ChannelState {
    pty_size: Option<(u16, u16)>,
    env: HashMap<String, String>,
    agent_forward: Option<AgentForwardListener>,
}

/// Handler for one SSH connection, covering every channel it opens.
pub struct SessionHandler {
    ctx: SshContext,
    channels: HashMap<ChannelId, ChannelState>,
    /// Cancelled when the connection ends, tearing down any reverse-forward
    /// listeners this connection opened via `tcpip_forward`.
    forward_cancel: CancellationToken,
}

impl SessionHandler {
    #[must_use]
    pub fn new(ctx: SshContext) -> Self {
        Self { ctx, channels: HashMap::new(), forward_cancel: CancellationToken::new() }
    }

    fn state_mut(&mut self, id: ChannelId) -> &mut ChannelState {
        self.channels.entry(id).or_default()
    }
}

impl Drop for SessionHandler {
    fn drop(&mut self) {
        self.forward_cancel.cancel();
    }
}

#[async_trait::async_trait]
impl russh::server::Handler for SessionHandler {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<russh::server::Auth, Self::Error> {
        // No client authentication: the overlay network is the trust
        // boundary, per spec.
        Ok(russh::server::Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(channel.id(), ChannelState::default());
        Ok(true)
    }

    /// Local port forwarding (`ssh -L`): bridge the opened channel directly
    /// to `host_to_connect:port_to_connect`. Permitted unconditionally.
    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let target = format!("{host_to_connect}:{port_to_connect}");
        match tokio::net::TcpStream::connect(&target).await {
            Ok(remote) => {
                tokio::spawn(async move {
                    let local = channel.into_stream();
                    bicopy::bicopy(local, remote, CancellationToken::new()).await;
                });
                Ok(true)
            }
            Err(e) => {
                log::warn!("direct-tcpip to {target} failed: {e}");
                Ok(false)
            }
        }
    }

    /// Reverse port forwarding (`ssh -R`): bind a local listener and open a
    /// `forwarded-tcpip` channel back to the client for each connection.
    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let bind_addr = format!("{address}:{port}");
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                log::warn!("tcpip-forward bind on {bind_addr} failed: {e}");
                return Ok(false);
            }
        };
        let bound_port = listener.local_addr().map(|a| a.port() as u32).unwrap_or(*port);
        *port = bound_port;

        let handle = session.handle();
        let address = address.to_string();
        let cancel = self.forward_cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let Ok((conn, peer)) = accepted else { break };
                        let handle = handle.clone();
                        let address = address.clone();
                        tokio::spawn(async move {
                            if let Ok(channel) = handle
                                .channel_open_forwarded_tcpip(&address, bound_port, &peer.ip().to_string(), peer.port() as u32)
                                .await
                            {
                                let remote = channel.into_stream();
                                bicopy::bicopy(conn, remote, CancellationToken::new()).await;
                            }
                        });
                    }
                    () = cancel.cancelled() => break,
                }
            }
        });
        Ok(true)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        _address: &str,
        _port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        // Individual listener cancellation isn't tracked per (address,
        // port); the whole connection's forwards tear down together when
        // the connection closes, via `forward_cancel`.
        Ok(true)
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.state_mut(channel).env.insert(variable_name.to_string(), variable_value.to_string());
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.state_mut(channel).pty_size = Some((row_height as u16, col_width as u16));
        session.channel_success(channel);
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.state_mut(channel).pty_size = Some((row_height as u16, col_width as u16));
        Ok(())
    }

    async fn agent_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let handle = session.handle();
        match AgentForwardListener::start(&self.ctx.config.temp_dir, handle, channel) {
            Ok(listener) => {
                self.state_mut(channel).env.insert(
                    "SSH_AUTH_SOCK".to_string(),
                    listener.socket_path.to_string_lossy().to_string(),
                );
                self.state_mut(channel).agent_forward = Some(listener);
                Ok(true)
            }
            Err(e) => {
                log::warn!("agent-forward setup failed: {e}");
                Ok(false)
            }
        }
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name != "sftp" {
            session.channel_failure(channel_id);
            return Ok(());
        }
        let user = homedir::current_user()?;
        let handle = session.handle();
        let channel = session
            .channels
            .take_channel(channel_id)
            .ok_or_else(|| anyhow::anyhow!("unknown channel {channel_id:?} for sftp request"))?;
        session.channel_success(channel_id);
        tokio::spawn(async move {
            if let Err(e) = sftp::serve(channel, channel_id, handle, user.home_dir).await {
                log::warn!("sftp session error on channel {channel_id:?}: {e}");
            }
        });
        Ok(())
    }

    async fn shell_request(&mut self, channel_id: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        self.run_session(channel_id, String::new(), session).await
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let raw_command = String::from_utf8_lossy(data).to_string();
        self.run_session(channel_id, raw_command, session).await
    }
}

impl SessionHandler {
    async fn run_session(
        &mut self,
        channel_id: ChannelId,
        raw_command: String,
        session: &mut Session,
    ) -> Result<()> {
        let state = self.channels.remove(&channel_id).unwrap_or_default();
        let metadata = self.ctx.metadata.get();
        let token = self.ctx.session_token.get().map(|t| t.to_string()).unwrap_or_default();
        let spec = match command::build(&raw_command, &state.env, metadata.as_deref(), &token, &self.ctx.config) {
            Ok(spec) => spec,
            Err(e) => {
                log::warn!("command factory failed for channel {channel_id:?}: {e}");
                session.exit_status_request(channel_id, ABNORMAL_EXIT_CODE);
                session.close(channel_id);
                return Ok(());
            }
        };

        let channel = session
            .channels
            .take_channel(channel_id)
            .ok_or_else(|| anyhow::anyhow!("unknown channel {channel_id:?} for session request"))?;
        let handle = session.handle();
        let is_login_shell = raw_command.is_empty();

        // §4.3: for a login shell, show the MOTD unless the user has a
        // `.hushlogin`. A non-login shell (explicit command) never sees it.
        let motd_path = homedir::current_user()
            .ok()
            .map(|u| motd::resolve_motd_path(is_login_shell, &u.home_dir, metadata.as_ref().map(|m| m.motd_path.as_str()).unwrap_or("")))
            .unwrap_or_default();

        if let Some((rows, cols)) = state.pty_size {
            tokio::spawn(run_with_pty(channel, channel_id, handle, spec, rows, cols, motd_path));
        } else {
            tokio::spawn(run_without_pty(channel, channel_id, handle, spec));
        }
        Ok(())
    }
}

async fn run_with_pty(
    channel: Channel<Msg>,
    channel_id: ChannelId,
    handle: Handle,
    spec: CommandSpec,
    rows: u16,
    cols: u16,
    motd_path: String,
) {
    let exit_code = match run_with_pty_inner(channel, channel_id, &handle, spec, rows, cols, motd_path).await {
        Ok(code) => code,
        Err(e) => {
            log::warn!("pty session on channel {channel_id:?} failed abnormally: {e}");
            ABNORMAL_EXIT_CODE
        }
    };
    let _ = handle.exit_status_request(channel_id, exit_code).await;
    let _ = handle.close(channel_id).await;
}

async fn run_with_pty_inner(
    channel: Channel<Msg>,
    channel_id: ChannelId,
    handle: &Handle,
    spec: CommandSpec,
    rows: u16,
    cols: u16,
    motd_path: String,
) -> Result<u32> {
    let pty_system = native_pty_system();
    let pair = pty_system.openpty(PtySize { rows, cols, pixel_width: 0, pixel_height: 0 })?;

    let mut cmd = CommandBuilder::new(&spec.program);
    for arg in &spec.args {
        cmd.arg(arg);
    }
    cmd.cwd(&spec.cwd);
    cmd.env_clear();
    for (k, v) in &spec.env {
        cmd.env(k, v);
    }

    let mut child = pair.slave.spawn_command(cmd)?;
    drop(pair.slave);

    let mut writer = pair.master.take_writer()?;
    let mut reader = pair.master.try_clone_reader()?;

    if !motd_path.is_empty() {
        let mut sink = ChannelDataSink { handle: handle.clone(), channel_id };
        let _ = motd::write_motd(&motd_path, &mut sink).await;
    }

    let (mut channel_read, mut channel_write) = split_channel(channel, handle.clone(), channel_id);
    let cancel = CancellationToken::new();

    let pty_to_channel = {
        let cancel = cancel.clone();
        let handle = handle.clone();
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if cancel.is_cancelled() {
                            break;
                        }
                        let data = buf[..n].to_vec();
                        if tokio::runtime::Handle::current()
                            .block_on(handle.data(channel_id, data.into()))
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
            cancel.cancel();
        })
    };

    let channel_to_pty = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            loop {
                tokio::select! {
                    n = channel_read.read(&mut buf) => {
                        match n {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if writer.write_all(&buf[..n]).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    () = cancel.cancelled() => break,
                }
            }
        })
    };

    let wait_result = tokio::task::spawn_blocking(move || child.wait()).await;
    cancel.cancel();
    let _ = channel_write.shutdown().await;
    let _ = pty_to_channel.await;
    let _ = channel_to_pty.await;

    match wait_result {
        Ok(Ok(status)) => Ok(status.exit_code()),
        Ok(Err(e)) => {
            log::warn!("waiting on pty child for channel {channel_id:?} failed: {e}");
            Ok(ABNORMAL_EXIT_CODE)
        }
        Err(e) => {
            log::warn!("pty child wait task panicked for channel {channel_id:?}: {e}");
            Ok(ABNORMAL_EXIT_CODE)
        }
    }
}

async fn run_without_pty(channel: Channel<Msg>, channel_id: ChannelId, handle: Handle, spec: CommandSpec) {
    let exit_code = match run_without_pty_inner(channel, channel_id, &handle, spec).await {
        Ok(code) => code,
        Err(e) => {
            log::warn!("non-pty session on channel {channel_id:?} failed abnormally: {e}");
            ABNORMAL_EXIT_CODE
        }
    };
    let _ = handle.exit_status_request(channel_id, exit_code).await;
    let _ = handle.close(channel_id).await;
}

async fn run_without_pty_inner(channel: Channel<Msg>, channel_id: ChannelId, handle: &Handle, spec: CommandSpec) -> Result<u32> {
    use std::process::Stdio;
    use tokio::process::Command;

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args).current_dir(&spec.cwd).env_clear().envs(&spec.env);
    cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = cmd.spawn()?;
    // A stdin pipe is required to unblock the child's stdin even though no
    // session input is expected on the common non-interactive path.
    let mut stdin = child.stdin.take().expect("piped stdin");
    let mut stdout = child.stdout.take().expect("piped stdout");
    let mut stderr = child.stderr.take().expect("piped stderr");

    let (mut channel_read, mut channel_write) = split_channel(channel, handle.clone(), channel_id);

    let stdin_task = tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        loop {
            match channel_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stdin.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let stdout_handle = handle.clone();
    let stdout_task = tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stdout_handle.data(channel_id, buf[..n].to_vec().into()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let stderr_handle = handle.clone();
    let stderr_task = tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match stderr.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stderr_handle.extended_data(channel_id, 1, buf[..n].to_vec().into()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let status = child.wait().await?;
    let _ = stdin_task.await;
    let _ = stdout_task.await;
    let _ = stderr_task.await;
    let _ = channel_write.shutdown().await;

    Ok(status.code().unwrap_or(0) as u32)
}

/// Split a channel into an `AsyncRead` half fed by incoming channel data and
/// an `AsyncWrite` half that forwards writes to `handle.data(...)`.
fn split_channel(
    channel: Channel<Msg>,
    handle: Handle,
    channel_id: ChannelId,
) -> (ChannelReadHalf, ChannelWriteHalf) {
    let stream = channel.into_stream();
    let (read_half, write_half) = tokio::io::split(stream);
    (ChannelReadHalf { inner: read_half }, ChannelWriteHalf { inner: write_half, handle, channel_id })
}

struct ChannelReadHalf {
    inner: tokio::io::ReadHalf<russh::ChannelStream<Msg>>,
}

impl tokio::io::AsyncRead for ChannelReadHalf {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

struct ChannelWriteHalf {
    inner: tokio::io::WriteHalf<russh::ChannelStream<Msg>>,
    #[allow(dead_code)]
    handle: Handle,
    #[allow(dead_code)]
    channel_id: ChannelId,
}

impl tokio::io::AsyncWrite for ChannelWriteHalf {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::pin::Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// A writer that forwards bytes written to it straight to `handle.data`, for
/// feeding the MOTD through the same data channel as command output.
struct ChannelDataSink {
    handle: Handle,
    channel_id: ChannelId,
}

impl tokio::io::AsyncWrite for ChannelDataSink {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        let data = buf.to_vec();
        let handle = self.handle.clone();
        let channel_id = self.channel_id;
        let len = data.len();
        tokio::spawn(async move {
            let _ = handle.data(channel_id, data.into()).await;
        });
        std::task::Poll::Ready(Ok(len))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}
