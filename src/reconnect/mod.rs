//! Reconnecting-PTY engine (C1, §4.5).
//!
//! Wire framing lives in [`wire`], session state and fan-out in
//! [`registry`]; this module is the glue that drives one accepted overlay
//! connection through the attach algorithm end to end.

pub mod registry;
pub mod ringbuffer;
pub mod wire;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::command::{self, CommandSpec};
use crate::config::AgentConfig;
use crate::metadata::{MetadataSlot, SessionTokenSlot};
use registry::PtyRegistry;
use wire::{read_init_frame, ReconnectingPtyStreamMessage};

/// Drive one accepted reconnecting-PTY connection to completion.
///
/// Reads the init frame, gets-or-creates the named session (spawning a
/// fresh child only if none is registered or the previous one already
/// died), attaches as a subscriber, and then pumps bytes in both
/// directions until the connection or the session closes.
pub async fn handle_connection<S>(
    mut stream: S,
    registry: &PtyRegistry,
    metadata: &MetadataSlot,
    session_token: &SessionTokenSlot,
    config: &AgentConfig,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let init = read_init_frame(&mut stream).await.context("reading reconnecting-pty init frame")?;

    let session = match registry.get(&init.id) {
        Some(session) => session,
        None => {
            let meta = metadata.require()?;
            let token = session_token.require()?;
            let spec: CommandSpec = command::build(
                &init.command,
                &std::collections::HashMap::new(),
                Some(&meta),
                &token,
                config,
            )?;
            let session = registry::PtySession::spawn(init.id.clone(), &spec, init.height, init.width)?;
            registry.insert(init.id.clone(), Arc::clone(&session));
            session
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let replay = session.attach(tx);

    let (read_half, mut write_half) = tokio::io::split(stream);
    write_half.write_all(&replay).await.context("writing scrollback replay")?;

    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        tokio::select! {
            biased;

            out = rx.recv() => {
                match out {
                    Some(bytes) => {
                        if write_half.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    None => break, // session reader thread exited, fan-out channel dropped
                }
            }

            n = reader.read_line(&mut line) => {
                match n {
                    Ok(0) => break, // client disconnected; session survives for reconnect
                    Ok(_) => {
                        if let Ok(msg) = serde_json::from_str::<ReconnectingPtyStreamMessage>(line.trim_end()) {
                            handle_stream_message(&session, &msg);
                        }
                        line.clear();
                    }
                    Err(_) => break,
                }
            }

            () = session.closed.cancelled() => break,
        }
    }

    session.mark_possibly_idle();
    Ok(())
}

fn handle_stream_message(session: &registry::PtySession, msg: &ReconnectingPtyStreamMessage) {
    if msg.wants_resize() {
        if let Err(e) = session.resize(msg.height, msg.width) {
            log::warn!("resize failed for reconnecting-pty session {}: {e}", session.id());
        }
    }
    if !msg.data.is_empty() {
        if let Err(e) = session.write_input(msg.data.as_bytes()) {
            log::warn!("write failed for reconnecting-pty session {}: {e}", session.id());
        }
    }
}

/// Background task: evict sessions that have had zero attached subscribers
/// for longer than `config.idle_timeout`, killing their child process.
///
/// Grounded on the teacher's `hub::polling` pattern of a `tokio::select!`
/// loop driven by a fixed-interval ticker, generalized from "poll the hub"
/// to "sweep the registry".
pub async fn run_idle_sweeper(registry: Arc<PtyRegistry>, config: AgentConfig, cancel: tokio_util::sync::CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(10));
    loop {
        tokio::select! {
            _ = interval.tick() => registry.sweep(config.idle_timeout),
            () = cancel.cancelled() => break,
        }
    }
}
