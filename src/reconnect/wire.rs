//! Wire framing for the reconnecting-PTY listener (§4.5, §6).
//!
//! The init frame is `[u16 LE length][JSON bytes]`, read with exact-length
//! semantics — a streaming JSON decoder would over-read past the init frame
//! into bytes that belong to the stream phase, so the length prefix is
//! decoded and then exactly that many bytes are read with
//! [`tokio::io::AsyncReadExt::read_exact`].
//!
//! After the init frame, client->server messages are newline-delimited JSON
//! objects (`{ data, height, width }`) and server->client bytes are raw PTY
//! output with no framing at all — the first burst written is the
//! scrollback replay.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Init frame sent once, before the connection becomes a stream.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconnectingPtyInit {
    /// Client-chosen session id, reused across reconnects.
    pub id: String,
    /// Raw command to run; empty means the user's login shell.
    #[serde(default)]
    pub command: String,
    /// Initial terminal height in rows.
    pub height: u16,
    /// Initial terminal width in columns.
    pub width: u16,
}

/// A single client->server stream message.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconnectingPtyStreamMessage {
    /// Input bytes to write to the PTY (may be empty on a pure resize).
    #[serde(default)]
    pub data: String,
    /// Requested terminal height; 0 means "no resize requested".
    #[serde(default)]
    pub height: u16,
    /// Requested terminal width; 0 means "no resize requested".
    #[serde(default)]
    pub width: u16,
}

impl ReconnectingPtyStreamMessage {
    /// True if both dimensions are non-zero, i.e. this message carries a
    /// resize request.
    #[must_use]
    pub fn wants_resize(&self) -> bool {
        self.height > 0 && self.width > 0
    }
}

/// Read the 2-byte little-endian length prefix and then exactly that many
/// bytes, decoding the result as a [`ReconnectingPtyInit`].
///
/// Uses `read_exact` for both the length and the body so a short read never
/// silently truncates or blends into the stream phase.
///
/// # Errors
///
/// Returns an error if the connection closes mid-frame or the body is not
/// valid JSON for [`ReconnectingPtyInit`].
pub async fn read_init_frame<R>(reader: &mut R) -> Result<ReconnectingPtyInit>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    reader
        .read_exact(&mut len_buf)
        .await
        .context("reading reconnecting-pty init length prefix")?;
    let len = u16::from_le_bytes(len_buf) as usize;

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .context("reading reconnecting-pty init body")?;

    serde_json::from_slice(&body).context("decoding reconnecting-pty init frame")
}

/// Encode a [`ReconnectingPtyInit`] into its wire form, for use by test
/// harnesses acting as the client side of the protocol.
pub fn encode_init_frame(init: &ReconnectingPtyInit) -> Vec<u8> {
    let body = serde_json::to_vec(init).expect("ReconnectingPtyInit always serializes");
    let len = u16::try_from(body.len()).expect("init frame body fits in u16");
    let mut out = Vec::with_capacity(2 + body.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&body);
    out
}
