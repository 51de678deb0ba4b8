//! Bidirectional byte copy with cancellation (C7).
//!
//! Used to bridge an SSH agent-forwarding channel to the local
//! `SSH_AUTH_SOCK` listener, and for local/reverse port forwarding glue.
//! Copies `a -> b` and `b -> a` concurrently; closes both sides as soon as
//! either direction finishes or the supplied [`CancellationToken`] fires.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Copy bytes in both directions between `a` and `b` until either side
/// reaches EOF, either copy errors, or `cancel` is triggered.
pub async fn bicopy<A, B>(mut a: A, mut b: B, cancel: CancellationToken)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ar, mut aw) = tokio::io::split(a);
    let (mut br, mut bw) = tokio::io::split(b);

    let a_to_b = tokio::io::copy(&mut ar, &mut bw);
    let b_to_a = tokio::io::copy(&mut br, &mut aw);
    tokio::pin!(a_to_b);
    tokio::pin!(b_to_a);

    tokio::select! {
        _ = &mut a_to_b => {}
        _ = &mut b_to_a => {}
        () = cancel.cancelled() => {}
    }

    let _ = aw.shutdown().await;
    let _ = bw.shutdown().await;
}
