//! Full-duplex byte relay between two streams with mutual cancellation (C2).

use anyhow::Result;
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Copy `a -> b` and `b -> a` concurrently. As soon as either direction ends
/// (EOF, error, or the given `cancel` token fires), both directions are
/// stopped and both streams are shut down.
///
/// The two directions are raced against each other rather than driven by a
/// single `copy_bidirectional`-style loop, which only returns once *both*
/// sides have reached EOF: if the app side closes while the visitor stays
/// silent, that loop would keep the visitor's half alive indefinitely. Here,
/// as soon as either `tokio::io::copy` finishes, the other is dropped
/// mid-flight and both halves are shut down to unblock it.
///
/// `cancel` lets a caller outside this splice (e.g. a session tearing down)
/// unblock a transfer that is parked on a read that will otherwise never
/// return, since closing a socket this task doesn't own is the only portable
/// way to interrupt it.
pub async fn splice<A, B>(a: A, b: B, cancel: CancellationToken) -> Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = io::split(a);
    let (mut b_read, mut b_write) = io::split(b);

    let result = tokio::select! {
        res = io::copy(&mut a_read, &mut b_write) => res.map(|_| ()),
        res = io::copy(&mut b_read, &mut a_write) => res.map(|_| ()),
        _ = cancel.cancelled() => Ok(()),
    };

    // Whichever direction ended first, shut down both halves so the other
    // direction's still-pending read/write is abandoned instead of left
    // running until something else tears the whole session down.
    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;

    Ok(result?)
}
