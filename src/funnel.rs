//! Per-session listener on the public port; feeds each accepted visitor
//! stream onto an internal queue consumed by the tunnel broker (C5).

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::transport::{Listener, Stream};

/// Owns the public listener for one session's `RemotePort` and forwards
/// every accepted visitor onto an unbounded channel.
pub struct VisitorFunnel {
    receiver: mpsc::UnboundedReceiver<Stream>,
}

impl VisitorFunnel {
    /// Bind the public listener and start accepting. The accept loop runs on
    /// its own task and stops as soon as `cancel` fires, at which point the
    /// listener is dropped and any streams still queued are dropped too.
    pub async fn bind(
        listener: Listener,
        port: u16,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let accept = tokio::select! {
                    res = listener.accept() => res,
                    _ = cancel.cancelled() => {
                        info!(port, "visitor funnel cancelled");
                        return;
                    }
                };

                match accept {
                    Ok((stream, addr)) => {
                        info!(port, ?addr, "visitor connected");
                        if tx.send(stream).is_err() {
                            // Broker side is gone; nothing left to do.
                            return;
                        }
                    }
                    Err(err) => {
                        warn!(port, %err, "visitor accept failed");
                        return;
                    }
                }
            }
        });

        Ok(VisitorFunnel { receiver: rx })
    }

    /// Wait for the next visitor stream. Returns `None` once the funnel has
    /// been cancelled and will never produce another stream.
    pub async fn next(&mut self) -> Option<Stream> {
        self.receiver.recv().await
    }
}

/// Binds the public, visitor-facing listener for a session's `RemotePort`.
///
/// A visitor is an arbitrary third party, not the client, so this always
/// binds plain TCP regardless of the session's transport kind — only the
/// tunnel back-channel dial-back (see `crate::broker::bind_tunnel_listener`)
/// is required to match the control connection's transport.
pub async fn bind_public_listener(bind_addr: std::net::IpAddr, port: u16) -> Result<Listener> {
    Listener::bind_plain((bind_addr, port)).await
}
