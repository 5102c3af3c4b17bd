//! For each visitor stream, reserves a tunnel port, notifies the client,
//! verifies the arriving token, and splices the streams (C6).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::funnel::VisitorFunnel;
use crate::pipe;
use crate::port_pool::PortRegistry;
use crate::protocol::{ConnResp, TOKEN_LEN};
use crate::transport::{Kind, Listener, Stream};

/// How long a tunnel listener waits for a correctly-tokened dial-back before
/// giving up on the visitor and releasing the port.
const TOKEN_WAIT: Duration = Duration::from_secs(10);

/// Drives the visitor-to-tunnel pairing loop for one session.
pub struct TunnelBroker {
    registry: Arc<PortRegistry>,
    bind_addr: std::net::IpAddr,
    kind: Kind,
    tls_cert: Option<std::path::PathBuf>,
    tls_key: Option<std::path::PathBuf>,
    token: Arc<Vec<u8>>,
}

impl TunnelBroker {
    /// Construct a broker bound to one session's token and transport kind.
    pub fn new(
        registry: Arc<PortRegistry>,
        bind_addr: std::net::IpAddr,
        kind: Kind,
        tls_cert: Option<std::path::PathBuf>,
        tls_key: Option<std::path::PathBuf>,
        token: Vec<u8>,
    ) -> Self {
        TunnelBroker {
            registry,
            bind_addr,
            kind,
            tls_cert,
            tls_key,
            token: Arc::new(token),
        }
    }

    /// Consume visitors from `funnel` until cancelled, spawning one task per
    /// visitor so a slow or hostile visitor cannot stall another. Each
    /// notification is sent, in the order its `reserve_any` completed, onto
    /// `conn_resp_tx` for the session task to forward down the control
    /// stream.
    pub async fn run(
        &self,
        mut funnel: VisitorFunnel,
        conn_resp_tx: mpsc::UnboundedSender<ConnResp>,
        cancel: CancellationToken,
    ) {
        loop {
            let visitor = tokio::select! {
                v = funnel.next() => v,
                _ = cancel.cancelled() => return,
            };

            let Some(visitor) = visitor else {
                return;
            };

            let registry = Arc::clone(&self.registry);
            let bind_addr = self.bind_addr;
            let kind = self.kind;
            let tls_cert = self.tls_cert.clone();
            let tls_key = self.tls_key.clone();
            let token = Arc::clone(&self.token);
            let conn_resp_tx = conn_resp_tx.clone();
            let cancel = cancel.clone();

            tokio::spawn(async move {
                if let Err(err) = handle_visitor(
                    visitor,
                    registry,
                    bind_addr,
                    kind,
                    tls_cert.as_deref(),
                    tls_key.as_deref(),
                    token,
                    conn_resp_tx,
                    cancel,
                )
                .await
                {
                    warn!(%err, "tunnel broker dropped a visitor");
                }
            });
        }
    }
}

async fn handle_visitor(
    visitor: Stream,
    registry: Arc<PortRegistry>,
    bind_addr: std::net::IpAddr,
    kind: Kind,
    tls_cert: Option<&std::path::Path>,
    tls_key: Option<&std::path::Path>,
    token: Arc<Vec<u8>>,
    conn_resp_tx: mpsc::UnboundedSender<ConnResp>,
    cancel: CancellationToken,
) -> Result<()> {
    let port = match registry.reserve_any() {
        Ok(port) => port,
        Err(_) => {
            warn!("tunnel port pool exhausted, dropping visitor");
            drop(visitor);
            return Ok(());
        }
    };

    let result = serve_one_tunnel(visitor, port, bind_addr, kind, tls_cert, tls_key, token, conn_resp_tx, cancel).await;
    registry.release(port);
    result
}

#[allow(clippy::too_many_arguments)]
async fn serve_one_tunnel(
    visitor: Stream,
    port: u16,
    bind_addr: std::net::IpAddr,
    kind: Kind,
    tls_cert: Option<&std::path::Path>,
    tls_key: Option<&std::path::Path>,
    token: Arc<Vec<u8>>,
    conn_resp_tx: mpsc::UnboundedSender<ConnResp>,
    cancel: CancellationToken,
) -> Result<()> {
    // Listen before notifying: the client must never be told about a port
    // that isn't accepting connections yet.
    let listener = bind_tunnel_listener(bind_addr, port, kind, tls_cert, tls_key).await?;
    info!(port, "tunnel listener ready");

    if conn_resp_tx.send(ConnResp::tunnel(port)).is_err() {
        // Control stream is gone; nothing to notify, abandon this visitor.
        return Ok(());
    }

    let deadline = Instant::now() + TOKEN_WAIT;

    match wait_for_verified_dial(port, &listener, &token, deadline, &cancel).await {
        DialOutcome::Verified(client_stream) => {
            info!(port, "tunnel verified, splicing");
            pipe::splice(client_stream, visitor, cancel).await
        }
        DialOutcome::TimedOut => {
            warn!(port, "no verified dial-back within the token wait window");
            Ok(())
        }
        DialOutcome::Cancelled => Ok(()),
    }
}

/// Result of waiting on a tunnel listener for a dial-back whose first 256
/// bytes match the session's token.
enum DialOutcome {
    /// A dial-back presented the correct token; here is its stream.
    Verified(Stream),
    /// The wait window elapsed with no correctly-tokened dial-back.
    TimedOut,
    /// The session was cancelled while waiting.
    Cancelled,
}

/// Accepts on `listener` until a dial-back presents a token matching
/// `token`, the `deadline` passes, or `cancel` fires. A mismatched or
/// truncated token does not close the listener — per spec.md §4.6 step 4,
/// the listener keeps accepting within the bounded wait window instead of
/// giving up after the first bad attempt.
async fn wait_for_verified_dial(
    port: u16,
    listener: &Listener,
    token: &[u8],
    deadline: Instant,
    cancel: &CancellationToken,
) -> DialOutcome {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return DialOutcome::TimedOut;
        }

        let accept = tokio::select! {
            res = timeout(remaining, listener.accept()) => res,
            _ = cancel.cancelled() => return DialOutcome::Cancelled,
        };

        let (mut candidate, addr) = match accept {
            Ok(Ok(pair)) => pair,
            Ok(Err(err)) => {
                warn!(port, %err, "tunnel accept failed");
                continue;
            }
            Err(_) => return DialOutcome::TimedOut,
        };

        let mut presented = vec![0u8; TOKEN_LEN];
        if candidate.read_exact(&mut presented).await.is_err() {
            warn!(port, ?addr, "tunnel dial-back closed before sending a full token");
            continue;
        }

        if constant_time_eq(&presented, token) {
            return DialOutcome::Verified(candidate);
        } else {
            warn!(port, ?addr, "tunnel dial-back presented a mismatched token");
            continue;
        }
    }
}

/// Binds the ephemeral tunnel listener for one visitor. Unlike the public
/// funnel listener, this dial-back channel is between the server and the
/// client only, so it must match the session's transport kind (spec.md
/// §4.3: "the same transport kind for every back-channel dial").
async fn bind_tunnel_listener(
    bind_addr: std::net::IpAddr,
    port: u16,
    kind: Kind,
    tls_cert: Option<&std::path::Path>,
    tls_key: Option<&std::path::Path>,
) -> Result<Listener> {
    match kind {
        Kind::Plain => Listener::bind_plain((bind_addr, port)).await,
        Kind::Tls => {
            let (cert, key) = tls_cert
                .zip(tls_key)
                .context("TLS session requires a certificate and key")?;
            Listener::bind_tls((bind_addr, port), cert, key).await
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
