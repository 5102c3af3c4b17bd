//! Per-control-connection state machine: parse intro, authorize, reserve the
//! public port, drive the funnel and broker, clean up on disconnect (C7).
//!
//! ```text
//!          accept control conn
//!               |
//!               v
//!         +-----------+   malformed / auth fail / port taken
//!         | AwaitIntro|------------------------------------> Rejected -> close
//!         +-----+-----+
//!               | valid intro, try_reserve(remote_port) ok
//!               v
//!         +-----------+
//!         |  Active   |  -- spawns Funnel(remote_port) + Broker
//!         +-----+-----+
//!               | control stream EOF/error  OR  cancel
//!               v
//!         +-----------+
//!         | Draining  |  cancel Funnel + Broker; release remote_port;
//!         +-----+-----+  wait for children; close
//!               v
//!            Closed
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::auth::verify_password;
use crate::broker::TunnelBroker;
use crate::funnel::{bind_public_listener, VisitorFunnel};
use crate::port_pool::PortRegistry;
use crate::protocol::{ConnResp, Delimited, Intro, TOKEN_LEN};
use crate::transport::{Kind, Stream};

/// Errors that can end a session before it reaches `Active`. These decide
/// whether the session sends a rejection frame or just closes.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Malformed or unexpected frame on the control stream.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Password mismatch.
    #[error("authentication failed")]
    Auth,

    /// The requested `RemotePort` is already held by another session.
    #[error("port {0} is already in use")]
    PortInUse(u16),
}

/// Shared, process-wide configuration every session reads from.
pub struct SessionConfig {
    /// Pre-shared password; empty means no authentication.
    pub password: String,
    /// IP address public listeners bind to.
    pub bind_addr: std::net::IpAddr,
    /// Shared registry backing both RemotePort and TunnelPort reservations.
    pub registry: Arc<PortRegistry>,
    /// TLS certificate, required if this session's transport is TLS.
    pub tls_cert: Option<PathBuf>,
    /// TLS key, required if this session's transport is TLS.
    pub tls_key: Option<PathBuf>,
}

/// Drive one control connection end to end. Returns once the session is
/// fully torn down (all child tasks stopped, any held port released).
pub async fn run(stream: Stream, kind: Kind, cfg: Arc<SessionConfig>) -> Result<()> {
    let session_id = Uuid::new_v4();
    let span = info_span!("session", %session_id);

    async move {
        let mut control = Delimited::new(stream);

        let intro = match await_intro(&mut control, &cfg).await {
            Ok(intro) => intro,
            Err(err) => {
                let msg = match &err {
                    SessionError::Auth => "auth",
                    SessionError::PortInUse(_) => "port in use",
                    SessionError::Protocol(_) => "protocol error",
                };
                warn!(%err, "rejecting session");
                let _ = control.send(ConnResp::reject(msg)).await;
                return Ok(());
            }
        };

        info!(port = intro.port, "session active");
        let result = drive_active_session(control, kind, intro.clone(), &cfg).await;
        cfg.registry.release(intro.port);
        info!(port = intro.port, "session closed, port released");
        result
    }
    .instrument(span)
    .await
}

async fn await_intro(
    control: &mut Delimited<Stream>,
    cfg: &SessionConfig,
) -> Result<Intro, SessionError> {
    let intro: Intro = control
        .recv_timeout()
        .await
        .map_err(|err| SessionError::Protocol(err.to_string()))?
        .ok_or_else(|| SessionError::Protocol("connection closed before intro".into()))?;

    if intro.token.len() != TOKEN_LEN {
        return Err(SessionError::Protocol(format!(
            "token must be {TOKEN_LEN} bytes, got {}",
            intro.token.len()
        )));
    }

    if !verify_password(&cfg.password, &intro.password) {
        return Err(SessionError::Auth);
    }

    if !cfg.registry.try_reserve(intro.port) {
        return Err(SessionError::PortInUse(intro.port));
    }

    Ok(intro)
}

async fn drive_active_session(
    mut control: Delimited<Stream>,
    kind: Kind,
    intro: Intro,
    cfg: &SessionConfig,
) -> Result<()> {
    let cancel = CancellationToken::new();

    let listener = bind_public_listener(cfg.bind_addr, intro.port).await?;
    let funnel = VisitorFunnel::bind(listener, intro.port, cancel.clone()).await?;

    let broker = TunnelBroker::new(
        Arc::clone(&cfg.registry),
        cfg.bind_addr,
        kind,
        cfg.tls_cert.clone(),
        cfg.tls_key.clone(),
        intro.token,
    );

    let (conn_resp_tx, mut conn_resp_rx) = mpsc::unbounded_channel::<ConnResp>();
    let broker_cancel = cancel.clone();
    let broker_handle =
        tokio::spawn(async move { broker.run(funnel, conn_resp_tx, broker_cancel).await });

    let mut broker_done = false;
    let result = loop {
        tokio::select! {
            resp = conn_resp_rx.recv(), if !broker_done => {
                match resp {
                    Some(resp) => {
                        if control.send(resp).await.is_err() {
                            break Ok(());
                        }
                    }
                    None => broker_done = true,
                }
            }
            frame = control.recv::<serde_json::Value>() => {
                match frame {
                    Ok(None) => break Ok(()),
                    Ok(Some(_)) => {
                        warn!("unexpected message after intro, closing session");
                        break Ok(());
                    }
                    Err(err) => break Err(err),
                }
            }
        }
    };

    cancel.cancel();
    let _ = broker_handle.await;
    result
}
