//! Matching tunnel dialer for the client side of a session (C8).

use std::time::Duration;

use anyhow::{Context, Result};
use rand::RngCore;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;
use tracing::{error, info, info_span, warn, Instrument};

use crate::protocol::{ConnResp, Delimited, Intro, TOKEN_LEN};
use crate::{pipe, transport};
use tokio_util::sync::CancellationToken;
use transport::Kind;

/// How long to wait before reconnecting when `--restart` is set, matching
/// the 2s baseline of the system this design is based on.
const RESTART_BACKOFF: Duration = Duration::from_secs(2);

/// Terminal error returned when the server rejects a session outright.
#[derive(Debug, Error)]
#[error("server rejected tunnel: {0}")]
pub struct ServerRejected(pub String);

/// Configuration for one client session.
pub struct Client {
    /// Host the application being exposed is listening on.
    pub local_host: String,
    /// Port the application being exposed is listening on.
    pub local_port: u16,
    /// Server host to connect to.
    pub server_host: String,
    /// Server control port.
    pub server_port: u16,
    /// Requested public port. 0 must already have been resolved by the
    /// caller (see `pick_remote_port`) to a concrete value, since the
    /// server treats the requested port as authoritative.
    pub remote_port: u16,
    /// Transport kind used for the control connection and every tunnel
    /// dial-back.
    pub kind: Kind,
    /// Whether to validate the server's TLS certificate against system
    /// roots (only meaningful when `kind == Kind::Tls`).
    pub tls_verify: bool,
    /// Pre-shared password, empty if the server requires none.
    pub password: String,
    /// If true, reconnect with a fixed backoff after any failure instead of
    /// returning the error.
    pub restart: bool,
}

impl Client {
    /// Run the client. A rejection is terminal only under the non-restart
    /// policy; with `restart` set, any error — including a rejection —
    /// is retried after a fixed backoff, indefinitely.
    pub async fn run(&self) -> Result<()> {
        loop {
            match self.run_once().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if !self.restart {
                        return Err(err);
                    }
                    error!(%err, "client session ended, restarting");
                    sleep(RESTART_BACKOFF).await;
                }
            }
        }
    }

    async fn run_once(&self) -> Result<()> {
        let token = random_token();

        let stream =
            transport::connect(self.kind, &self.server_host, self.server_port, self.tls_verify)
                .await
                .context("could not reach server")?;
        let mut control = Delimited::new(stream);

        control
            .send(Intro {
                port: self.remote_port,
                token: token.clone(),
                password: self.password.clone(),
            })
            .await?;

        info!(
            server = %self.server_host,
            port = self.remote_port,
            "waiting for tunnel notifications",
        );

        let cancel = CancellationToken::new();
        loop {
            let resp: Option<ConnResp> = control.recv_timeout().await?;
            let Some(resp) = resp else {
                info!("control connection closed");
                return Ok(());
            };

            if resp.rejection {
                let msg = resp.rejection_msg.unwrap_or_else(|| "unknown reason".into());
                return Err(ServerRejected(msg).into());
            }

            let Some(tunnel_port) = resp.tunnel_port else {
                warn!("ConnResp missing tunnel_port on non-rejection, ignoring");
                continue;
            };

            let token = token.clone();
            let server_host = self.server_host.clone();
            let local_host = self.local_host.clone();
            let local_port = self.local_port;
            let kind = self.kind;
            let tls_verify = self.tls_verify;
            let cancel = cancel.clone();

            tokio::spawn(
                async move {
                    if let Err(err) = dial_back(
                        kind,
                        &server_host,
                        tunnel_port,
                        tls_verify,
                        &token,
                        &local_host,
                        local_port,
                        cancel,
                    )
                    .await
                    {
                        warn!(%err, "tunnel dial-back failed");
                    }
                }
                .instrument(info_span!("tunnel", tunnel_port)),
            );
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn dial_back(
    kind: Kind,
    server_host: &str,
    tunnel_port: u16,
    tls_verify: bool,
    token: &[u8],
    local_host: &str,
    local_port: u16,
    cancel: CancellationToken,
) -> Result<()> {
    let mut tunnel_stream = transport::connect(kind, server_host, tunnel_port, tls_verify)
        .await
        .context("could not dial tunnel port")?;
    tunnel_stream
        .write_all(token)
        .await
        .context("could not send token")?;

    let app_stream = transport::connect(Kind::Plain, local_host, local_port, false)
        .await
        .context("could not reach local application")?;

    pipe::splice(tunnel_stream, app_stream, cancel).await
}

fn random_token() -> Vec<u8> {
    let mut token = vec![0u8; TOKEN_LEN];
    rand::rngs::OsRng.fill_bytes(&mut token);
    token
}

/// Choose a random public port in `[4001, 14001)`, excluding the server's
/// control port, for the client's "let the server pick" (`0`) default.
pub fn pick_remote_port(control_port: u16) -> u16 {
    loop {
        let candidate = 4001 + fastrand::u16(..10000);
        if candidate != control_port {
            return candidate;
        }
    }
}
