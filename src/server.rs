//! Top-level acceptor: binds the control listener(s) and spawns one session
//! per accepted connection (C9).

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, info_span, warn, Instrument};

use crate::port_pool::PortRegistry;
use crate::session::{self, SessionConfig};
use crate::transport::Listener;

/// Top-level server configuration, built once from CLI flags and handed off
/// to [`Server::listen`].
pub struct Server {
    /// IP address both the control listener and every tunnel listener bind
    /// to.
    pub bind_addr: IpAddr,
    /// Control port for plaintext sessions. `None` disables plaintext.
    pub control_port: Option<u16>,
    /// Control port for TLS sessions. `None` disables TLS.
    pub control_tls_port: Option<u16>,
    /// TLS certificate, required when `control_tls_port` is set.
    pub tls_cert: Option<PathBuf>,
    /// TLS key, required when `control_tls_port` is set.
    pub tls_key: Option<PathBuf>,
    /// Pre-shared password; empty disables authentication.
    pub password: String,
    /// Inclusive-exclusive range of ports usable as RemotePort/TunnelPort.
    pub min_port: u16,
    pub max_port: u16,
}

impl Server {
    /// Bind every configured listener and accept connections until one of
    /// them hits a fatal error. Per-connection errors are logged and do not
    /// affect other sessions.
    pub async fn listen(self) -> Result<()> {
        if self.control_port.is_none() && self.control_tls_port.is_none() {
            anyhow::bail!("server must have at least one of plaintext or TLS enabled");
        }

        let registry = Arc::new(PortRegistry::new(self.min_port..self.max_port));
        let cfg = Arc::new(SessionConfig {
            password: self.password,
            bind_addr: self.bind_addr,
            registry,
            tls_cert: self.tls_cert.clone(),
            tls_key: self.tls_key.clone(),
        });

        let mut listeners = Vec::new();
        if let Some(port) = self.control_port {
            let listener = Listener::bind_plain((self.bind_addr, port))
                .await
                .context("failed to bind plaintext control listener")?;
            info!(port, "plaintext control listener ready");
            listeners.push(listener);
        }
        if let Some(port) = self.control_tls_port {
            let (cert, key) = self
                .tls_cert
                .as_deref()
                .zip(self.tls_key.as_deref())
                .context("TLS control listener requires --tls-cert and --tls-key")?;
            let listener = Listener::bind_tls((self.bind_addr, port), cert, key)
                .await
                .context("failed to bind TLS control listener")?;
            info!(port, "TLS control listener ready");
            listeners.push(listener);
        }

        let mut tasks = Vec::new();
        for listener in listeners {
            let cfg = Arc::clone(&cfg);
            tasks.push(tokio::spawn(accept_loop(listener, cfg)));
        }

        // Any listener dying is fatal: propagate the first error and let the
        // others keep running sessions until the process exits.
        let (result, _idx, _rest) = futures_util::future::select_all(tasks).await;
        Ok(result.context("control listener task panicked")??)
    }
}

async fn accept_loop(listener: Listener, cfg: Arc<SessionConfig>) -> Result<()> {
    let kind = listener.kind();
    loop {
        let (stream, addr) = listener.accept().await?;
        let cfg = Arc::clone(&cfg);
        tokio::spawn(
            async move {
                info!("incoming connection");
                if let Err(err) = session::run(stream, kind, cfg).await {
                    warn!(%err, "session exited with error");
                }
            }
            .instrument(info_span!("control", ?addr, ?kind)),
        );
    }
}
