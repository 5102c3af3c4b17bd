//! Uniform "accept a stream"/"dial a stream" surface over plaintext TCP and
//! TLS-over-TCP (C3).

use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::{Context as _, Result};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Which wire transport a session or dial uses. Both sides of a session
/// (control connection and every tunnel back-channel dial it spawns) must
/// agree on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Plain TCP.
    Plain,
    /// TLS over TCP.
    Tls,
}

/// A stream that is either a plain TCP socket or a TLS session over one.
pub enum Stream {
    /// Plaintext.
    Plain(TcpStream),
    /// TLS server or client session.
    Tls(Box<TlsStream>),
}

/// Either half of a TLS session, so one enum variant can carry both.
pub enum TlsStream {
    /// Accepted (server-side) TLS session.
    Server(tokio_rustls::server::TlsStream<TcpStream>),
    /// Dialed (client-side) TLS session.
    Client(tokio_rustls::client::TlsStream<TcpStream>),
}

impl Stream {
    /// Which transport kind this stream is using.
    pub fn kind(&self) -> Kind {
        match self {
            Stream::Plain(_) => Kind::Plain,
            Stream::Tls(_) => Kind::Tls,
        }
    }
}

macro_rules! delegate_pin {
    ($self:expr) => {
        match $self.get_mut() {
            Stream::Plain(s) => Pin::new(s),
            Stream::Tls(s) => match s.as_mut() {
                TlsStream::Server(s) => Pin::new(s),
                TlsStream::Client(s) => Pin::new(s),
            },
        }
    };
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => match s.as_mut() {
                TlsStream::Server(s) => Pin::new(s).poll_read(cx, buf),
                TlsStream::Client(s) => Pin::new(s).poll_read(cx, buf),
            },
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => match s.as_mut() {
                TlsStream::Server(s) => Pin::new(s).poll_write(cx, buf),
                TlsStream::Client(s) => Pin::new(s).poll_write(cx, buf),
            },
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        delegate_pin!(self).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        delegate_pin!(self).poll_shutdown(cx)
    }
}

/// Server-side listener: plaintext, TLS, or (at the acceptor level) both
/// bound concurrently as two separate `Listener`s.
pub enum Listener {
    /// Plaintext TCP listener.
    Plain(TcpListener),
    /// TLS-over-TCP listener.
    Tls(TcpListener, TlsAcceptor),
}

impl Listener {
    /// Bind a plaintext listener.
    pub async fn bind_plain(addr: (std::net::IpAddr, u16)) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Listener::Plain(listener))
    }

    /// Bind a TLS listener using a certificate and key loaded from disk.
    pub async fn bind_tls(
        addr: (std::net::IpAddr, u16),
        cert_path: &Path,
        key_path: &Path,
    ) -> Result<Self> {
        let acceptor = build_tls_acceptor(cert_path, key_path)?;
        let listener = TcpListener::bind(addr).await?;
        Ok(Listener::Tls(listener, acceptor))
    }

    /// Which transport kind this listener produces.
    pub fn kind(&self) -> Kind {
        match self {
            Listener::Plain(_) => Kind::Plain,
            Listener::Tls(..) => Kind::Tls,
        }
    }

    /// Local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        match self {
            Listener::Plain(l) => l.local_addr(),
            Listener::Tls(l, _) => l.local_addr(),
        }
    }

    /// Accept one incoming connection, completing the TLS handshake if this
    /// is a TLS listener.
    pub async fn accept(&self) -> Result<(Stream, std::net::SocketAddr)> {
        match self {
            Listener::Plain(l) => {
                let (stream, addr) = l.accept().await?;
                Ok((Stream::Plain(stream), addr))
            }
            Listener::Tls(l, acceptor) => {
                let (stream, addr) = l.accept().await?;
                let tls = acceptor
                    .accept(stream)
                    .await
                    .context("TLS handshake failed")?;
                Ok((Stream::Tls(Box::new(TlsStream::Server(tls))), addr))
            }
        }
    }
}

fn build_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid TLS certificate/key")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let mut reader = io::BufReader::new(
        std::fs::File::open(path).with_context(|| format!("reading cert file {path:?}"))?,
    );
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("invalid PEM certificate chain")
}

fn load_key(path: &Path) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let mut reader = io::BufReader::new(
        std::fs::File::open(path).with_context(|| format!("reading key file {path:?}"))?,
    );
    rustls_pemfile::private_key(&mut reader)
        .context("invalid PEM private key")?
        .context("no private key found in file")
}

/// Dial out on either transport kind, used both for the control connection
/// and for every tunnel back-channel dial.
pub async fn connect(
    kind: Kind,
    host: &str,
    port: u16,
    tls_verify: bool,
) -> Result<Stream> {
    let tcp = TcpStream::connect((host, port))
        .await
        .with_context(|| format!("could not connect to {host}:{port}"))?;
    match kind {
        Kind::Plain => Ok(Stream::Plain(tcp)),
        Kind::Tls => {
            let connector = build_tls_connector(tls_verify)?;
            let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
                .context("invalid TLS server name")?;
            let tls = connector
                .connect(server_name, tcp)
                .await
                .context("TLS handshake failed")?;
            Ok(Stream::Tls(Box::new(TlsStream::Client(tls))))
        }
    }
}

fn build_tls_connector(tls_verify: bool) -> Result<TlsConnector> {
    let config = if tls_verify {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    } else {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify))
            .with_no_client_auth()
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

#[derive(Debug)]
struct NoVerify;

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
