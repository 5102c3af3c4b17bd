//! Wire protocol for the control connection: newline-delimited JSON records.

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_util::codec::{Framed, LinesCodec};

/// Default port the server listens on for control connections.
pub const CONTROL_PORT: u16 = 4000;

/// Default TLS port the server listens on for control connections.
pub const CONTROL_TLS_PORT: u16 = 4001;

/// Default lower bound of the tunnel-port pool.
pub const DEFAULT_MIN_TUNNEL_PORT: u16 = 4500;

/// Default upper bound (exclusive) of the tunnel-port pool.
pub const DEFAULT_MAX_TUNNEL_PORT: u16 = 5000;

/// Length in bytes of the one-shot token exchanged on the tunnel back-channel.
pub const TOKEN_LEN: usize = 256;

/// Maximum length of one control-connection line, to bound memory use on a
/// hostile or confused peer.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024;

/// How long either side will wait for an expected message before giving up.
pub const NETWORK_TIMEOUT: Duration = Duration::from_secs(10);

/// Sent once by the client immediately after opening the control connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intro {
    /// The public port the client wants the server to listen on.
    pub port: u16,

    /// One-shot secret proving that a tunnel dial-back belongs to this
    /// session.
    #[serde(with = "token_b64")]
    pub token: Vec<u8>,

    /// Pre-shared password, empty string if the server requires none.
    #[serde(default)]
    pub password: String,
}

/// Sent by the server on the control stream, zero or more times per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnResp {
    /// True if the server rejected the session outright (bad port, bad
    /// password). Once sent, no more messages follow and the connection is
    /// closed by the server.
    pub rejection: bool,

    /// Present iff `rejection` is true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_msg: Option<String>,

    /// Present iff `rejection` is false: the ephemeral port the client
    /// should dial back on for this visitor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_port: Option<u16>,
}

impl ConnResp {
    /// Build a rejection reply.
    pub fn reject(msg: impl Into<String>) -> Self {
        ConnResp {
            rejection: true,
            rejection_msg: Some(msg.into()),
            tunnel_port: None,
        }
    }

    /// Build a tunnel-ready reply.
    pub fn tunnel(port: u16) -> Self {
        ConnResp {
            rejection: false,
            rejection_msg: None,
            tunnel_port: Some(port),
        }
    }
}

mod token_b64 {
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)
    }
}

/// Wraps an async byte stream in a newline-delimited JSON framing, matching
/// the control protocol's one-JSON-object-per-line wire format.
pub struct Delimited<T>(Framed<T, LinesCodec>);

impl<T: AsyncRead + AsyncWrite + Unpin> Delimited<T> {
    /// Construct a new framed connection over the given stream.
    pub fn new(stream: T) -> Self {
        Delimited(Framed::new(
            stream,
            LinesCodec::new_with_max_length(MAX_FRAME_LENGTH),
        ))
    }

    /// Send a JSON-serializable message, encoded on one line.
    pub async fn send<M: Serialize>(&mut self, msg: M) -> Result<()> {
        let line = serde_json::to_string(&msg).context("failed to encode message")?;
        self.0.send(line).await.context("failed to write frame")?;
        Ok(())
    }

    /// Receive and decode one message, or `None` on clean EOF.
    pub async fn recv<M: DeserializeOwned>(&mut self) -> Result<Option<M>> {
        match self.0.next().await {
            Some(line) => {
                let line = line.context("failed to read frame")?;
                let msg = serde_json::from_str(&line).context("malformed control message")?;
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }

    /// Receive with a bounded wait, erroring out on timeout rather than
    /// hanging forever on a peer that never speaks.
    pub async fn recv_timeout<M: DeserializeOwned>(&mut self) -> Result<Option<M>> {
        timeout(NETWORK_TIMEOUT, self.recv())
            .await
            .context("timed out waiting for control message")?
    }

    /// Unwrap the underlying stream, surfacing the partially-filled buffers
    /// so a caller can forward anything already read before handing the raw
    /// socket off to a splice.
    pub fn into_parts(self) -> DelimitedParts<T> {
        let parts = self.0.into_parts();
        DelimitedParts {
            io: parts.io,
            read_buf: parts.read_buf.to_vec(),
            write_buf: parts.write_buf.to_vec(),
        }
    }
}

/// The pieces of a [`Delimited`] after it has been torn down.
pub struct DelimitedParts<T> {
    /// The raw underlying stream.
    pub io: T,
    /// Bytes already read off the wire but not yet consumed as a frame.
    pub read_buf: Vec<u8>,
    /// Bytes buffered for write but not yet flushed.
    pub write_buf: Vec<u8>,
}
