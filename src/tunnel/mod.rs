//! Tunnel layer - per-session ciphered streams to the rendezvous server
//!
//! Each origin dial opens a fresh control stream, performs the signed
//! `NewVisitorConn` exchange, and layers the configured transforms
//! (cipher, then compression) over the raw stream. The layered stream is
//! handed back as a [`TunnelStream`] that the protocol servers treat as an
//! opaque duplex.

mod compress;
mod crypto;

pub use compress::{CodecPool, CompressedStream};
pub use crypto::CipherStream;

use crate::config::VisitorConfig;
use crate::msg::{self, Message, MsgError, NewVisitorConn};
use crate::BoxedStream;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::warn;

/// How long to wait for the rendezvous answer before giving up on the
/// session. The deadline covers only the handshake read; byte pumping runs
/// without one.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] MsgError),

    #[error("timed out waiting for the visitor handshake response")]
    HandshakeTimeout,

    #[error("server rejected visitor connection: {0}")]
    Rejected(String),

    #[error("unexpected message from server")]
    UnexpectedMessage,
}

/// A control stream freshly opened to the rendezvous server.
pub struct ControlStream {
    pub io: BoxedStream,
    /// Local endpoint of the underlying transport, when it has one.
    pub local_addr: Option<SocketAddr>,
}

/// Callbacks the wider client provides: how to reach the rendezvous server
/// and the run identifier this client registered under.
#[async_trait]
pub trait ControlHandle: Send + Sync {
    /// Open a fresh control stream. May be a sub-stream of a shared
    /// long-lived transport; each returned stream closes independently.
    async fn connect_server(&self) -> io::Result<ControlStream>;

    fn run_id(&self) -> String;
}

/// Dial an origin by its `host:port` address.
///
/// Every protocol server takes one of these, so tests can stub the tunnel
/// and the visitor can steer all dials through the rendezvous.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, target: &str) -> Result<TunnelStream, TunnelError>;
}

/// The real dialer: control stream + signed handshake + stream transforms.
pub struct TunnelDialer {
    handle: Arc<dyn ControlHandle>,
    server_name: String,
    secret_key: String,
    use_encryption: bool,
    use_compression: bool,
    codecs: Arc<CodecPool>,
}

impl TunnelDialer {
    pub fn new(cfg: &VisitorConfig, handle: Arc<dyn ControlHandle>, codecs: Arc<CodecPool>) -> Self {
        Self {
            handle,
            server_name: cfg.server_name.clone(),
            secret_key: cfg.secret_key.clone(),
            use_encryption: cfg.use_encryption,
            use_compression: cfg.use_compression,
            codecs,
        }
    }
}

#[async_trait]
impl Dialer for TunnelDialer {
    async fn dial(&self, target: &str) -> Result<TunnelStream, TunnelError> {
        let ControlStream { mut io, local_addr } = self.handle.connect_server().await?;

        let timestamp = unix_now();
        let request = Message::NewVisitorConn(NewVisitorConn {
            run_id: self.handle.run_id(),
            proxy_name: self.server_name.clone(),
            sign_key: msg::sign_key(&self.secret_key, timestamp),
            timestamp,
            use_encryption: self.use_encryption,
            use_compression: self.use_compression,
            target_addr: target.to_string(),
        });
        if let Err(e) = msg::write_message(&mut io, &request).await {
            warn!("send visitor handshake failed: {e}");
            return Err(e.into());
        }

        let response = tokio::time::timeout(HANDSHAKE_TIMEOUT, msg::read_message(&mut io))
            .await
            .map_err(|_| TunnelError::HandshakeTimeout)??;
        let response = match response {
            Message::NewVisitorConnResp(r) => r,
            _ => return Err(TunnelError::UnexpectedMessage),
        };
        if !response.error.is_empty() {
            warn!("visitor connection refused: {}", response.error);
            return Err(TunnelError::Rejected(response.error));
        }

        let mut stream: BoxedStream = io;
        if self.use_encryption {
            stream = Box::new(CipherStream::new(stream, self.secret_key.as_bytes()));
        }
        if self.use_compression {
            stream = Box::new(CompressedStream::new(stream, self.codecs.clone()));
        }
        Ok(TunnelStream::new(stream, local_addr))
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// The dialed end-to-end stream. Dropping it releases any pooled
/// compression state and closes the underlying control stream.
pub struct TunnelStream {
    io: BoxedStream,
    local_addr: Option<SocketAddr>,
}

impl TunnelStream {
    pub fn new(io: BoxedStream, local_addr: Option<SocketAddr>) -> Self {
        Self { io, local_addr }
    }

    /// Local endpoint of the transport carrying this stream, if known.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}
