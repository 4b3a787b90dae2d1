//! SOCKS4/4a server (CONNECT and BIND)
//!
//! A DSTIP of 0.0.0.x with x non-zero marks a SOCKS4a request: the real
//! hostname follows the userid, NUL-terminated. Replies are always the
//! fixed 8-byte frame `VN=0 CD PORT(2) IP(4)`.

use super::ProxyError;
use crate::demux::PeekableStream;
use crate::relay::{join_streams, BytesPool};
use crate::tunnel::Dialer;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, warn};

const SOCKS_VERSION: u8 = 0x04;
const MAX_FIELD: usize = 255;

/// SOCKS4 commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
}

impl TryFrom<u8> for Command {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Bind),
            _ => Err(ProxyError::UnsupportedCommand(value)),
        }
    }
}

/// Reply codes
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum Reply {
    Granted = 90,
    Rejected = 91,
    NoIdentd = 92,
    BadIdentd = 93,
}

/// Authentication callback: gets the requested command and the userid.
pub type Authentication = Arc<dyn Fn(Command, &str) -> bool + Send + Sync>;

/// SOCKS4 proxy server
pub struct Socks4Server {
    dialer: Arc<dyn Dialer>,
    auth: Option<Authentication>,
    pool: Arc<BytesPool>,
}

impl Socks4Server {
    pub fn new(dialer: Arc<dyn Dialer>, auth: Option<Authentication>, pool: Arc<BytesPool>) -> Self {
        Self { dialer, auth, pool }
    }

    /// Serve one SOCKS4 request on `conn`.
    pub async fn serve_conn(&self, mut conn: PeekableStream) -> Result<(), ProxyError> {
        let mut head = [0u8; 8];
        conn.read_exact(&mut head).await?;
        if head[0] != SOCKS_VERSION {
            return Err(ProxyError::InvalidSocksVersion(head[0]));
        }

        let port = u16::from_be_bytes([head[2], head[3]]);
        let ip = [head[4], head[5], head[6], head[7]];
        let userid = read_nul_terminated(&mut conn).await?;

        // 0.0.0.x (x != 0) means 4a: the hostname follows.
        let target = if ip[0] == 0 && ip[1] == 0 && ip[2] == 0 && ip[3] != 0 {
            let host = read_nul_terminated(&mut conn).await?;
            format!("{host}:{port}")
        } else {
            format!("{}.{}.{}.{}:{}", ip[0], ip[1], ip[2], ip[3], port)
        };

        let command = match Command::try_from(head[1]) {
            Ok(command) => command,
            Err(e) => {
                send_reply(&mut conn, Reply::Rejected, None).await?;
                return Err(e);
            }
        };

        if let Some(auth) = &self.auth {
            if !auth(command, &userid) {
                send_reply(&mut conn, Reply::Rejected, None).await?;
                return Err(ProxyError::AuthenticationFailed);
            }
        }

        match command {
            Command::Connect => self.handle_connect(conn, &target).await,
            Command::Bind => self.handle_bind(conn, &target).await,
        }
    }

    async fn handle_connect(
        &self,
        mut conn: PeekableStream,
        target: &str,
    ) -> Result<(), ProxyError> {
        debug!("socks4 CONNECT to {target}");
        let tunnel = match self.dialer.dial(target).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                warn!("dial {target} failed: {e}");
                send_reply(&mut conn, Reply::Rejected, None).await?;
                return Err(e.into());
            }
        };

        send_reply(&mut conn, Reply::Granted, tunnel.local_addr()).await?;
        join_streams(conn, tunnel, &self.pool).await?;
        Ok(())
    }

    async fn handle_bind(&self, mut conn: PeekableStream, target: &str) -> Result<(), ProxyError> {
        debug!("socks4 BIND on {target}");
        let listener = match TcpListener::bind(target).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("bind {target} failed: {e}");
                send_reply(&mut conn, Reply::Rejected, None).await?;
                return Err(e.into());
            }
        };

        send_reply(&mut conn, Reply::Granted, listener.local_addr().ok()).await?;

        let (inbound, peer) = listener.accept().await?;
        drop(listener);
        send_reply(&mut conn, Reply::Granted, Some(peer)).await?;

        join_streams(conn, inbound, &self.pool).await?;
        Ok(())
    }
}

async fn read_nul_terminated<R>(r: &mut R) -> Result<String, ProxyError>
where
    R: AsyncRead + Unpin,
{
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        r.read_exact(&mut byte).await?;
        if byte[0] == 0 {
            break;
        }
        if out.len() >= MAX_FIELD {
            return Err(ProxyError::MalformedRequest("field too long".into()));
        }
        out.push(byte[0]);
    }
    String::from_utf8(out).map_err(|_| ProxyError::MalformedRequest("non-UTF-8 field".into()))
}

async fn send_reply<W>(w: &mut W, reply: Reply, addr: Option<SocketAddr>) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin,
{
    let (ip, port) = match addr {
        Some(addr) => {
            let ip = match addr.ip() {
                IpAddr::V4(v4) => v4.octets(),
                IpAddr::V6(_) => [0u8; 4],
            };
            (ip, addr.port())
        }
        None => ([0u8; 4], 0),
    };

    let mut frame = [0u8; 8];
    frame[1] = reply as u8;
    frame[2..4].copy_from_slice(&port.to_be_bytes());
    frame[4..8].copy_from_slice(&ip);
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}
