//! Client-facing protocol servers
//!
//! Provides:
//! - HTTP proxy (CONNECT and forward requests)
//! - SOCKS4/4a server
//! - SOCKS5 server (CONNECT, BIND, UDP ASSOCIATE)
//!
//! Each server terminates its protocol on an already-classified connection
//! and dials origins through the injected [`crate::tunnel::Dialer`].

pub mod http;
pub mod socks4;
pub mod socks5;

pub use http::HttpProxyServer;
pub use socks4::Socks4Server;
pub use socks5::Socks5Server;

use std::net::{IpAddr, SocketAddr};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid SOCKS version: {0}")]
    InvalidSocksVersion(u8),

    #[error("unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("address type not supported: {0}")]
    UnsupportedAddressType(u8),

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("origin dial failed: {0}")]
    Dial(#[from] crate::tunnel::TunnelError),
}

/// Proxy target address, as carried by SOCKS request and UDP headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address and port
    Ipv4([u8; 4], u16),
    /// IPv6 address and port
    Ipv6([u8; 16], u16),
    /// Domain name and port
    Domain(String, u16),
}

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

impl Address {
    pub fn port(&self) -> u16 {
        match self {
            Address::Ipv4(_, port) => *port,
            Address::Ipv6(_, port) => *port,
            Address::Domain(_, port) => *port,
        }
    }

    /// Read the `ATYP DSTADDR DSTPORT` tail of a request whose ATYP byte
    /// was already consumed.
    pub async fn read_from<R>(r: &mut R, atyp: u8) -> Result<Self, ProxyError>
    where
        R: AsyncRead + Unpin,
    {
        match atyp {
            ATYP_IPV4 => {
                let mut ip = [0u8; 4];
                r.read_exact(&mut ip).await?;
                let mut port = [0u8; 2];
                r.read_exact(&mut port).await?;
                Ok(Address::Ipv4(ip, u16::from_be_bytes(port)))
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                r.read_exact(&mut len).await?;
                let mut domain = vec![0u8; len[0] as usize];
                r.read_exact(&mut domain).await?;
                let domain = String::from_utf8(domain)
                    .map_err(|_| ProxyError::MalformedRequest("non-UTF-8 domain".into()))?;
                let mut port = [0u8; 2];
                r.read_exact(&mut port).await?;
                Ok(Address::Domain(domain, u16::from_be_bytes(port)))
            }
            ATYP_IPV6 => {
                let mut ip = [0u8; 16];
                r.read_exact(&mut ip).await?;
                let mut port = [0u8; 2];
                r.read_exact(&mut port).await?;
                Ok(Address::Ipv6(ip, u16::from_be_bytes(port)))
            }
            other => Err(ProxyError::UnsupportedAddressType(other)),
        }
    }

    /// Decode `ATYP DSTADDR DSTPORT` from a byte slice; returns the address
    /// and the number of bytes consumed. Used for SOCKS5 UDP headers.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), ProxyError> {
        let atyp = *buf.first().ok_or_else(truncated)?;
        match atyp {
            ATYP_IPV4 => {
                if buf.len() < 7 {
                    return Err(truncated());
                }
                let mut ip = [0u8; 4];
                ip.copy_from_slice(&buf[1..5]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Ok((Address::Ipv4(ip, port), 7))
            }
            ATYP_DOMAIN => {
                let len = *buf.get(1).ok_or_else(truncated)? as usize;
                if buf.len() < 2 + len + 2 {
                    return Err(truncated());
                }
                let domain = String::from_utf8(buf[2..2 + len].to_vec())
                    .map_err(|_| ProxyError::MalformedRequest("non-UTF-8 domain".into()))?;
                let port = u16::from_be_bytes([buf[2 + len], buf[3 + len]]);
                Ok((Address::Domain(domain, port), 2 + len + 2))
            }
            ATYP_IPV6 => {
                if buf.len() < 19 {
                    return Err(truncated());
                }
                let mut ip = [0u8; 16];
                ip.copy_from_slice(&buf[1..17]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                Ok((Address::Ipv6(ip, port), 19))
            }
            other => Err(ProxyError::UnsupportedAddressType(other)),
        }
    }

    /// Append the `ATYP DSTADDR DSTPORT` encoding to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Address::Ipv4(ip, port) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(ip);
                buf.extend_from_slice(&port.to_be_bytes());
            }
            Address::Ipv6(ip, port) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(ip);
                buf.extend_from_slice(&port.to_be_bytes());
            }
            Address::Domain(domain, port) => {
                buf.push(ATYP_DOMAIN);
                buf.push(domain.len().min(255) as u8);
                buf.extend_from_slice(&domain.as_bytes()[..domain.len().min(255)]);
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }
    }

    /// The `host:port` form handed to the tunnel dialer.
    pub fn to_target(&self) -> String {
        match self {
            Address::Ipv4(ip, port) => {
                format!("{}.{}.{}.{}:{}", ip[0], ip[1], ip[2], ip[3], port)
            }
            Address::Ipv6(ip, port) => {
                format!("[{}]:{}", std::net::Ipv6Addr::from(*ip), port)
            }
            Address::Domain(domain, port) => format!("{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr.ip() {
            IpAddr::V4(ip) => Address::Ipv4(ip.octets(), addr.port()),
            IpAddr::V6(ip) => Address::Ipv6(ip.octets(), addr.port()),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_target())
    }
}

fn truncated() -> ProxyError {
    ProxyError::MalformedRequest("truncated address".into())
}
