//! # STCP Visitor
//!
//! The visitor half of a secret-TCP relay: a local endpoint that accepts
//! application connections in several wire formats and relays each of them
//! through a rendezvous server to a registered origin service.
//!
//! ## Session flow
//!
//! ```text
//! client ──► listener ──► peekable stream ──► demux (http|socks4|socks5|target)
//!        ──► protocol handler ──► origin address
//!        ──► tunnel dialer ──► [cipher?] ──► [compression?] ──► duplex stream
//!        ──► bidirectional join ──► close both
//! ```
//!
//! Every accepted connection is classified by its first bytes, parsed by the
//! matching protocol server, and joined to a freshly dialed tunnel stream.
//! The tunnel handshake (`NewVisitorConn` / `NewVisitorConnResp`) is signed
//! with the pre-shared secret; the resulting stream optionally carries an
//! AES-128-CFB cipher layer and a deflate layer on top.

pub mod config;
pub mod demux;
pub mod msg;
pub mod proxy;
pub mod relay;
pub mod trie;
pub mod tunnel;
pub mod visitor;

pub use config::{Config, VisitorConfig};
pub use visitor::{Visitor, VisitorHandle};

use tokio::io::{AsyncRead, AsyncWrite};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// A byte stream the visitor can own, pump, and close.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> Duplex for T {}

/// An owned duplex byte stream.
pub type BoxedStream = Box<dyn Duplex>;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Demux error: {0}")]
    Demux(#[from] demux::DemuxError),

    #[error("Codec error: {0}")]
    Msg(#[from] msg::MsgError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Configuration error: {0}")]
    Config(String),
}
