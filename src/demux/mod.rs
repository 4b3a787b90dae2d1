//! Connection classification
//!
//! A freshly accepted stream is classified by its first bytes against a
//! fixed prefix set, then handed on as a [`PeekableStream`] that re-serves
//! the classified bytes before falling through to the socket. The prefix
//! set is closed: anything else is a [`DemuxError::NoMatch`] and the
//! session is dropped.

use crate::trie::Trie;
use crate::BoxedStream;
use bytes::{Buf, Bytes};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::OnceLock;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Demux errors
#[derive(Debug, Error)]
pub enum DemuxError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("first bytes match no known protocol")]
    NoMatch,
}

/// Protocols the visitor accepts from clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Socks4,
    Socks5,
    Target,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Socks4 => "socks4",
            Protocol::Socks5 => "socks5",
            Protocol::Target => "target",
        }
    }
}

/// HTTP/1.1 method prefixes plus the HTTP/2 connection preface.
const HTTP_PREFIXES: &[&[u8]] = &[
    b"GET ",
    b"HEAD ",
    b"POST ",
    b"PUT ",
    b"PATCH ",
    b"DELETE ",
    b"CONNECT ",
    b"OPTIONS ",
    b"TRACE ",
    b"PRI * HTTP/2.0",
];

/// SOCKS5 greeting: version 5 with a method count of 1..=3.
const SOCKS5_PREFIXES: &[&[u8]] = &[&[0x05, 0x01], &[0x05, 0x02], &[0x05, 0x03]];

/// SOCKS4: version 4 with CONNECT or BIND.
const SOCKS4_PREFIXES: &[&[u8]] = &[&[0x04, 0x01], &[0x04, 0x02]];

const TARGET_PREFIX: &[u8] = b"TARGET ";

fn handler_trie() -> &'static Trie<Protocol> {
    static TRIE: OnceLock<Trie<Protocol>> = OnceLock::new();
    TRIE.get_or_init(|| {
        let mut trie = Trie::new();
        for prefix in HTTP_PREFIXES {
            trie.put(prefix, Protocol::Http);
        }
        for prefix in SOCKS5_PREFIXES {
            trie.put(prefix, Protocol::Socks5);
        }
        for prefix in SOCKS4_PREFIXES {
            trie.put(prefix, Protocol::Socks4);
        }
        trie.put(TARGET_PREFIX, Protocol::Target);
        trie
    })
}

/// Classify `conn` and return it with the classified bytes replayed.
pub async fn demux(mut conn: BoxedStream) -> Result<(Protocol, PeekableStream), DemuxError> {
    let (tag, consumed) = handler_trie().match_with_reader(&mut conn).await?;
    match tag {
        Some(protocol) => Ok((protocol, PeekableStream::new(conn, consumed))),
        None => Err(DemuxError::NoMatch),
    }
}

/// Wraps a stream so that bytes already pulled off the socket are served
/// again before reads fall through to the underlying stream. Once the
/// buffer drains the wrapper is a transparent view.
pub struct PeekableStream {
    inner: BoxedStream,
    buffer: Bytes,
    local_addr: Option<SocketAddr>,
}

impl PeekableStream {
    pub fn new(inner: BoxedStream, buffer: impl Into<Bytes>) -> Self {
        Self {
            inner,
            buffer: buffer.into(),
            local_addr: None,
        }
    }

    /// Record the local address of the accepting socket, when there is one.
    /// SOCKS5 ASSOCIATE replies use it as the packet-forward IP.
    pub fn set_local_addr(&mut self, addr: Option<SocketAddr>) {
        self.local_addr = addr;
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl AsyncRead for PeekableStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.buffer.is_empty() {
            let n = self.buffer.len().min(buf.remaining());
            buf.put_slice(&self.buffer[..n]);
            self.buffer.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PeekableStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
