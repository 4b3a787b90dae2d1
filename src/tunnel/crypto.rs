//! Transparent AES-128-CFB layer over a duplex stream
//!
//! Wire shape, per direction: a random 16-byte IV written by the sender,
//! then the CFB byte stream. The IV rides along with the first encrypted
//! write; the reader consumes the peer IV before the first plaintext byte.
//! The key is a single MD5 block over the pre-shared secret.

use aes::Aes128;
use bytes::{Buf, BytesMut};
use cfb_mode::cipher::KeyIvInit;
use cfb_mode::{BufDecryptor, BufEncryptor};
use md5::{Digest, Md5};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

type Enc = BufEncryptor<Aes128>;
type Dec = BufDecryptor<Aes128>;

pub const IV_LEN: usize = 16;

/// Ciphertext buffered ahead of the underlying stream before writes are
/// pushed back on the caller.
const MAX_BUFFERED: usize = 64 * 1024;

fn derive_key(secret_key: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(secret_key);
    hasher.finalize().into()
}

/// AES-128-CFB over `S`. Byte-transparent: no framing, no length change.
pub struct CipherStream<S> {
    inner: S,
    key: [u8; 16],
    enc: Enc,
    dec: Option<Dec>,
    /// Pending ciphertext, seeded with our IV.
    out: BytesMut,
    iv_buf: [u8; IV_LEN],
    iv_fill: usize,
}

impl<S> CipherStream<S> {
    pub fn new(inner: S, secret_key: &[u8]) -> Self {
        let key = derive_key(secret_key);
        let iv: [u8; IV_LEN] = rand::random();
        let enc = Enc::new(&key.into(), &iv.into());
        let mut out = BytesMut::with_capacity(4 * 1024);
        out.extend_from_slice(&iv);
        Self {
            inner,
            key,
            enc,
            dec: None,
            out,
            iv_buf: [0u8; IV_LEN],
            iv_fill: 0,
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> CipherStream<S> {
    /// Push pending ciphertext down to the inner stream. Returns `Pending`
    /// only when nothing could be written.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.out.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.out))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.out.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for CipherStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.dec.is_none() {
            while this.iv_fill < IV_LEN {
                let mut iv_read = ReadBuf::new(&mut this.iv_buf[this.iv_fill..]);
                ready!(Pin::new(&mut this.inner).poll_read(cx, &mut iv_read))?;
                let n = iv_read.filled().len();
                if n == 0 {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream closed before the peer IV arrived",
                    )));
                }
                this.iv_fill += n;
            }
            this.dec = Some(Dec::new(&this.key.into(), &this.iv_buf.into()));
        }

        let pre = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        if let Some(dec) = this.dec.as_mut() {
            dec.decrypt(&mut buf.filled_mut()[pre..]);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for CipherStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;

        // Make room first; only report Pending once the backlog is full.
        while !this.out.is_empty() {
            match Pin::new(&mut this.inner).poll_write(cx, &this.out) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()))
                }
                Poll::Ready(Ok(n)) => this.out.advance(n),
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => {
                    if this.out.len() >= MAX_BUFFERED {
                        return Poll::Pending;
                    }
                    break;
                }
            }
        }

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let take = buf.len().min(MAX_BUFFERED - this.out.len());
        let start = this.out.len();
        this.out.extend_from_slice(&buf[..take]);
        this.enc.encrypt(&mut this.out[start..]);
        Poll::Ready(Ok(take))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
