//! Deflate layer over a duplex stream, with pooled codec state
//!
//! Compression state is expensive to set up, so streams borrow a codec
//! pair from a [`CodecPool`] on dial and return it (reset) when dropped.
//! Flushing emits a deflate sync block so the peer sees everything written
//! so far; the joiner flushes after every chunk, which keeps interactive
//! traffic moving.

use bytes::{Buf, BytesMut};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const SCRATCH_SIZE: usize = 8 * 1024;
const MAX_BUFFERED: usize = 64 * 1024;

/// One compressor + one decompressor, bound to a single tunnel stream at a
/// time.
pub struct DeflateCodec {
    enc: Compress,
    dec: Decompress,
}

impl DeflateCodec {
    fn new() -> Self {
        Self {
            enc: Compress::new(Compression::default(), true),
            dec: Decompress::new(true),
        }
    }

    fn reset(&mut self) {
        self.enc.reset();
        self.dec.reset(true);
    }
}

/// Shared pool of codec state; acquire on dial, release on close.
pub struct CodecPool {
    free: Mutex<Vec<DeflateCodec>>,
}

impl CodecPool {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    fn get(&self) -> DeflateCodec {
        let reused = self.free.lock().ok().and_then(|mut free| free.pop());
        reused.unwrap_or_else(DeflateCodec::new)
    }

    fn put(&self, mut codec: DeflateCodec) {
        codec.reset();
        if let Ok(mut free) = self.free.lock() {
            free.push(codec);
        }
    }

    /// Number of codecs currently parked in the pool.
    pub fn available(&self) -> usize {
        self.free.lock().map(|free| free.len()).unwrap_or(0)
    }
}

impl Default for CodecPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Deflate over `S`. The codec returns to its pool exactly once, when the
/// stream drops.
pub struct CompressedStream<S> {
    inner: S,
    codec: Option<DeflateCodec>,
    pool: Arc<CodecPool>,
    /// Compressed bytes not yet written to `inner`.
    out: BytesMut,
    /// Raw bytes read from `inner`, not yet decompressed.
    in_buf: BytesMut,
    in_eof: bool,
    /// Data written since the last sync flush.
    needs_sync: bool,
}

impl<S> CompressedStream<S> {
    pub fn new(inner: S, pool: Arc<CodecPool>) -> Self {
        let codec = pool.get();
        Self {
            inner,
            codec: Some(codec),
            pool,
            out: BytesMut::with_capacity(4 * 1024),
            in_buf: BytesMut::with_capacity(4 * 1024),
            in_eof: false,
            needs_sync: false,
        }
    }
}

impl<S> Drop for CompressedStream<S> {
    fn drop(&mut self) {
        if let Some(codec) = self.codec.take() {
            self.pool.put(codec);
        }
    }
}

fn stream_error(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

/// Run `input` through the compressor, appending output to `out`. Loops
/// until the input is consumed and, for flushing modes, until the
/// compressor has nothing more to emit.
fn compress_into(
    enc: &mut Compress,
    mut input: &[u8],
    out: &mut BytesMut,
    flush: FlushCompress,
) -> io::Result<()> {
    let mut scratch = [0u8; SCRATCH_SIZE];
    loop {
        let before_in = enc.total_in();
        let before_out = enc.total_out();
        let status = enc
            .compress(input, &mut scratch, flush)
            .map_err(stream_error)?;
        let consumed = (enc.total_in() - before_in) as usize;
        let produced = (enc.total_out() - before_out) as usize;
        out.extend_from_slice(&scratch[..produced]);
        input = &input[consumed..];

        match status {
            Status::StreamEnd => return Ok(()),
            Status::Ok | Status::BufError => {
                if input.is_empty() && produced == 0 {
                    return Ok(());
                }
                if consumed == 0 && produced == 0 && !input.is_empty() {
                    return Err(stream_error("deflate made no progress"));
                }
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> CompressedStream<S> {
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

    fn sync_pending(&mut self) -> io::Result<()> {
        if !self.needs_sync {
            return Ok(());
        }
        let codec = self
            .codec
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))?;
        compress_into(&mut codec.enc, &[], &mut self.out, FlushCompress::Sync)?;
        self.needs_sync = false;
        Ok(())
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for CompressedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        loop {
            if !this.in_buf.is_empty() {
                let dec = match this.codec.as_mut() {
                    Some(codec) => &mut codec.dec,
                    None => return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
                };
                let before_in = dec.total_in();
                let before_out = dec.total_out();
                let dst = buf.initialize_unfilled();
                let status = dec
                    .decompress(&this.in_buf, dst, FlushDecompress::None)
                    .map_err(stream_error)?;
                let consumed = (dec.total_in() - before_in) as usize;
                let produced = (dec.total_out() - before_out) as usize;
                this.in_buf.advance(consumed);
                buf.advance(produced);

                if produced > 0 || status == Status::StreamEnd {
                    return Poll::Ready(Ok(()));
                }
                if this.in_eof && consumed == 0 {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "deflate stream cut off mid-block",
                    )));
                }
            } else if this.in_eof {
                return Poll::Ready(Ok(()));
            }

            let mut scratch = [0u8; SCRATCH_SIZE];
            let mut raw = ReadBuf::new(&mut scratch);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut raw))?;
            let filled = raw.filled();
            if filled.is_empty() {
                this.in_eof = true;
            } else {
                this.in_buf.extend_from_slice(filled);
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for CompressedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;

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
        let take = buf.len().min(SCRATCH_SIZE);
        let codec = match this.codec.as_mut() {
            Some(codec) => codec,
            None => return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        };
        compress_into(&mut codec.enc, &buf[..take], &mut this.out, FlushCompress::None)?;
        this.needs_sync = true;
        Poll::Ready(Ok(take))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        this.sync_pending()?;
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        this.sync_pending()?;
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
