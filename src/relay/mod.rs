//! Scratch buffers and the bidirectional byte pump
//!
//! The pool is the only shared mutable state on the hot path. The joiner is
//! a pure conduit: bytes are never reordered, coalesced across directions,
//! or injected; the first EOF or error in either direction ends the session
//! and both streams are closed.

use crate::Duplex;
use std::io;
use std::sync::Mutex;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Scratch buffer size handed out by the pool.
pub const DEFAULT_BUF_SIZE: usize = 32 * 1024;

/// Fixed-size scratch buffers for copy loops, safe under concurrent
/// get/put.
pub struct BytesPool {
    buf_size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BytesPool {
    pub fn new(buf_size: usize) -> Self {
        Self {
            buf_size,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self) -> Vec<u8> {
        let reused = self.free.lock().ok().and_then(|mut free| free.pop());
        reused.unwrap_or_else(|| vec![0u8; self.buf_size])
    }

    pub fn put(&self, buf: Vec<u8>) {
        if buf.len() != self.buf_size {
            return;
        }
        if let Ok(mut free) = self.free.lock() {
            free.push(buf);
        }
    }

    /// Number of buffers currently parked in the pool.
    pub fn available(&self) -> usize {
        self.free.lock().map(|free| free.len()).unwrap_or(0)
    }
}

impl Default for BytesPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUF_SIZE)
    }
}

/// Copy bytes in both directions between `a` and `b` until either
/// direction sees EOF or an error, then close both ends.
///
/// Clean terminations (EOF, peer reset after we are done with the stream)
/// yield `Ok`; the first substantive error is returned.
pub async fn join_streams<A, B>(a: A, b: B, pool: &BytesPool) -> io::Result<()>
where
    A: Duplex,
    B: Duplex,
{
    let mut buf1 = pool.get();
    let mut buf2 = pool.get();

    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    // Whichever direction finishes first ends the session; the remaining
    // half-open direction is torn down below.
    let result = tokio::select! {
        r = copy_half(&mut a_read, &mut b_write, &mut buf1) => r,
        r = copy_half(&mut b_read, &mut a_write, &mut buf2) => r,
    };

    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;

    pool.put(buf1);
    pool.put(buf2);

    match result {
        Err(e) if !is_clean_close(&e) => Err(e),
        Err(e) => {
            debug!("join ended by peer close: {e}");
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}

async fn copy_half<R, W>(r: &mut R, w: &mut W, buf: &mut [u8]) -> io::Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let n = r.read(buf).await?;
        if n == 0 {
            break;
        }
        w.write_all(&buf[..n]).await?;
        // Flushing per chunk keeps layered transforms (cipher, deflate)
        // from sitting on interactive traffic.
        w.flush().await?;
    }
    w.shutdown().await?;
    Ok(())
}

/// Errors that just mean "the other side is gone".
fn is_clean_close(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_pool_reuses_buffers() {
        let pool = BytesPool::new(64);
        assert_eq!(pool.available(), 0);

        let buf = pool.get();
        assert_eq!(buf.len(), 64);
        pool.put(buf);
        assert_eq!(pool.available(), 1);

        let _ = pool.get();
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_pool_rejects_foreign_buffers() {
        let pool = BytesPool::new(64);
        pool.put(vec![0u8; 16]);
        assert_eq!(pool.available(), 0);
    }

    #[tokio::test]
    async fn test_join_relays_both_directions() {
        let pool = std::sync::Arc::new(BytesPool::default());
        let (client_near, client_far) = tokio::io::duplex(1024);
        let (origin_near, origin_far) = tokio::io::duplex(1024);

        let join_pool = pool.clone();
        let join = tokio::spawn(async move {
            join_streams(client_far, origin_near, &join_pool).await
        });

        let (mut client, mut origin) = (client_near, origin_far);
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        origin.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        origin.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(client);
        join.await.unwrap().unwrap();
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_join_returns_after_single_close() {
        let pool = std::sync::Arc::new(BytesPool::default());
        let (client_near, client_far) = tokio::io::duplex(1024);
        let (origin_near, _origin_far) = tokio::io::duplex(1024);

        let join_pool = pool.clone();
        let join = tokio::spawn(async move {
            join_streams(client_far, origin_near, &join_pool).await
        });

        drop(client_near);
        let result = tokio::time::timeout(std::time::Duration::from_secs(1), join)
            .await
            .expect("join did not return after close");
        result.unwrap().unwrap();
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_join_releases_buffers_to_pool() {
        let pool = BytesPool::default();
        let (_client_near, client_far) = tokio::io::duplex(64);
        let (origin_near, _origin_far) = tokio::io::duplex(64);
        drop(_client_near);
        drop(_origin_far);
        join_streams(client_far, origin_near, &pool).await.unwrap();
        assert_eq!(pool.available(), 2);
    }
}
