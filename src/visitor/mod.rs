//! Visitor listener loop and session dispatch
//!
//! Two accept loops run side by side: a TCP listener on the configured
//! bind address (only when `bind_port > 0`) and an in-process listener
//! other components hand already-accepted streams to. Every stream is
//! classified, parsed by its protocol server, and relayed through the
//! tunnel. A failing session never takes a loop down; the loops stop only
//! when the handle is closed.

use crate::config::VisitorConfig;
use crate::demux::{demux, Protocol};
use crate::proxy::{HttpProxyServer, ProxyError, Socks4Server, Socks5Server};
use crate::relay::{join_streams, BytesPool};
use crate::tunnel::{CodecPool, ControlHandle, Dialer, TunnelDialer};
use crate::{BoxedStream, Error};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Longest accepted `TARGET <host:port>;` head.
const MAX_TARGET_HEAD: usize = 2048;

/// The STCP visitor: accepts client connections and relays each one
/// through the rendezvous server to the nominated origin.
pub struct Visitor {
    cfg: VisitorConfig,
    handle: Arc<dyn ControlHandle>,
}

/// Handle to a running visitor: feeds the in-process listener and stops
/// the accept loops.
pub struct VisitorHandle {
    internal_tx: mpsc::Sender<BoxedStream>,
    shutdown_tx: watch::Sender<bool>,
    bind_addr: Option<SocketAddr>,
}

impl VisitorHandle {
    /// Hand an already-accepted stream to the visitor, as if it had
    /// arrived on the external listener.
    pub async fn transfer(&self, conn: BoxedStream) -> crate::Result<()> {
        self.internal_tx
            .send(conn)
            .await
            .map_err(|_| Error::Config("visitor is closed".into()))
    }

    /// Address of the external listener, when one is bound.
    pub fn bind_addr(&self) -> Option<SocketAddr> {
        self.bind_addr
    }

    /// Stop both accept loops. In-flight sessions run to completion.
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

struct SessionContext {
    http: HttpProxyServer,
    socks4: Socks4Server,
    socks5: Socks5Server,
    dialer: Arc<dyn Dialer>,
    pool: Arc<BytesPool>,
}

impl Visitor {
    pub fn new(cfg: VisitorConfig, handle: Arc<dyn ControlHandle>) -> crate::Result<Self> {
        cfg.validate()?;
        Ok(Self { cfg, handle })
    }

    /// Bind the listeners and spawn the accept loops.
    pub async fn run(self) -> crate::Result<VisitorHandle> {
        let pool = Arc::new(BytesPool::default());
        let codecs = Arc::new(CodecPool::new());
        let dialer: Arc<dyn Dialer> = Arc::new(TunnelDialer::new(
            &self.cfg,
            self.handle.clone(),
            codecs,
        ));

        let users = (!self.cfg.users.is_empty()).then(|| self.cfg.users.clone());
        let socks4_auth = users.clone().map(|users| {
            let auth: crate::proxy::socks4::Authentication =
                Arc::new(move |_, userid: &str| users.contains_key(userid));
            auth
        });

        let ctx = Arc::new(SessionContext {
            http: HttpProxyServer::new(dialer.clone(), users.clone(), pool.clone()),
            socks4: Socks4Server::new(dialer.clone(), socks4_auth, pool.clone()),
            socks5: Socks5Server::new(dialer.clone(), users, pool.clone()),
            dialer,
            pool,
        });

        let (internal_tx, mut internal_rx) = mpsc::channel::<BoxedStream>(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut bind_addr = None;
        if self.cfg.bind_port > 0 {
            let listen = format!("{}:{}", self.cfg.bind_addr, self.cfg.bind_port);
            let listener = TcpListener::bind(&listen).await?;
            bind_addr = listener.local_addr().ok();
            debug!("visitor listening on {listen}");

            let ctx = ctx.clone();
            let mut shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        accepted = listener.accept() => {
                            let (stream, peer) = match accepted {
                                Ok(accepted) => accepted,
                                Err(e) => {
                                    warn!("visitor listener closed: {e}");
                                    break;
                                }
                            };
                            debug!("accepted visitor connection from {peer}");
                            let local = stream.local_addr().ok();
                            let ctx = ctx.clone();
                            tokio::spawn(async move {
                                handle_session(ctx, Box::new(stream), local).await;
                            });
                        }
                    }
                }
            });
        }

        // The internal listener always runs, even without an external bind.
        let ctx_internal = ctx;
        let mut shutdown = shutdown_rx;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    conn = internal_rx.recv() => {
                        let Some(conn) = conn else {
                            debug!("visitor internal listener closed");
                            break;
                        };
                        let ctx = ctx_internal.clone();
                        tokio::spawn(async move {
                            handle_session(ctx, conn, None).await;
                        });
                    }
                }
            }
        });

        Ok(VisitorHandle {
            internal_tx,
            shutdown_tx,
            bind_addr,
        })
    }
}

async fn handle_session(ctx: Arc<SessionContext>, conn: BoxedStream, local: Option<SocketAddr>) {
    let (protocol, mut conn) = match demux(conn).await {
        Ok(classified) => classified,
        Err(e) => {
            warn!("demux error: {e}");
            return;
        }
    };
    conn.set_local_addr(local);
    debug!("classified visitor connection as {}", protocol.as_str());

    match protocol {
        Protocol::Http => {
            if let Err(e) = ctx.http.serve_conn(conn).await {
                warn!("http session error: {e}");
            }
        }
        Protocol::Socks4 => {
            if let Err(e) = ctx.socks4.serve_conn(conn).await {
                warn!("socks4 session error: {e}");
            }
        }
        Protocol::Socks5 => {
            if let Err(e) = ctx.socks5.serve_conn(conn).await {
                warn!("socks5 session error: {e}");
            }
        }
        Protocol::Target => {
            let target = match parse_target_head(&mut conn).await {
                Ok(target) => target,
                Err(e) => {
                    warn!("bad target head: {e}");
                    return;
                }
            };
            let tunnel = match ctx.dialer.dial(&target).await {
                Ok(tunnel) => tunnel,
                Err(e) => {
                    warn!("dial {target} failed: {e}");
                    return;
                }
            };
            if let Err(e) = join_streams(conn, tunnel, &ctx.pool).await {
                warn!("session copy error: {e}");
            }
        }
    }
}

/// Consume the literal `TARGET <host:port>;` framing and return the
/// origin address.
pub async fn parse_target_head<R>(r: &mut R) -> crate::Result<String>
where
    R: AsyncRead + Unpin,
{
    let malformed = |reason: String| Error::Proxy(ProxyError::MalformedRequest(reason));

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        r.read_exact(&mut byte).await.map_err(Error::Io)?;
        head.push(byte[0]);
        if byte[0] == b';' {
            break;
        }
        if head.len() >= MAX_TARGET_HEAD {
            return Err(malformed(format!(
                "target head longer than {MAX_TARGET_HEAD} bytes"
            )));
        }
    }

    let head = String::from_utf8(head)
        .map_err(|_| malformed("target head is not UTF-8".into()))?;
    let target = head
        .strip_prefix("TARGET ")
        .and_then(|rest| rest.strip_suffix(';'))
        .ok_or_else(|| malformed(format!("bad head format {head:?}")))?;
    Ok(target.to_string())
}
