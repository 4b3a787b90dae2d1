//! SOCKS5 server (RFC 1928) on an already-classified connection
//!
//! Method negotiation offers user/password when users are configured and
//! no-auth otherwise. CONNECT dials through the tunnel, BIND accepts one
//! inbound connection on a local listener, ASSOCIATE relays UDP datagrams
//! until the TCP control channel goes away.

use super::{Address, ProxyError};
use crate::demux::PeekableStream;
use crate::relay::{join_streams, BytesPool};
use crate::tunnel::{Dialer, TunnelError};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tracing::{debug, warn};

/// SOCKS5 version
const SOCKS_VERSION: u8 = 0x05;

const USER_AUTH_VERSION: u8 = 0x01;
const AUTH_SUCCESS: u8 = 0x00;
const AUTH_FAILURE: u8 = 0x01;

/// Largest UDP datagram the ASSOCIATE relay will carry.
const MAX_UDP_PACKET: usize = 64 * 1024;

/// Authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthMethod {
    NoAuth = 0x00,
    UsernamePassword = 0x02,
    NoAcceptable = 0xFF,
}

/// SOCKS5 commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl TryFrom<u8> for Command {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Bind),
            0x03 => Ok(Command::UdpAssociate),
            _ => Err(ProxyError::UnsupportedCommand(value)),
        }
    }
}

/// Reply codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// SOCKS5 proxy server
pub struct Socks5Server {
    dialer: Arc<dyn Dialer>,
    /// Optional username → password table
    users: Option<HashMap<String, String>>,
    pool: Arc<BytesPool>,
}

impl Socks5Server {
    pub fn new(
        dialer: Arc<dyn Dialer>,
        users: Option<HashMap<String, String>>,
        pool: Arc<BytesPool>,
    ) -> Self {
        Self {
            dialer,
            users,
            pool,
        }
    }

    /// Serve one SOCKS5 session on `conn`.
    pub async fn serve_conn(&self, mut conn: PeekableStream) -> Result<(), ProxyError> {
        self.negotiate(&mut conn).await?;

        let mut header = [0u8; 4];
        conn.read_exact(&mut header).await?;
        if header[0] != SOCKS_VERSION {
            return Err(ProxyError::InvalidSocksVersion(header[0]));
        }

        let dest = match Address::read_from(&mut conn, header[3]).await {
            Ok(dest) => dest,
            Err(ProxyError::UnsupportedAddressType(atyp)) => {
                send_reply(&mut conn, Reply::AddressTypeNotSupported, None).await?;
                return Err(ProxyError::UnsupportedAddressType(atyp));
            }
            Err(e) => return Err(e),
        };

        match Command::try_from(header[1]) {
            Ok(Command::Connect) => self.handle_connect(conn, dest).await,
            Ok(Command::Bind) => self.handle_bind(conn, dest).await,
            Ok(Command::UdpAssociate) => self.handle_associate(conn, dest).await,
            Err(e) => {
                send_reply(&mut conn, Reply::CommandNotSupported, None).await?;
                Err(e)
            }
        }
    }

    /// Method negotiation plus the user/password subnegotiation when
    /// credentials are required.
    async fn negotiate(&self, conn: &mut PeekableStream) -> Result<(), ProxyError> {
        let mut greeting = [0u8; 2];
        conn.read_exact(&mut greeting).await?;
        if greeting[0] != SOCKS_VERSION {
            return Err(ProxyError::InvalidSocksVersion(greeting[0]));
        }
        let mut methods = vec![0u8; greeting[1] as usize];
        conn.read_exact(&mut methods).await?;

        match &self.users {
            Some(users) => {
                if !methods.contains(&(AuthMethod::UsernamePassword as u8)) {
                    conn.write_all(&[SOCKS_VERSION, AuthMethod::NoAcceptable as u8])
                        .await?;
                    conn.flush().await?;
                    return Err(ProxyError::AuthenticationFailed);
                }
                conn.write_all(&[SOCKS_VERSION, AuthMethod::UsernamePassword as u8])
                    .await?;
                conn.flush().await?;

                let mut head = [0u8; 2];
                conn.read_exact(&mut head).await?;
                if head[0] != USER_AUTH_VERSION {
                    return Err(ProxyError::MalformedRequest(format!(
                        "bad auth version {}",
                        head[0]
                    )));
                }
                let mut username = vec![0u8; head[1] as usize];
                conn.read_exact(&mut username).await?;
                let mut len = [0u8; 1];
                conn.read_exact(&mut len).await?;
                let mut password = vec![0u8; len[0] as usize];
                conn.read_exact(&mut password).await?;

                let username = String::from_utf8_lossy(&username).to_string();
                let password = String::from_utf8_lossy(&password).to_string();
                let ok = users.get(&username).map(String::as_str) == Some(password.as_str());

                let status = if ok { AUTH_SUCCESS } else { AUTH_FAILURE };
                conn.write_all(&[USER_AUTH_VERSION, status]).await?;
                conn.flush().await?;
                if !ok {
                    return Err(ProxyError::AuthenticationFailed);
                }
                Ok(())
            }
            None => {
                if !methods.contains(&(AuthMethod::NoAuth as u8)) {
                    conn.write_all(&[SOCKS_VERSION, AuthMethod::NoAcceptable as u8])
                        .await?;
                    conn.flush().await?;
                    return Err(ProxyError::AuthenticationFailed);
                }
                conn.write_all(&[SOCKS_VERSION, AuthMethod::NoAuth as u8])
                    .await?;
                conn.flush().await?;
                Ok(())
            }
        }
    }

    async fn handle_connect(
        &self,
        mut conn: PeekableStream,
        dest: Address,
    ) -> Result<(), ProxyError> {
        let target = dest.to_target();
        debug!("socks5 CONNECT to {target}");

        let tunnel = match self.dialer.dial(&target).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                warn!("dial {target} failed: {e}");
                send_reply(&mut conn, error_reply(&e), None).await?;
                return Err(e.into());
            }
        };

        // The bound address is the local endpoint of the dialed transport;
        // 0.0.0.0 with the real port is what clients get.
        let port = tunnel.local_addr().map(|a| a.port()).unwrap_or(0);
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        send_reply(&mut conn, Reply::Succeeded, Some(bind)).await?;

        join_streams(conn, tunnel, &self.pool).await?;
        Ok(())
    }

    async fn handle_bind(&self, mut conn: PeekableStream, dest: Address) -> Result<(), ProxyError> {
        let target = dest.to_target();
        debug!("socks5 BIND on {target}");

        let listener = match TcpListener::bind(&target).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("bind {target} failed: {e}");
                send_reply(&mut conn, io_error_reply(&e), None).await?;
                return Err(e.into());
            }
        };

        send_reply(&mut conn, Reply::Succeeded, listener.local_addr().ok()).await?;

        let (inbound, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                send_reply(&mut conn, io_error_reply(&e), None).await?;
                return Err(e.into());
            }
        };
        drop(listener);

        send_reply(&mut conn, Reply::Succeeded, Some(peer)).await?;

        join_streams(conn, inbound, &self.pool).await?;
        Ok(())
    }

    /// UDP ASSOCIATE: the first datagram pins the client as packet source,
    /// its SOCKS header names the target; everything after is relayed
    /// header-stripped one way and header-prefixed the other. The session
    /// ends when the TCP control channel stops reading.
    async fn handle_associate(
        &self,
        mut conn: PeekableStream,
        dest: Address,
    ) -> Result<(), ProxyError> {
        let requested = dest.to_target();
        debug!("socks5 ASSOCIATE for {requested}");

        let udp = match UdpSocket::bind(&requested).await {
            Ok(udp) => udp,
            Err(e) => {
                warn!("udp bind {requested} failed: {e}");
                send_reply(&mut conn, io_error_reply(&e), None).await?;
                return Err(e.into());
            }
        };
        let udp_local = udp.local_addr()?;

        // Packet-forward address: TCP-local IP paired with the UDP-local
        // port, so clients behind NAT can find the packet relay.
        let forward_ip = conn
            .local_addr()
            .map(|a| a.ip())
            .unwrap_or_else(|| udp_local.ip());
        send_reply(
            &mut conn,
            Reply::Succeeded,
            Some(SocketAddr::new(forward_ip, udp_local.port())),
        )
        .await?;

        // The control channel's only remaining job is liveness: any read
        // termination, including half-close, ends the association.
        let (mut control_read, _control_write) = tokio::io::split(conn);
        let mut probe = tokio::spawn(async move {
            let mut byte = [0u8; 1];
            loop {
                match control_read.read(&mut byte).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        let result = tokio::select! {
            _ = &mut probe => {
                debug!("associate control channel closed");
                Ok(())
            }
            r = self.relay_packets(&udp) => r,
        };
        probe.abort();
        result
    }

    async fn relay_packets(&self, udp: &UdpSocket) -> Result<(), ProxyError> {
        let mut buf = vec![0u8; MAX_UDP_PACKET];
        let mut source: Option<SocketAddr> = None;
        let mut target: Option<SocketAddr> = None;
        let mut reply_prefix: Option<Vec<u8>> = None;

        loop {
            let (n, from) = udp.recv_from(&mut buf).await?;

            let source_addr = *source.get_or_insert(from);
            if from == source_addr {
                if n < 4 {
                    continue;
                }
                // RSV(2) FRAG(1); fragments are not supported.
                if buf[2] != 0 {
                    debug!("dropping fragmented datagram from {from}");
                    continue;
                }
                let (dest, consumed) = match Address::decode(&buf[3..n]) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        debug!("bad udp header from {from}: {e}");
                        continue;
                    }
                };
                let dest_addr = match resolve_udp_addr(&dest) {
                    Some(addr) => addr,
                    None => {
                        debug!("unresolvable udp target {dest}");
                        continue;
                    }
                };
                let target_addr = *target.get_or_insert(dest_addr);
                if dest_addr != target_addr {
                    debug!("ignoring datagram for non-target address {dest_addr}");
                    continue;
                }
                udp.send_to(&buf[3 + consumed..n], target_addr).await?;
            } else if target == Some(from) {
                let prefix = reply_prefix.get_or_insert_with(|| {
                    let mut prefix = vec![0u8, 0, 0];
                    Address::from(from).encode_into(&mut prefix);
                    prefix
                });
                let mut packet = Vec::with_capacity(prefix.len() + n);
                packet.extend_from_slice(prefix);
                packet.extend_from_slice(&buf[..n]);
                udp.send_to(&packet, source_addr).await?;
            }
        }
    }
}

/// The UDP relay needs a socket address; domain targets only work when
/// they parse as IP literals.
fn resolve_udp_addr(addr: &Address) -> Option<SocketAddr> {
    match addr {
        Address::Ipv4(ip, port) => Some(SocketAddr::new(IpAddr::V4((*ip).into()), *port)),
        Address::Ipv6(ip, port) => Some(SocketAddr::new(IpAddr::V6((*ip).into()), *port)),
        Address::Domain(domain, port) => domain
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, *port)),
    }
}

async fn send_reply<W>(
    w: &mut W,
    reply: Reply,
    bind: Option<SocketAddr>,
) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = vec![SOCKS_VERSION, reply as u8, 0x00];
    let bind = bind.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
    Address::from(bind).encode_into(&mut frame);
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}

/// Map a failed origin dial onto the closest SOCKS reply code.
fn error_reply(e: &TunnelError) -> Reply {
    match e {
        TunnelError::Io(io) => io_error_reply(io),
        TunnelError::HandshakeTimeout => Reply::HostUnreachable,
        _ => Reply::GeneralFailure,
    }
}

fn io_error_reply(e: &std::io::Error) -> Reply {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::NetworkUnreachable => Reply::NetworkUnreachable,
        ErrorKind::HostUnreachable => Reply::HostUnreachable,
        ErrorKind::ConnectionRefused => Reply::ConnectionRefused,
        _ => Reply::GeneralFailure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::TunnelStream;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::io::AsyncReadExt;

    struct StubDialer {
        targets: Mutex<Vec<String>>,
        origin_ends: Mutex<Vec<tokio::io::DuplexStream>>,
        fail_with: Option<std::io::ErrorKind>,
    }

    impl StubDialer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                targets: Mutex::new(Vec::new()),
                origin_ends: Mutex::new(Vec::new()),
                fail_with: None,
            })
        }

        fn failing(kind: std::io::ErrorKind) -> Arc<Self> {
            Arc::new(Self {
                targets: Mutex::new(Vec::new()),
                origin_ends: Mutex::new(Vec::new()),
                fail_with: Some(kind),
            })
        }
    }

    #[async_trait]
    impl Dialer for StubDialer {
        async fn dial(&self, target: &str) -> Result<TunnelStream, TunnelError> {
            self.targets.lock().unwrap().push(target.to_string());
            if let Some(kind) = self.fail_with {
                return Err(TunnelError::Io(kind.into()));
            }
            let (near, far) = tokio::io::duplex(8 * 1024);
            self.origin_ends.lock().unwrap().push(far);
            Ok(TunnelStream::new(
                Box::new(near),
                Some("127.0.0.1:45000".parse().unwrap()),
            ))
        }
    }

    fn peekable(io: tokio::io::DuplexStream) -> PeekableStream {
        PeekableStream::new(Box::new(io), Vec::new())
    }

    fn server(dialer: Arc<StubDialer>, users: Option<HashMap<String, String>>) -> Socks5Server {
        Socks5Server::new(dialer, users, Arc::new(BytesPool::default()))
    }

    #[tokio::test]
    async fn test_connect_flow() {
        let dialer = StubDialer::new();
        let srv = server(dialer.clone(), None);
        let (mut client, conn) = tokio::io::duplex(8 * 1024);

        let serve = tokio::spawn(async move { srv.serve_conn(peekable(conn)).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut greeting = [0u8; 2];
        client.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [0x05, 0x00]);

        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);
        assert_eq!(&reply[4..8], &[0, 0, 0, 0]);
        assert_eq!(u16::from_be_bytes([reply[8], reply[9]]), 45000);
        assert_eq!(
            dialer.targets.lock().unwrap().as_slice(),
            ["127.0.0.1:80".to_string()]
        );

        // Bytes flow end to end after the reply.
        let mut origin = dialer.origin_ends.lock().unwrap().remove(0);
        client.write_all(b"payload").await.unwrap();
        let mut seen = [0u8; 7];
        origin.read_exact(&mut seen).await.unwrap();
        assert_eq!(&seen, b"payload");

        drop(client);
        drop(origin);
        serve.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_refused_dial_maps_to_reply_code() {
        let dialer = StubDialer::failing(std::io::ErrorKind::ConnectionRefused);
        let srv = server(dialer, None);
        let (mut client, conn) = tokio::io::duplex(8 * 1024);

        let serve = tokio::spawn(async move { srv.serve_conn(peekable(conn)).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut greeting = [0u8; 2];
        client.read_exact(&mut greeting).await.unwrap();

        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], Reply::ConnectionRefused as u8);
        assert!(serve.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_user_password_negotiation() {
        let dialer = StubDialer::new();
        let mut users = HashMap::new();
        users.insert("alice".to_string(), "wonder".to_string());
        let srv = server(dialer.clone(), Some(users));
        let (mut client, conn) = tokio::io::duplex(8 * 1024);

        let serve = tokio::spawn(async move { srv.serve_conn(peekable(conn)).await });

        client.write_all(&[0x05, 0x02, 0x00, 0x02]).await.unwrap();
        let mut greeting = [0u8; 2];
        client.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [0x05, 0x02]);

        let mut auth = vec![0x01, 5];
        auth.extend_from_slice(b"alice");
        auth.push(6);
        auth.extend_from_slice(b"wonder");
        client.write_all(&auth).await.unwrap();

        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status, [0x01, 0x00]);

        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x00);

        drop(client);
        serve.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_no_acceptable_method() {
        let dialer = StubDialer::new();
        let mut users = HashMap::new();
        users.insert("alice".to_string(), "wonder".to_string());
        let srv = server(dialer, Some(users));
        let (mut client, conn) = tokio::io::duplex(8 * 1024);

        let serve = tokio::spawn(async move { srv.serve_conn(peekable(conn)).await });

        // Client only offers no-auth, but credentials are required.
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut greeting = [0u8; 2];
        client.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [0x05, 0xFF]);
        assert!(matches!(
            serve.await.unwrap(),
            Err(ProxyError::AuthenticationFailed)
        ));
    }

    #[tokio::test]
    async fn test_unknown_address_type() {
        let dialer = StubDialer::new();
        let srv = server(dialer, None);
        let (mut client, conn) = tokio::io::duplex(8 * 1024);

        let serve = tokio::spawn(async move { srv.serve_conn(peekable(conn)).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut greeting = [0u8; 2];
        client.read_exact(&mut greeting).await.unwrap();

        client
            .write_all(&[0x05, 0x01, 0x00, 0x09, 1, 2, 3, 4, 0x00, 0x50])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], Reply::AddressTypeNotSupported as u8);
        assert!(matches!(
            serve.await.unwrap(),
            Err(ProxyError::UnsupportedAddressType(0x09))
        ));
    }
}
