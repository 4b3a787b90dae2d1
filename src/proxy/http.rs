//! HTTP proxy on an already-classified connection
//!
//! One request life-cycle per connection: CONNECT tunnels, an
//! absolute-form request is forwarded to its origin, anything without a
//! host gets a 404. Basic auth (realm "Proxy") guards both proxy modes
//! when users are configured.

use super::ProxyError;
use crate::demux::PeekableStream;
use crate::relay::{join_streams, BytesPool};
use crate::tunnel::Dialer;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

const MAX_HEADER_LINE: usize = 8 * 1024;
const MAX_HEADERS: usize = 100;

/// Parsed request head.
struct RequestHead {
    method: String,
    target: String,
    version: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// HTTP proxy server
pub struct HttpProxyServer {
    dialer: Arc<dyn Dialer>,
    /// Optional username → password table for Basic auth
    users: Option<HashMap<String, String>>,
    pool: Arc<BytesPool>,
}

impl HttpProxyServer {
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

    /// Serve one request on `conn`, dialing the origin through the tunnel.
    pub async fn serve_conn(&self, conn: PeekableStream) -> Result<(), ProxyError> {
        let mut reader = BufReader::new(conn);
        let head = read_request_head(&mut reader).await?;

        if !self.authenticate(&head) {
            let mut conn = reader.into_inner();
            conn.write_all(
                b"HTTP/1.1 407 Proxy Authentication Required\r\n\
                  Proxy-Authenticate: Basic realm=\"Proxy\"\r\n\r\n",
            )
            .await?;
            conn.flush().await?;
            return Err(ProxyError::AuthenticationFailed);
        }

        if head.method.eq_ignore_ascii_case("CONNECT") {
            self.serve_connect(reader, head).await
        } else if head.target.starts_with("http://") {
            self.serve_forward(reader, head).await
        } else {
            debug!("non-proxy request for {}", head.target);
            let mut conn = reader.into_inner();
            conn.write_all(b"HTTP/1.1 404 Not Found\r\n\r\n").await?;
            conn.flush().await?;
            Ok(())
        }
    }

    fn authenticate(&self, head: &RequestHead) -> bool {
        let Some(users) = &self.users else {
            return true;
        };
        let Some(value) = head.get("proxy-authorization") else {
            return false;
        };
        let Some(encoded) = value.strip_prefix("Basic ") else {
            return false;
        };
        let Ok(decoded) = BASE64.decode(encoded.trim()) else {
            return false;
        };
        let Ok(credentials) = String::from_utf8(decoded) else {
            return false;
        };
        match credentials.split_once(':') {
            Some((user, pass)) => users.get(user).map(String::as_str) == Some(pass),
            None => false,
        }
    }

    async fn serve_connect(
        &self,
        reader: BufReader<PeekableStream>,
        head: RequestHead,
    ) -> Result<(), ProxyError> {
        debug!("http CONNECT to {}", head.target);

        let tunnel = match self.dialer.dial(&head.target).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                warn!("dial {} failed: {e}", head.target);
                let mut conn = reader.into_inner();
                conn.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await?;
                conn.flush().await?;
                return Err(e.into());
            }
        };

        // Any bytes the client pipelined behind the request head are still
        // sitting in the BufReader; replay them in front of the socket.
        let leftover = reader.buffer().to_vec();
        let mut client = PeekableStream::new(Box::new(reader.into_inner()), leftover);
        client
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;
        client.flush().await?;

        join_streams(client, tunnel, &self.pool).await?;
        Ok(())
    }

    async fn serve_forward(
        &self,
        reader: BufReader<PeekableStream>,
        head: RequestHead,
    ) -> Result<(), ProxyError> {
        let (authority, path) = split_absolute_uri(&head.target)?;
        debug!("http {} {} via {}", head.method, path, authority);

        let mut tunnel = match self.dialer.dial(&authority).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                warn!("dial {authority} failed: {e}");
                let mut conn = reader.into_inner();
                conn.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await?;
                conn.flush().await?;
                return Err(e.into());
            }
        };

        // Re-issue the request in origin-form, dropping the proxy headers.
        let mut out = format!("{} {} {}\r\n", head.method, path, head.version);
        for (name, value) in &head.headers {
            if name.eq_ignore_ascii_case("proxy-authorization")
                || name.eq_ignore_ascii_case("proxy-connection")
            {
                continue;
            }
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        tunnel.write_all(out.as_bytes()).await?;
        tunnel.flush().await?;

        // Body and response stream verbatim from here on.
        let leftover = reader.buffer().to_vec();
        let client = PeekableStream::new(Box::new(reader.into_inner()), leftover);
        join_streams(client, tunnel, &self.pool).await?;
        Ok(())
    }
}

async fn read_request_head(
    reader: &mut BufReader<PeekableStream>,
) -> Result<RequestHead, ProxyError> {
    let request_line = read_head_line(reader).await?;
    let mut parts = request_line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) => (m.to_string(), t.to_string(), v.to_string()),
        _ => {
            return Err(ProxyError::MalformedRequest(format!(
                "bad request line {request_line:?}"
            )))
        }
    };

    let mut headers = Vec::new();
    loop {
        let line = read_head_line(reader).await?;
        if line.is_empty() {
            break;
        }
        if headers.len() >= MAX_HEADERS {
            return Err(ProxyError::MalformedRequest("too many headers".into()));
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(ProxyError::MalformedRequest(format!(
                "bad header line {line:?}"
            )));
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(RequestHead {
        method,
        target,
        version,
        headers,
    })
}

async fn read_head_line(reader: &mut BufReader<PeekableStream>) -> Result<String, ProxyError> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(ProxyError::MalformedRequest(
            "connection closed mid-request".into(),
        ));
    }
    if line.len() > MAX_HEADER_LINE {
        return Err(ProxyError::MalformedRequest("header line too long".into()));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Split `http://host[:port]/path` into (`host:port`, origin-form path).
fn split_absolute_uri(target: &str) -> Result<(String, String), ProxyError> {
    let rest = target
        .strip_prefix("http://")
        .ok_or_else(|| ProxyError::MalformedRequest(format!("not an absolute URI: {target}")))?;
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    if authority.is_empty() {
        return Err(ProxyError::MalformedRequest("empty host".into()));
    }
    let authority = if authority.contains(':') {
        authority.to_string()
    } else {
        format!("{authority}:80")
    };
    Ok((authority, path.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::{TunnelError, TunnelStream};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::io::AsyncReadExt;

    /// Dialer that hands out one end of an in-memory pipe and records the
    /// requested targets.
    struct StubDialer {
        targets: Mutex<Vec<String>>,
        origin_ends: Mutex<Vec<tokio::io::DuplexStream>>,
    }

    impl StubDialer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                targets: Mutex::new(Vec::new()),
                origin_ends: Mutex::new(Vec::new()),
            })
        }

        fn take_origin(&self) -> tokio::io::DuplexStream {
            self.origin_ends.lock().unwrap().remove(0)
        }

        fn targets(&self) -> Vec<String> {
            self.targets.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Dialer for StubDialer {
        async fn dial(&self, target: &str) -> Result<TunnelStream, TunnelError> {
            self.targets.lock().unwrap().push(target.to_string());
            let (near, far) = tokio::io::duplex(64 * 1024);
            self.origin_ends.lock().unwrap().push(far);
            Ok(TunnelStream::new(
                Box::new(near),
                Some("127.0.0.1:45000".parse().unwrap()),
            ))
        }
    }

    fn server(dialer: Arc<StubDialer>, users: Option<HashMap<String, String>>) -> HttpProxyServer {
        HttpProxyServer::new(dialer, users, Arc::new(BytesPool::default()))
    }

    fn peekable(io: tokio::io::DuplexStream) -> PeekableStream {
        PeekableStream::new(Box::new(io), Vec::new())
    }

    #[tokio::test]
    async fn test_connect_relays_pipelined_bytes() {
        let dialer = StubDialer::new();
        let srv = server(dialer.clone(), None);
        let (mut client, conn) = tokio::io::duplex(64 * 1024);

        let serve = tokio::spawn(async move { srv.serve_conn(peekable(conn)).await });

        client
            .write_all(
                b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\nHELLO",
            )
            .await
            .unwrap();

        let mut response = [0u8; 39];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(
            &response[..],
            b"HTTP/1.1 200 Connection Established\r\n\r\n"
        );

        let mut origin = dialer.take_origin();
        let mut seen = [0u8; 5];
        origin.read_exact(&mut seen).await.unwrap();
        assert_eq!(&seen, b"HELLO");
        assert_eq!(dialer.targets(), vec!["example.com:443".to_string()]);

        origin.write_all(b"WORLD").await.unwrap();
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"WORLD");

        drop(client);
        drop(origin);
        serve.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_missing_credentials_get_407() {
        let dialer = StubDialer::new();
        let mut users = HashMap::new();
        users.insert("alice".to_string(), "wonder".to_string());
        let srv = server(dialer.clone(), Some(users));
        let (mut client, conn) = tokio::io::duplex(8 * 1024);

        let serve = tokio::spawn(async move { srv.serve_conn(peekable(conn)).await });

        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 407 Proxy Authentication Required\r\n"));
        assert!(text.contains("Proxy-Authenticate: Basic realm=\"Proxy\"\r\n"));

        match serve.await.unwrap() {
            Err(ProxyError::AuthenticationFailed) => {}
            other => panic!("expected auth failure, got {other:?}"),
        }
        assert!(dialer.targets().is_empty());
    }

    #[tokio::test]
    async fn test_valid_credentials_pass() {
        let dialer = StubDialer::new();
        let mut users = HashMap::new();
        users.insert("alice".to_string(), "wonder".to_string());
        let srv = server(dialer.clone(), Some(users));
        let (mut client, conn) = tokio::io::duplex(8 * 1024);

        let serve = tokio::spawn(async move { srv.serve_conn(peekable(conn)).await });

        let credentials = BASE64.encode("alice:wonder");
        client
            .write_all(
                format!(
                    "CONNECT example.com:443 HTTP/1.1\r\nProxy-Authorization: Basic {credentials}\r\n\r\n"
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        let mut response = [0u8; 39];
        client.read_exact(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 200"));

        drop(client);
        drop(dialer.take_origin());
        serve.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_forward_request_rewritten_to_origin_form() {
        let dialer = StubDialer::new();
        let srv = server(dialer.clone(), None);
        let (mut client, conn) = tokio::io::duplex(64 * 1024);

        let serve = tokio::spawn(async move { srv.serve_conn(peekable(conn)).await });

        client
            .write_all(
                b"GET http://example.com/index.html HTTP/1.1\r\nHost: example.com\r\nProxy-Connection: keep-alive\r\n\r\n",
            )
            .await
            .unwrap();

        let mut origin = dialer.take_origin();
        let mut head = vec![0u8; 256];
        let n = origin.read(&mut head).await.unwrap();
        let head = String::from_utf8_lossy(&head[..n]).to_string();
        assert!(head.starts_with("GET /index.html HTTP/1.1\r\n"));
        assert!(head.contains("Host: example.com\r\n"));
        assert!(!head.to_lowercase().contains("proxy-connection"));
        assert_eq!(dialer.targets(), vec!["example.com:80".to_string()]);

        origin
            .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
            .await
            .unwrap();
        drop(origin);

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 204 No Content\r\n"));

        drop(client);
        serve.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_opaque_path_gets_404() {
        let dialer = StubDialer::new();
        let srv = server(dialer.clone(), None);
        let (mut client, conn) = tokio::io::duplex(8 * 1024);

        let serve = tokio::spawn(async move { srv.serve_conn(peekable(conn)).await });

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: nope\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 404 Not Found\r\n"));
        serve.await.unwrap().unwrap();
        assert!(dialer.targets().is_empty());
    }

    #[test]
    fn test_split_absolute_uri() {
        assert_eq!(
            split_absolute_uri("http://example.com/a/b").unwrap(),
            ("example.com:80".to_string(), "/a/b".to_string())
        );
        assert_eq!(
            split_absolute_uri("http://example.com:8080").unwrap(),
            ("example.com:8080".to_string(), "/".to_string())
        );
        assert!(split_absolute_uri("ftp://example.com/").is_err());
    }
}
