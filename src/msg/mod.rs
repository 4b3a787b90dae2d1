//! Control-channel codec
//!
//! Messages to and from the rendezvous server are framed as
//! `type_byte(1) ‖ length_be(8) ‖ json`. Type bytes are registered in a
//! process-global decoder table built once at first use. Payload keys are
//! camelCase on the wire.

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::sync::OnceLock;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames longer than this are rejected as malformed.
pub const MAX_MSG_SIZE: u64 = 10 * 1024;

/// Codec errors
#[derive(Debug, Error)]
pub enum MsgError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown message type: {0:#x}")]
    UnknownType(u8),

    #[error("message too large: {0} bytes")]
    TooLarge(u64),
}

pub const TYPE_NEW_VISITOR_CONN: u8 = b'v';
pub const TYPE_NEW_VISITOR_CONN_RESP: u8 = b'3';

/// Sent over a fresh control stream to request an end-to-end connection to
/// the origin registered under `proxy_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewVisitorConn {
    pub run_id: String,
    pub proxy_name: String,
    pub sign_key: String,
    pub timestamp: i64,
    pub use_encryption: bool,
    pub use_compression: bool,
    pub target_addr: String,
}

/// Rendezvous answer; an empty `error` means the stream now carries raw
/// bytes for the origin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewVisitorConnResp {
    #[serde(default)]
    pub error: String,
}

/// A control-channel message the visitor knows how to frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    NewVisitorConn(NewVisitorConn),
    NewVisitorConnResp(NewVisitorConnResp),
}

impl Message {
    pub fn type_byte(&self) -> u8 {
        match self {
            Message::NewVisitorConn(_) => TYPE_NEW_VISITOR_CONN,
            Message::NewVisitorConnResp(_) => TYPE_NEW_VISITOR_CONN_RESP,
        }
    }

    fn payload(&self) -> Result<Vec<u8>, MsgError> {
        let buf = match self {
            Message::NewVisitorConn(m) => serde_json::to_vec(m)?,
            Message::NewVisitorConnResp(m) => serde_json::to_vec(m)?,
        };
        Ok(buf)
    }
}

type DecodeFn = fn(&[u8]) -> Result<Message, MsgError>;

fn decoders() -> &'static HashMap<u8, DecodeFn> {
    static TABLE: OnceLock<HashMap<u8, DecodeFn>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table: HashMap<u8, DecodeFn> = HashMap::new();
        table.insert(TYPE_NEW_VISITOR_CONN, |b| {
            Ok(Message::NewVisitorConn(serde_json::from_slice(b)?))
        });
        table.insert(TYPE_NEW_VISITOR_CONN_RESP, |b| {
            Ok(Message::NewVisitorConnResp(serde_json::from_slice(b)?))
        });
        table
    })
}

/// Write one framed message.
pub async fn write_message<W>(w: &mut W, msg: &Message) -> Result<(), MsgError>
where
    W: AsyncWrite + Unpin,
{
    let payload = msg.payload()?;
    let mut frame = Vec::with_capacity(1 + 8 + payload.len());
    frame.push(msg.type_byte());
    frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    frame.extend_from_slice(&payload);
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}

/// Read one framed message.
pub async fn read_message<R>(r: &mut R) -> Result<Message, MsgError>
where
    R: AsyncRead + Unpin,
{
    let mut type_byte = [0u8; 1];
    r.read_exact(&mut type_byte).await?;
    let decode = decoders()
        .get(&type_byte[0])
        .copied()
        .ok_or(MsgError::UnknownType(type_byte[0]))?;

    let mut len_bytes = [0u8; 8];
    r.read_exact(&mut len_bytes).await?;
    let len = u64::from_be_bytes(len_bytes);
    if len > MAX_MSG_SIZE {
        return Err(MsgError::TooLarge(len));
    }

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;
    decode(&payload)
}

/// Handshake signature: hex MD5 over the secret key concatenated with the
/// decimal timestamp. Peers depend on this byte-for-byte.
pub fn sign_key(secret_key: &str, timestamp: i64) -> String {
    let mut hasher = Md5::new();
    hasher.update(secret_key.as_bytes());
    hasher.update(timestamp.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_message_roundtrip() {
        let msg = Message::NewVisitorConn(NewVisitorConn {
            run_id: "abc123".into(),
            proxy_name: "secret-web".into(),
            sign_key: sign_key("key", 1700000000),
            timestamp: 1700000000,
            use_encryption: true,
            use_compression: false,
            target_addr: "127.0.0.1:80".into(),
        });

        let (mut a, mut b) = tokio::io::duplex(4096);
        write_message(&mut a, &msg).await.unwrap();
        let read = read_message(&mut b).await.unwrap();
        assert_eq!(read, msg);
    }

    #[tokio::test]
    async fn test_frame_layout() {
        let msg = Message::NewVisitorConnResp(NewVisitorConnResp::default());
        let mut buf = Vec::new();
        write_message(&mut buf, &msg).await.unwrap();

        assert_eq!(buf[0], TYPE_NEW_VISITOR_CONN_RESP);
        let len = u64::from_be_bytes(buf[1..9].try_into().unwrap());
        assert_eq!(len as usize, buf.len() - 9);
        let decoded: NewVisitorConnResp = serde_json::from_slice(&buf[9..]).unwrap();
        assert_eq!(decoded.error, "");
    }

    #[tokio::test]
    async fn test_camel_case_keys() {
        let msg = NewVisitorConn {
            run_id: "r".into(),
            proxy_name: "p".into(),
            sign_key: "s".into(),
            timestamp: 1,
            use_encryption: false,
            use_compression: false,
            target_addr: "t:1".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"runId\""));
        assert!(json.contains("\"proxyName\""));
        assert!(json.contains("\"signKey\""));
        assert!(json.contains("\"useEncryption\""));
        assert!(json.contains("\"useCompression\""));
        assert!(json.contains("\"targetAddr\""));
    }

    #[tokio::test]
    async fn test_unknown_type_byte() {
        let mut frame = vec![b'z'];
        frame.extend_from_slice(&2u64.to_be_bytes());
        frame.extend_from_slice(b"{}");
        let mut reader = std::io::Cursor::new(frame);
        match read_message(&mut reader).await {
            Err(MsgError::UnknownType(b'z')) => {}
            other => panic!("expected UnknownType, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_oversize_frame_rejected() {
        let mut frame = vec![TYPE_NEW_VISITOR_CONN];
        frame.extend_from_slice(&(MAX_MSG_SIZE + 1).to_be_bytes());
        let mut reader = std::io::Cursor::new(frame);
        match read_message(&mut reader).await {
            Err(MsgError::TooLarge(_)) => {}
            other => panic!("expected TooLarge, got {other:?}"),
        }
    }

    #[test]
    fn test_sign_key_matches_digest_of_concatenation() {
        let expected = {
            let mut hasher = Md5::new();
            hasher.update(format!("{}{}", "secret", 1700000000i64).as_bytes());
            hex::encode(hasher.finalize())
        };
        assert_eq!(sign_key("secret", 1700000000), expected);
    }

    #[test]
    fn test_sign_key_is_stable_and_hex() {
        let a = sign_key("k", 42);
        let b = sign_key("k", 42);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(sign_key("k", 43), a);
        assert_ne!(sign_key("other", 42), a);
    }
}
