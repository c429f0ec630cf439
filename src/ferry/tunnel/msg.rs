//! Control protocol framing.
//!
//! Every frame is `tag: u8` + `len: u32be` + JSON payload. The tag selects the
//! message type; the length is checked against [`MAX_MSG_BYTES`] before any
//! payload byte is read.

use std::{collections::BTreeMap, net::SocketAddr};

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::ferry::tunnel::{
    error::WireError,
    kind::{ProxyConfig, ProxyKind, VisitorMode},
    nat::{Candidate, NatRole},
};

/// Major component must match between peers.
pub const PROTOCOL_VERSION: &str = "1.0";

pub const MAX_MSG_BYTES: u32 = 1 << 20; // 1 MiB
pub const MAX_DATAGRAM_BYTES: u32 = 1 << 20; // 1 MiB

const HEADER_LEN: usize = 5;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown message tag {0:#04x}")]
    UnknownTag(u8),
    #[error("payload too large: {0}")]
    PayloadTooLarge(u32),
    #[error("truncated frame")]
    Truncated,
    #[error("unexpected message: expected {expected}, got {got}")]
    Unexpected {
        expected: &'static str,
        got: &'static str,
    },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn versions_compatible(a: &str, b: &str) -> bool {
    let major = |v: &str| v.trim().split('.').next().unwrap_or("").to_string();
    !major(a).is_empty() && major(a) == major(b)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Login {
    pub version: String,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    pub timestamp: i64,
    pub privilege_key: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginResp {
    pub version: String,
    #[serde(default)]
    pub run_id: String,
    /// Proxies re-attached from a previous session with the same run id.
    #[serde(default)]
    pub resumed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nat_hole_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProxy {
    pub proxy: ProxyConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProxyResp {
    pub name: String,
    #[serde(default)]
    pub remote_addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseProxy {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewVisitor {
    pub name: String,
    pub kind: ProxyKind,
    pub server_name: String,
    pub sign_key: String,
    pub timestamp: i64,
    #[serde(default)]
    pub mode: VisitorMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewVisitorResp {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReqWorkConn {
    pub request_id: u64,
    pub proxy_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewWorkConn {
    pub run_id: String,
    pub request_id: u64,
    pub timestamp: i64,
    /// Same proof as `Login::privilege_key`.
    pub privilege_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartWorkConn {
    pub request_id: u64,
    pub proxy_name: String,
    #[serde(default)]
    pub src_addr: String,
    #[serde(default)]
    pub dst_addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewVisitorConn {
    pub run_id: String,
    pub proxy_name: String,
    pub sign_key: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewVisitorConnResp {
    pub proxy_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NatCandidates {
    pub peering_id: String,
    pub role: NatRole,
    pub proxy_name: String,
    #[serde(default)]
    pub sign_key: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    /// Fingerprint of the provider's QUIC certificate on the punched path.
    #[serde(default)]
    pub cert_fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NatProbe {
    pub transaction_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NatProbeResp {
    pub transaction_id: u64,
    pub observed: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Punch {
    pub peering_id: String,
    pub ack: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Close {
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Login(Login),
    LoginResp(LoginResp),
    Ping(Ping),
    Pong(Pong),
    NewProxy(NewProxy),
    NewProxyResp(NewProxyResp),
    CloseProxy(CloseProxy),
    NewVisitor(NewVisitor),
    NewVisitorResp(NewVisitorResp),
    ReqWorkConn(ReqWorkConn),
    NewWorkConn(NewWorkConn),
    StartWorkConn(StartWorkConn),
    NewVisitorConn(NewVisitorConn),
    NewVisitorConnResp(NewVisitorConnResp),
    NatCandidates(NatCandidates),
    NatProbe(NatProbe),
    NatProbeResp(NatProbeResp),
    Punch(Punch),
    Close(Close),
}

impl Message {
    pub fn tag(&self) -> u8 {
        match self {
            Message::Login(_) => b'o',
            Message::LoginResp(_) => b'1',
            Message::Ping(_) => b'h',
            Message::Pong(_) => b'4',
            Message::NewProxy(_) => b'p',
            Message::NewProxyResp(_) => b'2',
            Message::CloseProxy(_) => b'c',
            Message::NewVisitor(_) => b'v',
            Message::NewVisitorResp(_) => b'3',
            Message::ReqWorkConn(_) => b'r',
            Message::NewWorkConn(_) => b'w',
            Message::StartWorkConn(_) => b's',
            Message::NewVisitorConn(_) => b'V',
            Message::NewVisitorConnResp(_) => b'5',
            Message::NatCandidates(_) => b'n',
            Message::NatProbe(_) => b'b',
            Message::NatProbeResp(_) => b'B',
            Message::Punch(_) => b'u',
            Message::Close(_) => b'x',
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::Login(_) => "Login",
            Message::LoginResp(_) => "LoginResp",
            Message::Ping(_) => "Ping",
            Message::Pong(_) => "Pong",
            Message::NewProxy(_) => "NewProxy",
            Message::NewProxyResp(_) => "NewProxyResp",
            Message::CloseProxy(_) => "CloseProxy",
            Message::NewVisitor(_) => "NewVisitor",
            Message::NewVisitorResp(_) => "NewVisitorResp",
            Message::ReqWorkConn(_) => "ReqWorkConn",
            Message::NewWorkConn(_) => "NewWorkConn",
            Message::StartWorkConn(_) => "StartWorkConn",
            Message::NewVisitorConn(_) => "NewVisitorConn",
            Message::NewVisitorConnResp(_) => "NewVisitorConnResp",
            Message::NatCandidates(_) => "NatCandidates",
            Message::NatProbe(_) => "NatProbe",
            Message::NatProbeResp(_) => "NatProbeResp",
            Message::Punch(_) => "Punch",
            Message::Close(_) => "Close",
        }
    }

    fn payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Message::Login(m) => serde_json::to_vec(m),
            Message::LoginResp(m) => serde_json::to_vec(m),
            Message::Ping(m) => serde_json::to_vec(m),
            Message::Pong(m) => serde_json::to_vec(m),
            Message::NewProxy(m) => serde_json::to_vec(m),
            Message::NewProxyResp(m) => serde_json::to_vec(m),
            Message::CloseProxy(m) => serde_json::to_vec(m),
            Message::NewVisitor(m) => serde_json::to_vec(m),
            Message::NewVisitorResp(m) => serde_json::to_vec(m),
            Message::ReqWorkConn(m) => serde_json::to_vec(m),
            Message::NewWorkConn(m) => serde_json::to_vec(m),
            Message::StartWorkConn(m) => serde_json::to_vec(m),
            Message::NewVisitorConn(m) => serde_json::to_vec(m),
            Message::NewVisitorConnResp(m) => serde_json::to_vec(m),
            Message::NatCandidates(m) => serde_json::to_vec(m),
            Message::NatProbe(m) => serde_json::to_vec(m),
            Message::NatProbeResp(m) => serde_json::to_vec(m),
            Message::Punch(m) => serde_json::to_vec(m),
            Message::Close(m) => serde_json::to_vec(m),
        }
    }

    fn from_payload(tag: u8, b: &[u8]) -> Result<Self, ProtocolError> {
        fn de<T: DeserializeOwned>(b: &[u8]) -> Result<T, ProtocolError> {
            Ok(serde_json::from_slice(b)?)
        }
        let m = match tag {
            b'o' => Message::Login(de(b)?),
            b'1' => Message::LoginResp(de(b)?),
            b'h' => Message::Ping(de(b)?),
            b'4' => Message::Pong(de(b)?),
            b'p' => Message::NewProxy(de(b)?),
            b'2' => Message::NewProxyResp(de(b)?),
            b'c' => Message::CloseProxy(de(b)?),
            b'v' => Message::NewVisitor(de(b)?),
            b'3' => Message::NewVisitorResp(de(b)?),
            b'r' => Message::ReqWorkConn(de(b)?),
            b'w' => Message::NewWorkConn(de(b)?),
            b's' => Message::StartWorkConn(de(b)?),
            b'V' => Message::NewVisitorConn(de(b)?),
            b'5' => Message::NewVisitorConnResp(de(b)?),
            b'n' => Message::NatCandidates(de(b)?),
            b'b' => Message::NatProbe(de(b)?),
            b'B' => Message::NatProbeResp(de(b)?),
            b'u' => Message::Punch(de(b)?),
            b'x' => Message::Close(de(b)?),
            other => return Err(ProtocolError::UnknownTag(other)),
        };
        Ok(m)
    }

    pub fn unexpected(&self, expected: &'static str) -> ProtocolError {
        ProtocolError::Unexpected {
            expected,
            got: self.name(),
        }
    }
}

/// Encodes one frame into a contiguous buffer, as sent in a single UDP datagram.
pub fn encode(msg: &Message) -> Result<BytesMut, ProtocolError> {
    let payload = msg.payload()?;
    let n: u32 = payload
        .len()
        .try_into()
        .map_err(|_| ProtocolError::PayloadTooLarge(u32::MAX))?;
    if n > MAX_MSG_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(msg.tag());
    buf.put_u32(n);
    buf.put_slice(&payload);
    Ok(buf)
}

/// Decodes exactly one frame from `buf`.
pub fn decode(buf: &[u8]) -> Result<Message, ProtocolError> {
    if buf.len() < HEADER_LEN {
        return Err(ProtocolError::Truncated);
    }
    let tag = buf[0];
    let n = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if n > MAX_MSG_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }
    let body = &buf[HEADER_LEN..];
    if body.len() != n as usize {
        return Err(ProtocolError::Truncated);
    }
    Message::from_payload(tag, body)
}

pub async fn write_msg<W: AsyncWrite + Unpin>(w: &mut W, msg: &Message) -> Result<(), ProtocolError> {
    let buf = encode(msg)?;
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_msg<R: AsyncRead + Unpin>(r: &mut R) -> Result<Message, ProtocolError> {
    let tag = r.read_u8().await?;
    let n = r.read_u32().await?;
    if n > MAX_MSG_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }
    let mut buf = vec![0u8; n as usize];
    r.read_exact(&mut buf).await?;
    Message::from_payload(tag, &buf)
}
