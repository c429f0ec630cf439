//! Carriers between a client and the server.
//!
//! A client holds one [`TransportSession`] to the server. Every control,
//! work and visitor stream is opened by the client on that session and is
//! accepted by the server, which tells them apart by their first message.

use std::{fmt, net::SocketAddr, str::FromStr, sync::Arc};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod mux;
pub mod quic;
pub mod tcp;

pub use quic::{QuicDialOptions, QuicListenOptions};

/// `AsyncRead + AsyncWrite` under one name so it can be boxed.
pub trait AsyncStream: AsyncRead + AsyncWrite {}
impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + ?Sized {}

/// One tunnel stream: control, work or visitor.
pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Quic,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Quic => "quic",
        }
    }

    pub fn build(self) -> Arc<dyn Transport> {
        match self {
            TransportKind::Tcp => Arc::new(tcp::TcpTransport::new()),
            TransportKind::Quic => Arc::new(quic::QuicTransport::new()),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = anyhow::Error;

    /// Case-insensitive; an empty name means TCP.
    fn from_str(name: &str) -> anyhow::Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "tcp" => Ok(TransportKind::Tcp),
            "quic" => Ok(TransportKind::Quic),
            _ => anyhow::bail!("tunnel: unknown transport {name:?} (expected tcp|quic)"),
        }
    }
}

/// Canonical transport name for a config value.
pub fn parse_transport(name: &str) -> anyhow::Result<String> {
    Ok(name.parse::<TransportKind>()?.as_str().to_string())
}

pub fn transport_by_name(name: &str) -> anyhow::Result<Arc<dyn Transport>> {
    Ok(name.parse::<TransportKind>()?.build())
}

#[derive(Debug, Clone, Default)]
pub struct TransportListenOptions {
    /// Run yamux over each accepted TCP connection. QUIC ignores it.
    pub tcp_mux: bool,
    pub quic: QuicListenOptions,
}

#[derive(Debug, Clone, Default)]
pub struct TransportDialOptions {
    /// Must match the server's `tcp_mux`.
    pub tcp_mux: bool,
    pub quic: QuicDialOptions,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn listen(
        &self,
        addr: &str,
        opts: TransportListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>>;

    async fn dial(
        &self,
        addr: &str,
        opts: TransportDialOptions,
    ) -> anyhow::Result<Arc<dyn TransportSession>>;
}

/// Server end: yields one session per connected client.
#[async_trait]
pub trait TransportListener: Send + Sync {
    async fn accept(&self) -> anyhow::Result<Arc<dyn TransportSession>>;
    fn local_addr(&self) -> Option<SocketAddr>;
    async fn close(&self) -> anyhow::Result<()>;
}

/// A connection carrying tunnel streams.
///
/// Without multiplexing every `open_stream` dials a fresh connection, and
/// each accepted server session yields exactly one stream.
#[async_trait]
pub trait TransportSession: Send + Sync {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream>;
    async fn accept_stream(&self) -> anyhow::Result<BoxedStream>;
    /// Ends the session. Data already written to closed streams is flushed
    /// on a best-effort basis.
    async fn close(&self);
    fn remote_addr(&self) -> Option<SocketAddr>;
    fn local_addr(&self) -> Option<SocketAddr>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_names_are_case_insensitive() {
        assert_eq!(parse_transport("").unwrap(), "tcp");
        assert_eq!(parse_transport(" QUIC ").unwrap(), "quic");
        assert!(parse_transport("kcp").is_err());
        assert_eq!(transport_by_name("Tcp").unwrap().name(), "tcp");
        assert_eq!(TransportKind::Quic.to_string(), "quic");
    }
}
