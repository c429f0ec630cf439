use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::Mutex,
};

use crate::ferry::net;
use crate::ferry::tunnel::transport::{
    BoxedStream, Transport, TransportDialOptions, TransportListenOptions, TransportListener,
    TransportSession, mux::MuxSession,
};

pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn listen(
        &self,
        addr: &str,
        opts: TransportListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>> {
        let bind_addr = net::normalize_bind_addr(addr);
        let ln = TcpListener::bind(bind_addr.as_ref()).await?;
        Ok(Box::new(TcpTransportListener {
            ln,
            mux: opts.tcp_mux,
        }))
    }

    async fn dial(
        &self,
        addr: &str,
        opts: TransportDialOptions,
    ) -> anyhow::Result<Arc<dyn TransportSession>> {
        let c = TcpStream::connect(addr).await?;
        let _ = c.set_nodelay(true);
        if opts.tcp_mux {
            return Ok(Arc::new(MuxSession::client(c)));
        }
        Ok(Arc::new(DialingSession::new(addr.to_string(), c)))
    }
}

pub struct TcpTransportListener {
    ln: TcpListener,
    mux: bool,
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    async fn accept(&self) -> anyhow::Result<Arc<dyn TransportSession>> {
        let (c, _) = self.ln.accept().await?;
        let _ = c.set_nodelay(true);
        if self.mux {
            return Ok(Arc::new(MuxSession::server(c)));
        }
        Ok(Arc::new(SingleStreamSession::new(c)))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr().ok()
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Client side without multiplexing: the first stream reuses the initial
/// connection, every later stream is a fresh TCP connection.
struct DialingSession {
    addr: String,
    first: Mutex<Option<TcpStream>>,
    remote: Option<SocketAddr>,
    local: Option<SocketAddr>,
}

impl DialingSession {
    fn new(addr: String, c: TcpStream) -> Self {
        let remote = c.peer_addr().ok();
        let local = c.local_addr().ok();
        Self {
            addr,
            first: Mutex::new(Some(c)),
            remote,
            local,
        }
    }
}

#[async_trait]
impl TransportSession for DialingSession {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream> {
        if let Some(c) = self.first.lock().await.take() {
            return Ok(Box::new(c));
        }
        let c = TcpStream::connect(&self.addr).await?;
        let _ = c.set_nodelay(true);
        Ok(Box::new(c))
    }

    async fn accept_stream(&self) -> anyhow::Result<BoxedStream> {
        anyhow::bail!("tunnel: server-initiated streams are not supported")
    }

    async fn close(&self) {
        self.first.lock().await.take();
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }
}

/// Server side without multiplexing: one accepted connection is one stream.
struct SingleStreamSession {
    stream: Mutex<Option<TcpStream>>,
    remote: Option<SocketAddr>,
    local: Option<SocketAddr>,
}

impl SingleStreamSession {
    fn new(c: TcpStream) -> Self {
        let remote = c.peer_addr().ok();
        let local = c.local_addr().ok();
        Self {
            stream: Mutex::new(Some(c)),
            remote,
            local,
        }
    }
}

#[async_trait]
impl TransportSession for SingleStreamSession {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream> {
        anyhow::bail!("tunnel: server-initiated streams are not supported")
    }

    async fn accept_stream(&self) -> anyhow::Result<BoxedStream> {
        let c = self
            .stream
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow::anyhow!("tunnel: session closed"))?;
        Ok(Box::new(c))
    }

    async fn close(&self) {
        self.stream.lock().await.take();
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn echo_one_stream(ln: Box<dyn TransportListener>) {
        let sess = ln.accept().await.unwrap();
        let mut st = sess.accept_stream().await.unwrap();
        let mut buf = [0u8; 4];
        st.read_exact(&mut buf).await.unwrap();
        st.write_all(&buf).await.unwrap();
        st.flush().await.unwrap();
        // Keep the session open until the peer is done reading.
        let _ = st.read(&mut buf).await;
    }

    #[tokio::test]
    async fn yamux_stream_roundtrip() {
        let tr = TcpTransport::new();
        let opts = TransportListenOptions {
            tcp_mux: true,
            ..Default::default()
        };
        let ln = tr.listen("127.0.0.1:0", opts).await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(echo_one_stream(ln));

        let sess = tr
            .dial(
                &addr.to_string(),
                TransportDialOptions {
                    tcp_mux: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let mut st = sess.open_stream().await.unwrap();
        st.write_all(b"ping").await.unwrap();
        st.flush().await.unwrap();
        let mut buf = [0u8; 4];
        st.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn plain_tcp_dials_a_connection_per_stream() {
        let tr = TcpTransport::new();
        let ln = tr
            .listen("127.0.0.1:0", TransportListenOptions::default())
            .await
            .unwrap();
        let addr = ln.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let mut seen = 0;
            for _ in 0..2 {
                let sess = ln.accept().await.unwrap();
                let _st = sess.accept_stream().await.unwrap();
                assert!(sess.accept_stream().await.is_err());
                seen += 1;
            }
            seen
        });

        let sess = tr
            .dial(&addr.to_string(), TransportDialOptions::default())
            .await
            .unwrap();
        let _a = sess.open_stream().await.unwrap();
        let _b = sess.open_stream().await.unwrap();
        assert_eq!(server.await.unwrap(), 2);
    }
}
