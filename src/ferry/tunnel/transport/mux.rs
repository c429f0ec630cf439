//! yamux over one TCP connection.
//!
//! A `StreamHandle` only applies the peer's window updates while its read
//! side is polled, so a stream that is written but not read stalls once the
//! send window is spent. Every handle is therefore owned by a pump task that
//! keeps draining its frames and moves bytes to and from a local duplex
//! pipe, which is what callers get as their stream.

use std::{
    future::poll_fn,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::{
    io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf},
    net::TcpStream,
    sync::{Mutex, mpsc},
    task::{JoinHandle, JoinSet},
};
use tokio_yamux::{Config, Control, Session, StreamHandle};

use crate::ferry::tunnel::transport::{BoxedStream, TransportSession};

const PIPE_CAPACITY: usize = 64 * 1024;
const PUMP_BUFFER: usize = 16 * 1024;
/// Rounds of progress a pump makes before yielding to the scheduler.
const PUMP_BUDGET: usize = 16;
const CLOSE_GRACE: Duration = Duration::from_millis(500);
const FLUSH_GRACE: Duration = Duration::from_millis(50);

type Pumps = Arc<Mutex<JoinSet<()>>>;

pub struct MuxSession {
    control: Mutex<Control>,
    incoming: Mutex<mpsc::Receiver<BoxedStream>>,
    pumps: Pumps,
    driver: std::sync::Mutex<Option<JoinHandle<()>>>,
    remote: Option<SocketAddr>,
    local: Option<SocketAddr>,
}

impl MuxSession {
    pub fn server(c: TcpStream) -> Self {
        let (remote, local) = (c.peer_addr().ok(), c.local_addr().ok());
        Self::start(Session::new_server(c, Config::default()), remote, local)
    }

    pub fn client(c: TcpStream) -> Self {
        let (remote, local) = (c.peer_addr().ok(), c.local_addr().ok());
        Self::start(Session::new_client(c, Config::default()), remote, local)
    }

    fn start(
        mut session: Session<TcpStream>,
        remote: Option<SocketAddr>,
        local: Option<SocketAddr>,
    ) -> Self {
        let control = session.control();
        let pumps: Pumps = Arc::default();
        let (tx, rx) = mpsc::channel(64);

        let accepted = pumps.clone();
        let driver = tokio::spawn(async move {
            while let Some(next) = session.next().await {
                let handle = match next {
                    Ok(h) => h,
                    Err(err) => {
                        tracing::debug!(%err, "mux session ended");
                        break;
                    }
                };
                let st = bridge(handle, &accepted).await;
                // Keep driving the session after the acceptor is gone so
                // open streams still flow.
                let _ = tx.send(st).await;
            }
        });

        Self {
            control: Mutex::new(control),
            incoming: Mutex::new(rx),
            pumps,
            driver: std::sync::Mutex::new(Some(driver)),
            remote,
            local,
        }
    }

    fn take_driver(&self) -> Option<JoinHandle<()>> {
        match self.driver.lock() {
            Ok(mut d) => d.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        if let Some(d) = self.take_driver() {
            d.abort();
        }
    }
}

#[async_trait]
impl TransportSession for MuxSession {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream> {
        let handle = self.control.lock().await.open_stream().await?;
        Ok(bridge(handle, &self.pumps).await)
    }

    async fn accept_stream(&self) -> anyhow::Result<BoxedStream> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("tunnel: session closed"))
    }

    /// Lets the pumps hand their last bytes to the session, then sends a
    /// GoAway and waits briefly for the driver to write it out.
    async fn close(&self) {
        let mut pumps = std::mem::take(&mut *self.pumps.lock().await);
        let _ = tokio::time::timeout(CLOSE_GRACE, async {
            while pumps.join_next().await.is_some() {}
        })
        .await;
        drop(pumps);
        tokio::time::sleep(FLUSH_GRACE).await;

        self.control.lock().await.close().await;
        if let Some(mut d) = self.take_driver()
            && tokio::time::timeout(CLOSE_GRACE, &mut d).await.is_err()
        {
            d.abort();
        }
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }
}

async fn bridge(handle: StreamHandle, pumps: &Pumps) -> BoxedStream {
    let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
    let mut pump = Pump::new(handle, far);
    let id = pump.mux.id();
    let mut set = pumps.lock().await;
    while set.try_join_next().is_some() {}
    set.spawn(async move {
        if let Err(err) = poll_fn(|cx| pump.poll_run(cx)).await {
            tracing::trace!(stream = id, %err, "mux stream reset");
        }
    });
    Box::new(near)
}

struct Window {
    buf: Box<[u8]>,
    start: usize,
    end: usize,
}

impl Window {
    fn new() -> Self {
        Self {
            buf: vec![0; PUMP_BUFFER].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.start == self.end
    }

    fn has_room(&self) -> bool {
        self.end < self.buf.len()
    }

    fn pending(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    fn consume(&mut self, n: usize) {
        self.start += n;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    /// Reads into the free tail. `Ready(Ok(0))` is EOF.
    fn poll_fill<R: AsyncRead + Unpin>(
        &mut self,
        cx: &mut Context<'_>,
        rd: &mut R,
    ) -> Poll<io::Result<usize>> {
        let mut rb = ReadBuf::new(&mut self.buf[self.end..]);
        match Pin::new(rd).poll_read(cx, &mut rb) {
            Poll::Ready(Ok(())) => {
                let n = rb.filled().len();
                self.end += n;
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_drain<W: AsyncWrite + Unpin>(
        &mut self,
        cx: &mut Context<'_>,
        wr: &mut W,
    ) -> Poll<io::Result<usize>> {
        match Pin::new(wr).poll_write(cx, self.pending()) {
            Poll::Ready(Ok(0)) => Poll::Ready(Err(io::ErrorKind::WriteZero.into())),
            Poll::Ready(Ok(n)) => {
                self.consume(n);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }
}

/// Moves bytes between one yamux stream and the local end of a pipe.
struct Pump {
    mux: StreamHandle,
    local: DuplexStream,
    /// local -> mux
    up: Window,
    /// mux -> local
    down: Window,
    local_eof: bool,
    mux_eof: bool,
    local_shut: bool,
    mux_shut: bool,
}

impl Pump {
    fn new(mux: StreamHandle, local: DuplexStream) -> Self {
        Self {
            mux,
            local,
            up: Window::new(),
            down: Window::new(),
            local_eof: false,
            mux_eof: false,
            local_shut: false,
            mux_shut: false,
        }
    }

    /// A dropped pipe end refuses even empty writes; one that was only shut
    /// down still accepts them.
    fn local_dropped(&mut self, cx: &mut Context<'_>) -> bool {
        matches!(
            Pin::new(&mut self.local).poll_write(cx, &[]),
            Poll::Ready(Err(_))
        )
    }

    /// Finishes once both directions are shut down. An error drops the
    /// handle, which resets the stream.
    fn poll_run(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        for _ in 0..PUMP_BUDGET {
            let mut progress = false;

            // Applies window updates and registers for new frames; consumes
            // nothing.
            if !self.mux_eof {
                let mut empty = ReadBuf::new(&mut []);
                if let Poll::Ready(Err(e)) = Pin::new(&mut self.mux).poll_read(cx, &mut empty) {
                    return Poll::Ready(Err(e));
                }
            }

            if !self.mux_eof && self.down.has_room() {
                if let Poll::Ready(r) = self.down.poll_fill(cx, &mut self.mux) {
                    self.mux_eof = r? == 0;
                    progress = true;
                }
            }
            if !self.down.is_empty()
                && let Poll::Ready(r) = self.down.poll_drain(cx, &mut self.local)
            {
                r?;
                progress = true;
            }
            if self.mux_eof && self.down.is_empty() && !self.local_shut {
                if let Poll::Ready(r) = Pin::new(&mut self.local).poll_shutdown(cx) {
                    r?;
                    self.local_shut = true;
                    progress = true;
                }
            }

            if !self.local_eof && self.up.has_room() {
                if let Poll::Ready(r) = self.up.poll_fill(cx, &mut self.local) {
                    self.local_eof = r? == 0;
                    if self.local_eof && self.local_dropped(cx) {
                        // Nobody is left to read what the peer sends.
                        self.mux_eof = true;
                        self.local_shut = true;
                        self.down.consume(self.down.pending().len());
                    }
                    progress = true;
                }
            }
            if !self.up.is_empty()
                && let Poll::Ready(r) = self.up.poll_drain(cx, &mut self.mux)
            {
                r?;
                progress = true;
            }
            if self.local_eof && self.up.is_empty() && !self.mux_shut {
                if let Poll::Ready(r) = Pin::new(&mut self.mux).poll_shutdown(cx) {
                    r?;
                    self.mux_shut = true;
                    progress = true;
                }
            }

            if self.local_shut && self.mux_shut {
                return Poll::Ready(Ok(()));
            }
            if !progress {
                return Poll::Pending;
            }
        }
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    async fn pair() -> (MuxSession, MuxSession) {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), ln.accept());
        (
            MuxSession::client(dialed.unwrap()),
            MuxSession::server(accepted.unwrap().0),
        )
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31) ^ seed).collect()
    }

    #[tokio::test]
    async fn both_sides_write_before_reading() {
        let (client, server) = pair().await;
        let len = 2 * 1024 * 1024;

        let srv = tokio::spawn(async move {
            let st = server.accept_stream().await.unwrap();
            let (mut rd, mut wr) = tokio::io::split(st);
            let send = pattern(len, 7);
            let writer = async move {
                wr.write_all(&send).await.unwrap();
                wr.shutdown().await.unwrap();
            };
            let reader = async move {
                let mut got = Vec::new();
                rd.read_to_end(&mut got).await.unwrap();
                got
            };
            let ((), got) = tokio::join!(writer, reader);
            (server, got)
        });

        let st = client.open_stream().await.unwrap();
        let (mut rd, mut wr) = tokio::io::split(st);
        let send = pattern(len, 3);
        let writer = async move {
            wr.write_all(&send).await.unwrap();
            wr.shutdown().await.unwrap();
        };
        let reader = async move {
            let mut got = Vec::new();
            rd.read_to_end(&mut got).await.unwrap();
            got
        };
        let ((), got) = tokio::time::timeout(Duration::from_secs(20), async {
            tokio::join!(writer, reader)
        })
        .await
        .expect("transfer stalled");
        assert_eq!(got, pattern(len, 7));

        let (_server, srv_got) = srv.await.unwrap();
        assert_eq!(srv_got, pattern(len, 3));
    }

    #[tokio::test]
    async fn last_write_reaches_peer_before_close() {
        let (client, server) = pair().await;

        let srv = tokio::spawn(async move {
            let mut st = server.accept_stream().await.unwrap();
            st.write_all(b"rejected").await.unwrap();
            st.shutdown().await.unwrap();
            server.close().await;
        });

        let mut st = client.open_stream().await.unwrap();
        // The server only learns about the stream once something is sent.
        st.write_all(b"hello").await.unwrap();
        let mut got = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), st.read_to_end(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, b"rejected");
        srv.await.unwrap();
    }

    #[tokio::test]
    async fn accept_fails_once_peer_is_gone() {
        let (client, server) = pair().await;
        client.close().await;
        drop(client);
        let res = tokio::time::timeout(Duration::from_secs(5), server.accept_stream()).await;
        assert!(res.unwrap().is_err());
    }
}
