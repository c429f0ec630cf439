use std::{
    collections::HashMap,
    future::Future,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::UdpSocket,
    sync::{mpsc, watch},
};

use crate::ferry::tunnel::{
    msg::{MAX_DATAGRAM_BYTES, ProtocolError},
    transport::BoxedStream,
};

/// Datagram framing over a tunnel stream.
///
/// Each datagram is encoded as: `u32be len` + `payload`.
pub async fn read_datagram<R: AsyncRead + Unpin>(
    r: &mut R,
    buf: &mut Vec<u8>,
) -> Result<usize, ProtocolError> {
    let n = r.read_u32().await?;
    if n > MAX_DATAGRAM_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }
    let n = n as usize;
    if n > buf.len() {
        buf.resize(n, 0);
    }
    r.read_exact(&mut buf[..n]).await?;
    Ok(n)
}

pub async fn write_datagram<W: AsyncWrite + Unpin>(
    w: &mut W,
    payload: &[u8],
) -> Result<(), ProtocolError> {
    let n: u32 = payload
        .len()
        .try_into()
        .map_err(|_| ProtocolError::PayloadTooLarge(u32::MAX))?;
    if n > MAX_DATAGRAM_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }
    w.write_u32(n).await?;
    w.write_all(payload).await?;
    w.flush().await?;
    Ok(())
}

/// Relays framed datagrams between a tunnel stream and a connected UDP socket
/// until either side fails.
pub async fn relay_connected(st: BoxedStream, sock: UdpSocket) -> anyhow::Result<()> {
    let sock = Arc::new(sock);
    let (mut rd, mut wr) = tokio::io::split(st);

    let to_local = sock.clone();
    let mut t1 = tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = read_datagram(&mut rd, &mut buf).await?;
            to_local.send(&buf[..n]).await?;
        }
        #[allow(unreachable_code)]
        Ok::<(), anyhow::Error>(())
    });

    let from_local = sock;
    let mut t2 = tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = from_local.recv(&mut buf).await?;
            write_datagram(&mut wr, &buf[..n]).await?;
        }
        #[allow(unreachable_code)]
        Ok::<(), anyhow::Error>(())
    });

    // Either direction ending tears down the pair.
    let res = tokio::select! {
        r = &mut t1 => { t2.abort(); r }
        r = &mut t2 => { t1.abort(); r }
    };
    res?
}

#[derive(Debug, Clone)]
pub struct UdpFlowOptions {
    /// How long to keep per-peer UDP flows alive without activity.
    pub idle_timeout: Duration,
    pub queue_len: usize,
}

impl Default for UdpFlowOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            queue_len: 256,
        }
    }
}

struct UdpFlow {
    tx: mpsc::Sender<Vec<u8>>,
    task: tokio::task::JoinHandle<()>,
    last: Instant,
}

/// Serves a public-facing UDP socket by opening one tunnel stream per remote
/// peer. `open` runs inside the flow task so a slow tunnel never stalls the
/// receive loop for other peers.
pub async fn serve_udp_flows<F, Fut>(
    sock: Arc<UdpSocket>,
    opts: UdpFlowOptions,
    mut stop: watch::Receiver<bool>,
    open: F,
) -> anyhow::Result<()>
where
    F: Fn(SocketAddr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<BoxedStream>> + Send + 'static,
{
    let open = Arc::new(open);
    let mut flows: HashMap<SocketAddr, UdpFlow> = HashMap::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut tick = tokio::time::interval(Duration::from_secs(5));

    loop {
        tokio::select! {
            _ = stop.changed() => {
                if *stop.borrow() { break; }
            }
            _ = tick.tick() => {
                let now = Instant::now();
                let idle = opts.idle_timeout;
                if idle > Duration::from_millis(0) {
                    let dead: Vec<SocketAddr> = flows
                        .iter()
                        .filter_map(|(k, v)| if now.duration_since(v.last) > idle || v.task.is_finished() { Some(*k) } else { None })
                        .collect();
                    for k in dead {
                        if let Some(f) = flows.remove(&k) {
                            f.task.abort();
                        }
                    }
                }
            }
            res = sock.recv_from(&mut buf) => {
                let (n, peer) = match res {
                    Ok(v) => v,
                    Err(err) => {
                        // ICMP port unreachable surfaces as a recv error on some platforms.
                        tracing::debug!(err=%err, "tunnel: udp recv failed");
                        continue;
                    }
                };
                let payload = buf[..n].to_vec();

                let stale = flows.get(&peer).is_some_and(|f| f.tx.is_closed());
                if stale {
                    if let Some(f) = flows.remove(&peer) {
                        f.task.abort();
                    }
                }

                let flow = flows.entry(peer).or_insert_with(|| {
                    let (tx, rx) = mpsc::channel(opts.queue_len.max(1));
                    let task = tokio::spawn(run_flow(sock.clone(), peer, rx, open.clone()));
                    tracing::debug!(peer=%peer, "tunnel: udp flow created");
                    UdpFlow { tx, task, last: Instant::now() }
                });
                flow.last = Instant::now();
                // Drop on backpressure, like the network would.
                let _ = flow.tx.try_send(payload);
            }
        }
    }

    for (_k, f) in flows.drain() {
        f.task.abort();
    }
    Ok(())
}

async fn run_flow<F, Fut>(
    sock: Arc<UdpSocket>,
    peer: SocketAddr,
    mut rx: mpsc::Receiver<Vec<u8>>,
    open: Arc<F>,
) where
    F: Fn(SocketAddr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<BoxedStream>> + Send + 'static,
{
    let st = match open(peer).await {
        Ok(st) => st,
        Err(err) => {
            tracing::debug!(peer=%peer, err=%err, "tunnel: udp flow open failed");
            return;
        }
    };
    let (mut rd, mut wr) = tokio::io::split(st);

    let mut down = tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = read_datagram(&mut rd, &mut buf).await?;
            sock.send_to(&buf[..n], peer).await?;
        }
        #[allow(unreachable_code)]
        Ok::<(), anyhow::Error>(())
    });

    let up = async {
        while let Some(d) = rx.recv().await {
            write_datagram(&mut wr, &d).await?;
        }
        Ok::<(), anyhow::Error>(())
    };

    tokio::select! {
        res = up => {
            if let Err(err) = res {
                tracing::debug!(peer=%peer, err=%err, "tunnel: udp flow ended");
            }
        }
        res = &mut down => {
            if let Ok(Err(err)) = res {
                tracing::debug!(peer=%peer, err=%err, "tunnel: udp flow ended");
            }
        }
    }
    down.abort();
}
