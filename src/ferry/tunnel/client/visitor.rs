//! Local endpoints for secret proxies published by other clients.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream, UdpSocket},
    sync::{Mutex, watch},
};

use crate::ferry::{
    net::{self, SpliceOptions},
    tunnel::{
        auth,
        client::{Inner, p2p, transport_err},
        datagram::{self, UdpFlowOptions},
        error::{self, TunnelError},
        kind::{VisitorConfig, VisitorMode},
        msg::{self, Message, NewVisitorConn},
        transport::{BoxedStream, TransportSession},
    },
};

pub(crate) enum VisitorListener {
    Tcp(TcpListener),
    Udp(UdpSocket),
}

/// Binds the visitor's local address. Listeners outlive reconnects.
pub(crate) async fn bind(cfg: &VisitorConfig) -> anyhow::Result<VisitorListener> {
    let addr = net::normalize_bind_addr(&cfg.bind_addr);
    let ln = if cfg.kind.is_datagram() {
        VisitorListener::Udp(UdpSocket::bind(addr.as_ref()).await?)
    } else {
        VisitorListener::Tcp(TcpListener::bind(addr.as_ref()).await?)
    };
    tracing::info!(visitor=%cfg.name, kind=%cfg.kind, addr=%addr, mode=%cfg.mode, "tunnel: visitor listening");
    Ok(ln)
}

pub(crate) async fn serve(
    inner: Arc<Inner>,
    cfg: VisitorConfig,
    ln: VisitorListener,
    shutdown: watch::Receiver<bool>,
) {
    let cfg = Arc::new(cfg);
    match ln {
        VisitorListener::Tcp(ln) => serve_tcp(inner, cfg, ln, shutdown).await,
        VisitorListener::Udp(sock) => {
            let name = cfg.name.clone();
            let res = datagram::serve_udp_flows(
                Arc::new(sock),
                UdpFlowOptions::default(),
                shutdown,
                move |_peer| {
                    let inner = inner.clone();
                    let cfg = cfg.clone();
                    async move { Ok(open_relayed(&inner, &cfg).await?) }
                },
            )
            .await;
            if let Err(err) = res {
                tracing::warn!(visitor=%name, err=%err, "tunnel: visitor udp listener failed");
            }
        }
    }
}

async fn serve_tcp(
    inner: Arc<Inner>,
    cfg: Arc<VisitorConfig>,
    ln: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    let direct = Arc::new(DirectPath::default());
    loop {
        tokio::select! {
            _ = async { let _ = shutdown.wait_for(|s| *s).await; } => break,
            res = ln.accept() => {
                let (c, peer) = match res {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::warn!(visitor=%cfg.name, err=%err, "tunnel: accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                };
                let inner = inner.clone();
                let cfg = cfg.clone();
                let direct = direct.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_conn(&inner, &cfg, &direct, c, peer).await {
                        tracing::warn!(visitor=%cfg.name, client=%peer, err=%err, "tunnel: visitor connection failed");
                    }
                });
            }
        }
    }
}

async fn handle_conn(
    inner: &Inner,
    cfg: &VisitorConfig,
    direct: &DirectPath,
    c: TcpStream,
    peer: SocketAddr,
) -> Result<(), TunnelError> {
    let st = match cfg.mode {
        VisitorMode::Relayed => open_relayed(inner, cfg).await?,
        VisitorMode::Direct => match direct.open(inner, cfg).await {
            Ok(st) => st,
            Err(err) if cfg.fallback_to_relay => {
                tracing::info!(visitor=%cfg.name, err=%err, "tunnel: direct path failed; relaying");
                open_relayed(inner, cfg).await?
            }
            Err(err) => return Err(err),
        },
    };
    let _ = c.set_nodelay(true);
    let stats = net::splice(c, st, SpliceOptions::default()).await;
    tracing::debug!(visitor=%cfg.name, client=%peer, up=stats.a_to_b, down=stats.b_to_a, "tunnel: visitor connection closed");
    Ok(())
}

/// Opens a stream to the provider through the server.
pub(crate) async fn open_relayed(inner: &Inner, cfg: &VisitorConfig) -> Result<BoxedStream, TunnelError> {
    let link = inner.current_link()?;
    let mut st = link.session.open_stream().await.map_err(transport_err)?;
    handshake(&mut st, &link.run_id, cfg, inner.opts.dial_timeout).await?;
    Ok(st)
}

/// Sends `NewVisitorConn` and waits for the answer. Used on relayed streams
/// and on streams of a direct path alike.
async fn handshake(
    st: &mut BoxedStream,
    run_id: &str,
    cfg: &VisitorConfig,
    wait: Duration,
) -> Result<(), TunnelError> {
    let ts = auth::now_unix();
    let req = Message::NewVisitorConn(NewVisitorConn {
        run_id: run_id.to_string(),
        proxy_name: cfg.server_name.clone(),
        sign_key: auth::sign(&cfg.secret_key, ts),
        timestamp: ts,
    });
    msg::write_msg(st, &req).await?;
    let resp = tokio::time::timeout(wait, msg::read_msg(st))
        .await
        .map_err(|_| TunnelError::WorkConnectionTimeout)??;
    match resp {
        Message::NewVisitorConnResp(r) => error::check(r.error),
        other => Err(other.unexpected("NewVisitorConnResp").into()),
    }
}

/// The direct QUIC session of one visitor, negotiated on first use and
/// renegotiated once it stops accepting streams.
#[derive(Default)]
struct DirectPath {
    session: Mutex<Option<Arc<dyn TransportSession>>>,
}

impl DirectPath {
    async fn open(&self, inner: &Inner, cfg: &VisitorConfig) -> Result<BoxedStream, TunnelError> {
        let run_id = inner.run_id.load().to_string();
        let wait = inner.opts.dial_timeout;

        let mut cur = self.session.lock().await;
        if let Some(s) = cur.as_ref() {
            match s.open_stream().await {
                Ok(mut st) => match handshake(&mut st, &run_id, cfg, wait).await {
                    Ok(()) => return Ok(st),
                    Err(err) => tracing::debug!(visitor=%cfg.name, err=%err, "tunnel: direct path rejected stream"),
                },
                Err(err) => tracing::debug!(visitor=%cfg.name, err=%err, "tunnel: direct path lost"),
            }
            if let Some(old) = cur.take() {
                old.close().await;
            }
        }

        let session = p2p::connect(inner, cfg).await?;
        let mut st = session.open_stream().await.map_err(transport_err)?;
        handshake(&mut st, &run_id, cfg, wait).await?;
        *cur = Some(session);
        Ok(st)
    }
}
