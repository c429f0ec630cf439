//! Client side of the control session.

use std::{collections::HashSet, net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{mpsc, watch},
    task::{JoinHandle, JoinSet},
    time::Instant,
};

use crate::ferry::tunnel::{
    auth,
    client::{Inner, Link, SessionState, p2p, transport_err, workconn},
    error::{self, TunnelError},
    msg::{
        self, Close, Login, LoginResp, Message, NewProxy, NewProxyResp, NewVisitor, PROTOCOL_VERSION,
        Ping,
    },
    nat::NatRole,
    transport::{BoxedStream, TransportDialOptions},
};

/// Why a session ended. `active` tells whether the login went through.
pub(crate) struct RunError {
    pub err: TunnelError,
    pub active: bool,
}

impl RunError {
    fn before_login(err: impl Into<TunnelError>) -> Self {
        Self {
            err: err.into(),
            active: false,
        }
    }
}

/// One connect, login and serve cycle. `Ok` means shutdown was requested.
pub(crate) async fn run_once(inner: Arc<Inner>, shutdown: watch::Receiver<bool>) -> Result<(), RunError> {
    inner.set_state(SessionState::LoggingIn);
    let opts = &inner.opts;

    let dial = inner.transport.dial(
        &opts.server_addr,
        TransportDialOptions {
            tcp_mux: opts.tcp_mux,
            quic: opts.quic.clone(),
        },
    );
    let session = tokio::time::timeout(opts.dial_timeout, dial)
        .await
        .map_err(|_| RunError::before_login(timed_out("dial")))?
        .map_err(|e| RunError::before_login(transport_err(e)))?;

    let mut st = session
        .open_stream()
        .await
        .map_err(|e| RunError::before_login(transport_err(e)))?;

    let resp = match tokio::time::timeout(opts.dial_timeout, login(&inner, &mut st)).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(err)) => {
            drop(st);
            session.close().await;
            return Err(RunError::before_login(err));
        }
        Err(_) => {
            drop(st);
            session.close().await;
            return Err(RunError::before_login(timed_out("login")));
        }
    };

    inner.run_id.store(Arc::new(resp.run_id.clone()));
    let nat_hole = match (resp.nat_hole_port, session.remote_addr()) {
        (Some(port), Some(addr)) => Some(SocketAddr::new(addr.ip(), port)),
        _ => None,
    };

    let (rd, wr) = tokio::io::split(st);
    let (tx, rx) = mpsc::channel(256);
    let (stop_tx, stop_rx) = watch::channel(false);
    let writer = tokio::spawn(write_loop(wr, rx, stop_rx));

    let link = Arc::new(Link {
        session: session.clone(),
        run_id: resp.run_id.clone(),
        nat_hole,
        tx,
    });
    inner.link.store(Some(link.clone()));
    inner.set_state(SessionState::Active);
    tracing::info!(
        transport=%inner.transport.name(),
        server=%opts.server_addr,
        run_id=%resp.run_id,
        resumed=resp.resumed.len(),
        "tunnel: logged in"
    );

    let (inbound, reader) = spawn_reader(rd);
    let res = serve(&inner, &link, inbound, &resp.resumed, shutdown).await;

    reader.abort();
    inner.link.store(None);
    inner.peerings.clear();
    let _ = stop_tx.send(true);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), writer).await;
    session.close().await;

    res.map_err(|err| RunError { err, active: true })
}

fn timed_out(what: &str) -> TunnelError {
    TunnelError::Transport(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("{what} timed out"),
    ))
}

async fn login(inner: &Inner, st: &mut BoxedStream) -> Result<LoginResp, TunnelError> {
    let opts = &inner.opts;
    let ts = auth::now_unix();
    let req = Message::Login(Login {
        version: PROTOCOL_VERSION.to_string(),
        run_id: inner.run_id.load().to_string(),
        user: opts.user.clone(),
        hostname: std::env::var("HOSTNAME").unwrap_or_default(),
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        timestamp: ts,
        privilege_key: auth::sign(&opts.auth_token, ts),
        metadata: opts.metadata.clone(),
    });
    msg::write_msg(st, &req).await?;
    match msg::read_msg(st).await? {
        Message::LoginResp(resp) => {
            error::check(resp.error.clone())?;
            if !msg::versions_compatible(PROTOCOL_VERSION, &resp.version) {
                return Err(TunnelError::VersionMismatch {
                    local: PROTOCOL_VERSION.to_string(),
                    remote: resp.version,
                });
            }
            Ok(resp)
        }
        other => Err(other.unexpected("LoginResp").into()),
    }
}

async fn write_loop(
    mut wr: WriteHalf<BoxedStream>,
    mut rx: mpsc::Receiver<Message>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            m = rx.recv() => {
                let Some(m) = m else { break };
                if let Err(err) = msg::write_msg(&mut wr, &m).await {
                    tracing::debug!(err=%err, "tunnel: control write failed");
                    break;
                }
            }
            _ = async { let _ = stop.wait_for(|s| *s).await; } => break,
        }
    }
    let _ = wr.shutdown().await;
}

/// Reads control frames on their own task; `serve` only sees whole messages.
fn spawn_reader(
    mut rd: ReadHalf<BoxedStream>,
) -> (mpsc::Receiver<Result<Message, TunnelError>>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(64);
    let task = tokio::spawn(async move {
        loop {
            let res = msg::read_msg(&mut rd).await.map_err(TunnelError::from);
            let failed = res.is_err();
            if tx.send(res).await.is_err() || failed {
                break;
            }
        }
    });
    (rx, task)
}

async fn serve(
    inner: &Arc<Inner>,
    link: &Arc<Link>,
    mut inbound: mpsc::Receiver<Result<Message, TunnelError>>,
    resumed: &[String],
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), TunnelError> {
    let opts = &inner.opts;
    let resumed: HashSet<&str> = resumed.iter().map(String::as_str).collect();

    for p in inner.proxies.values() {
        if resumed.contains(p.cfg.name.as_str()) {
            if let Some(mut s) = inner.status.get_mut(&p.cfg.name) {
                s.status = "running";
                s.error.clear();
            }
            continue;
        }
        link.send(Message::NewProxy(NewProxy { proxy: p.cfg.clone() }))
            .await?;
    }
    for v in &opts.visitors {
        let ts = auth::now_unix();
        link.send(Message::NewVisitor(NewVisitor {
            name: v.name.clone(),
            kind: v.kind,
            server_name: v.server_name.clone(),
            sign_key: auth::sign(&v.secret_key, ts),
            timestamp: ts,
            mode: v.mode,
        }))
        .await?;
    }

    let hb_interval = opts.heartbeat_interval;
    let hb_timeout = opts.effective_heartbeat_timeout();
    let mut ticker = tokio::time::interval(if hb_interval.is_zero() {
        std::time::Duration::from_secs(3600)
    } else {
        hb_interval
    });
    ticker.tick().await;
    let mut last_pong = Instant::now();
    // P2P providers live as long as this session; dropping the set aborts them.
    let mut providers = JoinSet::new();

    loop {
        let m = tokio::select! {
            _ = async { let _ = shutdown.wait_for(|s| *s).await; } => {
                let _ = link.send(Message::Close(Close { reason: "client shutdown".into() })).await;
                return Ok(());
            }
            _ = ticker.tick(), if !hb_interval.is_zero() => {
                if last_pong.elapsed() > hb_timeout {
                    return Err(TunnelError::HeartbeatTimeout);
                }
                link.send(Message::Ping(Ping { timestamp: auth::now_unix() })).await?;
                continue;
            }
            Some(_) = providers.join_next(), if !providers.is_empty() => continue,
            res = inbound.recv() => res.ok_or(TunnelError::SessionClosed)??,
        };

        match m {
            Message::Pong(_) => last_pong = Instant::now(),
            Message::NewProxyResp(resp) => on_proxy_resp(inner, resp),
            Message::NewVisitorResp(resp) => match resp.error {
                None => tracing::info!(visitor=%resp.name, "tunnel: visitor accepted"),
                Some(err) => {
                    tracing::warn!(visitor=%resp.name, code=%err.code.as_str(), err=%err.message, "tunnel: visitor rejected");
                }
            },
            Message::ReqWorkConn(req) => {
                let inner = inner.clone();
                let link = link.clone();
                tokio::spawn(async move {
                    let proxy = req.proxy_name.clone();
                    if let Err(err) = workconn::handle(inner, link, req).await {
                        tracing::debug!(proxy=%proxy, err=%err, "tunnel: work connection failed");
                    }
                });
            }
            Message::NatCandidates(nc) if nc.role == NatRole::Visitor => {
                let inner = inner.clone();
                let link = link.clone();
                providers.spawn(p2p::serve_provider(inner, link, nc));
            }
            Message::NatCandidates(nc) => {
                match inner.peerings.remove(&nc.peering_id) {
                    Some((_, tx)) => {
                        let _ = tx.send(nc);
                    }
                    None => tracing::debug!(peering_id=%nc.peering_id, "tunnel: candidates for unknown peering"),
                }
            }
            Message::Close(c) => {
                tracing::warn!(reason=%c.reason, "tunnel: server closed the session");
                return Err(TunnelError::SessionClosed);
            }
            other => {
                tracing::debug!(msg=other.name(), "tunnel: unexpected message on control stream");
            }
        }
    }
}

fn on_proxy_resp(inner: &Inner, resp: NewProxyResp) {
    let Some(mut s) = inner.status.get_mut(&resp.name) else {
        tracing::debug!(proxy=%resp.name, "tunnel: response for unknown proxy");
        return;
    };
    match resp.error {
        None => {
            tracing::info!(proxy=%resp.name, kind=%s.kind, remote_addr=%resp.remote_addr, "tunnel: proxy started");
            s.status = "running";
            s.remote_addr = resp.remote_addr;
            s.error.clear();
        }
        Some(err) => {
            tracing::warn!(proxy=%resp.name, code=%err.code.as_str(), err=%err.message, "tunnel: proxy rejected");
            s.status = "error";
            s.error = err.message;
        }
    }
}
