use std::{
    sync::{Arc, OnceLock},
    time::Duration,
};

use tokio::{net::UdpSocket, sync::watch};

use crate::ferry::{
    net::{self, SpliceOptions},
    tunnel::{
        error::TunnelError,
        msg::{self, Message},
        nat::NatOptions,
        transport::{
            BoxedStream, QuicListenOptions, TransportListenOptions, TransportListener,
            TransportSession, transport_by_name,
        },
    },
};

pub mod broker;
pub mod control;
pub mod listener;
pub mod nathole;
pub mod registry;
pub mod vhost;
pub mod visitor;

use broker::Broker;
use control::{SessionSnapshot, SessionTable};
use listener::{ListenerManager, ListenerOptions};
use nathole::NatHole;
use registry::{ProxySnapshot, Registry};

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub bind_addr: String,
    pub transport: String,
    pub tcp_mux: bool,
    pub auth_token: String,
    pub quic: QuicListenOptions,
    pub listeners: ListenerOptions,
    /// A session with no `Ping` for this long is dropped. Zero disables.
    pub heartbeat_timeout: Duration,
    pub work_conn_timeout: Duration,
    /// Limit for the first message on a new stream.
    pub handshake_timeout: Duration,
    /// How long a lost session's proxies wait for the same run id.
    pub resume_grace: Duration,
    /// Zero means unlimited.
    pub max_proxies_per_session: usize,
    /// UDP address answering reflexive-address probes. Empty disables it.
    pub nat_hole_bind_addr: String,
    pub nat: NatOptions,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7000".into(),
            transport: "tcp".into(),
            tcp_mux: true,
            auth_token: String::new(),
            quic: QuicListenOptions::default(),
            listeners: ListenerOptions::default(),
            heartbeat_timeout: Duration::from_secs(90),
            work_conn_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            resume_grace: Duration::from_secs(30),
            max_proxies_per_session: 0,
            nat_hole_bind_addr: String::new(),
            nat: NatOptions::default(),
        }
    }
}

/// State shared by every session of one server.
pub(crate) struct Shared {
    pub opts: ServerOptions,
    pub sessions: SessionTable,
    pub registry: Registry,
    pub broker: Arc<Broker>,
    pub nathole: NatHole,
    pub nat_hole_port: OnceLock<u16>,
    pub splice: SpliceOptions,
}

#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
}

impl Server {
    pub fn new(opts: ServerOptions) -> anyhow::Result<Self> {
        crate::ferry::tunnel::transport::parse_transport(&opts.transport)?;
        let broker = Arc::new(Broker::new(opts.work_conn_timeout, opts.auth_token.clone()));
        let listeners = Arc::new(ListenerManager::new(opts.listeners.clone(), broker.clone()));
        let registry = Registry::new(listeners, opts.max_proxies_per_session);
        let nathole = NatHole::new(opts.nat.weights, opts.nat.negotiation_timeout);
        let splice = opts.listeners.splice.clone();
        Ok(Self {
            shared: Arc::new(Shared {
                opts,
                sessions: SessionTable::new(),
                registry,
                broker,
                nathole,
                nat_hole_port: OnceLock::new(),
                splice,
            }),
        })
    }

    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        self.shared.sessions.snapshot()
    }

    pub fn proxies(&self) -> Vec<ProxySnapshot> {
        self.shared.registry.snapshot()
    }

    pub async fn listen(&self) -> anyhow::Result<Box<dyn TransportListener>> {
        let opts = &self.shared.opts;
        let tr = transport_by_name(&opts.transport)?;
        let ln = tr
            .listen(
                &opts.bind_addr,
                TransportListenOptions {
                    tcp_mux: opts.tcp_mux,
                    quic: opts.quic.clone(),
                },
            )
            .await?;
        tracing::info!(
            addr = ?ln.local_addr(),
            transport = %tr.name(),
            tcp_mux = opts.tcp_mux,
            "tunnel: listening"
        );
        Ok(ln)
    }

    pub async fn listen_and_serve(&self, ctx: watch::Receiver<bool>) -> anyhow::Result<()> {
        let ln = self.listen().await?;
        self.serve(ln, ctx).await
    }

    /// Accepts sessions on `ln` until `ctx` turns true, then releases every
    /// proxy and listener.
    pub async fn serve(
        &self,
        ln: Box<dyn TransportListener>,
        ctx: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let addr = self.shared.opts.nat_hole_bind_addr.trim();
        if !addr.is_empty() {
            let sock = UdpSocket::bind(net::normalize_bind_addr(addr).as_ref()).await?;
            let port = sock.local_addr()?.port();
            let _ = self.shared.nat_hole_port.set(port);
            tracing::info!(addr=%addr, port, "tunnel: nat hole probe responder listening");
            tokio::spawn(nathole::serve_probes(sock, ctx.clone()));
        }

        let mut shutdown = ctx;
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                sess = ln.accept() => {
                    let sess = match sess {
                        Ok(s) => s,
                        Err(err) => {
                            tracing::warn!(err=%err, "tunnel: accept failed");
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            continue;
                        }
                    };
                    tokio::spawn(handle_session(self.shared.clone(), sess));
                }
            }
        }

        tracing::info!(
            sessions = self.shared.sessions.len(),
            pending_work_conns = self.shared.broker.pending_len(),
            peerings = self.shared.nathole.len(),
            "tunnel: shutting down"
        );
        self.shared.sessions.close_all();
        self.shared.registry.release_all().await;
        ln.close().await?;
        Ok(())
    }
}

async fn handle_session(shared: Arc<Shared>, sess: Arc<dyn TransportSession>) {
    while let Ok(st) = sess.accept_stream().await {
        let shared = shared.clone();
        let sess = sess.clone();
        tokio::spawn(async move {
            if let Err(err) = dispatch_stream(shared, sess.clone(), st).await {
                tracing::debug!(client=?sess.remote_addr(), err=%err, "tunnel: stream ended with error");
            }
        });
    }
}

/// Routes a new stream by its first message.
async fn dispatch_stream(
    shared: Arc<Shared>,
    sess: Arc<dyn TransportSession>,
    mut st: BoxedStream,
) -> Result<(), TunnelError> {
    let first = tokio::time::timeout(shared.opts.handshake_timeout, msg::read_msg(&mut st))
        .await
        .map_err(|_| {
            TunnelError::Transport(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "no handshake message",
            ))
        })??;

    match first {
        Message::Login(login) => control::serve(shared, sess, st, login).await,
        Message::NewWorkConn(req) => shared.broker.fulfill(req, st).await,
        Message::NewVisitorConn(req) => visitor::serve_conn(shared, req, st).await,
        other => Err(other.unexpected("Login, NewWorkConn or NewVisitorConn").into()),
    }
}

