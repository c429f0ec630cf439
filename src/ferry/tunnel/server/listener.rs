//! Public sockets for registered proxies.
//!
//! `tcp` and `udp` proxies each own a port. `http`, `https` and `tcpmux`
//! proxies share one listener per kind; the listener lives as long as at least
//! one proxy routes through it.

use std::{
    borrow::Cow,
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    ops::RangeInclusive,
    str::FromStr,
    sync::{Arc, Weak},
    time::Duration,
};

use rand::{RngExt, rng};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    sync::{Mutex, watch},
    task::JoinHandle,
};

use crate::ferry::{
    net::{self, SpliceOptions},
    tunnel::{
        datagram::{self, UdpFlowOptions},
        error::TunnelError,
        kind::{Binding, PortProto, ProxyConfig, VhostKind},
        server::{
            broker::Broker,
            registry::ProxyRoute,
            vhost::{self, ParseError, VhostRouter},
        },
    },
};

const MAX_SNIFF_BYTES: usize = 16 * 1024;

/// Set of allowed public ports, written as `"2000-3000,3306,8000-9000"`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortRanges(Vec<RangeInclusive<u16>>);

impl PortRanges {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// An empty set allows every port.
    pub fn contains(&self, port: u16) -> bool {
        self.0.is_empty() || self.0.iter().any(|r| r.contains(&port))
    }

    fn pick(&self) -> Option<u16> {
        let total: u32 = self
            .0
            .iter()
            .map(|r| u32::from(*r.end()) - u32::from(*r.start()) + 1)
            .sum();
        if total == 0 {
            return None;
        }
        let mut n = rng().random_range(0..total);
        for r in &self.0 {
            let len = u32::from(*r.end()) - u32::from(*r.start()) + 1;
            if n < len {
                return u16::try_from(u32::from(*r.start()) + n).ok();
            }
            n -= len;
        }
        None
    }
}

impl FromStr for PortRanges {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = |p: &str| TunnelError::InvalidConfig(format!("invalid port range {p:?}"));
        let mut out = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (lo, hi) = match part.split_once('-') {
                Some((a, b)) => (a.trim(), b.trim()),
                None => (part, part),
            };
            let lo: u16 = lo.parse().map_err(|_| bad(part))?;
            let hi: u16 = hi.parse().map_err(|_| bad(part))?;
            if lo == 0 || lo > hi {
                return Err(bad(part));
            }
            out.push(lo..=hi);
        }
        Ok(Self(out))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListenerOptions {
    /// IP for per-proxy ports. Empty means all interfaces.
    pub proxy_bind_addr: String,
    pub allow_ports: PortRanges,
    pub vhost_http_port: Option<u16>,
    pub vhost_https_port: Option<u16>,
    pub tcpmux_http_connect_port: Option<u16>,
    pub subdomain_host: String,
    /// Bound on reading the routing header of a vhost connection.
    pub sniff_timeout: Duration,
    pub udp: UdpFlowOptions,
    pub splice: SpliceOptions,
}

/// Keeps a proxy's public binding alive. [`ListenerGuard::shutdown`] waits for
/// the accept loop to exit so the port can be reused right away.
pub struct ListenerGuard {
    stop: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
    lease: Option<VhostLease>,
}

impl ListenerGuard {
    fn none() -> Self {
        Self {
            stop: None,
            task: None,
            lease: None,
        }
    }

    fn task(stop: watch::Sender<bool>, task: JoinHandle<()>) -> Self {
        Self {
            stop: Some(stop),
            task: Some(task),
            lease: None,
        }
    }

    pub async fn shutdown(mut self) {
        self.lease.take();
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }
        if let Some(task) = self.task.take() {
            if tokio::time::timeout(Duration::from_secs(1), task).await.is_err() {
                tracing::warn!("tunnel: listener did not stop in time");
            }
        }
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }
    }
}

struct SharedVhost {
    kind: VhostKind,
    port: u16,
    router: Arc<VhostRouter>,
    stop: watch::Sender<bool>,
}

impl Drop for SharedVhost {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
        tracing::info!(kind=?self.kind, port=self.port, "tunnel: vhost listener stopped");
    }
}

struct VhostLease {
    shared: Arc<SharedVhost>,
    domains: Vec<String>,
    route_id: u64,
}

impl Drop for VhostLease {
    fn drop(&mut self) {
        for d in &self.domains {
            self.shared.router.remove(d, self.route_id);
        }
    }
}

struct Forwarder {
    broker: Arc<Broker>,
    splice: SpliceOptions,
}

pub struct ListenerManager {
    opts: ListenerOptions,
    fw: Arc<Forwarder>,
    vhosts: Mutex<HashMap<VhostKind, Weak<SharedVhost>>>,
}

impl ListenerManager {
    pub fn new(opts: ListenerOptions, broker: Arc<Broker>) -> Self {
        let fw = Arc::new(Forwarder {
            broker,
            splice: opts.splice.clone(),
        });
        Self {
            opts,
            fw,
            vhosts: Mutex::new(HashMap::new()),
        }
    }

    /// Creates the public binding for `route` and returns it with the address
    /// reported back to the client.
    pub async fn bind(&self, route: &Arc<ProxyRoute>) -> Result<(ListenerGuard, String), TunnelError> {
        match route.kind().binding() {
            Binding::Secret => Ok((ListenerGuard::none(), String::new())),
            Binding::Port(PortProto::Tcp) => {
                let ln = self
                    .bind_port(route.config.remote_port, |a| TcpListener::bind(a))
                    .await?;
                let addr = ln.local_addr()?;
                let (stop, rx) = watch::channel(false);
                let task = tokio::spawn(serve_tcp(ln, route.clone(), self.fw.clone(), rx));
                Ok((ListenerGuard::task(stop, task), addr.to_string()))
            }
            Binding::Port(PortProto::Udp) => {
                let sock = self
                    .bind_port(route.config.remote_port, |a| UdpSocket::bind(a))
                    .await?;
                let addr = sock.local_addr()?;
                let (stop, rx) = watch::channel(false);
                let task = tokio::spawn(serve_udp(
                    Arc::new(sock),
                    route.clone(),
                    self.fw.clone(),
                    self.opts.udp.clone(),
                    rx,
                ));
                Ok((ListenerGuard::task(stop, task), addr.to_string()))
            }
            Binding::Vhost(kind) => self.bind_vhost(kind, route).await,
        }
    }

    fn bind_ip(&self) -> Result<IpAddr, TunnelError> {
        let ip = self.opts.proxy_bind_addr.trim();
        if ip.is_empty() {
            return Ok(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        }
        ip.parse()
            .map_err(|_| TunnelError::InvalidConfig(format!("invalid proxy_bind_addr {ip:?}")))
    }

    async fn bind_port<T, F, Fut>(&self, requested: Option<u16>, bind: F) -> Result<T, TunnelError>
    where
        F: Fn(SocketAddr) -> Fut,
        Fut: Future<Output = std::io::Result<T>>,
    {
        let ip = self.bind_ip()?;
        let allow = &self.opts.allow_ports;
        match requested.unwrap_or(0) {
            0 if allow.is_empty() => Ok(bind(SocketAddr::new(ip, 0)).await?),
            0 => {
                let mut last = None;
                for _ in 0..32 {
                    let Some(p) = allow.pick() else { break };
                    match bind(SocketAddr::new(ip, p)).await {
                        Ok(v) => return Ok(v),
                        Err(err) => last = Some(err),
                    }
                }
                Err(TunnelError::Transport(last.unwrap_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::AddrNotAvailable,
                        "no allowed port is free",
                    )
                })))
            }
            p if !allow.contains(p) => Err(TunnelError::PortNotAllowed(p)),
            p => Ok(bind(SocketAddr::new(ip, p)).await?),
        }
    }

    fn vhost_port(&self, kind: VhostKind) -> Option<u16> {
        match kind {
            VhostKind::Http => self.opts.vhost_http_port,
            VhostKind::Https => self.opts.vhost_https_port,
            VhostKind::Tcpmux => self.opts.tcpmux_http_connect_port,
        }
    }

    fn vhost_domains(&self, cfg: &ProxyConfig) -> Result<Vec<String>, TunnelError> {
        let mut out: Vec<String> = cfg
            .custom_domains
            .iter()
            .map(|d| d.trim().to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        if let Some(sub) = cfg.subdomain.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            let host = self.opts.subdomain_host.trim();
            if host.is_empty() {
                return Err(TunnelError::InvalidConfig(
                    "subdomain is not enabled on this server".into(),
                ));
            }
            if sub.contains('.') {
                return Err(TunnelError::InvalidConfig(format!(
                    "subdomain {sub:?} must not contain '.'"
                )));
            }
            out.push(format!("{}.{}", sub.to_ascii_lowercase(), host.to_ascii_lowercase()));
        }
        out.sort();
        out.dedup();
        Ok(out)
    }

    async fn bind_vhost(
        &self,
        kind: VhostKind,
        route: &Arc<ProxyRoute>,
    ) -> Result<(ListenerGuard, String), TunnelError> {
        let Some(port) = self.vhost_port(kind) else {
            return Err(TunnelError::TypeUnsupported(route.kind().to_string()));
        };
        let domains = self.vhost_domains(&route.config)?;

        let shared = self.shared_vhost(kind, port).await?;
        shared.router.insert_all(&domains, route)?;

        let scheme = match kind {
            VhostKind::Http => "http",
            VhostKind::Https => "https",
            VhostKind::Tcpmux => "tcpmux",
        };
        let remote_addr = domains
            .iter()
            .map(|d| format!("{scheme}://{d}:{}", shared.port))
            .collect::<Vec<_>>()
            .join(",");

        let lease = VhostLease {
            shared,
            domains,
            route_id: route.id,
        };
        let mut guard = ListenerGuard::none();
        guard.lease = Some(lease);
        Ok((guard, remote_addr))
    }

    async fn shared_vhost(&self, kind: VhostKind, port: u16) -> Result<Arc<SharedVhost>, TunnelError> {
        let mut vhosts = self.vhosts.lock().await;
        if let Some(v) = vhosts.get(&kind).and_then(Weak::upgrade) {
            return Ok(v);
        }

        let addr = SocketAddr::new(self.bind_ip()?, port);
        // A listener that just lost its last route may still hold the port.
        let mut attempt = 0;
        let ln = loop {
            match TcpListener::bind(addr).await {
                Ok(ln) => break ln,
                Err(err) if err.kind() == std::io::ErrorKind::AddrInUse && attempt < 10 => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(err) => return Err(err.into()),
            }
        };
        let port = ln.local_addr()?.port();

        let router = Arc::new(VhostRouter::new());
        let (stop, rx) = watch::channel(false);
        let sniff_timeout = if self.opts.sniff_timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            self.opts.sniff_timeout
        };
        tokio::spawn(serve_vhost(
            ln,
            kind,
            router.clone(),
            self.fw.clone(),
            sniff_timeout,
            rx,
        ));
        tracing::info!(kind=?kind, port, "tunnel: vhost listener started");

        let shared = Arc::new(SharedVhost {
            kind,
            port,
            router,
            stop,
        });
        vhosts.insert(kind, Arc::downgrade(&shared));
        Ok(shared)
    }
}

async fn serve_tcp(
    ln: TcpListener,
    route: Arc<ProxyRoute>,
    fw: Arc<Forwarder>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => {
                if *stop.borrow() {
                    break;
                }
            }
            res = ln.accept() => {
                let (c, peer) = match res {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::warn!(proxy=%route.name(), err=%err, "tunnel: accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                };
                let route = route.clone();
                let fw = fw.clone();
                tokio::spawn(async move {
                    if let Err(err) = forward_tcp(&fw, &route, c, peer, &[]).await {
                        tracing::debug!(proxy=%route.name(), client=%peer, err=%err, "tunnel: inbound connection failed");
                    }
                });
            }
        }
    }
}

async fn forward_tcp(
    fw: &Forwarder,
    route: &ProxyRoute,
    c: TcpStream,
    peer: SocketAddr,
    prelude: &[u8],
) -> Result<(), TunnelError> {
    let Some(_permit) = route.admit() else {
        tracing::debug!(proxy=%route.name(), client=%peer, "tunnel: max_connections reached");
        return Ok(());
    };
    let _ = c.set_nodelay(true);
    let dst = c.local_addr().map(|a| a.to_string()).unwrap_or_default();
    let mut work = fw.broker.request(route, peer.to_string(), dst).await?;
    if !prelude.is_empty() {
        work.write_all(prelude).await?;
    }
    let stats = net::splice(c, work, fw.splice.clone()).await;
    tracing::debug!(proxy=%route.name(), client=%peer, up=stats.a_to_b, down=stats.b_to_a, "tunnel: connection closed");
    Ok(())
}

async fn serve_udp(
    sock: Arc<UdpSocket>,
    route: Arc<ProxyRoute>,
    fw: Arc<Forwarder>,
    opts: UdpFlowOptions,
    stop: watch::Receiver<bool>,
) {
    let dst = sock.local_addr().map(|a| a.to_string()).unwrap_or_default();
    let name = route.name().to_string();
    let res = datagram::serve_udp_flows(sock, opts, stop, move |peer| {
        let fw = fw.clone();
        let route = route.clone();
        let dst = dst.clone();
        async move {
            let st = fw.broker.request(&route, peer.to_string(), dst).await?;
            Ok(st)
        }
    })
    .await;
    if let Err(err) = res {
        tracing::warn!(proxy=%name, err=%err, "tunnel: udp listener failed");
    }
}

async fn serve_vhost(
    ln: TcpListener,
    kind: VhostKind,
    router: Arc<VhostRouter>,
    fw: Arc<Forwarder>,
    sniff_timeout: Duration,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => {
                if *stop.borrow() {
                    break;
                }
            }
            res = ln.accept() => {
                let (c, peer) = match res {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::warn!(kind=?kind, err=%err, "tunnel: vhost accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                };
                let router = router.clone();
                let fw = fw.clone();
                tokio::spawn(async move {
                    handle_vhost_conn(kind, &router, &fw, c, peer, sniff_timeout).await;
                });
            }
        }
    }
}

async fn handle_vhost_conn(
    kind: VhostKind,
    router: &VhostRouter,
    fw: &Forwarder,
    mut c: TcpStream,
    peer: SocketAddr,
    sniff_timeout: Duration,
) {
    let mut captured: Vec<u8> = Vec::with_capacity(4096);
    let mut tmp = vec![0u8; 4096];

    let read_fut = async {
        loop {
            if captured.len() >= MAX_SNIFF_BYTES {
                break Err(ParseError::NoMatch);
            }
            let n = c.read(&mut tmp).await.map_err(|_| ParseError::NoMatch)?;
            if n == 0 {
                break Err(ParseError::NoMatch);
            }
            let need = (MAX_SNIFF_BYTES - captured.len()).min(n);
            captured.extend_from_slice(&tmp[..need]);
            match vhost::sniff(kind, &captured) {
                Ok(s) => break Ok(s),
                Err(ParseError::NeedMoreData) => continue,
                Err(e) => break Err(e),
            }
        }
    };

    let sniffed = match tokio::time::timeout(sniff_timeout, read_fut).await {
        Ok(Ok(s)) => s,
        Ok(Err(_)) => {
            tracing::debug!(kind=?kind, client=%peer, "tunnel: no routing header");
            reply(kind, &mut c, 400, "Bad Request").await;
            return;
        }
        Err(_) => {
            tracing::debug!(kind=?kind, client=%peer, "tunnel: routing header timeout");
            let _ = c.shutdown().await;
            return;
        }
    };

    let Some(route) = router.lookup(&sniffed.host) else {
        tracing::debug!(kind=?kind, client=%peer, host=%sniffed.host, "tunnel: no route for host");
        reply(kind, &mut c, 404, "Not Found").await;
        return;
    };
    let Some(_permit) = route.admit() else {
        reply(kind, &mut c, 503, "Service Unavailable").await;
        return;
    };

    let mut work = match fw
        .broker
        .request(&route, peer.to_string(), sniffed.host.clone())
        .await
    {
        Ok(w) => w,
        Err(TunnelError::WorkConnectionTimeout) => {
            reply(kind, &mut c, 504, "Gateway Timeout").await;
            return;
        }
        Err(err) => {
            tracing::debug!(proxy=%route.name(), client=%peer, err=%err, "tunnel: work connection failed");
            reply(kind, &mut c, 502, "Bad Gateway").await;
            return;
        }
    };

    if kind == VhostKind::Tcpmux && c.write_all(vhost::CONNECT_ESTABLISHED).await.is_err() {
        return;
    }
    let rest = match kind {
        VhostKind::Http => vhost::close_after_first_request(&captured),
        _ => Cow::Borrowed(&captured[sniffed.consumed..]),
    };
    if !rest.is_empty() && work.write_all(&rest).await.is_err() {
        return;
    }
    let stats = net::splice(c, work, fw.splice.clone()).await;
    tracing::debug!(proxy=%route.name(), client=%peer, host=%sniffed.host, up=stats.a_to_b, down=stats.b_to_a, "tunnel: connection closed");
}

/// Answers plain-text HTTP errors; TLS clients just see the connection close.
async fn reply(kind: VhostKind, c: &mut TcpStream, status: u16, reason: &str) {
    if kind != VhostKind::Https {
        let _ = c.write_all(&vhost::http_response(status, reason)).await;
    }
    let _ = c.shutdown().await;
}
