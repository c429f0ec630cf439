use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use arc_swap::{ArcSwap, ArcSwapOption};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};

use crate::ferry::{
    net::RateLimiter,
    tunnel::{
        error::TunnelError,
        kind::{ProxyConfig, ProxyKind, VisitorConfig},
        msg::{Message, NatCandidates},
        nat::NatOptions,
        transport::{QuicDialOptions, Transport, TransportSession, transport_by_name},
    },
};

pub mod control;
pub mod p2p;
pub mod visitor;
pub mod workconn;

/// Reconnect delays: `initial`, then multiplied by `multiplier` up to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffConfig {
    #[serde(rename = "initial_ms", with = "millis")]
    pub initial: Duration,
    #[serde(rename = "max_ms", with = "millis")]
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    pub fn next(&self, cur: Duration) -> Duration {
        let m = if self.multiplier.is_finite() && self.multiplier >= 1.0 {
            self.multiplier
        } else {
            1.0
        };
        cur.mul_f64(m).min(self.max.max(self.initial))
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_addr: String,
    pub transport: String,
    pub tcp_mux: bool,
    pub auth_token: String,
    pub user: String,
    pub metadata: BTreeMap<String, String>,
    /// Zero disables pings.
    pub heartbeat_interval: Duration,
    /// Zero means three intervals.
    pub heartbeat_timeout: Duration,
    pub dial_timeout: Duration,
    /// Stop instead of retrying when the very first login fails.
    pub login_fail_exit: bool,
    pub backoff: BackoffConfig,
    pub nat: NatOptions,
    pub quic: QuicDialOptions,
    pub proxies: Vec<ProxyConfig>,
    pub visitors: Vec<VisitorConfig>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            server_addr: String::new(),
            transport: "tcp".into(),
            tcp_mux: true,
            auth_token: String::new(),
            user: String::new(),
            metadata: BTreeMap::new(),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::ZERO,
            dial_timeout: Duration::from_secs(10),
            login_fail_exit: true,
            backoff: BackoffConfig::default(),
            nat: NatOptions::default(),
            quic: QuicDialOptions::default(),
            proxies: Vec::new(),
            visitors: Vec::new(),
        }
    }
}

impl ClientOptions {
    pub(crate) fn effective_heartbeat_timeout(&self) -> Duration {
        if self.heartbeat_timeout.is_zero() {
            self.heartbeat_interval * 3
        } else {
            self.heartbeat_timeout
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    LoggingIn,
    Active,
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProxyStatus {
    pub name: String,
    pub kind: ProxyKind,
    /// `pending`, `running` or `error`.
    pub status: &'static str,
    pub remote_addr: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    pub state: SessionState,
    pub run_id: String,
    pub server_addr: String,
    pub proxies: Vec<ProxyStatus>,
}

pub(crate) struct LocalProxy {
    pub cfg: ProxyConfig,
    pub limiter: Option<Arc<RateLimiter>>,
}

/// The current connection to the server. Replaced on every login.
pub(crate) struct Link {
    pub session: Arc<dyn TransportSession>,
    pub run_id: String,
    pub nat_hole: Option<SocketAddr>,
    tx: mpsc::Sender<Message>,
}

impl Link {
    pub async fn send(&self, m: Message) -> Result<(), TunnelError> {
        self.tx.send(m).await.map_err(|_| TunnelError::SessionClosed)
    }
}

pub(crate) struct Inner {
    pub opts: ClientOptions,
    pub transport: Arc<dyn Transport>,
    pub state: watch::Sender<SessionState>,
    pub run_id: ArcSwap<String>,
    pub proxies: HashMap<String, LocalProxy>,
    pub status: DashMap<String, ProxyStatus>,
    pub link: ArcSwapOption<Link>,
    /// Visitor-side negotiations waiting for the provider's candidates.
    pub peerings: DashMap<String, oneshot::Sender<NatCandidates>>,
}

impl Inner {
    pub fn current_link(&self) -> Result<Arc<Link>, TunnelError> {
        self.link.load_full().ok_or(TunnelError::SessionClosed)
    }

    fn set_state(&self, s: SessionState) {
        self.state.send_if_modified(|cur| {
            if *cur == s {
                return false;
            }
            tracing::debug!(from=?*cur, to=?s, "tunnel: client state");
            *cur = s;
            true
        });
    }
}

pub(crate) fn transport_err(err: anyhow::Error) -> TunnelError {
    TunnelError::Transport(std::io::Error::other(err.to_string()))
}

#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    pub fn new(opts: ClientOptions) -> anyhow::Result<Self> {
        if opts.server_addr.trim().is_empty() {
            anyhow::bail!("tunnel: client server_addr is required");
        }
        let transport = transport_by_name(&opts.transport)?;

        let mut proxies = HashMap::new();
        let status = DashMap::new();
        for p in &opts.proxies {
            p.validate()?;
            let limiter = p
                .bandwidth_limit
                .filter(|n| *n > 0)
                .map(|n| Arc::new(RateLimiter::new(n)));
            status.insert(
                p.name.clone(),
                ProxyStatus {
                    name: p.name.clone(),
                    kind: p.kind,
                    status: "pending",
                    remote_addr: String::new(),
                    error: String::new(),
                },
            );
            let prev = proxies.insert(
                p.name.clone(),
                LocalProxy {
                    cfg: p.clone(),
                    limiter,
                },
            );
            if prev.is_some() {
                anyhow::bail!("tunnel: duplicate proxy name {:?}", p.name);
            }
        }
        for v in &opts.visitors {
            v.validate()?;
        }

        let (state, _) = watch::channel(SessionState::Disconnected);
        Ok(Self {
            inner: Arc::new(Inner {
                opts,
                transport,
                state,
                run_id: ArcSwap::from_pointee(String::new()),
                proxies,
                status,
                link: ArcSwapOption::empty(),
                peerings: DashMap::new(),
            }),
        })
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn run_id(&self) -> String {
        self.inner.run_id.load().to_string()
    }

    pub fn status(&self) -> ClientStatus {
        let mut proxies: Vec<ProxyStatus> =
            self.inner.status.iter().map(|s| s.value().clone()).collect();
        proxies.sort_by(|a, b| a.name.cmp(&b.name));
        ClientStatus {
            state: *self.inner.state.borrow(),
            run_id: self.run_id(),
            server_addr: self.inner.opts.server_addr.clone(),
            proxies,
        }
    }

    /// Keeps a session up until `shutdown` turns true or a fatal error occurs.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let inner = &self.inner;

        let mut visitors = tokio::task::JoinSet::new();
        for v in inner.opts.visitors.clone() {
            let ln = visitor::bind(&v).await?;
            visitors.spawn(visitor::serve(inner.clone(), v, ln, shutdown.clone()));
        }

        let mut backoff = inner.opts.backoff.initial;
        let mut ever_active = false;
        let res = loop {
            if *shutdown.borrow() {
                break Ok(());
            }

            let err = match control::run_once(inner.clone(), shutdown.clone()).await {
                Ok(()) => break Ok(()),
                Err(control::RunError { err, active }) => {
                    if active {
                        ever_active = true;
                        backoff = inner.opts.backoff.initial;
                    }
                    err
                }
            };

            if err.is_fatal() || (!ever_active && inner.opts.login_fail_exit) {
                tracing::error!(server=%inner.opts.server_addr, err=%err, "tunnel: giving up");
                break Err(anyhow::Error::new(err));
            }

            inner.set_state(SessionState::Reconnecting);
            tracing::warn!(
                transport=%inner.transport.name(),
                server=%inner.opts.server_addr,
                err=%err,
                backoff=%humantime::format_duration(backoff),
                "tunnel: disconnected; retrying"
            );

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break Ok(());
                    }
                }
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = inner.opts.backoff.next(backoff);
        };

        inner.set_state(SessionState::Closed);
        visitors.abort_all();
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_to_cap() {
        let b = BackoffConfig::default();
        let mut d = b.initial;
        let mut seen = vec![d];
        for _ in 0..6 {
            d = b.next(d);
            seen.push(d);
        }
        let secs: Vec<u64> = seen.iter().map(|d| d.as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 10, 10, 10]);
    }

    #[test]
    fn backoff_tolerates_bad_multiplier() {
        let b = BackoffConfig {
            multiplier: 0.1,
            ..BackoffConfig::default()
        };
        assert_eq!(b.next(Duration::from_secs(3)), Duration::from_secs(3));
    }

    #[test]
    fn heartbeat_timeout_defaults_to_three_intervals() {
        let opts = ClientOptions {
            heartbeat_interval: Duration::from_secs(5),
            ..ClientOptions::default()
        };
        assert_eq!(opts.effective_heartbeat_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn duplicate_proxy_names_are_rejected() {
        let p = ProxyConfig::new("web", ProxyKind::Tcp, "127.0.0.1:80");
        let opts = ClientOptions {
            server_addr: "127.0.0.1:7000".into(),
            proxies: vec![p.clone(), p],
            ..ClientOptions::default()
        };
        assert!(Client::new(opts).is_err());
    }
}
