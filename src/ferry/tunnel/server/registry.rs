use std::sync::{
    Arc, OnceLock,
    atomic::{AtomicU64, Ordering},
};

use arc_swap::ArcSwapOption;
use dashmap::{DashMap, mapref::entry::Entry};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::ferry::{
    telemetry::{self, Event},
    tunnel::{
        error::TunnelError,
        kind::{ProxyConfig, ProxyIdentity, ProxyKind},
        server::{
            control::SessionHandle,
            listener::{ListenerGuard, ListenerManager},
        },
    },
};

static NEXT_ROUTE_ID: AtomicU64 = AtomicU64::new(1);

/// A registered proxy and where its traffic goes.
///
/// The owner is cleared while the session is detached; the listener keeps
/// running so a resumed session picks up where the old one left off.
pub struct ProxyRoute {
    pub id: u64,
    pub identity: ProxyIdentity,
    pub config: ProxyConfig,
    remote_addr: OnceLock<String>,
    owner: ArcSwapOption<SessionHandle>,
    conn_limit: Option<Arc<Semaphore>>,
    guard: std::sync::Mutex<Option<ListenerGuard>>,
    registered_at_ms: u64,
}

impl std::fmt::Debug for ProxyRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyRoute")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

/// Holds one of a proxy's `max_connections` slots.
pub struct ConnPermit {
    _permit: Option<OwnedSemaphorePermit>,
}

impl ProxyRoute {
    pub fn new(config: ProxyConfig, run_id: String, owner: Option<Arc<SessionHandle>>) -> Self {
        let conn_limit = config
            .max_connections
            .map(|n| Arc::new(Semaphore::new(n as usize)));
        Self {
            id: NEXT_ROUTE_ID.fetch_add(1, Ordering::Relaxed),
            identity: ProxyIdentity {
                name: config.name.clone(),
                kind: config.kind,
                run_id,
            },
            config,
            remote_addr: OnceLock::new(),
            owner: ArcSwapOption::new(owner),
            conn_limit,
            guard: std::sync::Mutex::new(None),
            registered_at_ms: telemetry::now_unix_ms(),
        }
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn kind(&self) -> ProxyKind {
        self.identity.kind
    }

    pub fn remote_addr(&self) -> &str {
        self.remote_addr.get().map(String::as_str).unwrap_or_default()
    }

    pub fn owner(&self) -> Option<Arc<SessionHandle>> {
        self.owner.load_full()
    }

    fn owned_by(&self, session_id: u64) -> bool {
        self.owner
            .load()
            .as_ref()
            .is_some_and(|s| s.id == session_id)
    }

    /// A live route has an owner whose session has not been closed.
    pub fn is_live(&self) -> bool {
        self.owner.load().as_ref().is_some_and(|s| !s.is_closed())
    }

    /// Admits one more inbound connection, or `None` at the limit.
    pub fn admit(&self) -> Option<ConnPermit> {
        match &self.conn_limit {
            None => Some(ConnPermit { _permit: None }),
            Some(sem) => sem
                .clone()
                .try_acquire_owned()
                .ok()
                .map(|p| ConnPermit { _permit: Some(p) }),
        }
    }

    async fn stop(&self) {
        let guard = self
            .guard
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(g) = guard {
            g.shutdown().await;
        }
    }
}

enum Slot {
    /// Name reserved while the listener is being bound.
    Pending(u64),
    Active(Arc<ProxyRoute>),
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ProxySnapshot {
    pub name: String,
    pub kind: ProxyKind,
    pub run_id: String,
    pub remote_addr: String,
    pub status: &'static str,
    pub session_id: Option<u64>,
    pub registered_at_unix_ms: u64,
}

/// Server-wide proxy name table.
pub struct Registry {
    slots: DashMap<String, Slot>,
    listeners: Arc<ListenerManager>,
    max_per_session: usize,
}

impl Registry {
    pub fn new(listeners: Arc<ListenerManager>, max_per_session: usize) -> Self {
        Self {
            slots: DashMap::new(),
            listeners,
            max_per_session,
        }
    }

    /// Registers `cfg` for `owner`.
    ///
    /// The name is reserved first, then the public binding is made, then the
    /// reservation turns into the route. Any failure releases the name.
    pub async fn register(
        &self,
        cfg: ProxyConfig,
        owner: &Arc<SessionHandle>,
    ) -> Result<Arc<ProxyRoute>, TunnelError> {
        let mut cfg = cfg;
        cfg.name = cfg.name.trim().to_string();
        cfg.validate()?;
        let name = cfg.name.clone();

        if self.max_per_session > 0 && self.count_for_run(&owner.run_id) >= self.max_per_session {
            return Err(TunnelError::QuotaExceeded(self.max_per_session));
        }

        let evicted = match self.slots.entry(name.clone()) {
            Entry::Vacant(e) => {
                e.insert(Slot::Pending(owner.id));
                None
            }
            Entry::Occupied(mut e) => {
                let old = match e.get() {
                    Slot::Active(r) if !r.is_live() => r.clone(),
                    _ => return Err(TunnelError::NameConflict(name)),
                };
                e.insert(Slot::Pending(owner.id));
                Some(old)
            }
        };
        if let Some(old) = evicted {
            tracing::info!(proxy=%name, old_run_id=%old.identity.run_id, run_id=%owner.run_id, "tunnel: detached proxy taken over");
            self.finish(&old).await;
        }

        let route = Arc::new(ProxyRoute::new(
            cfg,
            owner.run_id.clone(),
            Some(owner.clone()),
        ));
        match self.listeners.bind(&route).await {
            Ok((guard, remote_addr)) => {
                let _ = route.remote_addr.set(remote_addr);
                *route.guard.lock().unwrap_or_else(|e| e.into_inner()) = Some(guard);
            }
            Err(err) => {
                self.slots
                    .remove_if(&name, |_, s| matches!(s, Slot::Pending(id) if *id == owner.id));
                return Err(err);
            }
        }

        self.slots.insert(name, Slot::Active(route.clone()));
        telemetry::emit(Event::ProxyRegistered {
            name: route.name(),
            kind: route.kind(),
            remote_addr: route.remote_addr(),
        });
        Ok(route)
    }

    /// Removes a proxy owned by `session_id`.
    pub async fn unregister(&self, name: &str, session_id: u64) -> Result<(), TunnelError> {
        let name = name.trim();
        let removed = self.slots.remove_if(name, |_, s| {
            matches!(s, Slot::Active(r) if r.owned_by(session_id))
        });
        match removed {
            Some((_, Slot::Active(r))) => {
                self.finish(&r).await;
                Ok(())
            }
            _ => Err(TunnelError::ProxyNotFound(name.to_string())),
        }
    }

    /// Looks up an active route by name, live or detached.
    pub fn lookup(&self, name: &str) -> Option<Arc<ProxyRoute>> {
        match self.slots.get(name.trim()).as_deref() {
            Some(Slot::Active(r)) => Some(r.clone()),
            _ => None,
        }
    }

    fn routes_where(&self, pred: impl Fn(&ProxyRoute) -> bool) -> Vec<Arc<ProxyRoute>> {
        self.slots
            .iter()
            .filter_map(|e| match e.value() {
                Slot::Active(r) if pred(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    fn count_for_run(&self, run_id: &str) -> usize {
        self.slots
            .iter()
            .filter(|e| match e.value() {
                Slot::Active(r) => r.identity.run_id == run_id,
                Slot::Pending(_) => false,
            })
            .count()
    }

    /// Removes every proxy owned by the session and closes its listeners.
    pub async fn release_session(&self, session_id: u64) -> Vec<String> {
        let routes = self.routes_where(|r| r.owned_by(session_id));
        self.remove_all(routes).await
    }

    /// Clears the owner of every proxy of the session; listeners stay up.
    pub fn detach_session(&self, session_id: u64) -> usize {
        let routes = self.routes_where(|r| r.owned_by(session_id));
        for r in &routes {
            r.owner.rcu(|cur| match cur {
                Some(s) if s.id == session_id => None,
                other => other.clone(),
            });
        }
        routes.len()
    }

    /// Hands every non-live proxy of `run_id` to `session`.
    pub fn resume_run(&self, run_id: &str, session: &Arc<SessionHandle>) -> Vec<String> {
        let routes = self.routes_where(|r| r.identity.run_id == run_id && !r.is_live());
        let mut names = Vec::with_capacity(routes.len());
        for r in routes {
            r.owner.store(Some(session.clone()));
            names.push(r.name().to_string());
        }
        names.sort();
        names
    }

    /// Drops proxies of `run_id` that nobody resumed.
    pub async fn release_detached(&self, run_id: &str) -> Vec<String> {
        let routes = self.routes_where(|r| r.identity.run_id == run_id && !r.is_live());
        self.remove_all(routes).await
    }

    pub async fn release_all(&self) {
        let routes = self.routes_where(|_| true);
        self.remove_all(routes).await;
    }

    async fn remove_all(&self, routes: Vec<Arc<ProxyRoute>>) -> Vec<String> {
        let mut names = Vec::with_capacity(routes.len());
        for r in routes {
            let removed = self.slots.remove_if(r.name(), |_, s| {
                matches!(s, Slot::Active(cur) if cur.id == r.id)
            });
            if removed.is_some() {
                self.finish(&r).await;
                names.push(r.name().to_string());
            }
        }
        names
    }

    async fn finish(&self, r: &ProxyRoute) {
        r.stop().await;
        telemetry::emit(Event::ProxyUnregistered {
            name: r.name(),
            kind: r.kind(),
        });
    }

    pub fn snapshot(&self) -> Vec<ProxySnapshot> {
        let mut out: Vec<ProxySnapshot> = self
            .routes_where(|_| true)
            .into_iter()
            .map(|r| {
                let owner = r.owner();
                ProxySnapshot {
                    name: r.name().to_string(),
                    kind: r.kind(),
                    run_id: r.identity.run_id.clone(),
                    remote_addr: r.remote_addr().to_string(),
                    status: if r.is_live() { "online" } else { "detached" },
                    session_id: owner.map(|s| s.id),
                    registered_at_unix_ms: r.registered_at_ms,
                }
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}
