//! Server side of the control session.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{mpsc, watch},
    time::Instant,
};

use crate::ferry::{
    telemetry::{self, Event},
    tunnel::{
        auth,
        error::TunnelError,
        msg::{
            self, Login, LoginResp, Message, NewProxyResp, NewVisitorResp, PROTOCOL_VERSION, Pong,
        },
        server::{Shared, visitor},
        transport::{BoxedStream, TransportSession},
    },
};

/// How long a rejected client gets to read the `LoginResp` and hang up.
const REJECT_LINGER: Duration = Duration::from_secs(5);
const WRITER_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct LoginMeta {
    pub version: String,
    pub user: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub metadata: std::collections::BTreeMap<String, String>,
}

impl From<&Login> for LoginMeta {
    fn from(l: &Login) -> Self {
        Self {
            version: l.version.clone(),
            user: l.user.clone(),
            hostname: l.hostname.clone(),
            os: l.os.clone(),
            arch: l.arch.clone(),
            metadata: l.metadata.clone(),
        }
    }
}

/// A logged-in client as seen by the rest of the server.
pub struct SessionHandle {
    pub id: u64,
    pub run_id: String,
    pub remote: Option<SocketAddr>,
    pub login: LoginMeta,
    pub connected_at_ms: u64,
    tx: mpsc::Sender<Message>,
    closed: watch::Sender<bool>,
    transport: Option<Arc<dyn TransportSession>>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("run_id", &self.run_id)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    fn new(
        id: u64,
        run_id: String,
        remote: Option<SocketAddr>,
        login: LoginMeta,
        tx: mpsc::Sender<Message>,
        transport: Option<Arc<dyn TransportSession>>,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id,
            run_id,
            remote,
            login,
            connected_at_ms: telemetry::now_unix_ms(),
            tx,
            closed,
            transport,
        }
    }

    /// Queues a message on the control stream.
    pub async fn send(&self, m: Message) -> Result<(), TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::SessionClosed);
        }
        self.tx.send(m).await.map_err(|_| TunnelError::SessionClosed)
    }

    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Closes the carrier once the control writer has flushed.
    async fn close_transport(&self) {
        if let Some(t) = &self.transport {
            t.close().await;
        }
    }

    #[cfg(test)]
    pub fn for_test(id: u64, run_id: &str) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(64);
        let s = Self::new(id, run_id.into(), None, LoginMeta::default(), tx, None);
        (Arc::new(s), rx)
    }

    #[cfg(test)]
    pub fn stub_for_test(id: u64, run_id: &str) -> Arc<Self> {
        Self::for_test(id, run_id).0
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionSnapshot {
    pub id: u64,
    pub run_id: String,
    pub remote: String,
    #[serde(flatten)]
    pub login: LoginMeta,
    pub connected_at_unix_ms: u64,
}

/// Live sessions by run id, plus run ids whose proxies wait for a resume.
#[derive(Default)]
pub struct SessionTable {
    live: DashMap<String, Arc<SessionHandle>>,
    parked: DashMap<String, u64>,
    id_seq: AtomicU64,
    gen_seq: AtomicU64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_session_id(&self) -> u64 {
        self.id_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Makes `s` the live session for its run id and returns the one it replaces.
    fn attach(&self, s: Arc<SessionHandle>) -> Option<Arc<SessionHandle>> {
        self.parked.remove(&s.run_id);
        self.live.insert(s.run_id.clone(), s)
    }

    fn remove(&self, s: &SessionHandle) {
        self.live.remove_if(&s.run_id, |_, cur| cur.id == s.id);
    }

    fn park(&self, run_id: &str) -> u64 {
        let generation = self.gen_seq.fetch_add(1, Ordering::Relaxed) + 1;
        self.parked.insert(run_id.to_string(), generation);
        generation
    }

    /// True when `run_id` is still parked under `generation`; it is unparked.
    fn unpark_if(&self, run_id: &str, generation: u64) -> bool {
        self.parked
            .remove_if(run_id, |_, g| *g == generation)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn close_all(&self) {
        for s in self.live.iter() {
            s.close();
        }
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let mut out: Vec<SessionSnapshot> = self
            .live
            .iter()
            .map(|s| SessionSnapshot {
                id: s.id,
                run_id: s.run_id.clone(),
                remote: s.remote.map(|a| a.to_string()).unwrap_or_default(),
                login: s.login.clone(),
                connected_at_unix_ms: s.connected_at_ms,
            })
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }
}

fn authenticate(token: &str, login: &Login) -> Result<(), TunnelError> {
    if !msg::versions_compatible(PROTOCOL_VERSION, &login.version) {
        return Err(TunnelError::VersionMismatch {
            local: PROTOCOL_VERSION.to_string(),
            remote: login.version.clone(),
        });
    }
    if !auth::timestamp_fresh(login.timestamp, auth::now_unix()) {
        return Err(TunnelError::Auth("login timestamp out of range".into()));
    }
    if !auth::verify(token, login.timestamp, &login.privilege_key) {
        return Err(TunnelError::Auth("invalid privilege key".into()));
    }
    Ok(())
}

enum Teardown {
    /// Explicit close: proxies go away now.
    Release(String),
    /// Lost session: proxies wait for a resume.
    Detach(String),
}

/// Runs one control session from `Login` to teardown.
pub(crate) async fn serve(
    shared: Arc<Shared>,
    transport: Arc<dyn TransportSession>,
    st: BoxedStream,
    login: Login,
) -> Result<(), TunnelError> {
    let (mut rd, mut wr) = tokio::io::split(st);
    let remote = transport.remote_addr();
    let client = remote.map(|a| a.to_string()).unwrap_or_default();

    if let Err(err) = authenticate(&shared.opts.auth_token, &login) {
        tracing::warn!(client=%client, user=%login.user, err=%err, "tunnel: login rejected");
        let resp = LoginResp {
            version: PROTOCOL_VERSION.to_string(),
            run_id: String::new(),
            resumed: Vec::new(),
            nat_hole_port: None,
            error: Some(err.to_wire()),
        };
        let _ = msg::write_msg(&mut wr, &Message::LoginResp(resp)).await;
        let _ = wr.shutdown().await;
        let mut sink = [0u8; 512];
        let _ = tokio::time::timeout(REJECT_LINGER, async {
            while matches!(rd.read(&mut sink).await, Ok(n) if n > 0) {}
        })
        .await;
        transport.close().await;
        return Err(err);
    }

    let run_id = match login.run_id.trim() {
        "" => auth::new_run_id(),
        id => id.to_string(),
    };
    let (tx, rx) = mpsc::channel(256);
    let session = Arc::new(SessionHandle::new(
        shared.sessions.next_session_id(),
        run_id,
        remote,
        LoginMeta::from(&login),
        tx,
        Some(transport),
    ));

    if let Some(old) = shared.sessions.attach(session.clone()) {
        tracing::info!(run_id=%session.run_id, old_session=old.id, "tunnel: session replaced by new login");
        old.close();
    }
    let resumed = shared.registry.resume_run(&session.run_id, &session);

    let resp = LoginResp {
        version: PROTOCOL_VERSION.to_string(),
        run_id: session.run_id.clone(),
        resumed: resumed.clone(),
        nat_hole_port: shared.nat_hole_port.get().copied(),
        error: None,
    };
    if let Err(err) = msg::write_msg(&mut wr, &Message::LoginResp(resp)).await {
        teardown(&shared, &session, Teardown::Detach(err.to_string())).await;
        session.close_transport().await;
        return Err(err.into());
    }

    telemetry::emit(Event::SessionUp {
        run_id: &session.run_id,
        remote: &client,
        resumed: resumed.len(),
    });

    let writer = tokio::spawn(write_loop(wr, rx, session.closed()));
    let how = read_loop(&shared, &session, &mut rd).await;
    teardown(&shared, &session, how).await;
    let _ = tokio::time::timeout(WRITER_GRACE, writer).await;
    session.close_transport().await;
    Ok(())
}

async fn write_loop(
    mut wr: WriteHalf<BoxedStream>,
    mut rx: mpsc::Receiver<Message>,
    mut closed: watch::Receiver<bool>,
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
            _ = async { let _ = closed.wait_for(|c| *c).await; } => break,
        }
    }
    let _ = wr.shutdown().await;
}

async fn read_loop(
    shared: &Arc<Shared>,
    session: &Arc<SessionHandle>,
    rd: &mut ReadHalf<BoxedStream>,
) -> Teardown {
    let hb = shared.opts.heartbeat_timeout;
    let mut deadline = Instant::now() + hb;
    let mut closed = session.closed();

    loop {
        let m = tokio::select! {
            _ = tokio::time::sleep_until(deadline), if !hb.is_zero() => {
                return Teardown::Detach(TunnelError::HeartbeatTimeout.to_string());
            }
            _ = async { let _ = closed.wait_for(|c| *c).await; } => {
                return Teardown::Detach("session closed".into());
            }
            res = msg::read_msg(rd) => match res {
                Ok(m) => m,
                Err(err) => return Teardown::Detach(format!("read: {err}")),
            },
        };

        match m {
            Message::Ping(p) => {
                deadline = Instant::now() + hb;
                let _ = session
                    .send(Message::Pong(Pong {
                        timestamp: p.timestamp,
                    }))
                    .await;
            }
            Message::NewProxy(np) => {
                let name = np.proxy.name.clone();
                let resp = match shared.registry.register(np.proxy, session).await {
                    Ok(route) => NewProxyResp {
                        name,
                        remote_addr: route.remote_addr().to_string(),
                        error: None,
                    },
                    Err(err) => {
                        tracing::warn!(run_id=%session.run_id, proxy=%name, err=%err, "tunnel: proxy rejected");
                        NewProxyResp {
                            name,
                            remote_addr: String::new(),
                            error: Some(err.to_wire()),
                        }
                    }
                };
                let _ = session.send(Message::NewProxyResp(resp)).await;
            }
            Message::CloseProxy(cp) => {
                if let Err(err) = shared.registry.unregister(&cp.name, session.id).await {
                    tracing::debug!(run_id=%session.run_id, proxy=%cp.name, err=%err, "tunnel: close proxy ignored");
                }
            }
            Message::NewVisitor(nv) => {
                let res = visitor::check_pairing(
                    &shared.registry,
                    &nv.server_name,
                    Some(nv.kind),
                    &nv.sign_key,
                    nv.timestamp,
                );
                let error = match res {
                    Ok(_) => {
                        telemetry::emit(Event::VisitorAccepted {
                            proxy: &nv.server_name,
                            visitor: &nv.name,
                        });
                        None
                    }
                    Err(err) => {
                        telemetry::emit(Event::VisitorRejected {
                            proxy: &nv.server_name,
                            visitor: &nv.name,
                            reason: &err.to_string(),
                        });
                        Some(err.to_wire())
                    }
                };
                let _ = session
                    .send(Message::NewVisitorResp(NewVisitorResp {
                        name: nv.name,
                        error,
                    }))
                    .await;
            }
            Message::NatCandidates(nc) => {
                let shared = shared.clone();
                let session = session.clone();
                tokio::spawn(async move {
                    shared.nathole.handle(&shared.registry, &session, nc).await;
                });
            }
            Message::Close(c) => return Teardown::Release(c.reason),
            other => {
                tracing::debug!(run_id=%session.run_id, msg=other.name(), "tunnel: unexpected message on control stream");
            }
        }
    }
}

async fn teardown(shared: &Arc<Shared>, session: &Arc<SessionHandle>, how: Teardown) {
    let replaced = session.is_closed();
    session.close();
    shared.sessions.remove(session);
    let cancelled = shared.broker.cancel_session(session.id);
    shared.nathole.cancel_session(session.id).await;

    let reason = match how {
        Teardown::Release(reason) => {
            shared.registry.release_session(session.id).await;
            reason
        }
        Teardown::Detach(reason) if shared.opts.resume_grace.is_zero() => {
            shared.registry.release_session(session.id).await;
            reason
        }
        Teardown::Detach(reason) => {
            let detached = shared.registry.detach_session(session.id);
            if detached > 0 && !replaced {
                park(shared.clone(), session.run_id.clone());
            }
            reason
        }
    };

    tracing::debug!(run_id=%session.run_id, cancelled, "tunnel: session torn down");
    telemetry::emit(Event::SessionDown {
        run_id: &session.run_id,
        reason: &reason,
    });
}

fn park(shared: Arc<Shared>, run_id: String) {
    let generation = shared.sessions.park(&run_id);
    let grace = shared.opts.resume_grace;
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        if shared.sessions.unpark_if(&run_id, generation) {
            let names = shared.registry.release_detached(&run_id).await;
            if !names.is_empty() {
                tracing::info!(run_id=%run_id, proxies=?names, "tunnel: resume window expired");
            }
        }
    });
}
