use std::time::Duration;

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::sync::oneshot;

use crate::ferry::{
    telemetry::{self, Event},
    tunnel::{
        auth,
        error::TunnelError,
        msg::{self, Close, Message, NewWorkConn, ReqWorkConn, StartWorkConn},
        server::registry::ProxyRoute,
        transport::BoxedStream,
    },
};

struct Pending {
    session_id: u64,
    run_id: String,
    proxy_name: String,
    src_addr: String,
    dst_addr: String,
    tx: oneshot::Sender<BoxedStream>,
}

/// Pairs inbound connections with work connections opened by clients.
///
/// Every request is keyed by a random id and removed exactly once: either by
/// the matching `NewWorkConn`, by its timeout, or when its session goes away.
pub struct Broker {
    pending: DashMap<u64, Pending>,
    timeout: Duration,
    auth_token: String,
}

/// Upper bound for writing a rejection to a work stream nobody reads.
const REJECT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

impl Broker {
    pub fn new(timeout: Duration, auth_token: impl Into<String>) -> Self {
        Self {
            pending: DashMap::new(),
            timeout,
            auth_token: auth_token.into(),
        }
    }

    /// Asks the route's owner for a work connection and waits for it.
    pub async fn request(
        &self,
        route: &ProxyRoute,
        src_addr: String,
        dst_addr: String,
    ) -> Result<BoxedStream, TunnelError> {
        let owner = route.owner().ok_or(TunnelError::SessionClosed)?;
        if owner.is_closed() {
            return Err(TunnelError::SessionClosed);
        }

        let (tx, mut rx) = oneshot::channel();
        let mut pending = Some(Pending {
            session_id: owner.id,
            run_id: owner.run_id.clone(),
            proxy_name: route.name().to_string(),
            src_addr,
            dst_addr,
            tx,
        });
        let request_id = loop {
            let id = auth::new_request_id();
            if let Entry::Vacant(e) = self.pending.entry(id) {
                if let Some(p) = pending.take() {
                    e.insert(p);
                }
                break id;
            }
        };

        let req = Message::ReqWorkConn(ReqWorkConn {
            request_id,
            proxy_name: route.name().to_string(),
        });
        if owner.send(req).await.is_err() {
            self.pending.remove(&request_id);
            return Err(TunnelError::SessionClosed);
        }

        match tokio::time::timeout(self.timeout, &mut rx).await {
            Ok(Ok(st)) => Ok(st),
            Ok(Err(_)) => Err(TunnelError::SessionClosed),
            Err(_) => {
                if self.pending.remove(&request_id).is_some() {
                    telemetry::emit(Event::WorkConnExpired {
                        proxy: route.name(),
                        request_id,
                    });
                    return Err(TunnelError::WorkConnectionTimeout);
                }
                // Matched at the deadline; the stream is on its way.
                match tokio::time::timeout(Duration::from_secs(1), rx).await {
                    Ok(Ok(st)) => Ok(st),
                    _ => Err(TunnelError::WorkConnectionTimeout),
                }
            }
        }
    }

    /// Binds a freshly opened work stream to its pending request.
    pub async fn fulfill(&self, req: NewWorkConn, mut st: BoxedStream) -> Result<(), TunnelError> {
        if !auth::timestamp_fresh(req.timestamp, auth::now_unix())
            || !auth::verify(&self.auth_token, req.timestamp, &req.privilege_key)
        {
            return reject(st, TunnelError::Auth("invalid work connection proof".into())).await;
        }
        let matched = self
            .pending
            .remove_if(&req.request_id, |_, p| p.run_id == req.run_id);
        let Some((_, p)) = matched else {
            return reject(st, TunnelError::UnknownWorkRequest(req.request_id)).await;
        };

        let start = Message::StartWorkConn(StartWorkConn {
            request_id: req.request_id,
            proxy_name: p.proxy_name.clone(),
            src_addr: p.src_addr.clone(),
            dst_addr: p.dst_addr.clone(),
            error: None,
        });
        // On failure `p.tx` is dropped and the requester fails fast.
        msg::write_msg(&mut st, &start).await?;

        p.tx.send(st).map_err(|_| TunnelError::SessionClosed)?;
        tracing::trace!(proxy=%p.proxy_name, request_id=req.request_id, session_id=p.session_id, "tunnel: work connection matched");
        Ok(())
    }

    /// Fails every pending request of the session.
    pub fn cancel_session(&self, session_id: u64) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, p| p.session_id != session_id);
        before.saturating_sub(self.pending.len())
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

async fn reject(mut st: BoxedStream, err: TunnelError) -> Result<(), TunnelError> {
    let close = Message::Close(Close {
        reason: err.to_string(),
    });
    let _ = tokio::time::timeout(REJECT_WRITE_TIMEOUT, msg::write_msg(&mut st, &close)).await;
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ferry::tunnel::{
        kind::{ProxyConfig, ProxyKind},
        server::control::SessionHandle,
    };
    use std::sync::Arc;

    fn route_for(session: &Arc<SessionHandle>) -> ProxyRoute {
        let cfg = ProxyConfig::new("web", ProxyKind::Tcp, "127.0.0.1:80");
        ProxyRoute::new(cfg, session.run_id.clone(), Some(session.clone()))
    }

    fn work(run_id: &str, request_id: u64, token: &str) -> NewWorkConn {
        let ts = auth::now_unix();
        NewWorkConn {
            run_id: run_id.into(),
            request_id,
            timestamp: ts,
            privilege_key: auth::sign(token, ts),
        }
    }

    async fn next_request_id(rx: &mut tokio::sync::mpsc::Receiver<Message>) -> u64 {
        match rx.recv().await {
            Some(Message::ReqWorkConn(r)) => r.request_id,
            other => panic!("expected ReqWorkConn, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn work_connection_is_matched_exactly_once() {
        let (session, mut out) = SessionHandle::for_test(1, "run-a");
        let broker = Arc::new(Broker::new(Duration::from_secs(5), "tok"));
        let route = route_for(&session);

        let b = broker.clone();
        let waiter = tokio::spawn(async move {
            b.request(&route, "1.2.3.4:5".into(), "0.0.0.0:6000".into())
                .await
                .map(|_| ())
        });

        let id = next_request_id(&mut out).await;

        let (a1, mut peer1) = tokio::io::duplex(1024);
        broker
            .fulfill(work("run-a", id, "tok"), Box::new(a1))
            .await
            .unwrap();
        match msg::read_msg(&mut peer1).await.unwrap() {
            Message::StartWorkConn(s) => {
                assert_eq!(s.request_id, id);
                assert_eq!(s.src_addr, "1.2.3.4:5");
            }
            other => panic!("unexpected {other:?}"),
        }
        waiter.await.unwrap().unwrap();

        // A duplicate is rejected with Close.
        let (a2, mut peer2) = tokio::io::duplex(1024);
        let err = broker
            .fulfill(work("run-a", id, "tok"), Box::new(a2))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::UnknownWorkRequest(x) if x == id));
        assert!(matches!(
            msg::read_msg(&mut peer2).await.unwrap(),
            Message::Close(_)
        ));
    }

    #[tokio::test]
    async fn wrong_run_id_does_not_consume_request() {
        let (session, mut out) = SessionHandle::for_test(1, "run-a");
        let broker = Arc::new(Broker::new(Duration::from_secs(5), "tok"));
        let route = route_for(&session);

        let b = broker.clone();
        let waiter = tokio::spawn(async move {
            b.request(&route, String::new(), String::new())
                .await
                .map(|_| ())
        });
        let id = next_request_id(&mut out).await;

        let (a, _peer) = tokio::io::duplex(4096);
        let bad = work("someone-else", id, "tok");
        assert!(broker.fulfill(bad, Box::new(a)).await.is_err());
        assert_eq!(broker.pending_len(), 1);

        let (a, _peer) = tokio::io::duplex(4096);
        broker
            .fulfill(work("run-a", id, "tok"), Box::new(a))
            .await
            .unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn forged_work_connection_is_refused() {
        let (session, mut out) = SessionHandle::for_test(1, "run-a");
        let broker = Arc::new(Broker::new(Duration::from_secs(5), "tok"));
        let route = route_for(&session);

        let b = broker.clone();
        let waiter = tokio::spawn(async move {
            b.request(&route, String::new(), String::new())
                .await
                .map(|_| ())
        });
        let id = next_request_id(&mut out).await;

        let (a, mut peer) = tokio::io::duplex(4096);
        let err = broker
            .fulfill(work("run-a", id, "guess"), Box::new(a))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Auth(_)));
        assert!(matches!(
            msg::read_msg(&mut peer).await.unwrap(),
            Message::Close(_)
        ));
        assert_eq!(broker.pending_len(), 1);

        let mut stale = work("run-a", id, "tok");
        stale.timestamp = i64::MIN;
        stale.privilege_key = auth::sign("tok", i64::MIN);
        let (a, _peer) = tokio::io::duplex(4096);
        assert!(broker.fulfill(stale, Box::new(a)).await.is_err());
        assert_eq!(broker.pending_len(), 1);

        let (a, _peer) = tokio::io::duplex(4096);
        broker
            .fulfill(work("run-a", id, "tok"), Box::new(a))
            .await
            .unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn rejection_to_silent_peer_does_not_block() {
        let broker = Broker::new(Duration::from_secs(5), "tok");
        // Too small for a Close frame and never read.
        let (a, _peer) = tokio::io::duplex(8);
        let res = tokio::time::timeout(
            Duration::from_secs(10),
            broker.fulfill(work("run-a", 42, "tok"), Box::new(a)),
        )
        .await
        .expect("rejection write must be bounded");
        assert!(matches!(res, Err(TunnelError::UnknownWorkRequest(42))));
    }

    #[tokio::test]
    async fn unmatched_request_expires() {
        let (session, _out) = SessionHandle::for_test(1, "run-a");
        let broker = Broker::new(Duration::from_millis(50), "tok");
        let route = route_for(&session);
        let err = broker
            .request(&route, String::new(), String::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TunnelError::WorkConnectionTimeout));
        assert_eq!(broker.pending_len(), 0);
    }

    #[tokio::test]
    async fn closing_session_cancels_pending_requests() {
        let (session, mut out) = SessionHandle::for_test(9, "run-z");
        let broker = Arc::new(Broker::new(Duration::from_secs(5), "tok"));
        let route = route_for(&session);

        let b = broker.clone();
        let waiter = tokio::spawn(async move {
            b.request(&route, String::new(), String::new())
                .await
                .map(|_| ())
        });
        next_request_id(&mut out).await;
        assert_eq!(broker.cancel_session(9), 1);
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, TunnelError::SessionClosed));
    }
}
