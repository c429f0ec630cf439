//! Rendezvous for direct visitor paths.
//!
//! The server never touches the punched path. It relays candidate lists
//! between the two control sessions, adding the address it observed for each
//! side, and answers reflexive-address probes on a UDP port.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::{net::UdpSocket, sync::watch};

use crate::ferry::tunnel::{
    error::TunnelError,
    kind::ProxyKind,
    msg::{self, Message, NatCandidates, NatProbeResp},
    nat::{self, CandidateWeights, NatRole},
    server::{control::SessionHandle, registry::Registry, visitor},
};

struct Peering {
    proxy_name: String,
    visitor: Arc<SessionHandle>,
    provider: Arc<SessionHandle>,
}

/// Open negotiations keyed by peering id.
pub struct NatHole {
    peerings: Arc<DashMap<String, Peering>>,
    weights: CandidateWeights,
    ttl: Duration,
}

impl NatHole {
    pub fn new(weights: CandidateWeights, ttl: Duration) -> Self {
        Self {
            peerings: Arc::new(DashMap::new()),
            weights,
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.peerings.len()
    }

    /// Handles a candidate list sent by `from`.
    pub async fn handle(&self, registry: &Registry, from: &Arc<SessionHandle>, m: NatCandidates) {
        match m.role {
            NatRole::Visitor => {
                let peering_id = m.peering_id.clone();
                let proxy_name = m.proxy_name.clone();
                if let Err(err) = self.open(registry, from, m).await {
                    tracing::debug!(peering_id=%peering_id, proxy=%proxy_name, err=%err, "tunnel: negotiation refused");
                    let _ = from.send(failure(&peering_id, &proxy_name, &err)).await;
                }
            }
            NatRole::Provider => self.answer(from, m).await,
        }
    }

    async fn open(
        &self,
        registry: &Registry,
        from: &Arc<SessionHandle>,
        m: NatCandidates,
    ) -> Result<(), TunnelError> {
        if m.peering_id.trim().is_empty() {
            return Err(TunnelError::InvalidConfig("empty peering id".into()));
        }
        let route = visitor::check_pairing(
            registry,
            &m.proxy_name,
            Some(ProxyKind::Xtcp),
            &m.sign_key,
            m.timestamp,
        )?;
        let provider = route
            .owner()
            .filter(|s| !s.is_closed())
            .ok_or(TunnelError::SessionClosed)?;

        let mut candidates = m.candidates;
        if let Some(addr) = from.remote {
            nat::add_observed(&mut candidates, addr.ip(), &self.weights);
        }

        match self.peerings.entry(m.peering_id.clone()) {
            Entry::Occupied(_) => {
                return Err(TunnelError::InvalidConfig(format!(
                    "duplicate peering id {}",
                    m.peering_id
                )));
            }
            Entry::Vacant(e) => {
                e.insert(Peering {
                    proxy_name: route.name().to_string(),
                    visitor: from.clone(),
                    provider: provider.clone(),
                });
            }
        }

        let fwd = Message::NatCandidates(NatCandidates {
            peering_id: m.peering_id.clone(),
            role: NatRole::Visitor,
            proxy_name: route.name().to_string(),
            sign_key: String::new(),
            timestamp: 0,
            candidates,
            cert_fingerprint: String::new(),
            error: None,
        });
        if let Err(err) = provider.send(fwd).await {
            self.peerings.remove(&m.peering_id);
            return Err(err);
        }

        let peerings = self.peerings.clone();
        let ttl = self.ttl;
        let peering_id = m.peering_id;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some((id, p)) = peerings.remove(&peering_id) {
                let err = TunnelError::NatTraversalFailed("provider did not answer".into());
                let _ = p.visitor.send(failure(&id, &p.proxy_name, &err)).await;
            }
        });
        Ok(())
    }

    async fn answer(&self, from: &Arc<SessionHandle>, m: NatCandidates) {
        let Some((_, p)) = self
            .peerings
            .remove_if(&m.peering_id, |_, p| p.provider.id == from.id)
        else {
            tracing::debug!(peering_id=%m.peering_id, "tunnel: answer for unknown peering");
            return;
        };

        let mut candidates = m.candidates;
        if let Some(addr) = from.remote {
            nat::add_observed(&mut candidates, addr.ip(), &self.weights);
        }
        tracing::debug!(peering_id=%m.peering_id, proxy=%p.proxy_name, ok=m.error.is_none(), "tunnel: candidates exchanged");

        let fwd = Message::NatCandidates(NatCandidates {
            peering_id: m.peering_id,
            role: NatRole::Provider,
            proxy_name: p.proxy_name,
            sign_key: String::new(),
            timestamp: 0,
            candidates,
            cert_fingerprint: m.cert_fingerprint,
            error: m.error,
        });
        let _ = p.visitor.send(fwd).await;
    }

    /// Drops every negotiation the session takes part in. A visitor still
    /// waiting is told its provider went away.
    pub async fn cancel_session(&self, session_id: u64) {
        let ids: Vec<String> = self
            .peerings
            .iter()
            .filter(|p| p.visitor.id == session_id || p.provider.id == session_id)
            .map(|p| p.key().clone())
            .collect();
        for id in ids {
            let Some((id, p)) = self.peerings.remove(&id) else {
                continue;
            };
            if p.visitor.id != session_id {
                let _ = p
                    .visitor
                    .send(failure(&id, &p.proxy_name, &TunnelError::SessionClosed))
                    .await;
            }
        }
    }
}

fn failure(peering_id: &str, proxy_name: &str, err: &TunnelError) -> Message {
    Message::NatCandidates(NatCandidates {
        peering_id: peering_id.to_string(),
        role: NatRole::Provider,
        proxy_name: proxy_name.to_string(),
        sign_key: String::new(),
        timestamp: 0,
        candidates: Vec::new(),
        cert_fingerprint: String::new(),
        error: Some(err.to_wire()),
    })
}

/// Answers `NatProbe` datagrams with the source address they came from.
pub async fn serve_probes(sock: UdpSocket, mut stop: watch::Receiver<bool>) {
    let mut buf = vec![0u8; 2048];
    loop {
        let (n, from): (usize, SocketAddr) = tokio::select! {
            _ = async { let _ = stop.wait_for(|s| *s).await; } => break,
            res = sock.recv_from(&mut buf) => match res {
                Ok(v) => v,
                Err(err) => {
                    tracing::debug!(err=%err, "tunnel: probe recv failed");
                    continue;
                }
            },
        };
        let Ok(Message::NatProbe(p)) = msg::decode(&buf[..n]) else {
            continue;
        };
        let resp = Message::NatProbeResp(NatProbeResp {
            transaction_id: p.transaction_id,
            observed: from,
        });
        if let Ok(b) = msg::encode(&resp) {
            let _ = sock.send_to(&b, from).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ferry::tunnel::{
        auth,
        kind::ProxyConfig,
        msg::NatProbe,
        nat::{Candidate, CandidateKind},
        server::{
            broker::Broker,
            listener::{ListenerManager, ListenerOptions},
        },
    };

    fn registry() -> Registry {
        let broker = Arc::new(Broker::new(Duration::from_secs(1), ""));
        let opts = ListenerOptions {
            proxy_bind_addr: "127.0.0.1".into(),
            ..Default::default()
        };
        Registry::new(Arc::new(ListenerManager::new(opts, broker)), 0)
    }

    fn offer(peering_id: &str, secret: &str) -> NatCandidates {
        let ts = auth::now_unix();
        NatCandidates {
            peering_id: peering_id.into(),
            role: NatRole::Visitor,
            proxy_name: "p2p".into(),
            sign_key: auth::sign(secret, ts),
            timestamp: ts,
            candidates: vec![Candidate::new(
                "10.0.0.2:4000".parse().unwrap(),
                CandidateKind::Host,
            )],
            cert_fingerprint: String::new(),
            error: None,
        }
    }

    #[tokio::test]
    async fn candidates_are_relayed_both_ways() {
        let reg = registry();
        let (provider, mut provider_rx) = SessionHandle::for_test(1, "prov");
        let (visitor, mut visitor_rx) = SessionHandle::for_test(2, "vis");
        let mut cfg = ProxyConfig::new("p2p", ProxyKind::Xtcp, "127.0.0.1:22");
        cfg.secret_key = Some("abc123".into());
        reg.register(cfg, &provider).await.unwrap();

        let hole = NatHole::new(CandidateWeights::default(), Duration::from_secs(5));
        hole.handle(&reg, &visitor, offer("peer-1", "abc123")).await;

        let fwd = match provider_rx.recv().await {
            Some(Message::NatCandidates(c)) => c,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(fwd.role, NatRole::Visitor);
        assert_eq!(fwd.candidates.len(), 1);
        assert!(fwd.sign_key.is_empty());

        let answer = NatCandidates {
            role: NatRole::Provider,
            candidates: vec![Candidate::new(
                "10.0.0.3:5000".parse().unwrap(),
                CandidateKind::Host,
            )],
            cert_fingerprint: "ab12".into(),
            ..fwd
        };
        hole.handle(&reg, &provider, answer).await;
        match visitor_rx.recv().await {
            Some(Message::NatCandidates(c)) => {
                assert_eq!(c.role, NatRole::Provider);
                assert_eq!(c.cert_fingerprint, "ab12");
                assert!(c.error.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(hole.len(), 0);
        reg.release_all().await;
    }

    #[tokio::test]
    async fn wrong_secret_is_refused_to_the_visitor() {
        let reg = registry();
        let provider = SessionHandle::stub_for_test(1, "prov");
        let (visitor, mut visitor_rx) = SessionHandle::for_test(2, "vis");
        let mut cfg = ProxyConfig::new("p2p", ProxyKind::Xtcp, "127.0.0.1:22");
        cfg.secret_key = Some("abc123".into());
        reg.register(cfg, &provider).await.unwrap();

        let hole = NatHole::new(CandidateWeights::default(), Duration::from_secs(5));
        hole.handle(&reg, &visitor, offer("peer-2", "nope")).await;
        match visitor_rx.recv().await {
            Some(Message::NatCandidates(c)) => {
                assert_eq!(c.error.unwrap().code, crate::ferry::tunnel::error::ErrorCode::SecretMismatch);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(hole.len(), 0);
        reg.release_all().await;
    }

    #[tokio::test]
    async fn provider_loss_fails_the_waiting_visitor() {
        let reg = registry();
        let (provider, _provider_rx) = SessionHandle::for_test(1, "prov");
        let (visitor, mut visitor_rx) = SessionHandle::for_test(2, "vis");
        let mut cfg = ProxyConfig::new("p2p", ProxyKind::Xtcp, "127.0.0.1:22");
        cfg.secret_key = Some("abc123".into());
        reg.register(cfg, &provider).await.unwrap();

        let hole = NatHole::new(CandidateWeights::default(), Duration::from_secs(5));
        hole.handle(&reg, &visitor, offer("peer-3", "abc123")).await;
        assert_eq!(hole.len(), 1);
        hole.cancel_session(provider.id).await;
        match visitor_rx.recv().await {
            Some(Message::NatCandidates(c)) => assert!(c.error.is_some()),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(hole.len(), 0);
        reg.release_all().await;
    }

    #[tokio::test]
    async fn probe_responder_reports_source_address() {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        let (stop, rx) = watch::channel(false);
        let task = tokio::spawn(serve_probes(sock, rx));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let probe = msg::encode(&Message::NatProbe(NatProbe { transaction_id: 7 })).unwrap();
        client.send_to(&probe, addr).await.unwrap();
        let mut buf = [0u8; 512];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        match msg::decode(&buf[..n]).unwrap() {
            Message::NatProbeResp(r) => {
                assert_eq!(r.transaction_id, 7);
                assert_eq!(r.observed, client.local_addr().unwrap());
            }
            other => panic!("unexpected {other:?}"),
        }
        let _ = stop.send(true);
        task.await.unwrap();
    }
}
