//! Both ends of a direct visitor path.
//!
//! Candidates travel through the server on the control sessions; probes and
//! the QUIC connection that follows use a UDP socket bound for this one
//! negotiation.

use std::sync::Arc;

use tokio::{net::UdpSocket, sync::oneshot};

use crate::ferry::{
    telemetry::{self, Event},
    tunnel::{
        auth,
        client::{Inner, Link, workconn},
        error::{self, TunnelError, WireError},
        kind::{ProxyKind, VisitorConfig},
        msg::{self, Message, NatCandidates, NewVisitorConnResp},
        nat::{self, Candidate, NatRole},
        transport::{
            BoxedStream, TransportSession,
            quic::{P2pIdentity, p2p_connect, p2p_listen},
        },
    },
};

async fn bind_socket(link: &Link) -> Result<UdpSocket, TunnelError> {
    let v6 = link.session.local_addr().is_some_and(|a| a.is_ipv6());
    let sock = UdpSocket::bind(if v6 { "[::]:0" } else { "0.0.0.0:0" }).await?;
    Ok(sock)
}

async fn gather(inner: &Inner, link: &Link, sock: &UdpSocket) -> Vec<Candidate> {
    let host_ip = link.session.local_addr().map(|a| a.ip());
    nat::gather(sock, host_ip, link.nat_hole, &inner.opts.nat).await
}

fn failed(err: impl std::fmt::Display) -> TunnelError {
    TunnelError::NatTraversalFailed(err.to_string())
}

/// Visitor side: negotiates a path to `cfg.server_name` and returns a QUIC
/// session over it.
pub(crate) async fn connect(inner: &Inner, cfg: &VisitorConfig) -> Result<Arc<dyn TransportSession>, TunnelError> {
    let link = inner.current_link()?;
    let nat_opts = &inner.opts.nat;
    let sock = bind_socket(&link).await?;
    let candidates = gather(inner, &link, &sock).await;

    let peering_id = auth::new_peering_id();
    let (tx, rx) = oneshot::channel();
    inner.peerings.insert(peering_id.clone(), tx);

    let ts = auth::now_unix();
    let offer = Message::NatCandidates(NatCandidates {
        peering_id: peering_id.clone(),
        role: NatRole::Visitor,
        proxy_name: cfg.server_name.clone(),
        sign_key: auth::sign(&cfg.secret_key, ts),
        timestamp: ts,
        candidates,
        cert_fingerprint: String::new(),
        error: None,
    });
    if let Err(err) = link.send(offer).await {
        inner.peerings.remove(&peering_id);
        return Err(err);
    }

    let answer = match tokio::time::timeout(nat_opts.negotiation_timeout, rx).await {
        Ok(Ok(a)) => a,
        Ok(Err(_)) => return Err(TunnelError::SessionClosed),
        Err(_) => {
            inner.peerings.remove(&peering_id);
            return Err(failed("provider did not answer"));
        }
    };

    let res = finish_connect(sock, &peering_id, answer, nat_opts).await;
    telemetry::emit(Event::Negotiation {
        peering_id: &peering_id,
        proxy: &cfg.server_name,
        success: res.is_ok(),
    });
    res
}

async fn finish_connect(
    sock: UdpSocket,
    peering_id: &str,
    answer: NatCandidates,
    nat_opts: &nat::NatOptions,
) -> Result<Arc<dyn TransportSession>, TunnelError> {
    error::check(answer.error)?;
    if answer.cert_fingerprint.is_empty() {
        return Err(failed("provider sent no certificate fingerprint"));
    }
    let peer = nat::punch(&sock, peering_id, &answer.candidates, nat_opts).await?;
    let std_sock = sock.into_std()?;
    let session = tokio::time::timeout(
        nat_opts.negotiation_timeout,
        p2p_connect(std_sock, peer, &answer.cert_fingerprint),
    )
    .await
    .map_err(|_| failed("quic handshake timed out"))?
    .map_err(|e| failed(format!("quic: {e}")))?;
    tracing::info!(peering_id=%peering_id, peer=%peer, "tunnel: direct path up");
    Ok(session)
}

/// Provider side: answers a visitor's candidates, punches, then serves the
/// visitor's QUIC streams.
pub(crate) async fn serve_provider(inner: Arc<Inner>, link: Arc<Link>, offer: NatCandidates) {
    let peering_id = offer.peering_id.clone();
    let proxy_name = offer.proxy_name.clone();
    if let Err(err) = provide(&inner, &link, offer).await {
        tracing::warn!(peering_id=%peering_id, proxy=%proxy_name, err=%err, "tunnel: direct path failed");
    }
}

async fn provide(inner: &Arc<Inner>, link: &Link, offer: NatCandidates) -> Result<(), TunnelError> {
    let nat_opts = &inner.opts.nat;
    let answer = |candidates: Vec<Candidate>, fingerprint: String, error: Option<WireError>| {
        Message::NatCandidates(NatCandidates {
            peering_id: offer.peering_id.clone(),
            role: NatRole::Provider,
            proxy_name: offer.proxy_name.clone(),
            sign_key: String::new(),
            timestamp: 0,
            candidates,
            cert_fingerprint: fingerprint,
            error,
        })
    };

    let known = inner
        .proxies
        .get(&offer.proxy_name)
        .is_some_and(|p| p.cfg.kind == ProxyKind::Xtcp);
    if !known {
        let err = TunnelError::ProxyNotFound(offer.proxy_name.clone());
        link.send(answer(Vec::new(), String::new(), Some(err.to_wire())))
            .await?;
        return Err(err);
    }

    let sock = bind_socket(link).await?;
    let candidates = gather(inner, link, &sock).await;
    let id = match P2pIdentity::generate() {
        Ok(id) => id,
        Err(e) => {
            let err = failed(format!("certificate: {e}"));
            link.send(answer(Vec::new(), String::new(), Some(err.to_wire())))
                .await?;
            return Err(err);
        }
    };
    link.send(answer(candidates, id.fingerprint.clone(), None))
        .await?;

    let punched = nat::punch(&sock, &offer.peering_id, &offer.candidates, nat_opts).await;
    telemetry::emit(Event::Negotiation {
        peering_id: &offer.peering_id,
        proxy: &offer.proxy_name,
        success: punched.is_ok(),
    });
    let peer = punched?;

    let ln = p2p_listen(sock.into_std()?, &id).map_err(|e| failed(format!("quic: {e}")))?;
    let session = tokio::time::timeout(nat_opts.negotiation_timeout, ln.accept())
        .await
        .map_err(|_| failed("visitor did not connect"))?
        .map_err(|e| failed(format!("quic: {e}")))?;
    tracing::info!(peering_id=%offer.peering_id, proxy=%offer.proxy_name, peer=%peer, "tunnel: serving direct path");

    while let Ok(st) = session.accept_stream().await {
        let inner = inner.clone();
        let proxy_name = offer.proxy_name.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_stream(&inner, &proxy_name, st).await {
                tracing::debug!(proxy=%proxy_name, err=%err, "tunnel: direct stream failed");
            }
        });
    }
    let _ = ln.close().await;
    tracing::debug!(peering_id=%offer.peering_id, "tunnel: direct path closed");
    Ok(())
}

/// Checks the visitor's proof on a direct stream, then connects it to the
/// local service.
async fn serve_stream(inner: &Inner, proxy_name: &str, mut st: BoxedStream) -> anyhow::Result<()> {
    let first = tokio::time::timeout(inner.opts.dial_timeout, msg::read_msg(&mut st)).await??;
    let req = match first {
        Message::NewVisitorConn(req) => req,
        other => return Err(other.unexpected("NewVisitorConn").into()),
    };
    let Some(proxy) = inner.proxies.get(proxy_name) else {
        anyhow::bail!("tunnel: proxy {proxy_name:?} is gone");
    };

    let secret = proxy.cfg.secret_key.as_deref().unwrap_or_default();
    let ok = req.proxy_name == proxy_name
        && auth::timestamp_fresh(req.timestamp, auth::now_unix())
        && auth::verify(secret, req.timestamp, &req.sign_key);
    let error = (!ok).then(|| TunnelError::SecretMismatch(proxy_name.to_string()).to_wire());
    let resp = Message::NewVisitorConnResp(NewVisitorConnResp {
        proxy_name: proxy_name.to_string(),
        error,
    });
    msg::write_msg(&mut st, &resp).await?;
    if !ok {
        tracing::warn!(proxy=%proxy_name, visitor=%req.run_id, "tunnel: direct visitor rejected");
        return Ok(());
    }
    workconn::serve_local(inner, proxy, st).await
}
