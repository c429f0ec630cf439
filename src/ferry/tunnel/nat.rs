//! Candidate gathering and UDP hole punching.
//!
//! Both peers run [`punch`] at the same time against each other's candidate
//! list. A probe that makes it through is acked; the first ack received names
//! the path that works in both directions. The punched socket then carries a
//! QUIC connection.

use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::{net::UdpSocket, time::Instant};

use crate::ferry::tunnel::{
    auth,
    error::TunnelError,
    msg::{self, Message, NatProbe, Punch},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateKind {
    /// Address of a local interface.
    Host,
    /// Public address as observed by the server.
    Reflexive,
    Relay,
}

impl std::fmt::Display for CandidateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CandidateKind::Host => f.write_str("host"),
            CandidateKind::Reflexive => f.write_str("reflexive"),
            CandidateKind::Relay => f.write_str("relay"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NatRole {
    Visitor,
    Provider,
}

/// Type preferences, 0..=126. Higher is tried first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CandidateWeights {
    pub host: u32,
    pub reflexive: u32,
    pub relay: u32,
}

impl Default for CandidateWeights {
    fn default() -> Self {
        Self {
            host: 126,
            reflexive: 100,
            relay: 0,
        }
    }
}

impl CandidateWeights {
    fn type_pref(&self, kind: CandidateKind) -> u32 {
        let w = match kind {
            CandidateKind::Host => self.host,
            CandidateKind::Reflexive => self.reflexive,
            CandidateKind::Relay => self.relay,
        };
        w.min(126)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub addr: SocketAddr,
    pub kind: CandidateKind,
    pub priority: u32,
}

impl Candidate {
    #[cfg(test)]
    pub fn new(addr: SocketAddr, kind: CandidateKind) -> Self {
        Self::weighted(addr, kind, &CandidateWeights::default())
    }

    pub fn weighted(addr: SocketAddr, kind: CandidateKind, w: &CandidateWeights) -> Self {
        Self {
            addr,
            kind,
            priority: compute_priority(w.type_pref(kind), 65535),
        }
    }
}

/// Priority = 2^24 * type preference + 2^8 * local preference + 255.
pub fn compute_priority(type_pref: u32, local_pref: u32) -> u32 {
    ((1 << 24) * type_pref.min(126)) + ((1 << 8) * local_pref.min(65535)) + 255
}

/// Sorts by descending priority; ties keep their order.
pub fn sort_by_priority(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
}

#[derive(Debug, Clone)]
pub struct NatOptions {
    /// Time between probe rounds. A candidate that has not acked by the next
    /// round is probed again.
    pub attempt_timeout: Duration,
    /// Upper bound for the whole negotiation, candidate exchange included.
    pub negotiation_timeout: Duration,
    /// How long a side that already succeeded keeps acking its peer.
    pub linger: Duration,
    pub weights: CandidateWeights,
}

impl Default for NatOptions {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_millis(300),
            negotiation_timeout: Duration::from_secs(5),
            linger: Duration::from_millis(500),
            weights: CandidateWeights::default(),
        }
    }
}

/// Collects candidates for `sock`.
///
/// `host_ip` stands in for an unspecified bind address (usually the local IP
/// of the control connection). With a `rendezvous` address the server's UDP
/// responder is asked for the reflexive address.
pub async fn gather(
    sock: &UdpSocket,
    host_ip: Option<IpAddr>,
    rendezvous: Option<SocketAddr>,
    opts: &NatOptions,
) -> Vec<Candidate> {
    let mut out = Vec::new();
    if let Ok(local) = sock.local_addr() {
        let ip = if local.ip().is_unspecified() {
            host_ip
        } else {
            Some(local.ip())
        };
        if let Some(ip) = ip.filter(|ip| !ip.is_unspecified()) {
            out.push(Candidate::weighted(
                SocketAddr::new(ip, local.port()),
                CandidateKind::Host,
                &opts.weights,
            ));
        }
    }

    if let Some(server) = rendezvous {
        match probe_reflexive(sock, server, opts.attempt_timeout).await {
            Some(observed) if !out.iter().any(|c| c.addr == observed) => {
                out.push(Candidate::weighted(
                    observed,
                    CandidateKind::Reflexive,
                    &opts.weights,
                ));
            }
            Some(_) => {}
            None => {
                tracing::debug!(server=%server, "tunnel: no reflexive address observed");
            }
        }
    }

    sort_by_priority(&mut out);
    out
}

async fn probe_reflexive(sock: &UdpSocket, server: SocketAddr, wait: Duration) -> Option<SocketAddr> {
    let transaction_id = auth::new_request_id();
    let req = msg::encode(&Message::NatProbe(NatProbe { transaction_id })).ok()?;
    let mut buf = vec![0u8; 2048];

    for _ in 0..3 {
        if sock.send_to(&req, server).await.is_err() {
            continue;
        }
        let deadline = Instant::now() + wait;
        while let Ok(res) = tokio::time::timeout_at(deadline, sock.recv_from(&mut buf)).await {
            let Ok((n, from)) = res else { continue };
            if from != server {
                continue;
            }
            if let Ok(Message::NatProbeResp(r)) = msg::decode(&buf[..n]) {
                if r.transaction_id == transaction_id {
                    return Some(r.observed);
                }
            }
        }
    }
    None
}

/// Punches towards `peer` and returns the address that acked.
///
/// Probes go to every candidate in priority order on each round. Received
/// probes are acked; the first ack wins. After success the socket keeps
/// answering probes for `linger` so a peer that is one round behind can
/// finish too.
pub async fn punch(
    sock: &UdpSocket,
    peering_id: &str,
    peer: &[Candidate],
    opts: &NatOptions,
) -> Result<SocketAddr, TunnelError> {
    if peer.is_empty() {
        return Err(TunnelError::NatTraversalFailed("peer sent no candidates".into()));
    }
    let mut targets = peer.to_vec();
    sort_by_priority(&mut targets);

    let probe = encode_punch(peering_id, false)?;
    let ack = encode_punch(peering_id, true)?;

    let deadline = Instant::now() + opts.negotiation_timeout;
    let mut round = tokio::time::interval(opts.attempt_timeout.max(Duration::from_millis(10)));
    let mut buf = vec![0u8; 2048];

    let winner = loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                return Err(TunnelError::NatTraversalFailed(format!(
                    "no candidate answered within {}",
                    humantime::format_duration(opts.negotiation_timeout)
                )));
            }
            _ = round.tick() => {
                for c in &targets {
                    if let Err(err) = sock.send_to(&probe, c.addr).await {
                        tracing::trace!(peering_id=%peering_id, addr=%c.addr, err=%err, "tunnel: punch send failed");
                    }
                }
            }
            res = sock.recv_from(&mut buf) => {
                let Ok((n, from)) = res else { continue };
                match decode_punch(&buf[..n], peering_id) {
                    Some(false) => {
                        let _ = sock.send_to(&ack, from).await;
                    }
                    Some(true) => break from,
                    None => {}
                }
            }
        }
    };

    // The peer may still be waiting for its own ack.
    let _ = sock.send_to(&ack, winner).await;
    let linger_until = Instant::now() + opts.linger;
    while let Ok(res) = tokio::time::timeout_at(linger_until, sock.recv_from(&mut buf)).await {
        let Ok((n, from)) = res else { continue };
        if decode_punch(&buf[..n], peering_id) == Some(false) {
            let _ = sock.send_to(&ack, from).await;
        }
    }

    tracing::debug!(peering_id=%peering_id, peer=%winner, "tunnel: punched");
    Ok(winner)
}

fn encode_punch(peering_id: &str, ack: bool) -> Result<Vec<u8>, TunnelError> {
    let m = Message::Punch(Punch {
        peering_id: peering_id.to_string(),
        ack,
    });
    Ok(msg::encode(&m)?.to_vec())
}

/// `Some(ack)` for a punch belonging to this peering.
fn decode_punch(b: &[u8], peering_id: &str) -> Option<bool> {
    match msg::decode(b) {
        Ok(Message::Punch(p)) if p.peering_id == peering_id => Some(p.ack),
        _ => None,
    }
}

/// Adds a reflexive candidate at `observed_ip` for every host port that does
/// not already have one. Used by the server, which sees the peer's public IP on
/// the control connection.
pub fn add_observed(candidates: &mut Vec<Candidate>, observed_ip: IpAddr, w: &CandidateWeights) {
    if observed_ip.is_unspecified() || observed_ip.is_loopback() {
        return;
    }
    let ports: Vec<u16> = candidates
        .iter()
        .filter(|c| c.kind == CandidateKind::Host)
        .map(|c| c.addr.port())
        .collect();
    for port in ports {
        let addr = SocketAddr::new(observed_ip, port);
        if !candidates.iter().any(|c| c.addr == addr) {
            candidates.push(Candidate::weighted(addr, CandidateKind::Reflexive, w));
        }
    }
    sort_by_priority(candidates);
}
