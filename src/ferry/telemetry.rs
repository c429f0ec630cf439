use std::time::{SystemTime, UNIX_EPOCH};

use crate::ferry::tunnel::kind::ProxyKind;

/// Lifecycle notifications emitted by the tunnel engine.
///
/// Each event bumps a counter through the `metrics` facade and is logged.
/// Whatever recorder the process installs decides where counters go.
#[derive(Debug, Clone)]
pub enum Event<'a> {
    SessionUp {
        run_id: &'a str,
        remote: &'a str,
        resumed: usize,
    },
    SessionDown {
        run_id: &'a str,
        reason: &'a str,
    },
    ProxyRegistered {
        name: &'a str,
        kind: ProxyKind,
        remote_addr: &'a str,
    },
    ProxyUnregistered {
        name: &'a str,
        kind: ProxyKind,
    },
    VisitorAccepted {
        proxy: &'a str,
        visitor: &'a str,
    },
    VisitorRejected {
        proxy: &'a str,
        visitor: &'a str,
        reason: &'a str,
    },
    WorkConnExpired {
        proxy: &'a str,
        request_id: u64,
    },
    Negotiation {
        peering_id: &'a str,
        proxy: &'a str,
        success: bool,
    },
}

pub fn emit(ev: Event<'_>) {
    match ev {
        Event::SessionUp {
            run_id,
            remote,
            resumed,
        } => {
            metrics::counter!("ferry_sessions_total").increment(1);
            metrics::gauge!("ferry_active_sessions").increment(1.0);
            tracing::info!(run_id=%run_id, client=%remote, resumed, "tunnel: session up");
        }
        Event::SessionDown { run_id, reason } => {
            metrics::gauge!("ferry_active_sessions").decrement(1.0);
            tracing::info!(run_id=%run_id, reason=%reason, "tunnel: session down");
        }
        Event::ProxyRegistered {
            name,
            kind,
            remote_addr,
        } => {
            metrics::counter!("ferry_proxies_registered_total", "kind" => kind.as_str()).increment(1);
            metrics::gauge!("ferry_active_proxies").increment(1.0);
            tracing::info!(proxy=%name, kind=%kind, remote_addr=%remote_addr, "tunnel: proxy registered");
        }
        Event::ProxyUnregistered { name, kind } => {
            metrics::gauge!("ferry_active_proxies").decrement(1.0);
            tracing::info!(proxy=%name, kind=%kind, "tunnel: proxy unregistered");
        }
        Event::VisitorAccepted { proxy, visitor } => {
            metrics::counter!("ferry_visitors_accepted_total").increment(1);
            tracing::info!(proxy=%proxy, visitor=%visitor, "tunnel: visitor accepted");
        }
        Event::VisitorRejected {
            proxy,
            visitor,
            reason,
        } => {
            metrics::counter!("ferry_visitors_rejected_total").increment(1);
            tracing::warn!(proxy=%proxy, visitor=%visitor, reason=%reason, "tunnel: visitor rejected");
        }
        Event::WorkConnExpired { proxy, request_id } => {
            metrics::counter!("ferry_work_conn_timeouts_total").increment(1);
            tracing::warn!(proxy=%proxy, request_id, "tunnel: work connection request expired");
        }
        Event::Negotiation {
            peering_id,
            proxy,
            success,
        } => {
            let outcome = if success { "success" } else { "failure" };
            metrics::counter!("ferry_nat_negotiations_total", "outcome" => outcome).increment(1);
            tracing::info!(peering_id=%peering_id, proxy=%proxy, outcome, "tunnel: nat negotiation finished");
        }
    }
}

pub struct ActiveSpliceGuard;

impl ActiveSpliceGuard {
    pub fn new() -> Self {
        metrics::counter!("ferry_spliced_pairs_total").increment(1);
        metrics::gauge!("ferry_active_spliced_pairs").increment(1.0);
        Self
    }
}

impl Drop for ActiveSpliceGuard {
    fn drop(&mut self) {
        metrics::gauge!("ferry_active_spliced_pairs").decrement(1.0);
    }
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
