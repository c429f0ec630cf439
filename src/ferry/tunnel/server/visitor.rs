//! Pairing of visitors with secret proxies.

use std::sync::Arc;

use crate::ferry::{
    net,
    telemetry::{self, Event},
    tunnel::{
        auth,
        error::TunnelError,
        kind::ProxyKind,
        msg::{self, Message, NewVisitorConn, NewVisitorConnResp},
        server::{
            Shared,
            registry::{ProxyRoute, Registry},
        },
        transport::BoxedStream,
    },
};

/// Checks a visitor's claim on `proxy_name`.
///
/// `kind`, when given, must equal the provider's kind. The signature is the
/// provider's secret applied to `timestamp`.
pub fn check_pairing(
    registry: &Registry,
    proxy_name: &str,
    kind: Option<ProxyKind>,
    sign_key: &str,
    timestamp: i64,
) -> Result<Arc<ProxyRoute>, TunnelError> {
    let route = registry
        .lookup(proxy_name)
        .ok_or_else(|| TunnelError::ProxyNotFound(proxy_name.to_string()))?;
    if !route.kind().accepts_visitors() {
        return Err(TunnelError::TypeUnsupported(format!(
            "{} does not accept visitors",
            route.kind()
        )));
    }
    if let Some(k) = kind
        && k != route.kind()
    {
        return Err(TunnelError::TypeUnsupported(format!(
            "visitor type {k} does not match proxy type {}",
            route.kind()
        )));
    }
    let secret = route.config.secret_key.as_deref().unwrap_or_default();
    if !auth::timestamp_fresh(timestamp, auth::now_unix()) || !auth::verify(secret, timestamp, sign_key) {
        return Err(TunnelError::SecretMismatch(proxy_name.to_string()));
    }
    Ok(route)
}

/// Serves one relayed visitor connection: pair, fetch a work connection,
/// then splice.
pub(crate) async fn serve_conn(shared: Arc<Shared>, req: NewVisitorConn, mut st: BoxedStream) -> Result<(), TunnelError> {
    let res = check_pairing(&shared.registry, &req.proxy_name, None, &req.sign_key, req.timestamp);
    let route = match res {
        Ok(r) => r,
        Err(err) => {
            telemetry::emit(Event::VisitorRejected {
                proxy: &req.proxy_name,
                visitor: &req.run_id,
                reason: &err.to_string(),
            });
            reply(&mut st, &req.proxy_name, Some(&err)).await;
            return Err(err);
        }
    };

    let Some(_permit) = route.admit() else {
        let err = TunnelError::QuotaExceeded(route.config.max_connections.unwrap_or_default() as usize);
        reply(&mut st, &req.proxy_name, Some(&err)).await;
        return Err(err);
    };

    let work = match shared
        .broker
        .request(&route, format!("visitor:{}", req.run_id), String::new())
        .await
    {
        Ok(w) => w,
        Err(err) => {
            reply(&mut st, &req.proxy_name, Some(&err)).await;
            return Err(err);
        }
    };

    reply(&mut st, &req.proxy_name, None).await;
    let stats = net::splice(st, work, shared.splice.clone()).await;
    tracing::debug!(proxy=%req.proxy_name, up=stats.a_to_b, down=stats.b_to_a, "tunnel: visitor connection closed");
    Ok(())
}

async fn reply(st: &mut BoxedStream, proxy_name: &str, err: Option<&TunnelError>) {
    let resp = Message::NewVisitorConnResp(NewVisitorConnResp {
        proxy_name: proxy_name.to_string(),
        error: err.map(TunnelError::to_wire),
    });
    let _ = msg::write_msg(st, &resp).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ferry::tunnel::{
        kind::ProxyConfig,
        server::{
            broker::Broker,
            control::SessionHandle,
            listener::{ListenerManager, ListenerOptions},
        },
    };
    use std::time::Duration;

    fn registry() -> Registry {
        let broker = Arc::new(Broker::new(Duration::from_secs(1), ""));
        let opts = ListenerOptions {
            proxy_bind_addr: "127.0.0.1".into(),
            ..Default::default()
        };
        Registry::new(Arc::new(ListenerManager::new(opts, broker)), 0)
    }

    fn secret_proxy(name: &str, kind: ProxyKind) -> ProxyConfig {
        let mut cfg = ProxyConfig::new(name, kind, "127.0.0.1:22");
        cfg.secret_key = Some("abc123".into());
        cfg
    }

    #[tokio::test]
    async fn pairing_requires_matching_secret_and_kind() {
        let reg = registry();
        let owner = SessionHandle::stub_for_test(1, "run");
        reg.register(secret_proxy("ssh", ProxyKind::Stcp), &owner)
            .await
            .unwrap();
        reg.register(ProxyConfig::new("plain", ProxyKind::Tcp, "127.0.0.1:22"), &owner)
            .await
            .unwrap();

        let now = auth::now_unix();
        let good = auth::sign("abc123", now);
        let bad = auth::sign("wrong", now);

        assert!(check_pairing(&reg, "ssh", Some(ProxyKind::Stcp), &good, now).is_ok());
        assert!(check_pairing(&reg, "ssh", None, &good, now).is_ok());
        assert!(matches!(
            check_pairing(&reg, "ssh", Some(ProxyKind::Stcp), &bad, now),
            Err(TunnelError::SecretMismatch(_))
        ));
        assert!(matches!(
            check_pairing(&reg, "ssh", Some(ProxyKind::Xtcp), &good, now),
            Err(TunnelError::TypeUnsupported(_))
        ));
        assert!(matches!(
            check_pairing(&reg, "plain", None, &good, now),
            Err(TunnelError::TypeUnsupported(_))
        ));
        assert!(matches!(
            check_pairing(&reg, "nope", None, &good, now),
            Err(TunnelError::ProxyNotFound(_))
        ));

        let old = now - auth::MAX_TIMESTAMP_SKEW_SECS as i64 - 5;
        assert!(matches!(
            check_pairing(&reg, "ssh", None, &auth::sign("abc123", old), old),
            Err(TunnelError::SecretMismatch(_))
        ));
        reg.release_all().await;
    }
}
