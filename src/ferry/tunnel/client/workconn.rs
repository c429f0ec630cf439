use std::sync::Arc;

use anyhow::Context;
use tokio::net::{TcpStream, UdpSocket};

use crate::ferry::{
    net::{self, SpliceOptions},
    tunnel::{
        auth,
        client::{Inner, Link, LocalProxy},
        datagram,
        error,
        msg::{self, Message, NewWorkConn, ReqWorkConn},
        transport::BoxedStream,
    },
};

/// Answers one `ReqWorkConn`: open a stream, bind it to the request, then
/// carry it to the local service.
pub(crate) async fn handle(inner: Arc<Inner>, link: Arc<Link>, req: ReqWorkConn) -> anyhow::Result<()> {
    let Some(proxy) = inner.proxies.get(&req.proxy_name) else {
        tracing::warn!(proxy=%req.proxy_name, "tunnel: work request for unknown proxy");
        return Ok(());
    };

    let mut st = link.session.open_stream().await?;
    let ts = auth::now_unix();
    let hello = Message::NewWorkConn(NewWorkConn {
        run_id: link.run_id.clone(),
        request_id: req.request_id,
        timestamp: ts,
        privilege_key: auth::sign(&inner.opts.auth_token, ts),
    });
    msg::write_msg(&mut st, &hello).await?;

    let start = tokio::time::timeout(inner.opts.dial_timeout, msg::read_msg(&mut st))
        .await
        .context("tunnel: waiting for StartWorkConn")??;
    let start = match start {
        Message::StartWorkConn(s) => s,
        Message::Close(c) => anyhow::bail!("tunnel: work connection refused: {}", c.reason),
        other => return Err(other.unexpected("StartWorkConn").into()),
    };
    error::check(start.error)?;

    tracing::debug!(
        proxy=%start.proxy_name,
        request_id=start.request_id,
        src=%start.src_addr,
        dst=%start.dst_addr,
        "tunnel: work connection started"
    );
    serve_local(&inner, proxy, st).await
}

/// Connects `st` to the proxy's local address.
pub(crate) async fn serve_local(inner: &Inner, proxy: &LocalProxy, st: BoxedStream) -> anyhow::Result<()> {
    let local = proxy.cfg.local_addr.trim();
    if proxy.cfg.kind.is_datagram() {
        let target = net::resolve_socket_addr(local).await?;
        let bind = if target.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
        let sock = UdpSocket::bind(bind).await?;
        sock.connect(target).await?;
        return datagram::relay_connected(st, sock).await;
    }

    let up = tokio::time::timeout(inner.opts.dial_timeout, TcpStream::connect(local))
        .await
        .with_context(|| format!("tunnel: dial {local} timed out"))?
        .with_context(|| format!("tunnel: dial {local}"))?;
    let _ = up.set_nodelay(true);
    let opts = SpliceOptions {
        limiter: proxy.limiter.clone(),
        ..SpliceOptions::default()
    };
    let stats = net::splice(st, up, opts).await;
    tracing::debug!(proxy=%proxy.cfg.name, up=stats.a_to_b, down=stats.b_to_a, "tunnel: local connection closed");
    Ok(())
}
