use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Context;
use tokio::{sync::watch, task::JoinSet};

use crate::ferry::{
    admin, config, logging, net,
    tunnel::{client::Client, server::Server},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Server => write!(f, "server"),
            Role::Client => write!(f, "client"),
        }
    }
}

pub async fn run(role: Role, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let _logrt = logging::init(&cfg.logging)?;

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    let (admin_addr, admin_state) = match role {
        Role::Server => {
            let sc = cfg.server.with_context(|| {
                format!("config: no [server] section in {}", resolved.path.display())
            })?;
            tracing::info!(
                config = %resolved.path.display(),
                bind_addr = %sc.options.bind_addr,
                transport = %sc.options.transport,
                admin_addr = %sc.admin_addr,
                "ferry: starting server"
            );
            let server = Server::new(sc.options)?;
            let shutdown = shutdown_rx.clone();
            let s = server.clone();
            tasks.spawn(async move { s.listen_and_serve(shutdown).await });
            (sc.admin_addr, admin::AdminState::Server(server))
        }
        Role::Client => {
            let cc = cfg.client.with_context(|| {
                format!("config: no [client] section in {}", resolved.path.display())
            })?;
            tracing::info!(
                config = %resolved.path.display(),
                server_addr = %cc.options.server_addr,
                transport = %cc.options.transport,
                proxies = cc.options.proxies.len(),
                visitors = cc.options.visitors.len(),
                admin_addr = %cc.admin_addr,
                "ferry: starting client"
            );
            let client = Client::new(cc.options)?;
            let shutdown = shutdown_rx.clone();
            let c = client.clone();
            tasks.spawn(async move { c.run(shutdown).await });
            (cc.admin_addr, admin::AdminState::Client(client))
        }
    };

    if !admin_addr.is_empty() {
        let addr: SocketAddr = net::normalize_bind_addr(&admin_addr)
            .parse()
            .with_context(|| format!("invalid admin_addr: {admin_addr}"))?;
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, admin_state, shutdown).await });
    }

    // Wait for a signal or for a task to end on its own.
    let res = tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!(role = %role, "shutdown: signal");
            Ok(())
        }
        res = tasks.join_next() => match res {
            Some(Ok(Ok(()))) | None => Ok(()),
            Some(Ok(Err(err))) => Err(err),
            Some(Err(join_err)) => Err(join_err.into()),
        },
    };
    let _ = shutdown_tx.send(true);

    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tracing::warn!("shutdown: tasks did not stop in time; aborting");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    res
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
