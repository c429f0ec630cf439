use std::{net::SocketAddr, sync::Arc};

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::ferry::tunnel::{client::Client, server::Server};

/// What the admin endpoint reports on.
#[derive(Clone)]
pub enum AdminState {
    Server(Server),
    Client(Client),
}

pub fn router(state: AdminState) -> Router {
    let app = match state {
        AdminState::Server(server) => Router::new()
            .route("/health", get(health))
            .route("/api/sessions", get(sessions))
            .route("/api/proxies", get(proxies))
            .with_state(Arc::new(server)),
        AdminState::Client(client) => Router::new()
            .route("/health", get(health))
            .route("/api/status", get(status))
            .with_state(Arc::new(client)),
    };
    app.layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(admin_addr = %listener.local_addr()?, "admin: listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|s| *s).await;
        })
        .await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { ok: true }))
}

async fn sessions(State(server): State<Arc<Server>>) -> impl IntoResponse {
    (StatusCode::OK, Json(server.sessions()))
}

async fn proxies(State(server): State<Arc<Server>>) -> impl IntoResponse {
    (StatusCode::OK, Json(server.proxies()))
}

async fn status(State(client): State<Arc<Client>>) -> impl IntoResponse {
    (StatusCode::OK, Json(client.status()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::ferry::tunnel::server::ServerOptions;

    async fn get_path(addr: SocketAddr, path: &str) -> String {
        let mut c = tokio::net::TcpStream::connect(addr).await.unwrap();
        let req = format!("GET {path} HTTP/1.1\r\nHost: admin\r\nConnection: close\r\n\r\n");
        c.write_all(req.as_bytes()).await.unwrap();
        let mut out = String::new();
        c.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn server_admin_lists_sessions_and_proxies() {
        let server = Server::new(ServerOptions::default()).unwrap();
        let app = router(AdminState::Server(server));
        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(ln, app).await;
        });

        let health = get_path(addr, "/health").await;
        assert!(health.starts_with("HTTP/1.1 200"), "{health}");
        assert!(health.contains(r#"{"ok":true}"#));

        let sessions = get_path(addr, "/api/sessions").await;
        assert!(sessions.starts_with("HTTP/1.1 200"));
        assert!(sessions.ends_with("[]"), "{sessions}");

        let missing = get_path(addr, "/api/status").await;
        assert!(missing.starts_with("HTTP/1.1 404"), "{missing}");
    }
}
