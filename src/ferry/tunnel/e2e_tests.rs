use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::watch,
    task::JoinHandle,
};

use crate::ferry::tunnel::{
    auth,
    client::{Client, ClientOptions, SessionState},
    error::{ErrorCode, TunnelError},
    kind::{ProxyConfig, ProxyKind, VisitorConfig, VisitorMode},
    msg::{self, Login, LoginResp, Message, NewProxy, NewProxyResp, PROTOCOL_VERSION},
    nat::{Candidate, CandidateKind, NatOptions, NatRole},
    server::{Server, ServerOptions, listener::ListenerOptions},
    transport::{
        BoxedStream, QuicDialOptions, TransportDialOptions, TransportSession, transport_by_name,
    },
};

struct TestServer {
    server: Server,
    addr: SocketAddr,
    stop: watch::Sender<bool>,
}

async fn start_server(mut opts: ServerOptions) -> TestServer {
    opts.bind_addr = "127.0.0.1:0".into();
    opts.listeners.proxy_bind_addr = "127.0.0.1".into();
    let server = Server::new(opts).unwrap();
    let ln = server.listen().await.unwrap();
    let addr = ln.local_addr().unwrap();
    let (stop, rx) = watch::channel(false);
    let s = server.clone();
    tokio::spawn(async move { s.serve(ln, rx).await });
    TestServer { server, addr, stop }
}

struct TestClient {
    client: Client,
    stop: watch::Sender<bool>,
    task: JoinHandle<anyhow::Result<()>>,
}

fn client_opts(server: &TestServer) -> ClientOptions {
    ClientOptions {
        server_addr: server.addr.to_string(),
        heartbeat_interval: Duration::from_millis(200),
        dial_timeout: Duration::from_secs(2),
        ..ClientOptions::default()
    }
}

fn start_client(opts: ClientOptions) -> TestClient {
    let client = Client::new(opts).unwrap();
    let (stop, rx) = watch::channel(false);
    let c = client.clone();
    let task = tokio::spawn(async move { c.run(rx).await });
    TestClient { client, stop, task }
}

async fn wait_until(what: &str, mut f: impl FnMut() -> bool) {
    let res = tokio::time::timeout(Duration::from_secs(5), async {
        while !f() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(res.is_ok(), "timed out waiting for {what}");
}

/// Waits for `name` to be running and returns its public address.
async fn running_addr(c: &Client, name: &str) -> String {
    let mut addr = String::new();
    wait_until(name, || {
        let st = c.status();
        match st.proxies.iter().find(|p| p.name == name) {
            Some(p) if p.status == "running" => {
                addr = p.remote_addr.clone();
                true
            }
            _ => false,
        }
    })
    .await;
    addr
}

async fn echo_server() -> SocketAddr {
    let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = ln.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut c, _)) = ln.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = c.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

async fn roundtrip(addr: &str, payload: &[u8]) -> Vec<u8> {
    let c = TcpStream::connect(addr).await.unwrap();
    let (mut r, mut w) = c.into_split();
    let data = payload.to_vec();
    let writer = tokio::spawn(async move {
        w.write_all(&data).await.unwrap();
        w.shutdown().await.unwrap();
    });
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), r.read_to_end(&mut out))
        .await
        .unwrap()
        .unwrap();
    writer.await.unwrap();
    out
}

fn pattern(n: usize) -> Vec<u8> {
    (0..n).map(|i| (i * 31 % 251) as u8).collect()
}

async fn forward_tcp(server_opts: ServerOptions, client_opts_fn: impl FnOnce(ClientOptions) -> ClientOptions) {
    let srv = start_server(server_opts).await;
    let local = echo_server().await;

    let mut opts = client_opts(&srv);
    opts.proxies = vec![ProxyConfig::new("echo", ProxyKind::Tcp, local.to_string())];
    let c = start_client(client_opts_fn(opts));

    let public = running_addr(&c.client, "echo").await;
    assert_eq!(roundtrip(&public, b"hello ferry").await, b"hello ferry");

    let big = pattern(256 * 1024);
    assert_eq!(roundtrip(&public, &big).await, big);

    let _ = c.stop.send(true);
    assert!(c.task.await.unwrap().is_ok());
    let _ = srv.stop.send(true);
}

#[tokio::test]
async fn tcp_proxy_forwards_bytes_unmodified() {
    forward_tcp(ServerOptions::default(), |o| o).await;
}

#[tokio::test]
async fn tcp_proxy_without_multiplexing() {
    let server = ServerOptions {
        tcp_mux: false,
        ..ServerOptions::default()
    };
    forward_tcp(server, |o| ClientOptions { tcp_mux: false, ..o }).await;
}

#[tokio::test]
async fn tcp_proxy_over_quic() {
    let server = ServerOptions {
        transport: "quic".into(),
        ..ServerOptions::default()
    };
    forward_tcp(server, |o| ClientOptions {
        transport: "quic".into(),
        quic: QuicDialOptions {
            insecure_skip_verify: true,
            ..QuicDialOptions::default()
        },
        ..o
    })
    .await;
}

async fn rejected_login(tcp_mux: bool) {
    let srv = start_server(ServerOptions {
        auth_token: "right".into(),
        tcp_mux,
        ..ServerOptions::default()
    })
    .await;
    let c = start_client(ClientOptions {
        auth_token: "wrong".into(),
        login_fail_exit: false,
        tcp_mux,
        ..client_opts(&srv)
    });
    // Only a delivered rejection stops a client that retries on failure.
    let res = tokio::time::timeout(Duration::from_secs(5), c.task)
        .await
        .expect("client kept retrying")
        .unwrap();
    let err = res.unwrap_err();
    let code = err.downcast_ref::<TunnelError>().map(TunnelError::code);
    assert_eq!(code, Some(ErrorCode::Auth), "{err:#}");
    assert_eq!(*c.client.state().borrow(), SessionState::Closed);
    let _ = srv.stop.send(true);
}

#[tokio::test]
async fn wrong_token_stops_client() {
    rejected_login(true).await;
}

#[tokio::test]
async fn wrong_token_stops_client_without_multiplexing() {
    rejected_login(false).await;
}

fn stcp_visitor(name: &str, secret: &str, port: u16) -> VisitorConfig {
    VisitorConfig {
        name: name.into(),
        kind: ProxyKind::Stcp,
        server_name: "secret-echo".into(),
        secret_key: secret.into(),
        mode: VisitorMode::Relayed,
        bind_addr: format!("127.0.0.1:{port}"),
        fallback_to_relay: false,
    }
}

#[tokio::test]
async fn stcp_pair_relays_through_server() {
    let srv = start_server(ServerOptions::default()).await;
    let local = echo_server().await;

    let mut provider = client_opts(&srv);
    let mut p = ProxyConfig::new("secret-echo", ProxyKind::Stcp, local.to_string());
    p.secret_key = Some("abc123".into());
    provider.proxies = vec![p];
    let provider = start_client(provider);
    running_addr(&provider.client, "secret-echo").await;

    let good_port = free_port();
    let bad_port = free_port();
    let mut visitor = client_opts(&srv);
    visitor.visitors = vec![
        stcp_visitor("good", "abc123", good_port),
        stcp_visitor("bad", "abc124", bad_port),
    ];
    let visitor = start_client(visitor);
    let mut state = visitor.client.state();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == SessionState::Active),
    )
    .await
    .unwrap()
    .unwrap();

    let good = format!("127.0.0.1:{good_port}");
    assert_eq!(roundtrip(&good, b"through the relay").await, b"through the relay");

    // A mismatched secret gets the connection closed without data.
    let bad = format!("127.0.0.1:{bad_port}");
    let mut c = TcpStream::connect(&bad).await.unwrap();
    let _ = c.write_all(b"ping").await;
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(5), c.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);

    let _ = visitor.stop.send(true);
    let _ = provider.stop.send(true);
    let _ = srv.stop.send(true);
}

/// A session driven by hand, so the test decides when heartbeats stop.
struct RawSession {
    session: Arc<dyn TransportSession>,
    control: BoxedStream,
    run_id: String,
}

async fn raw_login(addr: SocketAddr, run_id: &str) -> (RawSession, LoginResp) {
    let tr = transport_by_name("tcp").unwrap();
    let session = tr
        .dial(
            &addr.to_string(),
            TransportDialOptions {
                tcp_mux: true,
                ..TransportDialOptions::default()
            },
        )
        .await
        .unwrap();
    let mut control = session.open_stream().await.unwrap();
    let ts = auth::now_unix();
    let login = Message::Login(Login {
        version: PROTOCOL_VERSION.into(),
        run_id: run_id.into(),
        user: String::new(),
        hostname: "test".into(),
        os: std::env::consts::OS.into(),
        arch: std::env::consts::ARCH.into(),
        timestamp: ts,
        privilege_key: auth::sign("", ts),
        metadata: Default::default(),
    });
    msg::write_msg(&mut control, &login).await.unwrap();
    let Message::LoginResp(resp) = msg::read_msg(&mut control).await.unwrap() else {
        panic!("expected LoginResp");
    };
    assert!(resp.error.is_none(), "{:?}", resp.error);
    (
        RawSession {
            session,
            control,
            run_id: resp.run_id.clone(),
        },
        resp,
    )
}

impl RawSession {
    async fn register(&mut self, cfg: ProxyConfig) -> NewProxyResp {
        msg::write_msg(&mut self.control, &Message::NewProxy(NewProxy { proxy: cfg }))
            .await
            .unwrap();
        match msg::read_msg(&mut self.control).await.unwrap() {
            Message::NewProxyResp(r) => r,
            other => panic!("unexpected {}", other.name()),
        }
    }
}

#[tokio::test]
async fn heartbeat_expiry_frees_names() {
    let srv = start_server(ServerOptions {
        heartbeat_timeout: Duration::from_millis(300),
        resume_grace: Duration::from_secs(30),
        ..ServerOptions::default()
    })
    .await;
    let cfg = ProxyConfig::new("shared", ProxyKind::Tcp, "127.0.0.1:1");

    let (mut a, resp) = raw_login(srv.addr, "run-a").await;
    assert_eq!(resp.run_id, "run-a");
    assert!(a.register(cfg.clone()).await.error.is_none());

    let (mut b, _) = raw_login(srv.addr, "run-b").await;
    let err = b.register(cfg.clone()).await.error.expect("conflict");
    assert_eq!(err.code, ErrorCode::NameConflict);

    // Neither raw session pings.
    let server = srv.server.clone();
    wait_until("sessions to expire", || server.sessions().is_empty()).await;

    let (mut c, _) = raw_login(srv.addr, "run-c").await;
    let resp = c.register(cfg).await;
    assert!(resp.error.is_none(), "{:?}", resp.error);
    let owner = srv
        .server
        .proxies()
        .into_iter()
        .find(|p| p.name == "shared")
        .map(|p| p.run_id);
    assert_eq!(owner.as_deref(), Some("run-c"));

    let _ = srv.stop.send(true);
}

#[tokio::test]
async fn reconnect_with_same_run_id_resumes_proxies() {
    let srv = start_server(ServerOptions {
        heartbeat_timeout: Duration::from_millis(300),
        resume_grace: Duration::from_secs(30),
        ..ServerOptions::default()
    })
    .await;

    let (mut a, _) = raw_login(srv.addr, "run-keep").await;
    let first = a
        .register(ProxyConfig::new("kept", ProxyKind::Tcp, "127.0.0.1:1"))
        .await;
    assert!(first.error.is_none());
    drop(a);

    let server = srv.server.clone();
    wait_until("session to drop", || server.sessions().is_empty()).await;

    let (_b, resp) = raw_login(srv.addr, "run-keep").await;
    assert_eq!(resp.resumed, vec!["kept".to_string()]);
    let kept = srv
        .server
        .proxies()
        .into_iter()
        .find(|p| p.name == "kept")
        .unwrap();
    assert_eq!(kept.remote_addr, first.remote_addr);

    let _ = srv.stop.send(true);
}

#[tokio::test]
async fn large_transfer_both_ways_over_one_mux_session() {
    let srv = start_server(ServerOptions::default()).await;
    let local = echo_server().await;

    let mut opts = client_opts(&srv);
    opts.proxies = vec![ProxyConfig::new("echo", ProxyKind::Tcp, local.to_string())];
    let c = start_client(opts);
    let public = running_addr(&c.client, "echo").await;

    // Several times the per-stream window, two connections at once.
    let big = pattern(3 * 1024 * 1024);
    let (a, b) = tokio::join!(roundtrip_within(&public, &big, 30), roundtrip_within(&public, &big, 30));
    assert!(a == big && b == big);

    let _ = c.stop.send(true);
    let _ = srv.stop.send(true);
}

async fn roundtrip_within(addr: &str, payload: &[u8], secs: u64) -> Vec<u8> {
    let c = TcpStream::connect(addr).await.unwrap();
    let (mut r, mut w) = c.into_split();
    let data = payload.to_vec();
    let writer = tokio::spawn(async move {
        w.write_all(&data).await.unwrap();
        w.shutdown().await.unwrap();
    });
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(secs), r.read_to_end(&mut out))
        .await
        .expect("transfer stalled")
        .unwrap();
    writer.await.unwrap();
    out
}

#[tokio::test]
async fn control_frame_split_across_heartbeats() {
    let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = ln.local_addr().unwrap();
    let accepted = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let count = accepted.clone();
    tokio::spawn(async move {
        while let Ok((c, _)) = ln.accept().await {
            count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            tokio::spawn(async move {
                let (mut rd, mut wr) = c.into_split();
                let Ok(Message::Login(_)) = msg::read_msg(&mut rd).await else {
                    return;
                };
                let resp = Message::LoginResp(LoginResp {
                    version: PROTOCOL_VERSION.into(),
                    run_id: "split".into(),
                    resumed: Vec::new(),
                    nat_hole_port: None,
                    error: None,
                });
                msg::write_msg(&mut wr, &resp).await.unwrap();
                let Ok(Message::NewProxy(np)) = msg::read_msg(&mut rd).await else {
                    return;
                };
                // Pings keep coming; read and drop them.
                tokio::spawn(async move { while msg::read_msg(&mut rd).await.is_ok() {} });

                let frame = msg::encode(&Message::NewProxyResp(NewProxyResp {
                    name: np.proxy.name,
                    remote_addr: "127.0.0.1:4242".into(),
                    error: None,
                }))
                .unwrap();
                wr.write_all(&frame[..3]).await.unwrap();
                tokio::time::sleep(Duration::from_millis(300)).await;
                wr.write_all(&frame[3..]).await.unwrap();
                tokio::time::sleep(Duration::from_secs(30)).await;
            });
        }
    });

    let mut opts = ClientOptions {
        server_addr: addr.to_string(),
        tcp_mux: false,
        heartbeat_interval: Duration::from_millis(20),
        heartbeat_timeout: Duration::from_secs(10),
        dial_timeout: Duration::from_secs(2),
        ..ClientOptions::default()
    };
    opts.proxies = vec![ProxyConfig::new("split", ProxyKind::Tcp, "127.0.0.1:1")];
    let c = start_client(opts);

    assert_eq!(running_addr(&c.client, "split").await, "127.0.0.1:4242");
    assert_eq!(accepted.load(std::sync::atomic::Ordering::SeqCst), 1);
    let _ = c.stop.send(true);
}

async fn http_backend(name: &'static str) -> SocketAddr {
    let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = ln.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut c, _)) = ln.accept().await {
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                loop {
                    let Ok(n) = c.read(&mut buf).await else { return };
                    if n == 0 {
                        return;
                    }
                    head.extend_from_slice(&buf[..n]);
                    let Some(end) = head.windows(4).position(|w| w == b"\r\n\r\n") else {
                        continue;
                    };
                    let req = String::from_utf8_lossy(&head[..end]).to_ascii_lowercase();
                    head.drain(..end + 4);
                    let resp = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{name}",
                        name.len()
                    );
                    if c.write_all(resp.as_bytes()).await.is_err() {
                        return;
                    }
                    if req.contains("connection: close") {
                        let _ = c.shutdown().await;
                        return;
                    }
                }
            });
        }
    });
    addr
}

fn vhost_server() -> ServerOptions {
    ServerOptions {
        work_conn_timeout: Duration::from_millis(300),
        listeners: ListenerOptions {
            vhost_http_port: Some(0),
            vhost_https_port: Some(0),
            tcpmux_http_connect_port: Some(0),
            ..ListenerOptions::default()
        },
        ..ServerOptions::default()
    }
}

fn vhost_proxy(name: &str, kind: ProxyKind, domain: &str, local: SocketAddr) -> ProxyConfig {
    let mut p = ProxyConfig::new(name, kind, local.to_string());
    p.custom_domains = vec![domain.into()];
    p
}

/// `http://a.test:PORT` to `127.0.0.1:PORT`.
fn vhost_addr(remote_addr: &str) -> String {
    let port = remote_addr.rsplit(':').next().unwrap();
    format!("127.0.0.1:{port}")
}

/// Writes `req` and reads until the server closes.
async fn exchange(addr: &str, req: &[u8]) -> Vec<u8> {
    let mut c = TcpStream::connect(addr).await.unwrap();
    c.write_all(req).await.unwrap();
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), c.read_to_end(&mut out))
        .await
        .expect("connection was not closed")
        .unwrap_or_default();
    out
}

#[tokio::test]
async fn vhost_http_routes_by_host_and_answers_errors() {
    let srv = start_server(vhost_server()).await;
    let a = http_backend("alpha").await;
    let b = http_backend("beta").await;

    let mut opts = client_opts(&srv);
    opts.proxies = vec![
        vhost_proxy("a", ProxyKind::Http, "a.test", a),
        vhost_proxy("b", ProxyKind::Http, "b.test", b),
    ];
    let c = start_client(opts);
    let http = vhost_addr(&running_addr(&c.client, "a").await);
    running_addr(&c.client, "b").await;

    // The client asks for keep-alive, yet the connection ends after one
    // response, so the next Host gets a fresh route.
    let resp = exchange(&http, b"GET / HTTP/1.1\r\nHost: a.test\r\nConnection: keep-alive\r\n\r\n").await;
    assert!(resp.ends_with(b"alpha"), "{}", String::from_utf8_lossy(&resp));
    let resp = exchange(&http, b"GET / HTTP/1.1\r\nHost: B.test:80\r\n\r\n").await;
    assert!(resp.ends_with(b"beta"), "{}", String::from_utf8_lossy(&resp));

    let resp = exchange(&http, b"GET / HTTP/1.1\r\nHost: nobody.test\r\n\r\n").await;
    assert!(resp.starts_with(b"HTTP/1.1 404"), "{}", String::from_utf8_lossy(&resp));

    // A route whose owner never answers work requests.
    let (mut raw, _) = raw_login(srv.addr, "silent").await;
    let resp = raw
        .register(vhost_proxy("slow", ProxyKind::Http, "slow.test", a))
        .await;
    assert!(resp.error.is_none(), "{:?}", resp.error);
    let resp = exchange(&http, b"GET / HTTP/1.1\r\nHost: slow.test\r\n\r\n").await;
    assert!(resp.starts_with(b"HTTP/1.1 504"), "{}", String::from_utf8_lossy(&resp));

    let _ = c.stop.send(true);
    let _ = srv.stop.send(true);
}

#[tokio::test]
async fn vhost_https_and_tcpmux_route_by_name() {
    use crate::ferry::tunnel::server::vhost::tests::client_hello;

    let srv = start_server(vhost_server()).await;
    let local = echo_server().await;

    let mut opts = client_opts(&srv);
    opts.proxies = vec![
        vhost_proxy("tls", ProxyKind::Https, "secure.test", local),
        vhost_proxy("mux", ProxyKind::Tcpmux, "db.test", local),
    ];
    let c = start_client(opts);
    let https = vhost_addr(&running_addr(&c.client, "tls").await);
    let tcpmux = vhost_addr(&running_addr(&c.client, "mux").await);

    // The ClientHello is forwarded untouched.
    let hello = client_hello("secure.test");
    assert_eq!(roundtrip(&https, &hello).await, hello);
    // Unknown names see the connection close.
    assert!(exchange(&https, &client_hello("other.test")).await.is_empty());

    let mut conn = b"CONNECT db.test:5432 HTTP/1.1\r\nHost: db.test:5432\r\n\r\n".to_vec();
    conn.extend_from_slice(b"payload");
    let mut expect = b"HTTP/1.1 200 Connection established\r\n\r\n".to_vec();
    expect.extend_from_slice(b"payload");
    assert_eq!(roundtrip(&tcpmux, &conn).await, expect);

    let resp = exchange(&tcpmux, b"CONNECT nowhere.test:1 HTTP/1.1\r\n\r\n").await;
    assert!(resp.starts_with(b"HTTP/1.1 404"), "{}", String::from_utf8_lossy(&resp));

    let _ = c.stop.send(true);
    let _ = srv.stop.send(true);
}

async fn udp_echo_server() -> SocketAddr {
    let sock = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = sock.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        while let Ok((n, from)) = sock.recv_from(&mut buf).await {
            let _ = sock.send_to(&buf[..n], from).await;
        }
    });
    addr
}

/// Sends `payload` until an answer comes back; flows are set up lazily.
async fn udp_exchange(target: &str, payload: &[u8]) -> Vec<u8> {
    let sock = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut buf = vec![0u8; 65536];
    let res = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            sock.send_to(payload, target).await.unwrap();
            if let Ok(Ok((n, _))) =
                tokio::time::timeout(Duration::from_millis(200), sock.recv_from(&mut buf)).await
            {
                return buf[..n].to_vec();
            }
        }
    })
    .await;
    res.expect("no datagram came back")
}

#[tokio::test]
async fn udp_proxy_keeps_datagram_boundaries() {
    let srv = start_server(ServerOptions::default()).await;
    let local = udp_echo_server().await;

    let mut opts = client_opts(&srv);
    opts.proxies = vec![ProxyConfig::new("dns", ProxyKind::Udp, local.to_string())];
    let c = start_client(opts);
    let public = running_addr(&c.client, "dns").await;

    assert_eq!(udp_exchange(&public, b"one datagram").await, b"one datagram");
    let big = pattern(1200);
    assert_eq!(udp_exchange(&public, &big).await, big);

    let _ = c.stop.send(true);
    let _ = srv.stop.send(true);
}

#[tokio::test]
async fn sudp_visitor_reaches_provider() {
    let srv = start_server(ServerOptions::default()).await;
    let local = udp_echo_server().await;

    let mut provider = client_opts(&srv);
    let mut p = ProxyConfig::new("secret-udp", ProxyKind::Sudp, local.to_string());
    p.secret_key = Some("udp-secret".into());
    provider.proxies = vec![p];
    let provider = start_client(provider);
    running_addr(&provider.client, "secret-udp").await;

    let port = {
        let s = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        s.local_addr().unwrap().port()
    };
    let mut visitor = client_opts(&srv);
    visitor.visitors = vec![VisitorConfig {
        name: "udp-visitor".into(),
        kind: ProxyKind::Sudp,
        server_name: "secret-udp".into(),
        secret_key: "udp-secret".into(),
        mode: VisitorMode::Relayed,
        bind_addr: format!("127.0.0.1:{port}"),
        fallback_to_relay: false,
    }];
    let visitor = start_client(visitor);

    let target = format!("127.0.0.1:{port}");
    assert_eq!(udp_exchange(&target, b"over sudp").await, b"over sudp");

    let _ = visitor.stop.send(true);
    let _ = provider.stop.send(true);
    let _ = srv.stop.send(true);
}

fn xtcp_visitor(port: u16, fallback_to_relay: bool) -> VisitorConfig {
    VisitorConfig {
        name: "p2p".into(),
        kind: ProxyKind::Xtcp,
        server_name: "p2p-echo".into(),
        secret_key: "p2p-secret".into(),
        mode: VisitorMode::Direct,
        bind_addr: format!("127.0.0.1:{port}"),
        fallback_to_relay,
    }
}

fn xtcp_proxy(local: SocketAddr) -> ProxyConfig {
    let mut p = ProxyConfig::new("p2p-echo", ProxyKind::Xtcp, local.to_string());
    p.secret_key = Some("p2p-secret".into());
    p
}

fn fast_nat() -> NatOptions {
    NatOptions {
        attempt_timeout: Duration::from_millis(100),
        negotiation_timeout: Duration::from_millis(1500),
        ..NatOptions::default()
    }
}

async fn wait_active(c: &Client) {
    let mut state = c.state();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == SessionState::Active),
    )
    .await
    .unwrap()
    .unwrap();
}

#[tokio::test]
async fn xtcp_visitor_connects_directly() {
    let srv = start_server(ServerOptions::default()).await;
    let local = echo_server().await;

    let mut provider = client_opts(&srv);
    provider.nat = fast_nat();
    provider.proxies = vec![xtcp_proxy(local)];
    let provider = start_client(provider);
    running_addr(&provider.client, "p2p-echo").await;

    let port = free_port();
    let mut visitor = client_opts(&srv);
    visitor.nat = fast_nat();
    visitor.visitors = vec![xtcp_visitor(port, false)];
    let visitor = start_client(visitor);
    wait_active(&visitor.client).await;

    // Without relay fallback, only the punched path can carry this.
    let addr = format!("127.0.0.1:{port}");
    assert_eq!(roundtrip(&addr, b"peer to peer").await, b"peer to peer");
    // The second connection reuses the negotiated session.
    assert_eq!(roundtrip(&addr, b"again").await, b"again");

    let _ = visitor.stop.send(true);
    let _ = provider.stop.send(true);
    let _ = srv.stop.send(true);
}

/// An xtcp provider that never answers candidate offers but serves relayed
/// work connections with an echo. Returns how many work requests it saw.
async fn unreachable_xtcp_provider(srv: &TestServer) -> Arc<std::sync::atomic::AtomicUsize> {
    let (mut raw, _) = raw_login(srv.addr, "unreachable").await;
    let resp = raw.register(xtcp_proxy("127.0.0.1:1".parse().unwrap())).await;
    assert!(resp.error.is_none(), "{:?}", resp.error);

    let served = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let count = served.clone();
    tokio::spawn(async move {
        while let Ok(m) = msg::read_msg(&mut raw.control).await {
            let Message::ReqWorkConn(req) = m else { continue };
            count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let session = raw.session.clone();
            let run_id = raw.run_id.clone();
            tokio::spawn(async move {
                let mut st = session.open_stream().await.unwrap();
                let ts = auth::now_unix();
                let hello = Message::NewWorkConn(msg::NewWorkConn {
                    run_id,
                    request_id: req.request_id,
                    timestamp: ts,
                    privilege_key: auth::sign("", ts),
                });
                msg::write_msg(&mut st, &hello).await.unwrap();
                let Ok(Message::StartWorkConn(_)) = msg::read_msg(&mut st).await else {
                    return;
                };
                let (mut r, mut w) = tokio::io::split(st);
                let _ = tokio::io::copy(&mut r, &mut w).await;
                let _ = w.shutdown().await;
            });
        }
    });
    served
}

#[tokio::test]
async fn xtcp_falls_back_to_relay_when_punching_fails() {
    let srv = start_server(ServerOptions {
        nat: fast_nat(),
        ..ServerOptions::default()
    })
    .await;
    let served = unreachable_xtcp_provider(&srv).await;

    let port = free_port();
    let mut visitor = client_opts(&srv);
    visitor.nat = fast_nat();
    visitor.visitors = vec![xtcp_visitor(port, true)];
    let visitor = start_client(visitor);
    wait_active(&visitor.client).await;

    let addr = format!("127.0.0.1:{port}");
    assert_eq!(roundtrip(&addr, b"relayed instead").await, b"relayed instead");
    assert_eq!(served.load(std::sync::atomic::Ordering::SeqCst), 1);

    let _ = visitor.stop.send(true);
    let _ = srv.stop.send(true);
}

#[tokio::test]
async fn xtcp_without_fallback_fails_when_punching_fails() {
    let srv = start_server(ServerOptions {
        nat: fast_nat(),
        ..ServerOptions::default()
    })
    .await;
    let served = unreachable_xtcp_provider(&srv).await;

    let port = free_port();
    let mut visitor = client_opts(&srv);
    visitor.nat = fast_nat();
    visitor.visitors = vec![xtcp_visitor(port, false)];
    let visitor = start_client(visitor);
    wait_active(&visitor.client).await;

    let addr = format!("127.0.0.1:{port}");
    let mut c = TcpStream::connect(&addr).await.unwrap();
    let _ = c.write_all(b"hello?").await;
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(5), c.read(&mut buf))
        .await
        .expect("visitor kept the connection open")
        .unwrap_or(0);
    assert_eq!(n, 0);
    assert_eq!(served.load(std::sync::atomic::Ordering::SeqCst), 0);

    let _ = visitor.stop.send(true);
    let _ = srv.stop.send(true);
}

#[tokio::test]
async fn stopped_provider_stops_punching() {
    let srv = start_server(ServerOptions::default()).await;
    let local = echo_server().await;

    let mut provider = client_opts(&srv);
    provider.nat = NatOptions {
        attempt_timeout: Duration::from_millis(50),
        negotiation_timeout: Duration::from_secs(60),
        ..NatOptions::default()
    };
    provider.proxies = vec![xtcp_proxy(local)];
    let provider = start_client(provider);
    running_addr(&provider.client, "p2p-echo").await;

    // A visitor whose only candidate is a socket that never answers.
    let target = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (mut raw, _) = raw_login(srv.addr, "visitor").await;
    let ts = auth::now_unix();
    let offer = Message::NatCandidates(msg::NatCandidates {
        peering_id: "stuck".into(),
        role: NatRole::Visitor,
        proxy_name: "p2p-echo".into(),
        sign_key: auth::sign("p2p-secret", ts),
        timestamp: ts,
        candidates: vec![Candidate::new(
            target.local_addr().unwrap(),
            CandidateKind::Host,
        )],
        cert_fingerprint: String::new(),
        error: None,
    });
    msg::write_msg(&mut raw.control, &offer).await.unwrap();

    let mut buf = [0u8; 2048];
    tokio::time::timeout(Duration::from_secs(5), target.recv_from(&mut buf))
        .await
        .expect("provider never punched")
        .unwrap();

    let _ = provider.stop.send(true);
    tokio::time::timeout(Duration::from_secs(5), provider.task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    // Drain what was in flight, then expect silence.
    while let Ok(Ok(_)) =
        tokio::time::timeout(Duration::from_millis(200), target.recv_from(&mut buf)).await
    {}
    let late = tokio::time::timeout(Duration::from_millis(500), target.recv_from(&mut buf)).await;
    assert!(late.is_err(), "provider kept punching after shutdown");

    let _ = srv.stop.send(true);
}
