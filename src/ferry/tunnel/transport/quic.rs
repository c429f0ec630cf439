use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use pin_project_lite::pin_project;
use quinn::{ClientConfig, Connection, Endpoint, EndpointConfig, ServerConfig, TransportConfig};
use tokio::sync::{Mutex, mpsc};

use crate::ferry::net;
use crate::ferry::tunnel::transport::{
    BoxedStream, Transport, TransportDialOptions, TransportListenOptions, TransportListener,
    TransportSession,
};

const TUNNEL_ALPN: &[u8] = b"ferry";
const P2P_ALPN: &[u8] = b"ferry-p2p";
const P2P_SERVER_NAME: &str = "ferry-p2p";

/// Server certificate. Both empty means a throwaway self-signed one.
#[derive(Debug, Clone, Default)]
pub struct QuicListenOptions {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone, Default)]
pub struct QuicDialOptions {
    /// SNI; `localhost` when empty.
    pub server_name: String,
    pub insecure_skip_verify: bool,
}

pub struct QuicTransport;

impl QuicTransport {
    pub fn new() -> Self {
        Self
    }
}

fn transport_config() -> anyhow::Result<TransportConfig> {
    let mut transport_cfg = TransportConfig::default();
    transport_cfg.max_idle_timeout(Some(Duration::from_secs(60).try_into()?));
    transport_cfg.keep_alive_interval(Some(Duration::from_secs(20)));
    Ok(transport_cfg)
}

fn server_config(
    certs: Vec<rustls::pki_types::CertificateDer<'static>>,
    key: rustls::pki_types::PrivateKeyDer<'static>,
    next_protos: Vec<Vec<u8>>,
) -> anyhow::Result<ServerConfig> {
    let server_crypto = quic_tls::server_crypto_config(certs, key, next_protos)?;
    let mut server_cfg = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)?,
    ));
    server_cfg.transport_config(Arc::new(transport_config()?));
    Ok(server_cfg)
}

fn client_config(crypto: rustls::ClientConfig) -> anyhow::Result<ClientConfig> {
    let mut client_cfg = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(crypto)?,
    ));
    client_cfg.transport_config(Arc::new(transport_config()?));
    Ok(client_cfg)
}

#[async_trait]
impl Transport for QuicTransport {
    fn name(&self) -> &'static str {
        "quic"
    }

    async fn listen(
        &self,
        addr: &str,
        opts: TransportListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>> {
        let bind_addr = net::normalize_bind_addr(addr);
        let addr: SocketAddr = bind_addr.parse()?;
        let QuicListenOptions {
            cert_file,
            key_file,
        } = opts.quic;

        let (cert_chain, key) = quic_tls::load_or_generate_cert(cert_file, key_file)?;
        let server_cfg = server_config(cert_chain, key, vec![TUNNEL_ALPN.to_vec()])?;

        let endpoint = Endpoint::server(server_cfg, addr)?;
        Ok(Box::new(QuicTransportListener { endpoint }))
    }

    async fn dial(
        &self,
        addr: &str,
        opts: TransportDialOptions,
    ) -> anyhow::Result<Arc<dyn TransportSession>> {
        let QuicDialOptions {
            server_name,
            insecure_skip_verify,
        } = opts.quic;

        let client_crypto =
            quic_tls::client_crypto_config(insecure_skip_verify, vec![TUNNEL_ALPN.to_vec()])?;
        let client_cfg = client_config(client_crypto)?;

        let remote = net::resolve_socket_addr(addr).await?;
        let bind: SocketAddr = if remote.is_ipv6() {
            SocketAddr::from(([0u16; 8], 0))
        } else {
            SocketAddr::from(([0u8; 4], 0))
        };
        let mut endpoint = Endpoint::client(bind)?;
        endpoint.set_default_client_config(client_cfg);

        let name = if server_name.trim().is_empty() {
            "localhost".to_string()
        } else {
            server_name
        };

        let connecting = endpoint.connect(remote, &name)?;
        let conn = connecting.await?;
        Ok(Arc::new(QuicSession::new(conn, Some(endpoint))))
    }
}

pub struct QuicTransportListener {
    endpoint: Endpoint,
}

#[async_trait]
impl TransportListener for QuicTransportListener {
    async fn accept(&self) -> anyhow::Result<Arc<dyn TransportSession>> {
        accept_session(&self.endpoint).await
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.local_addr().ok()
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.endpoint.close(0u32.into(), b"");
        Ok(())
    }
}

async fn accept_session(endpoint: &Endpoint) -> anyhow::Result<Arc<dyn TransportSession>> {
    let incoming = endpoint
        .accept()
        .await
        .ok_or_else(|| anyhow::anyhow!("tunnel: quic endpoint closed"))?;
    let conn = incoming.await?;
    Ok(Arc::new(QuicSession::new(conn, None)))
}

struct QuicSession {
    conn: Connection,
    local: Option<SocketAddr>,
    incoming: Mutex<mpsc::Receiver<(quinn::SendStream, quinn::RecvStream)>>,
    task: tokio::task::JoinHandle<()>,
    // Client endpoints must outlive their only connection.
    _endpoint: Option<Endpoint>,
}

impl QuicSession {
    fn new(conn: Connection, endpoint: Option<Endpoint>) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let c = conn.clone();
        let task = tokio::spawn(async move {
            while let Ok(st) = c.accept_bi().await {
                if tx.send(st).await.is_err() {
                    break;
                }
            }
        });
        let local = endpoint.as_ref().and_then(|e| e.local_addr().ok());
        Self {
            conn,
            local,
            incoming: Mutex::new(rx),
            task,
            _endpoint: endpoint,
        }
    }
}

#[async_trait]
impl TransportSession for QuicSession {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream> {
        let (send, recv) = self.conn.open_bi().await?;
        Ok(Box::new(QuicBiStream { send, recv }))
    }

    async fn accept_stream(&self) -> anyhow::Result<BoxedStream> {
        let mut rx = self.incoming.lock().await;
        let (send, recv) = rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("tunnel: session closed"))?;
        Ok(Box::new(QuicBiStream { send, recv }))
    }

    async fn close(&self) {
        self.task.abort();
        self.conn.close(0u32.into(), b"");
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.conn.remote_address())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }
}

pin_project! {
    struct QuicBiStream {
        #[pin]
        send: quinn::SendStream,
        #[pin]
        recv: quinn::RecvStream,
    }
}

impl tokio::io::AsyncRead for QuicBiStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        self.project().recv.poll_read(cx, buf)
    }
}

impl tokio::io::AsyncWrite for QuicBiStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        data: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        tokio::io::AsyncWrite::poll_write(self.project().send, cx, data)
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        tokio::io::AsyncWrite::poll_flush(self.project().send, cx)
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        tokio::io::AsyncWrite::poll_shutdown(self.project().send, cx)
    }
}

/// Certificate a provider presents on a punched path. The visitor learns the
/// fingerprint through the server and pins it.
pub struct P2pIdentity {
    certs: Vec<rustls::pki_types::CertificateDer<'static>>,
    key: rustls::pki_types::PrivateKeyDer<'static>,
    pub fingerprint: String,
}

impl P2pIdentity {
    pub fn generate() -> anyhow::Result<Self> {
        let (certs, key) = quic_tls::generate_cert(P2P_SERVER_NAME)?;
        let fingerprint = certs
            .first()
            .map(|c| quic_tls::fingerprint(c.as_ref()))
            .unwrap_or_default();
        Ok(Self {
            certs,
            key,
            fingerprint,
        })
    }
}

/// Runs a QUIC server on an already punched UDP socket.
pub fn p2p_listen(
    sock: std::net::UdpSocket,
    id: &P2pIdentity,
) -> anyhow::Result<Box<dyn TransportListener>> {
    let server_cfg = server_config(
        id.certs.clone(),
        id.key.clone_key(),
        vec![P2P_ALPN.to_vec()],
    )?;
    let endpoint = Endpoint::new(
        EndpointConfig::default(),
        Some(server_cfg),
        sock,
        Arc::new(quinn::TokioRuntime),
    )?;
    Ok(Box::new(QuicTransportListener { endpoint }))
}

/// Connects over an already punched UDP socket, accepting only the pinned certificate.
pub async fn p2p_connect(
    sock: std::net::UdpSocket,
    peer: SocketAddr,
    fingerprint: &str,
) -> anyhow::Result<Arc<dyn TransportSession>> {
    let crypto = quic_tls::pinned_client_crypto_config(fingerprint, vec![P2P_ALPN.to_vec()])?;
    let mut endpoint = Endpoint::new(
        EndpointConfig::default(),
        None,
        sock,
        Arc::new(quinn::TokioRuntime),
    )?;
    endpoint.set_default_client_config(client_config(crypto)?);
    let conn = endpoint.connect(peer, P2P_SERVER_NAME)?.await?;
    Ok(Arc::new(QuicSession::new(conn, Some(endpoint))))
}

mod quic_tls {
    use std::{fs, path::Path, sync::Arc};

    use rcgen::generate_simple_self_signed;
    use rustls::{
        client::danger::{ServerCertVerified, ServerCertVerifier},
        crypto::CryptoProvider,
        pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime},
    };

    fn provider() -> Arc<CryptoProvider> {
        Arc::new(rustls::crypto::ring::default_provider())
    }

    pub fn fingerprint(der: &[u8]) -> String {
        blake3::hash(der).to_hex().to_string()
    }

    pub fn generate_cert(
        name: &str,
    ) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let rcgen::CertifiedKey { cert, signing_key } =
            generate_simple_self_signed([name.to_string()])?;
        let cert_der = cert.der().clone();
        let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(signing_key.serialize_der()));
        Ok((vec![cert_der], key_der))
    }

    pub fn load_or_generate_cert(
        cert_file: String,
        key_file: String,
    ) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let cert_file = cert_file.trim().to_string();
        let key_file = key_file.trim().to_string();

        if !cert_file.is_empty() || !key_file.is_empty() {
            if cert_file.is_empty() || key_file.is_empty() {
                anyhow::bail!(
                    "tunnel: quic requires both cert_file and key_file (or neither to auto-generate)"
                );
            }

            let certs = load_certs(Path::new(&cert_file))?;
            let key = load_key(Path::new(&key_file))?;
            return Ok((certs, key));
        }

        generate_cert("localhost")
    }

    fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
        let data = fs::read(path)?;
        let mut rd = std::io::Cursor::new(&data);
        let certs = rustls_pemfile::certs(&mut rd).collect::<Result<Vec<_>, _>>()?;
        Ok(certs)
    }

    fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
        let data = fs::read(path)?;
        let mut rd = std::io::Cursor::new(&data);
        let key = rustls_pemfile::private_key(&mut rd)?;
        let Some(k) = key else {
            anyhow::bail!("tunnel: no private key found in {}", path.display());
        };
        Ok(k)
    }

    pub fn server_crypto_config(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        next_protos: Vec<Vec<u8>>,
    ) -> anyhow::Result<rustls::ServerConfig> {
        let mut cfg = rustls::ServerConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        cfg.alpn_protocols = next_protos;
        Ok(cfg)
    }

    pub fn client_crypto_config(
        insecure_skip_verify: bool,
        next_protos: Vec<Vec<u8>>,
    ) -> anyhow::Result<rustls::ClientConfig> {
        let builder = rustls::ClientConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&rustls::version::TLS13])?;
        let mut cfg = if insecure_skip_verify {
            builder
                .dangerous()
                .with_custom_certificate_verifier(PinnedServerVerification::any())
                .with_no_client_auth()
        } else {
            let root = rustls::RootCertStore::empty();
            builder.with_root_certificates(root).with_no_client_auth()
        };
        cfg.alpn_protocols = next_protos;
        Ok(cfg)
    }

    pub fn pinned_client_crypto_config(
        fingerprint: &str,
        next_protos: Vec<Vec<u8>>,
    ) -> anyhow::Result<rustls::ClientConfig> {
        let mut cfg = rustls::ClientConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .dangerous()
            .with_custom_certificate_verifier(PinnedServerVerification::pinned(fingerprint))
            .with_no_client_auth();
        cfg.alpn_protocols = next_protos;
        Ok(cfg)
    }

    /// Accepts a server certificate by fingerprint instead of a CA chain.
    ///
    /// With no pin every certificate is accepted. That mode is vulnerable to
    /// MITM and meant for local dev / testing only.
    #[derive(Debug)]
    struct PinnedServerVerification {
        provider: Arc<CryptoProvider>,
        pin: Option<String>,
    }

    impl PinnedServerVerification {
        fn any() -> Arc<Self> {
            Arc::new(Self {
                provider: provider(),
                pin: None,
            })
        }

        fn pinned(fingerprint: &str) -> Arc<Self> {
            Arc::new(Self {
                provider: provider(),
                pin: Some(fingerprint.to_ascii_lowercase()),
            })
        }
    }

    impl ServerCertVerifier for PinnedServerVerification {
        fn verify_server_cert(
            &self,
            end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            match &self.pin {
                Some(pin) if *pin != fingerprint(end_entity.as_ref()) => Err(
                    rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer),
                ),
                _ => Ok(ServerCertVerified::assertion()),
            }
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.provider
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}
