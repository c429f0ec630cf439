use std::{
    collections::{BTreeMap, HashSet},
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

use crate::ferry::{
    logging::{LogFormat, LogOutput},
    net,
    tunnel::{
        client::{BackoffConfig, ClientOptions},
        kind::{ProxyConfig, ProxyKind, VisitorConfig, VisitorMode},
        nat::{CandidateWeights, NatOptions},
        server::{ServerOptions, listener::PortRanges},
        transport::{QuicDialOptions, QuicListenOptions, parse_transport},
    },
};

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        let p = normalize_explicit_path(&p)?;
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    // clap folds FERRY_CONFIG into the flag; this covers callers that skip clap.
    if let Some(p) = std::env::var_os("FERRY_CONFIG")
        && !p.is_empty()
    {
        let p = normalize_explicit_path(Path::new(&p))?;
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Env,
        });
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    let p = p.to_path_buf();

    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(&p) {
        if m.is_dir() {
            if let Ok(discovered) = discover_config_path(&p) {
                return Ok(discovered);
            }
            return Ok(p.join("ferry.toml"));
        }
        return Ok(p);
    }

    let mut out = p;
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    for c in ["ferry.toml", "ferry.yaml", "ferry.yml"] {
        let p = dir.join(c);
        if fs::metadata(&p).is_ok_and(|m| m.is_file()) {
            return Ok(p);
        }
    }
    anyhow::bail!("config: no ferry.* found")
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/ferry/ferry.toml"));
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("dev", "ferry", "ferry")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("ferry.toml"))
    }
}

/// Writes the default template when `path` does not exist yet. Returns
/// whether a file was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) => {
            if m.is_file() {
                return Ok(false);
            }
            anyhow::bail!(
                "config: {} exists but is not a regular file",
                path.display()
            );
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path)?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("config: mkdir {}", parent.display()))?;
    }

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn config_ext(path: &Path) -> String {
    path.extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    match config_ext(path).as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = config_ext(path);
    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {}", ext),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub server: Option<ServerConfig>,
    pub client: Option<ClientConfig>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub admin_addr: String,
    pub options: ServerOptions,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub admin_addr: String,
    pub options: ClientOptions,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    logging: Option<FileLogging>,
    server: Option<FileServer>,
    client: Option<FileClient>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileServer {
    bind_addr: Option<String>,
    transport: Option<String>,
    tcp_mux: Option<bool>,
    #[serde(default)]
    auth_token: String,
    #[serde(default)]
    admin_addr: String,
    #[serde(default)]
    proxy_bind_addr: String,
    #[serde(default)]
    allow_ports: String,
    vhost_http_port: Option<u16>,
    vhost_https_port: Option<u16>,
    tcpmux_http_connect_port: Option<u16>,
    #[serde(default)]
    subdomain_host: String,
    heartbeat_timeout_ms: Option<u64>,
    work_conn_timeout_ms: Option<u64>,
    handshake_timeout_ms: Option<u64>,
    resume_grace_ms: Option<u64>,
    udp_idle_timeout_ms: Option<u64>,
    #[serde(default)]
    max_proxies_per_session: usize,
    #[serde(default)]
    nat_hole_bind_addr: String,
    nat: Option<FileNat>,
    quic: Option<FileQuicServer>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileQuicServer {
    #[serde(default)]
    cert_file: String,
    #[serde(default)]
    key_file: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClient {
    #[serde(default)]
    server_addr: String,
    transport: Option<String>,
    tcp_mux: Option<bool>,
    #[serde(default)]
    auth_token: String,
    #[serde(default)]
    user: String,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    #[serde(default)]
    admin_addr: String,
    heartbeat_interval_ms: Option<u64>,
    heartbeat_timeout_ms: Option<u64>,
    dial_timeout_ms: Option<u64>,
    login_fail_exit: Option<bool>,
    backoff: Option<BackoffConfig>,
    nat: Option<FileNat>,
    quic: Option<FileQuicClient>,
    #[serde(default)]
    proxies: Vec<FileProxy>,
    #[serde(default)]
    visitors: Vec<FileVisitor>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileQuicClient {
    #[serde(default)]
    server_name: String,
    #[serde(default)]
    insecure_skip_verify: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileNat {
    attempt_timeout_ms: Option<u64>,
    negotiation_timeout_ms: Option<u64>,
    linger_ms: Option<u64>,
    weights: Option<CandidateWeights>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileProxy {
    name: String,
    #[serde(alias = "type")]
    kind: String,
    #[serde(default)]
    local_addr: String,
    remote_port: Option<u16>,
    #[serde(default)]
    custom_domains: Vec<String>,
    subdomain: Option<String>,
    secret_key: Option<String>,
    bandwidth_limit: Option<FileBandwidth>,
    max_connections: Option<u32>,
}

/// Bytes per second, either a bare number or a string such as `"512KB"`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FileBandwidth {
    Bytes(u64),
    Text(String),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileVisitor {
    name: String,
    #[serde(alias = "type")]
    kind: String,
    server_name: String,
    #[serde(default)]
    secret_key: String,
    mode: Option<String>,
    bind_addr: String,
    #[serde(default)]
    fallback_to_relay: bool,
}

fn millis(v: Option<u64>, default: Duration) -> Duration {
    v.map(Duration::from_millis).unwrap_or(default)
}

fn lower_or(v: Option<&str>, default: &str) -> String {
    match v.map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => s.to_ascii_lowercase(),
        None => default.to_string(),
    }
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let logging = match fc.logging {
            Some(l) => LoggingConfig {
                level: lower_or(l.level.as_deref(), "info"),
                format: lower_or(l.format.as_deref(), "json"),
                output: l
                    .output
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .unwrap_or("stderr")
                    .to_string(),
                add_source: l.add_source,
            },
            None => LoggingConfig {
                level: "info".into(),
                format: "json".into(),
                output: "stderr".into(),
                add_source: false,
            },
        };
        logging
            .format
            .parse::<LogFormat>()
            .context("config: logging.format")?;
        logging
            .output
            .parse::<LogOutput>()
            .context("config: logging.output")?;

        let server = fc
            .server
            .map(ServerConfig::from_file)
            .transpose()
            .context("config: [server]")?;
        let client = fc
            .client
            .map(ClientConfig::from_file)
            .transpose()
            .context("config: [client]")?;

        Ok(Config {
            logging,
            server,
            client,
        })
    }
}

fn nat_options(n: Option<FileNat>) -> NatOptions {
    let d = NatOptions::default();
    let n = n.unwrap_or_default();
    NatOptions {
        attempt_timeout: millis(n.attempt_timeout_ms, d.attempt_timeout),
        negotiation_timeout: millis(n.negotiation_timeout_ms, d.negotiation_timeout),
        linger: millis(n.linger_ms, d.linger),
        weights: n.weights.unwrap_or(d.weights),
    }
}

fn check_bind_addr(field: &str, addr: &str) -> anyhow::Result<()> {
    net::normalize_bind_addr(addr)
        .parse::<SocketAddr>()
        .with_context(|| format!("{field}: invalid address {addr:?}"))?;
    Ok(())
}

/// Accepts `host:port` where host may be a name.
fn check_host_port(field: &str, addr: &str) -> anyhow::Result<()> {
    let ok = addr
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
    if !ok {
        anyhow::bail!("{field}: expected host:port, got {addr:?}");
    }
    Ok(())
}

impl ServerConfig {
    fn from_file(f: FileServer) -> anyhow::Result<ServerConfig> {
        let d = ServerOptions::default();
        let mut opts = ServerOptions {
            bind_addr: f
                .bind_addr
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .unwrap_or(d.bind_addr),
            transport: parse_transport(&lower_or(f.transport.as_deref(), "tcp"))?,
            tcp_mux: f.tcp_mux.unwrap_or(d.tcp_mux),
            auth_token: f.auth_token,
            heartbeat_timeout: millis(f.heartbeat_timeout_ms, d.heartbeat_timeout),
            work_conn_timeout: millis(f.work_conn_timeout_ms, d.work_conn_timeout),
            handshake_timeout: millis(f.handshake_timeout_ms, d.handshake_timeout),
            resume_grace: millis(f.resume_grace_ms, d.resume_grace),
            max_proxies_per_session: f.max_proxies_per_session,
            nat_hole_bind_addr: f.nat_hole_bind_addr.trim().to_string(),
            nat: nat_options(f.nat),
            ..d
        };
        check_bind_addr("bind_addr", &opts.bind_addr)?;
        if !opts.nat_hole_bind_addr.is_empty() {
            check_bind_addr("nat_hole_bind_addr", &opts.nat_hole_bind_addr)?;
        }

        let quic = f.quic.unwrap_or_default();
        if quic.cert_file.trim().is_empty() != quic.key_file.trim().is_empty() {
            anyhow::bail!("quic: cert_file and key_file must be set together");
        }
        opts.quic = QuicListenOptions {
            cert_file: quic.cert_file.trim().to_string(),
            key_file: quic.key_file.trim().to_string(),
        };

        let l = &mut opts.listeners;
        l.proxy_bind_addr = f.proxy_bind_addr.trim().to_string();
        if !l.proxy_bind_addr.is_empty() {
            l.proxy_bind_addr
                .parse::<std::net::IpAddr>()
                .with_context(|| format!("proxy_bind_addr: invalid ip {:?}", l.proxy_bind_addr))?;
        }
        l.allow_ports = f
            .allow_ports
            .parse::<PortRanges>()
            .context("allow_ports")?;
        l.vhost_http_port = f.vhost_http_port.filter(|p| *p != 0);
        l.vhost_https_port = f.vhost_https_port.filter(|p| *p != 0);
        l.tcpmux_http_connect_port = f.tcpmux_http_connect_port.filter(|p| *p != 0);
        l.subdomain_host = f.subdomain_host.trim().trim_matches('.').to_ascii_lowercase();
        if let Some(ms) = f.udp_idle_timeout_ms {
            l.udp.idle_timeout = Duration::from_millis(ms);
        }

        let admin_addr = f.admin_addr.trim().to_string();
        if !admin_addr.is_empty() {
            check_bind_addr("admin_addr", &admin_addr)?;
        }
        Ok(ServerConfig {
            admin_addr,
            options: opts,
        })
    }
}

impl ClientConfig {
    fn from_file(fc: FileClient) -> anyhow::Result<ClientConfig> {
        let d = ClientOptions::default();
        let server_addr = fc.server_addr.trim().to_string();
        if server_addr.is_empty() {
            anyhow::bail!("server_addr is required");
        }
        check_host_port("server_addr", &server_addr)?;

        let quic = fc.quic.unwrap_or_default();
        let mut opts = ClientOptions {
            server_addr,
            transport: parse_transport(&lower_or(fc.transport.as_deref(), "tcp"))?,
            tcp_mux: fc.tcp_mux.unwrap_or(d.tcp_mux),
            auth_token: fc.auth_token,
            user: fc.user.trim().to_string(),
            metadata: fc.metadata,
            heartbeat_interval: millis(fc.heartbeat_interval_ms, d.heartbeat_interval),
            heartbeat_timeout: millis(fc.heartbeat_timeout_ms, d.heartbeat_timeout),
            dial_timeout: millis(fc.dial_timeout_ms, d.dial_timeout),
            login_fail_exit: fc.login_fail_exit.unwrap_or(d.login_fail_exit),
            backoff: fc.backoff.unwrap_or(d.backoff),
            nat: nat_options(fc.nat),
            quic: QuicDialOptions {
                server_name: quic.server_name.trim().to_string(),
                insecure_skip_verify: quic.insecure_skip_verify,
            },
            proxies: Vec::with_capacity(fc.proxies.len()),
            visitors: Vec::with_capacity(fc.visitors.len()),
        };
        if opts.backoff.initial.is_zero() {
            anyhow::bail!("backoff.initial_ms must be positive");
        }

        let mut names = HashSet::new();
        for (i, p) in fc.proxies.into_iter().enumerate() {
            let p = proxy_from_file(p).with_context(|| format!("proxies[{i}]"))?;
            if !names.insert(p.name.clone()) {
                anyhow::bail!("proxies[{i}]: duplicate name {:?}", p.name);
            }
            opts.proxies.push(p);
        }

        let mut names = HashSet::new();
        for (i, v) in fc.visitors.into_iter().enumerate() {
            let v = visitor_from_file(v).with_context(|| format!("visitors[{i}]"))?;
            if !names.insert(v.name.clone()) {
                anyhow::bail!("visitors[{i}]: duplicate name {:?}", v.name);
            }
            opts.visitors.push(v);
        }

        let admin_addr = fc.admin_addr.trim().to_string();
        if !admin_addr.is_empty() {
            check_bind_addr("admin_addr", &admin_addr)?;
        }
        Ok(ClientConfig {
            admin_addr,
            options: opts,
        })
    }
}

fn proxy_from_file(p: FileProxy) -> anyhow::Result<ProxyConfig> {
    let kind: ProxyKind = p.kind.parse()?;
    let local_addr = p.local_addr.trim().to_string();
    check_host_port("local_addr", &local_addr)?;

    let bandwidth_limit = match p.bandwidth_limit {
        None => None,
        Some(FileBandwidth::Bytes(n)) => Some(n),
        Some(FileBandwidth::Text(s)) => Some(parse_bandwidth(&s)?),
    };

    let cfg = ProxyConfig {
        remote_port: p.remote_port,
        custom_domains: p
            .custom_domains
            .iter()
            .map(|d| d.trim().to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect(),
        subdomain: p.subdomain.map(|s| s.trim().to_ascii_lowercase()),
        secret_key: p.secret_key,
        bandwidth_limit: bandwidth_limit.filter(|n| *n > 0),
        max_connections: p.max_connections,
        ..ProxyConfig::new(p.name.trim(), kind, local_addr)
    };
    cfg.validate()?;
    Ok(cfg)
}

fn visitor_from_file(v: FileVisitor) -> anyhow::Result<VisitorConfig> {
    let mode = match lower_or(v.mode.as_deref(), "relayed").as_str() {
        "relayed" => VisitorMode::Relayed,
        "direct" => VisitorMode::Direct,
        other => anyhow::bail!("mode: expected relayed or direct, got {other:?}"),
    };
    let bind_addr = v.bind_addr.trim().to_string();
    check_bind_addr("bind_addr", &bind_addr)?;
    let cfg = VisitorConfig {
        name: v.name.trim().to_string(),
        kind: v.kind.parse()?,
        server_name: v.server_name.trim().to_string(),
        secret_key: v.secret_key,
        mode,
        bind_addr,
        fallback_to_relay: v.fallback_to_relay,
    };
    cfg.validate()?;
    Ok(cfg)
}

/// Parses `"1MB"`, `"512KB"`, `"100B"` or a bare byte count. Units are
/// powers of 1024.
pub fn parse_bandwidth(s: &str) -> anyhow::Result<u64> {
    let t = s.trim().to_ascii_uppercase();
    let split = t
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(t.len());
    let (num, unit) = t.split_at(split);
    let n: u64 = num
        .parse()
        .with_context(|| format!("bandwidth_limit: invalid value {s:?}"))?;
    let mul: u64 = match unit.trim() {
        "" | "B" => 1,
        "KB" | "K" => 1024,
        "MB" | "M" => 1024 * 1024,
        "GB" | "G" => 1024 * 1024 * 1024,
        other => anyhow::bail!("bandwidth_limit: unknown unit {other:?}"),
    };
    n.checked_mul(mul)
        .with_context(|| format!("bandwidth_limit: {s:?} overflows"))
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# Ferry configuration (auto-generated)
#
# This file was created because Ferry could not find a configuration file at the
# resolved config path. It runs a tunnel server on :7000; add a [client] section
# (or use a separate file) to publish local services through it.

[logging]
level = "info"
format = "json"
output = "stderr"
add_source = false

[server]
bind_addr = ":7000"
transport = "tcp" # tcp | quic
tcp_mux = true
auth_token = ""
admin_addr = ":7500"
heartbeat_timeout_ms = 90000
resume_grace_ms = 30000
allow_ports = ""

# [client]
# server_addr = "example.com:7000"
# auth_token = ""
#
# [[client.proxies]]
# name = "ssh"
# kind = "tcp"
# local_addr = "127.0.0.1:22"
# remote_port = 6000
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# Ferry configuration (auto-generated)
#
# This file was created because Ferry could not find a configuration file at the
# resolved config path. It runs a tunnel server on :7000; add a client section
# (or use a separate file) to publish local services through it.

logging:
  level: "info"
  format: "json"
  output: "stderr"
  add_source: false

server:
  bind_addr: ":7000"
  transport: "tcp" # tcp | quic
  tcp_mux: true
  auth_token: ""
  admin_addr: ":7500"
  heartbeat_timeout_ms: 90000
  resume_grace_ms: 30000
  allow_ports: ""

# client:
#   server_addr: "example.com:7000"
#   auth_token: ""
#   proxies:
#     - name: "ssh"
#       kind: "tcp"
#       local_addr: "127.0.0.1:22"
#       remote_port: 6000
"#;
