use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ferry::tunnel::error::TunnelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Tcp,
    Udp,
    Http,
    Https,
    Tcpmux,
    Stcp,
    Sudp,
    Xtcp,
}

/// How a proxy kind is exposed on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// A dedicated public port.
    Port(PortProto),
    /// A route on a listener shared by all proxies of the kind.
    Vhost(VhostKind),
    /// No public binding; reachable through visitors only.
    Secret,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortProto {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VhostKind {
    Http,
    Https,
    Tcpmux,
}

#[derive(Debug)]
pub struct KindInfo {
    pub kind: ProxyKind,
    pub name: &'static str,
    pub binding: Binding,
    pub requires_secret: bool,
    pub supports_direct: bool,
    /// Traffic is carried as length-framed datagrams instead of a byte stream.
    pub datagram: bool,
}

static KINDS: [KindInfo; 8] = [
    KindInfo {
        kind: ProxyKind::Tcp,
        name: "tcp",
        binding: Binding::Port(PortProto::Tcp),
        requires_secret: false,
        supports_direct: false,
        datagram: false,
    },
    KindInfo {
        kind: ProxyKind::Udp,
        name: "udp",
        binding: Binding::Port(PortProto::Udp),
        requires_secret: false,
        supports_direct: false,
        datagram: true,
    },
    KindInfo {
        kind: ProxyKind::Http,
        name: "http",
        binding: Binding::Vhost(VhostKind::Http),
        requires_secret: false,
        supports_direct: false,
        datagram: false,
    },
    KindInfo {
        kind: ProxyKind::Https,
        name: "https",
        binding: Binding::Vhost(VhostKind::Https),
        requires_secret: false,
        supports_direct: false,
        datagram: false,
    },
    KindInfo {
        kind: ProxyKind::Tcpmux,
        name: "tcpmux",
        binding: Binding::Vhost(VhostKind::Tcpmux),
        requires_secret: false,
        supports_direct: false,
        datagram: false,
    },
    KindInfo {
        kind: ProxyKind::Stcp,
        name: "stcp",
        binding: Binding::Secret,
        requires_secret: true,
        supports_direct: false,
        datagram: false,
    },
    KindInfo {
        kind: ProxyKind::Sudp,
        name: "sudp",
        binding: Binding::Secret,
        requires_secret: true,
        supports_direct: false,
        datagram: true,
    },
    KindInfo {
        kind: ProxyKind::Xtcp,
        name: "xtcp",
        binding: Binding::Secret,
        requires_secret: true,
        supports_direct: true,
        datagram: false,
    },
];

impl ProxyKind {
    pub const ALL: [ProxyKind; 8] = [
        ProxyKind::Tcp,
        ProxyKind::Udp,
        ProxyKind::Http,
        ProxyKind::Https,
        ProxyKind::Tcpmux,
        ProxyKind::Stcp,
        ProxyKind::Sudp,
        ProxyKind::Xtcp,
    ];

    pub fn info(self) -> &'static KindInfo {
        let idx = match self {
            ProxyKind::Tcp => 0,
            ProxyKind::Udp => 1,
            ProxyKind::Http => 2,
            ProxyKind::Https => 3,
            ProxyKind::Tcpmux => 4,
            ProxyKind::Stcp => 5,
            ProxyKind::Sudp => 6,
            ProxyKind::Xtcp => 7,
        };
        &KINDS[idx]
    }

    pub fn as_str(self) -> &'static str {
        self.info().name
    }

    pub fn binding(self) -> Binding {
        self.info().binding
    }

    pub fn requires_secret(self) -> bool {
        self.info().requires_secret
    }

    pub fn supports_direct(self) -> bool {
        self.info().supports_direct
    }

    pub fn is_datagram(self) -> bool {
        self.info().datagram
    }

    /// Secret kinds are the only ones a visitor can target.
    pub fn accepts_visitors(self) -> bool {
        matches!(self.binding(), Binding::Secret)
    }
}

impl std::fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyKind {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        KINDS
            .iter()
            .find(|k| k.name == s)
            .map(|k| k.kind)
            .ok_or_else(|| TunnelError::InvalidConfig(format!("unknown proxy kind {s:?}")))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisitorMode {
    #[default]
    Relayed,
    Direct,
}

impl std::fmt::Display for VisitorMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VisitorMode::Relayed => f.write_str("relayed"),
            VisitorMode::Direct => f.write_str("direct"),
        }
    }
}

/// A proxy as published by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub name: String,
    pub kind: ProxyKind,
    #[serde(default)]
    pub local_addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_domains: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    /// Bytes per second, enforced by the client on both directions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
}

impl ProxyConfig {
    pub fn new(name: impl Into<String>, kind: ProxyKind, local_addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            local_addr: local_addr.into(),
            remote_port: None,
            custom_domains: Vec::new(),
            subdomain: None,
            secret_key: None,
            bandwidth_limit: None,
            max_connections: None,
        }
    }

    /// Checks the fields each kind depends on. The server repeats this check
    /// since it cannot trust the client's copy.
    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.name.trim().is_empty() {
            return Err(TunnelError::InvalidConfig("proxy name is empty".into()));
        }
        if self.kind.requires_secret() && self.secret_key.as_deref().is_none() {
            return Err(TunnelError::InvalidConfig(format!(
                "proxy {:?}: kind {} requires secret_key",
                self.name, self.kind
            )));
        }
        match self.kind.binding() {
            Binding::Vhost(_) => {
                let has_sub = self
                    .subdomain
                    .as_deref()
                    .is_some_and(|s| !s.trim().is_empty());
                if self.custom_domains.is_empty() && !has_sub {
                    return Err(TunnelError::InvalidConfig(format!(
                        "proxy {:?}: kind {} requires custom_domains or subdomain",
                        self.name, self.kind
                    )));
                }
            }
            Binding::Port(_) | Binding::Secret => {}
        }
        if self.max_connections == Some(0) {
            return Err(TunnelError::InvalidConfig(format!(
                "proxy {:?}: max_connections must be positive",
                self.name
            )));
        }
        Ok(())
    }
}

/// A consumer-side endpoint for a secret proxy published by another client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitorConfig {
    pub name: String,
    pub kind: ProxyKind,
    pub server_name: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub mode: VisitorMode,
    pub bind_addr: String,
    #[serde(default)]
    pub fallback_to_relay: bool,
}

impl VisitorConfig {
    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.name.trim().is_empty() {
            return Err(TunnelError::InvalidConfig("visitor name is empty".into()));
        }
        if !self.kind.accepts_visitors() {
            return Err(TunnelError::InvalidConfig(format!(
                "visitor {:?}: kind {} cannot be visited",
                self.name, self.kind
            )));
        }
        if self.server_name.trim().is_empty() {
            return Err(TunnelError::InvalidConfig(format!(
                "visitor {:?}: server_name is empty",
                self.name
            )));
        }
        if self.mode == VisitorMode::Direct && !self.kind.supports_direct() {
            return Err(TunnelError::InvalidConfig(format!(
                "visitor {:?}: kind {} has no direct path",
                self.name, self.kind
            )));
        }
        Ok(())
    }
}

/// A registered proxy as tracked by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyIdentity {
    pub name: String,
    pub kind: ProxyKind,
    pub run_id: String,
}
