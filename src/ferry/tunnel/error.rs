use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ferry::tunnel::msg::ProtocolError;

/// Stable error codes carried on the wire inside response messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Auth,
    VersionMismatch,
    NameConflict,
    TypeUnsupported,
    QuotaExceeded,
    PortNotAllowed,
    DomainConflict,
    ProxyNotFound,
    InvalidConfig,
    HeartbeatTimeout,
    WorkConnectionTimeout,
    UnknownWorkRequest,
    SecretMismatch,
    NatTraversalFailed,
    SessionClosed,
    Protocol,
    Transport,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Auth => "auth",
            ErrorCode::VersionMismatch => "version_mismatch",
            ErrorCode::NameConflict => "name_conflict",
            ErrorCode::TypeUnsupported => "type_unsupported",
            ErrorCode::QuotaExceeded => "quota_exceeded",
            ErrorCode::PortNotAllowed => "port_not_allowed",
            ErrorCode::DomainConflict => "domain_conflict",
            ErrorCode::ProxyNotFound => "proxy_not_found",
            ErrorCode::InvalidConfig => "invalid_config",
            ErrorCode::HeartbeatTimeout => "heartbeat_timeout",
            ErrorCode::WorkConnectionTimeout => "work_connection_timeout",
            ErrorCode::UnknownWorkRequest => "unknown_work_request",
            ErrorCode::SecretMismatch => "secret_mismatch",
            ErrorCode::NatTraversalFailed => "nat_traversal_failed",
            ErrorCode::SessionClosed => "session_closed",
            ErrorCode::Protocol => "protocol",
            ErrorCode::Transport => "transport",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: ErrorCode,
    #[serde(default)]
    pub message: String,
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("protocol version mismatch: local {local}, remote {remote}")]
    VersionMismatch { local: String, remote: String },
    #[error("proxy name {0:?} is already in use")]
    NameConflict(String),
    #[error("proxy kind {0} is not supported by this server")]
    TypeUnsupported(String),
    #[error("proxy quota exceeded (max {0} per session)")]
    QuotaExceeded(usize),
    #[error("port {0} is not allowed")]
    PortNotAllowed(u16),
    #[error("domain {0:?} is already routed")]
    DomainConflict(String),
    #[error("proxy {0:?} not found")]
    ProxyNotFound(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("heartbeat timeout")]
    HeartbeatTimeout,
    #[error("work connection timeout")]
    WorkConnectionTimeout,
    #[error("unknown work connection request {0}")]
    UnknownWorkRequest(u64),
    #[error("secret mismatch for proxy {0:?}")]
    SecretMismatch(String),
    #[error("nat traversal failed: {0}")]
    NatTraversalFailed(String),
    #[error("session closed")]
    SessionClosed,
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),
    /// An error reported by the peer.
    #[error("remote: {0}")]
    Remote(WireError),
}

impl TunnelError {
    pub fn code(&self) -> ErrorCode {
        match self {
            TunnelError::Auth(_) => ErrorCode::Auth,
            TunnelError::VersionMismatch { .. } => ErrorCode::VersionMismatch,
            TunnelError::NameConflict(_) => ErrorCode::NameConflict,
            TunnelError::TypeUnsupported(_) => ErrorCode::TypeUnsupported,
            TunnelError::QuotaExceeded(_) => ErrorCode::QuotaExceeded,
            TunnelError::PortNotAllowed(_) => ErrorCode::PortNotAllowed,
            TunnelError::DomainConflict(_) => ErrorCode::DomainConflict,
            TunnelError::ProxyNotFound(_) => ErrorCode::ProxyNotFound,
            TunnelError::InvalidConfig(_) => ErrorCode::InvalidConfig,
            TunnelError::HeartbeatTimeout => ErrorCode::HeartbeatTimeout,
            TunnelError::WorkConnectionTimeout => ErrorCode::WorkConnectionTimeout,
            TunnelError::UnknownWorkRequest(_) => ErrorCode::UnknownWorkRequest,
            TunnelError::SecretMismatch(_) => ErrorCode::SecretMismatch,
            TunnelError::NatTraversalFailed(_) => ErrorCode::NatTraversalFailed,
            TunnelError::SessionClosed => ErrorCode::SessionClosed,
            TunnelError::Protocol(_) => ErrorCode::Protocol,
            TunnelError::Transport(_) => ErrorCode::Transport,
            TunnelError::Remote(w) => w.code,
        }
    }

    /// Fatal errors stop the client instead of scheduling a reconnect.
    pub fn is_fatal(&self) -> bool {
        matches!(self.code(), ErrorCode::Auth | ErrorCode::VersionMismatch)
    }

    pub fn to_wire(&self) -> WireError {
        match self {
            TunnelError::Remote(w) => w.clone(),
            other => WireError {
                code: other.code(),
                message: other.to_string(),
            },
        }
    }
}

impl From<WireError> for TunnelError {
    fn from(w: WireError) -> Self {
        TunnelError::Remote(w)
    }
}

/// Converts an optional wire error into a `Result`.
pub fn check(err: Option<WireError>) -> Result<(), TunnelError> {
    match err {
        Some(w) => Err(TunnelError::Remote(w)),
        None => Ok(()),
    }
}
