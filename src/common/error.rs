use std::fmt;

use thiserror::Error;

/// 握手阶段，用于定位上游连接在哪一步失败
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStage {
    Dial,
    Auth,
    Connect,
}

impl HandshakeStage {
    pub fn as_str(self) -> &'static str {
        match self {
            HandshakeStage::Dial => "dial",
            HandshakeStage::Auth => "auth",
            HandshakeStage::Connect => "connect",
        }
    }
}

impl fmt::Display for HandshakeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("DNS resolution failed: {0}")]
    DnsResolutionFailed(String),

    #[error("connection timeout: {0}")]
    ConnectionTimeout(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("{stage} stage failed: {reason}")]
    Handshake {
        stage: HandshakeStage,
        reason: String,
    },

    #[error("failed to apply {layer} tunnel: {reason}")]
    Tunnel { layer: String, reason: String },

    #[error("no healthy upstream available")]
    NoUpstream,

    #[error("engine already running")]
    AlreadyRunning,

    #[error("engine not running")]
    NotRunning,

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ProxyError {
    pub fn handshake(stage: HandshakeStage, reason: impl Into<String>) -> Self {
        ProxyError::Handshake {
            stage,
            reason: reason.into(),
        }
    }

    pub fn tunnel(layer: impl Into<String>, reason: impl fmt::Display) -> Self {
        ProxyError::Tunnel {
            layer: layer.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether a different upstream is worth trying after this error.
    pub fn should_switch_upstream(&self) -> bool {
        match self {
            ProxyError::ConnectionTimeout(_) | ProxyError::Tunnel { .. } => true,
            ProxyError::Handshake { stage, .. } => *stage != HandshakeStage::Auth,
            _ => false,
        }
    }

    /// Try to extract a ProxyError from an anyhow::Error, or classify
    /// the underlying error heuristically (e.g. io::Error kinds).
    pub fn classify(err: &anyhow::Error) -> ProxyErrorKind {
        if let Some(pe) = err.downcast_ref::<ProxyError>() {
            return pe.kind();
        }
        if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
            return match io_err.kind() {
                std::io::ErrorKind::TimedOut => ProxyErrorKind::ConnectionTimeout,
                _ => ProxyErrorKind::Io,
            };
        }
        ProxyErrorKind::Other
    }

    /// Get the kind/category of this error.
    pub fn kind(&self) -> ProxyErrorKind {
        match self {
            ProxyError::Io(_) => ProxyErrorKind::Io,
            ProxyError::Protocol(_) => ProxyErrorKind::Protocol,
            ProxyError::Config(_) => ProxyErrorKind::Config,
            ProxyError::DnsResolutionFailed(_) => ProxyErrorKind::DnsResolutionFailed,
            ProxyError::ConnectionTimeout(_) => ProxyErrorKind::ConnectionTimeout,
            ProxyError::AuthenticationFailed(_) => ProxyErrorKind::AuthenticationFailed,
            ProxyError::Handshake { .. } => ProxyErrorKind::Handshake,
            ProxyError::Tunnel { .. } => ProxyErrorKind::Tunnel,
            ProxyError::NoUpstream => ProxyErrorKind::NoUpstream,
            ProxyError::AlreadyRunning | ProxyError::NotRunning => ProxyErrorKind::State,
            ProxyError::Cancelled => ProxyErrorKind::Cancelled,
            ProxyError::Other(_) => ProxyErrorKind::Other,
        }
    }
}

/// Lightweight error category for pattern matching without borrowing the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorKind {
    Io,
    Protocol,
    Config,
    DnsResolutionFailed,
    ConnectionTimeout,
    AuthenticationFailed,
    Handshake,
    Tunnel,
    NoUpstream,
    State,
    Cancelled,
    Other,
}

impl ProxyErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProxyErrorKind::Io => "IO",
            ProxyErrorKind::Protocol => "PROTOCOL",
            ProxyErrorKind::Config => "CONFIG",
            ProxyErrorKind::DnsResolutionFailed => "DNS_FAILED",
            ProxyErrorKind::ConnectionTimeout => "CONN_TIMEOUT",
            ProxyErrorKind::AuthenticationFailed => "AUTH_FAILED",
            ProxyErrorKind::Handshake => "HANDSHAKE",
            ProxyErrorKind::Tunnel => "TUNNEL",
            ProxyErrorKind::NoUpstream => "NO_UPSTREAM",
            ProxyErrorKind::State => "STATE",
            ProxyErrorKind::Cancelled => "CANCELLED",
            ProxyErrorKind::Other => "OTHER",
        }
    }
}

impl From<ProxyError> for std::io::Error {
    fn from(e: ProxyError) -> Self {
        std::io::Error::other(e.to_string())
    }
}
