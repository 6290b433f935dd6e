//! Tunnel client errors

use thiserror::Error;

/// Broad category of a [`TunnelError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Invalid input, reported before any network activity
    Configuration,
    /// Reaching the server failed; retried with backoff
    Connectivity,
    /// The server was reached but the session could not be established
    Protocol,
}

/// Tunnel client errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TunnelError {
    #[error("Invalid server address: {0}")]
    InvalidServerUrl(String),

    #[error("Failed to decode remote '{spec}': {reason}")]
    InvalidRemoteSpec { spec: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported proxy protocol: {0}")]
    UnsupportedProxyProtocol(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Dial error: {0}")]
    Dial(String),

    #[error("Proxy CONNECT failed: {0}")]
    ProxyConnect(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("WebSocket upgrade failed: {0}")]
    UpgradeHandshake(String),

    #[error("Invalid fingerprint ({actual}), expected prefix {expected}")]
    FingerprintMismatch { expected: String, actual: String },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Config verification failed: {0}")]
    ConfigRequestFailed(String),

    #[error("Config rejected by server: {0}")]
    ConfigRejected(String),

    #[error("Session error: {0}")]
    Session(String),
}

impl TunnelError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TunnelError::InvalidServerUrl(_)
            | TunnelError::InvalidRemoteSpec { .. }
            | TunnelError::Config(_) => ErrorClass::Configuration,
            TunnelError::UnsupportedProxyProtocol(_)
            | TunnelError::UnsupportedOperation(_)
            | TunnelError::Dial(_)
            | TunnelError::ProxyConnect(_)
            | TunnelError::TlsHandshake(_)
            | TunnelError::UpgradeHandshake(_) => ErrorClass::Connectivity,
            TunnelError::FingerprintMismatch { .. }
            | TunnelError::AuthenticationFailed(_)
            | TunnelError::Handshake(_)
            | TunnelError::ConfigRequestFailed(_)
            | TunnelError::ConfigRejected(_)
            | TunnelError::Session(_) => ErrorClass::Protocol,
        }
    }

    /// Returns true if another attempt might succeed
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Connectivity
    }
}

impl From<revtun_proto::RuleError> for TunnelError {
    fn from(e: revtun_proto::RuleError) -> Self {
        match e {
            revtun_proto::RuleError::Invalid { spec, reason } => {
                TunnelError::InvalidRemoteSpec { spec, reason }
            }
        }
    }
}
