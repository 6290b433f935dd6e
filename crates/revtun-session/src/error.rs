//! Session error types

use std::io;
use thiserror::Error;

/// Errors from the session layer
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("Protocol version mismatch: local {local}, remote {remote}")]
    VersionMismatch { local: String, remote: String },

    #[error("Handshake interrupted: transport closed")]
    HandshakeInterrupted,

    #[error("Server could not prove possession of its host key")]
    HostKeyProof,

    #[error("unable to authenticate: {0}")]
    AuthenticationFailed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Nonce counter exhausted, session must be re-established")]
    NonceExhausted,

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Session closed")]
    Closed,
}

impl From<bincode::Error> for SessionError {
    fn from(e: bincode::Error) -> Self {
        Self::Protocol(format!("malformed message: {}", e))
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
