//! Handle to the connected tunnel session

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::TunnelError;
use revtun_proto::PING_REQUEST;
use revtun_session::{Channel, ConnectionStats, Session, SessionError};

/// The active session plus what was learned while establishing it
///
/// Cheap to clone; every clone refers to the same underlying session.
#[derive(Clone)]
pub struct TunnelSession {
    session: Session,
    fingerprint: String,
    connected_at: DateTime<Utc>,
    latency: Duration,
}

impl std::fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSession")
            .field("id", &self.session.id())
            .field("fingerprint", &self.fingerprint)
            .field("connected_at", &self.connected_at)
            .field("latency", &self.latency)
            .finish()
    }
}

fn session_error(e: SessionError) -> TunnelError {
    TunnelError::Session(e.to_string())
}

impl TunnelSession {
    pub(crate) fn new(session: Session, fingerprint: String, latency: Duration) -> Self {
        Self {
            session,
            fingerprint,
            connected_at: Utc::now(),
            latency,
        }
    }

    pub fn id(&self) -> &str {
        self.session.id()
    }

    /// Full host-key fingerprint of the server
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Round-trip time of the config exchange
    pub fn latency(&self) -> Duration {
        self.latency
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.session.stats()
    }

    /// Open a data channel towards `target` (`host:port`) on the server side
    pub async fn open_channel(&self, target: &str) -> Result<Channel, TunnelError> {
        self.session
            .open_channel(target.to_string())
            .await
            .map_err(session_error)
    }

    /// Send a keepalive request; the reply content is ignored
    pub async fn ping(&self) -> Result<(), TunnelError> {
        self.session
            .request(PING_REQUEST, bytes::Bytes::new())
            .await
            .map(|_| ())
            .map_err(session_error)
    }

    pub async fn close(&self) -> Result<(), TunnelError> {
        self.session.close().await.map_err(session_error)
    }

    pub(crate) async fn wait(&self) -> Result<(), SessionError> {
        self.session.wait().await
    }
}
