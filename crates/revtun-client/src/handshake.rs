//! Session establishment and config exchange

use bytes::Bytes;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::Credentials;
use crate::error::TunnelError;
use revtun_proto::CONFIG_REQUEST;
use revtun_session::{BoxTransport, HostKey, Incoming, Session, SessionError};

/// Check a host key against the configured fingerprint
///
/// The expected value may be any prefix of the full fingerprint; an absent
/// or empty expectation accepts every key. Returns the full fingerprint.
pub fn verify_host_key(expected: Option<&str>, key: &HostKey) -> Result<String, TunnelError> {
    let actual = key.fingerprint();
    match expected.map(str::trim).filter(|e| !e.is_empty()) {
        Some(expected) if !actual.starts_with(expected) => Err(TunnelError::FingerprintMismatch {
            expected: expected.to_string(),
            actual,
        }),
        _ => Ok(actual),
    }
}

/// An authenticated session that has not yet sent its config
pub(crate) struct Established {
    pub session: Session,
    pub incoming: Incoming,
    pub fingerprint: String,
}

/// Run the session handshake over a freshly dialed transport
///
/// The host key is verified before any credentials leave the client.
pub(crate) async fn establish(
    transport: BoxTransport,
    credentials: &Credentials,
    expected_fingerprint: Option<&str>,
    version: &str,
) -> Result<Established, TunnelError> {
    let pending = revtun_session::connect(transport, version)
        .await
        .map_err(handshake_error)?;

    let fingerprint = verify_host_key(expected_fingerprint, pending.host_key())?;
    info!("Fingerprint {}", fingerprint);

    let (session, incoming) = pending
        .authenticate(&credentials.user, &credentials.password)
        .await
        .map_err(handshake_error)?;

    debug!("[{}] Authenticated as '{}'", session.id(), credentials.user);
    Ok(Established {
        session,
        incoming,
        fingerprint,
    })
}

fn handshake_error(e: SessionError) -> TunnelError {
    match e {
        SessionError::AuthenticationFailed(message) => TunnelError::AuthenticationFailed(message),
        other => TunnelError::Handshake(other.to_string()),
    }
}

/// Send the encoded forwarding rules and wait for the verdict
///
/// Returns the round-trip latency of the request.
pub(crate) async fn exchange_config(
    session: &Session,
    payload: Bytes,
) -> Result<Duration, TunnelError> {
    let started = Instant::now();
    let reply = session
        .request(CONFIG_REQUEST, payload)
        .await
        .map_err(|e| TunnelError::ConfigRequestFailed(e.to_string()))?;
    let latency = started.elapsed();

    if !reply.payload.is_empty() {
        return Err(TunnelError::ConfigRejected(
            String::from_utf8_lossy(&reply.payload).into_owned(),
        ));
    }

    info!("Connected (Latency {:?})", latency);
    Ok(latency)
}
