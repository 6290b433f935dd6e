//! Reconnection state machine
//!
//! ```text
//! Idle -> Dialing -> Handshaking -> ConfigExchange -> Connected
//!           ^   |                                        |
//!           |   v                                        v
//!           +-- Disconnected <---------------------------+
//! ```
//!
//! Dial failures are retried after a backoff delay. Anything that goes wrong
//! after the transport is up (host key, authentication, config) stops the
//! client for good. A clean disconnect redials at once; an abnormal one waits
//! for the next backoff delay.

use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::client::Shared;
use crate::config::Credentials;
use crate::dialer::Connector;
use crate::error::TunnelError;
use crate::handshake::{establish, exchange_config, Established};
use crate::session::TunnelSession;
use revtun_proto::PROTOCOL_VERSION;
use revtun_session::Incoming;

/// Observable connection state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started yet
    Idle,
    /// Dial attempt in progress; counts attempts since the last connection
    Dialing { attempt: u32 },
    Handshaking,
    ConfigExchange,
    Connected { fingerprint: String },
    /// Between connections; `retry_in` is the backoff delay, if any
    Disconnected { retry_in: Option<Duration> },
    /// Terminal
    Stopped,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }
}

/// Run `fut` unless `stop` fires first
async fn until_stopped<F: Future>(stop: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = stop.cancelled() => None,
        output = fut => Some(output),
    }
}

pub(crate) struct Controller {
    connector: Arc<dyn Connector>,
    server: String,
    credentials: Credentials,
    fingerprint: Option<String>,
    config_payload: Bytes,
    backoff: Backoff,
    shared: Arc<Shared>,
}

impl Controller {
    pub(crate) fn new(
        connector: Arc<dyn Connector>,
        server: String,
        credentials: Credentials,
        fingerprint: Option<String>,
        config_payload: Bytes,
        backoff: Backoff,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            connector,
            server,
            credentials,
            fingerprint,
            config_payload,
            backoff,
            shared,
        }
    }

    fn publish(&self, state: ConnectionState) {
        self.shared.status.send_replace(state);
    }

    /// Drive connections until stopped or a fatal error occurs
    ///
    /// Returns `Ok` when stopped from outside.
    pub(crate) async fn run(mut self) -> Result<(), TunnelError> {
        let stop = self.shared.stop.clone();
        let mut attempt: u32 = 0;

        loop {
            attempt = attempt.saturating_add(1);
            self.publish(ConnectionState::Dialing { attempt });
            info!("Connecting to {}", self.server);

            let transport = match until_stopped(&stop, self.connector.connect()).await {
                None => return Ok(()),
                Some(Ok(transport)) => transport,
                Some(Err(e)) if e.is_retryable() => {
                    warn!("Connection error: {}", e);
                    if !self.backoff_sleep(&stop).await {
                        return Ok(());
                    }
                    continue;
                }
                Some(Err(e)) => return Err(e),
            };

            self.publish(ConnectionState::Handshaking);
            let handshake = establish(
                transport,
                &self.credentials,
                self.fingerprint.as_deref(),
                PROTOCOL_VERSION,
            );
            let Established {
                session,
                incoming,
                fingerprint,
            } = match until_stopped(&stop, handshake).await {
                None => return Ok(()),
                Some(result) => result?,
            };

            self.publish(ConnectionState::ConfigExchange);
            let latency = match until_stopped(
                &stop,
                exchange_config(&session, self.config_payload.clone()),
            )
            .await
            {
                Some(Ok(latency)) => latency,
                outcome => {
                    if let Err(e) = session.close().await {
                        debug!("Failed to close session: {}", e);
                    }
                    return match outcome {
                        Some(Err(e)) => Err(e),
                        _ => Ok(()),
                    };
                }
            };

            self.backoff.reset();
            attempt = 0;
            spawn_discard_tasks(incoming, session.id().to_string());

            let tunnel = TunnelSession::new(session, fingerprint.clone(), latency);
            {
                let mut state = self.shared.state.lock().await;
                if !state.running {
                    drop(state);
                    close_quietly(&tunnel).await;
                    return Ok(());
                }
                state.session = Some(tunnel.clone());
            }
            self.publish(ConnectionState::Connected { fingerprint });

            let outcome = until_stopped(&stop, tunnel.wait()).await;
            let still_published = self.shared.state.lock().await.session.take().is_some();

            match outcome {
                None => {
                    // Once taken from the slot, the session is closed by whoever took it
                    if still_published {
                        close_quietly(&tunnel).await;
                    }
                    return Ok(());
                }
                Some(Ok(())) => {
                    info!("Disconnected");
                    self.backoff.reset();
                    self.publish(ConnectionState::Disconnected { retry_in: None });
                }
                Some(Err(e)) => {
                    warn!("Disconnection error: {}", e);
                    if !self.backoff_sleep(&stop).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Sleep for the next backoff delay; false if stopped meanwhile
    async fn backoff_sleep(&mut self, stop: &CancellationToken) -> bool {
        let delay = self.backoff.duration();
        info!("Retrying in {:?}...", delay);
        self.publish(ConnectionState::Disconnected {
            retry_in: Some(delay),
        });
        until_stopped(stop, tokio::time::sleep(delay)).await.is_some()
    }
}

async fn close_quietly(tunnel: &TunnelSession) {
    if let Err(e) = tunnel.close().await {
        debug!("Failed to close session {}: {}", tunnel.id(), e);
    }
}

/// Refuse whatever the server asks of the client
///
/// Both tasks end when the session does.
fn spawn_discard_tasks(incoming: Incoming, session_id: String) {
    let Incoming {
        mut requests,
        mut channels,
    } = incoming;

    let id = session_id.clone();
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            debug!("[{}] Discarding request '{}'", id, request.name());
            if let Err(e) = request.reply(false, Bytes::new()).await {
                debug!("[{}] Failed to reject request: {}", id, e);
            }
        }
    });

    tokio::spawn(async move {
        while let Some(mut channel) = channels.recv().await {
            debug!("[{}] Rejecting channel {}", session_id, channel.id());
            if let Err(e) = channel.finish().await {
                debug!("[{}] Failed to reject channel: {}", session_id, e);
            }
        }
    });
}
