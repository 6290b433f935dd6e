//! Tunnel client lifecycle

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::backoff::Backoff;
use crate::config::ClientConfig;
use crate::controller::{ConnectionState, Controller};
use crate::dialer::{Connector, Dialer};
use crate::endpoint::Endpoint;
use crate::error::TunnelError;
use crate::keepalive;
use crate::session::TunnelSession;
use revtun_proto::{encode_config, parse_rules, ForwardingRule};

pub(crate) struct RuntimeState {
    /// False once the client was closed or the controller exited
    pub(crate) running: bool,
    pub(crate) session: Option<TunnelSession>,
}

/// State shared between the client handle and its background tasks
pub(crate) struct Shared {
    pub(crate) state: Mutex<RuntimeState>,
    pub(crate) stop: CancellationToken,
    pub(crate) status: watch::Sender<ConnectionState>,
    done: watch::Sender<Option<Result<(), TunnelError>>>,
}

impl Shared {
    fn complete(&self, result: Result<(), TunnelError>) {
        self.status.send_replace(ConnectionState::Stopped);
        self.done.send_replace(Some(result));
    }
}

/// Reverse tunnel client
///
/// Keeps one authenticated session to the server alive, reconnecting with
/// backoff after network failures, until closed or a fatal error occurs.
pub struct TunnelClient {
    config: ClientConfig,
    endpoint: Endpoint,
    rules: Vec<ForwardingRule>,
    config_payload: Bytes,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    started: AtomicBool,
}

impl std::fmt::Debug for TunnelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelClient")
            .field("endpoint", &self.endpoint.to_string())
            .field("rules", &self.rules)
            .field("state", &*self.shared.status.borrow())
            .finish()
    }
}

impl TunnelClient {
    /// Create a client that dials the configured server over WebSocket
    ///
    /// Validates the whole configuration; nothing touches the network until
    /// [`TunnelClient::start`].
    pub fn new(config: ClientConfig) -> Result<Self, TunnelError> {
        config.validate()?;
        let endpoint = Endpoint::parse(&config.server)?;
        let dialer = Dialer::new(
            endpoint.clone(),
            config.skip_tls_verify,
            config.connect_timeout,
        );
        Self::build(config, endpoint, Arc::new(dialer))
    }

    /// Create a client that obtains its transports from `connector`
    pub fn with_connector(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, TunnelError> {
        config.validate()?;
        let endpoint = Endpoint::parse(&config.server)?;
        Self::build(config, endpoint, connector)
    }

    fn build(
        config: ClientConfig,
        endpoint: Endpoint,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, TunnelError> {
        let rules = parse_rules(&config.remotes)?;
        let config_payload = encode_config(&rules)
            .map_err(|e| TunnelError::Config(format!("failed to encode rules: {}", e)))?;
        debug!("Loaded {} forwarding rules for {}", rules.len(), endpoint);

        let (status, _) = watch::channel(ConnectionState::Idle);
        let (done, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            state: Mutex::new(RuntimeState {
                running: true,
                session: None,
            }),
            stop: CancellationToken::new(),
            status,
            done,
        });

        Ok(Self {
            config,
            endpoint,
            rules,
            config_payload,
            connector,
            shared,
            started: AtomicBool::new(false),
        })
    }

    /// Spawn the connection loop and return immediately
    ///
    /// Must be called within a tokio runtime. Later calls are ignored.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("Tunnel client already started");
            return;
        }

        let backoff = Backoff::new(
            self.config.min_retry_interval,
            self.config.max_retry_interval,
        );
        let controller = Controller::new(
            self.connector.clone(),
            self.endpoint.to_string(),
            self.config.credentials(),
            self.config.fingerprint.clone(),
            self.config_payload.clone(),
            backoff,
            self.shared.clone(),
        );

        if !self.config.keepalive.is_zero() {
            tokio::spawn(keepalive::run(self.shared.clone(), self.config.keepalive));
        }

        let shared = self.shared.clone();
        tokio::spawn(async move {
            let result = controller.run().await;
            match &result {
                Ok(()) => info!("Tunnel client stopped"),
                Err(e) => error!("Tunnel client stopped: {}", e),
            }

            shared.stop.cancel();
            let session = {
                let mut state = shared.state.lock().await;
                state.running = false;
                state.session.take()
            };
            if let Some(session) = session {
                if let Err(e) = session.close().await {
                    debug!("Failed to close session: {}", e);
                }
            }
            shared.complete(result);
        });
    }

    /// Start the client and wait for it to finish
    pub async fn run(&self) -> Result<(), TunnelError> {
        self.start();
        self.wait().await
    }

    /// Wait for the client to finish
    ///
    /// Returns the fatal error that stopped the client, or `Ok` after
    /// [`TunnelClient::close`].
    pub async fn wait(&self) -> Result<(), TunnelError> {
        let mut done = self.shared.done.subscribe();
        let result = match done.wait_for(Option::is_some).await {
            Ok(result) => (*result).clone().unwrap_or(Ok(())),
            Err(_) => Ok(()),
        };
        result
    }

    /// Stop the client and close the current session
    ///
    /// Returns the error from closing the session, if any. Closing a client
    /// that already stopped does nothing.
    pub async fn close(&self) -> Result<(), TunnelError> {
        let session = {
            let mut state = self.shared.state.lock().await;
            if !state.running {
                return Ok(());
            }
            state.running = false;
            state.session.take()
        };

        info!("Closing tunnel client");
        self.shared.stop.cancel();

        // Never started: no controller will report completion
        if !self.started.swap(true, Ordering::SeqCst) {
            self.shared.complete(Ok(()));
        }

        match session {
            Some(session) => session.close().await,
            None => Ok(()),
        }
    }

    /// The current session, if connected
    pub async fn session(&self) -> Option<TunnelSession> {
        self.shared.state.lock().await.session.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.status.borrow().clone()
    }

    /// Watch connection state changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.status.subscribe()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn rules(&self) -> &[ForwardingRule] {
        &self.rules
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl Drop for TunnelClient {
    fn drop(&mut self) {
        self.shared.stop.cancel();
    }
}
