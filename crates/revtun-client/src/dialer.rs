//! Proxy-aware transport dialing
//!
//! Produces a framed transport to the tunnel server:
//!
//! - direct: TCP, then TLS for `wss`, then the WebSocket upgrade
//! - via HTTP proxy: `CONNECT` to the proxy, then TLS, then the upgrade
//!
//! Plain `ws` targets cannot be reached through a proxy.

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::MaybeTlsStream;
use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::TunnelError;
use crate::proxy::{self, ProxyEnv};
use crate::tls::build_tls_connector;
use crate::websocket::WsFrames;
use revtun_proto::PROTOCOL_VERSION;
use revtun_session::BoxTransport;

/// Source of fresh transports to the tunnel server
#[async_trait]
pub trait Connector: Send + Sync {
    /// Make one connection attempt
    async fn connect(&self) -> Result<BoxTransport, TunnelError>;
}

/// WebSocket dialer honoring the HTTP proxy environment
pub struct Dialer {
    endpoint: Endpoint,
    tls_connector: TlsConnector,
    proxy_env: ProxyEnv,
    connect_timeout: Duration,
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer")
            .field("endpoint", &self.endpoint.to_string())
            .field("proxy_env", &self.proxy_env)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl Dialer {
    /// Create a dialer; the proxy environment is read once, here
    pub fn new(endpoint: Endpoint, skip_tls_verify: bool, connect_timeout: Duration) -> Self {
        Self {
            endpoint,
            tls_connector: build_tls_connector(skip_tls_verify),
            proxy_env: ProxyEnv::from_env(),
            connect_timeout,
        }
    }

    pub fn with_proxy_env(mut self, proxy_env: ProxyEnv) -> Self {
        self.proxy_env = proxy_env;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Dial the server, bounded by the connect timeout
    pub async fn dial(&self) -> Result<BoxTransport, TunnelError> {
        match tokio::time::timeout(self.connect_timeout, self.dial_inner()).await {
            Ok(result) => result,
            Err(_) => Err(TunnelError::Dial(format!(
                "timed out after {:?} connecting to {}",
                self.connect_timeout, self.endpoint
            ))),
        }
    }

    async fn dial_inner(&self) -> Result<BoxTransport, TunnelError> {
        let stream = match self.proxy_env.proxy_for(&self.endpoint)? {
            None => {
                debug!("Dialing {}", self.endpoint);
                let tcp = TcpStream::connect((self.endpoint.connect_host(), self.endpoint.port()))
                    .await
                    .map_err(|e| {
                        TunnelError::Dial(format!("{}: {}", self.endpoint.authority(), e))
                    })?;
                if let Err(e) = tcp.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY: {}", e);
                }

                if self.endpoint.is_secure() {
                    MaybeTlsStream::Rustls(self.tls_handshake(tcp).await?)
                } else {
                    MaybeTlsStream::Plain(tcp)
                }
            }
            Some(proxy_url) => {
                if proxy_url.scheme() != "http" {
                    return Err(TunnelError::UnsupportedProxyProtocol(
                        proxy_url.scheme().to_string(),
                    ));
                }
                if !self.endpoint.is_secure() {
                    return Err(TunnelError::UnsupportedOperation(
                        "plain WebSocket through an HTTP proxy is not implemented".to_string(),
                    ));
                }
                let tcp = proxy::connect_tunnel(&proxy_url, &self.endpoint).await?;
                MaybeTlsStream::Rustls(self.tls_handshake(tcp).await?)
            }
        };

        self.upgrade(stream).await
    }

    async fn tls_handshake(&self, tcp: TcpStream) -> Result<TlsStream<TcpStream>, TunnelError> {
        let server_name = ServerName::try_from(self.endpoint.connect_host().to_string())
            .map_err(|e| TunnelError::TlsHandshake(format!("invalid server name: {}", e)))?;

        self.tls_connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| TunnelError::TlsHandshake(e.to_string()))
    }

    async fn upgrade(&self, stream: MaybeTlsStream<TcpStream>) -> Result<BoxTransport, TunnelError> {
        let mut request = self
            .endpoint
            .to_string()
            .into_client_request()
            .map_err(|e| TunnelError::UpgradeHandshake(e.to_string()))?;
        request.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(PROTOCOL_VERSION),
        );

        let (ws_stream, response) = tokio_tungstenite::client_async(request, stream)
            .await
            .map_err(|e| TunnelError::UpgradeHandshake(e.to_string()))?;

        debug!(
            "WebSocket connection established to {} ({})",
            self.endpoint,
            response.status()
        );
        Ok(Box::new(WsFrames::new(ws_stream)))
    }
}

#[async_trait]
impl Connector for Dialer {
    async fn connect(&self) -> Result<BoxTransport, TunnelError> {
        self.dial().await
    }
}
