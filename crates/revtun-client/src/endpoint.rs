//! Server address normalization

use std::fmt;
use url::Url;

use crate::error::TunnelError;

/// Canonical WebSocket endpoint of the tunnel server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    secure: bool,
    /// Host as it appears in a URL (IPv6 in brackets)
    host: String,
    port: u16,
    /// Path including any query string
    path: String,
}

impl Endpoint {
    /// Normalize a raw server address.
    ///
    /// A missing scheme means `http://`. `http`/`ws` map to `ws` with default
    /// port 80, `https`/`wss` map to `wss` with default port 443.
    pub fn parse(raw: &str) -> Result<Self, TunnelError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(TunnelError::InvalidServerUrl(
                "server address is empty".to_string(),
            ));
        }

        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("http://{}", raw)
        };

        let url = Url::parse(&with_scheme)
            .map_err(|e| TunnelError::InvalidServerUrl(format!("'{}': {}", raw, e)))?;

        let secure = match url.scheme() {
            "http" | "ws" => false,
            "https" | "wss" => true,
            other => {
                return Err(TunnelError::InvalidServerUrl(format!(
                    "'{}': unsupported scheme '{}'",
                    raw, other
                )))
            }
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TunnelError::InvalidServerUrl(format!("'{}': missing host", raw)))?
            .to_string();

        let port = url.port().unwrap_or(if secure { 443 } else { 80 });

        let mut path = url.path().to_string();
        if path.is_empty() {
            path.push('/');
        }
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Self {
            secure,
            host,
            port,
            path,
        })
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn scheme(&self) -> &'static str {
        if self.secure {
            "wss"
        } else {
            "ws"
        }
    }

    /// Host in URL form, with brackets around IPv6 literals
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Host suitable for DNS resolution and TLS server names
    pub fn connect_host(&self) -> &str {
        self.host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(&self.host)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// `host:port`, as used in a CONNECT request
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}:{}{}",
            self.scheme(),
            self.host,
            self.port,
            self.path
        )
    }
}
