//! Client configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::TunnelError;

/// Tunnel client configuration
///
/// Immutable once handed to [`crate::TunnelClient`]. Durations are written as
/// (fractional) seconds when serialized.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address, e.g. `tunnel.example.com` or `https://tunnel.example.com:8443`
    pub server: String,
    /// Expected host-key fingerprint or a prefix of it
    pub fingerprint: Option<String>,
    /// Credentials as `user:password`
    pub auth: Option<String>,
    /// Interval between keepalive pings; zero disables them
    #[serde(with = "duration_secs")]
    pub keepalive: Duration,
    /// Accept any TLS certificate from the server
    pub skip_tls_verify: bool,
    /// Forwarding rules, in order
    pub remotes: Vec<String>,
    #[serde(with = "duration_secs")]
    pub min_retry_interval: Duration,
    #[serde(with = "duration_secs")]
    pub max_retry_interval: Duration,
    /// Upper bound on one dial, including proxy and TLS negotiation
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("server", &self.server)
            .field("fingerprint", &self.fingerprint)
            .field("auth", &self.auth.as_ref().map(|_| "[REDACTED]"))
            .field("keepalive", &self.keepalive)
            .field("skip_tls_verify", &self.skip_tls_verify)
            .field("remotes", &self.remotes)
            .field("min_retry_interval", &self.min_retry_interval)
            .field("max_retry_interval", &self.max_retry_interval)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// Helper module for serializing Duration as seconds
mod duration_secs {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            fingerprint: None,
            auth: None,
            keepalive: Duration::ZERO,
            skip_tls_verify: false,
            remotes: Vec::new(),
            min_retry_interval: Duration::from_millis(100),
            max_retry_interval: Duration::from_secs(5 * 60),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Check the settings that do not need parsing
    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.server.trim().is_empty() {
            return Err(TunnelError::InvalidServerUrl(
                "server address is required".to_string(),
            ));
        }
        if self.max_retry_interval.is_zero() {
            return Err(TunnelError::Config(
                "max_retry_interval must be positive".to_string(),
            ));
        }
        if self.min_retry_interval > self.max_retry_interval {
            return Err(TunnelError::Config(format!(
                "min_retry_interval ({:?}) exceeds max_retry_interval ({:?})",
                self.min_retry_interval, self.max_retry_interval
            )));
        }
        if self.connect_timeout.is_zero() {
            return Err(TunnelError::Config(
                "connect_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::parse(self.auth.as_deref().unwrap_or_default())
    }
}

/// Builder for ClientConfig
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn server(mut self, server: impl Into<String>) -> Self {
        self.config.server = server.into();
        self
    }

    pub fn fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.config.fingerprint = Some(fingerprint.into());
        self
    }

    pub fn auth(mut self, auth: impl Into<String>) -> Self {
        self.config.auth = Some(auth.into());
        self
    }

    pub fn keepalive(mut self, interval: Duration) -> Self {
        self.config.keepalive = interval;
        self
    }

    pub fn skip_tls_verify(mut self, skip: bool) -> Self {
        self.config.skip_tls_verify = skip;
        self
    }

    pub fn remote(mut self, remote: impl Into<String>) -> Self {
        self.config.remotes.push(remote.into());
        self
    }

    pub fn remotes<I, S>(mut self, remotes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.remotes.extend(remotes.into_iter().map(Into::into));
        self
    }

    pub fn retry_interval(mut self, min: Duration, max: Duration) -> Self {
        self.config.min_retry_interval = min;
        self.config.max_retry_interval = max;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<ClientConfig, TunnelError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// User and password presented during authentication
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    /// Split `user:password` at the first colon.
    ///
    /// Input without a colon yields empty credentials.
    pub fn parse(auth: &str) -> Self {
        match auth.split_once(':') {
            Some((user, password)) => Self {
                user: user.to_string(),
                password: password.to_string(),
            },
            None => Self::default(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .finish()
    }
}
