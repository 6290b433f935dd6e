//! HTTP proxy discovery and CONNECT tunneling

use base64::Engine;
use std::net::IpAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

use crate::endpoint::Endpoint;
use crate::error::TunnelError;

/// Maximum number of headers to parse in a CONNECT response
const MAX_HEADERS: usize = 64;

/// Maximum size of a CONNECT response head
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Proxy settings taken from the process environment
///
/// Reads `HTTP_PROXY`, `HTTPS_PROXY` and `NO_PROXY`, preferring the upper
/// case spelling and falling back to lower case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyEnv {
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub no_proxy: Vec<String>,
}

impl ProxyEnv {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name)
                .or_else(|| lookup(&name.to_ascii_lowercase()))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Self {
            http_proxy: var("HTTP_PROXY"),
            https_proxy: var("HTTPS_PROXY"),
            no_proxy: var("NO_PROXY")
                .map(|v| {
                    v.split(',')
                        .map(|entry| entry.trim().to_ascii_lowercase())
                        .filter(|entry| !entry.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    /// Proxy to use for `endpoint`, if any
    pub fn proxy_for(&self, endpoint: &Endpoint) -> Result<Option<Url>, TunnelError> {
        let raw = if endpoint.is_secure() {
            self.https_proxy.as_deref()
        } else {
            self.http_proxy.as_deref()
        };
        let Some(raw) = raw else {
            return Ok(None);
        };
        if self.bypass(endpoint.connect_host(), endpoint.port()) {
            debug!("Bypassing proxy for {}", endpoint.authority());
            return Ok(None);
        }

        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("http://{}", raw)
        };
        Url::parse(&with_scheme)
            .map(Some)
            .map_err(|e| TunnelError::Dial(format!("invalid proxy address '{}': {}", raw, e)))
    }

    fn bypass(&self, host: &str, port: u16) -> bool {
        let host = host.to_ascii_lowercase();
        if host == "localhost" || host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback()) {
            return true;
        }

        self.no_proxy.iter().any(|entry| {
            if entry == "*" {
                return true;
            }
            let (pattern, entry_port) = split_no_proxy_entry(entry);
            if entry_port.is_some_and(|p| p != port) {
                return false;
            }
            let pattern = pattern
                .strip_prefix("*.")
                .or_else(|| pattern.strip_prefix('.'))
                .unwrap_or(pattern);
            host == pattern || host.ends_with(&format!(".{}", pattern))
        })
    }
}

/// Split `host[:port]`, leaving bare IPv6 literals intact
fn split_no_proxy_entry(entry: &str) -> (&str, Option<u16>) {
    if let Some(rest) = entry.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
            return (host, port);
        }
    }
    match entry.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host, Some(port)),
            Err(_) => (entry, None),
        },
        _ => (entry, None),
    }
}

/// Open a TCP connection through an HTTP proxy to `target`
///
/// Sends one `CONNECT` request and requires a 2xx answer. The returned
/// stream is a transparent pipe to the target.
pub async fn connect_tunnel(proxy: &Url, target: &Endpoint) -> Result<TcpStream, TunnelError> {
    if proxy.scheme() != "http" {
        return Err(TunnelError::UnsupportedProxyProtocol(
            proxy.scheme().to_string(),
        ));
    }

    let proxy_host = proxy
        .host_str()
        .ok_or_else(|| TunnelError::ProxyConnect(format!("proxy address '{}' has no host", proxy)))?;
    let proxy_host = proxy_host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(proxy_host);
    let proxy_port = proxy.port_or_known_default().unwrap_or(80);

    debug!(
        "Connecting to {} via proxy {}:{}",
        target.authority(),
        proxy_host,
        proxy_port
    );

    let mut stream = TcpStream::connect((proxy_host, proxy_port))
        .await
        .map_err(|e| {
            TunnelError::ProxyConnect(format!(
                "proxy {}:{} unreachable: {}",
                proxy_host, proxy_port, e
            ))
        })?;

    let authority = target.authority();
    let mut request = format!(
        "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\nProxy-Connection: Keep-Alive\r\n"
    );
    if !proxy.username().is_empty() {
        let credentials = format!("{}:{}", proxy.username(), proxy.password().unwrap_or(""));
        let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", encoded));
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| TunnelError::ProxyConnect(format!("failed to send CONNECT: {}", e)))?;

    let head = read_response_head(&mut stream).await?;
    check_connect_response(&head)?;

    debug!("Proxy tunnel to {} established", authority);
    Ok(stream)
}

/// Read until the end of the response head
async fn read_response_head(stream: &mut TcpStream) -> Result<Vec<u8>, TunnelError> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| TunnelError::ProxyConnect(format!("failed to read response: {}", e)))?;
        if n == 0 {
            return Err(TunnelError::ProxyConnect(
                "proxy closed the connection".to_string(),
            ));
        }
        buffer.extend_from_slice(&chunk[..n]);

        if buffer.windows(4).any(|w| w == b"\r\n\r\n") {
            return Ok(buffer);
        }
        if buffer.len() > MAX_RESPONSE_HEAD {
            return Err(TunnelError::ProxyConnect(
                "response head too large".to_string(),
            ));
        }
    }
}

fn check_connect_response(head: &[u8]) -> Result<(), TunnelError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);

    let header_len = match response.parse(head) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => {
            return Err(TunnelError::ProxyConnect(
                "incomplete response".to_string(),
            ))
        }
        Err(e) => {
            return Err(TunnelError::ProxyConnect(format!(
                "malformed response: {}",
                e
            )))
        }
    };

    let code = response.code.unwrap_or(0);
    if !(200..300).contains(&code) {
        return Err(TunnelError::ProxyConnect(format!(
            "{} {}",
            code,
            response.reason.unwrap_or("")
        )));
    }
    if header_len < head.len() {
        return Err(TunnelError::ProxyConnect(
            "unexpected data after CONNECT response".to_string(),
        ));
    }
    Ok(())
}
