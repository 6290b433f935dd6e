//! Forwarding rules
//!
//! A rule is written as `[R:]<fields>[/tcp|/udp]` where `<fields>` is one to
//! four colon-separated parts:
//!
//! - `remote-port`
//! - `remote-host:remote-port`
//! - `local-port:remote-port`
//! - `local-port:remote-host:remote-port`
//! - `local-host:local-port:remote-port`
//! - `local-host:local-port:remote-host:remote-port`
//!
//! IPv6 hosts must be bracketed (`[::1]:22`). The `R:` prefix marks a reverse
//! rule, where the server listens and the client dials.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Default listen host for the local side of a rule
pub const DEFAULT_LOCAL_HOST: &str = "0.0.0.0";

/// Default target host for the remote side of a rule
pub const DEFAULT_REMOTE_HOST: &str = "localhost";

/// Rule parse errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("Failed to decode remote '{spec}': {reason}")]
    Invalid { spec: String, reason: String },
}

impl RuleError {
    fn invalid(spec: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            spec: spec.to_string(),
            reason: reason.into(),
        }
    }

    /// The raw rule string that failed to parse
    pub fn spec(&self) -> &str {
        match self {
            Self::Invalid { spec, .. } => spec,
        }
    }
}

/// Transport protocol carried by a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RuleProtocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for RuleProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

/// Host and port of one side of a rule
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Binding {
    /// Host without IPv6 brackets
    pub host: String,
    pub port: u16,
}

impl Binding {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// A single decoded forwarding rule
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForwardingRule {
    pub reverse: bool,
    pub protocol: RuleProtocol,
    pub local: Binding,
    pub remote: Binding,
}

impl ForwardingRule {
    /// Forward `local` to `remote` over TCP
    pub fn tcp(local: Binding, remote: Binding) -> Self {
        Self {
            reverse: false,
            protocol: RuleProtocol::Tcp,
            local,
            remote,
        }
    }

    pub fn with_reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    pub fn with_protocol(mut self, protocol: RuleProtocol) -> Self {
        self.protocol = protocol;
        self
    }
}

impl fmt::Display for ForwardingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reverse {
            f.write_str("R:")?;
        }
        write!(f, "{}=>{}", self.local, self.remote)?;
        if self.protocol != RuleProtocol::Tcp {
            write!(f, "/{}", self.protocol)?;
        }
        Ok(())
    }
}

impl FromStr for ForwardingRule {
    type Err = RuleError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let mut rest = spec.trim();
        if rest.is_empty() {
            return Err(RuleError::invalid(spec, "empty rule"));
        }

        let reverse = match rest.strip_prefix("R:") {
            Some(stripped) => {
                rest = stripped;
                true
            }
            None => false,
        };

        let mut protocol = RuleProtocol::Tcp;
        if let Some((head, proto)) = rest.rsplit_once('/') {
            protocol = match proto.to_ascii_lowercase().as_str() {
                "tcp" => RuleProtocol::Tcp,
                "udp" => RuleProtocol::Udp,
                other => {
                    return Err(RuleError::invalid(
                        spec,
                        format!("unknown protocol '{}'", other),
                    ))
                }
            };
            rest = head;
        }

        let fields = split_colon_fields(rest).map_err(|reason| RuleError::invalid(spec, reason))?;
        let invalid = |reason: String| RuleError::invalid(spec, reason);

        let (local_host, local_port, remote_host, remote_port) = match fields.as_slice() {
            [port] => {
                let port = parse_port(port).map_err(invalid)?;
                (None, port, None, port)
            }
            [first, second] => {
                let remote_port = parse_port(second).map_err(invalid)?;
                if is_port(first) {
                    let local_port = parse_port(first).map_err(invalid)?;
                    (None, local_port, None, remote_port)
                } else {
                    let host = parse_host(first).map_err(invalid)?;
                    (None, remote_port, Some(host), remote_port)
                }
            }
            [first, second, third] => {
                let remote_port = parse_port(third).map_err(invalid)?;
                if is_port(first) {
                    let local_port = parse_port(first).map_err(invalid)?;
                    let host = parse_host(second).map_err(invalid)?;
                    (None, local_port, Some(host), remote_port)
                } else {
                    let host = parse_host(first).map_err(invalid)?;
                    let local_port = parse_port(second).map_err(invalid)?;
                    (Some(host), local_port, None, remote_port)
                }
            }
            [lhost, lport, rhost, rport] => (
                Some(parse_host(lhost).map_err(invalid)?),
                parse_port(lport).map_err(invalid)?,
                Some(parse_host(rhost).map_err(invalid)?),
                parse_port(rport).map_err(invalid)?,
            ),
            _ => {
                return Err(RuleError::invalid(
                    spec,
                    format!("expected 1 to 4 fields, got {}", fields.len()),
                ))
            }
        };

        Ok(Self {
            reverse,
            protocol,
            local: Binding::new(
                local_host.unwrap_or_else(|| DEFAULT_LOCAL_HOST.to_string()),
                local_port,
            ),
            remote: Binding::new(
                remote_host.unwrap_or_else(|| DEFAULT_REMOTE_HOST.to_string()),
                remote_port,
            ),
        })
    }
}

/// Parse an ordered list of rule strings, failing on the first malformed entry
pub fn parse_rules<I, S>(specs: I) -> Result<Vec<ForwardingRule>, RuleError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    specs
        .into_iter()
        .map(|spec| spec.as_ref().parse())
        .collect()
}

fn split_colon_fields(input: &str) -> Result<Vec<&str>, String> {
    let mut fields = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (idx, ch) in input.char_indices() {
        match ch {
            '[' => depth += 1,
            ']' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| "unbalanced ']'".to_string())?;
            }
            ':' if depth == 0 => {
                fields.push(&input[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err("unbalanced '['".to_string());
    }
    fields.push(&input[start..]);

    if fields.iter().any(|f| f.trim().is_empty()) {
        return Err("empty field".to_string());
    }
    Ok(fields.into_iter().map(str::trim).collect())
}

fn is_port(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit())
}

fn parse_port(value: &str) -> Result<u16, String> {
    match value.parse::<u16>() {
        Ok(0) => Err("port must be between 1 and 65535".to_string()),
        Ok(port) => Ok(port),
        Err(_) => Err(format!("invalid port '{}'", value)),
    }
}

fn parse_host(value: &str) -> Result<String, String> {
    let host = match value.strip_prefix('[') {
        Some(inner) => inner
            .strip_suffix(']')
            .ok_or_else(|| format!("invalid host '{}'", value))?,
        None => value,
    };
    if host.is_empty() || host.contains(['[', ']', ' ', '/']) {
        return Err(format!("invalid host '{}'", value));
    }
    if host.contains(':') && !value.starts_with('[') {
        return Err(format!("IPv6 host '{}' must be bracketed", value));
    }
    Ok(host.to_string())
}
