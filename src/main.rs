//! revtun CLI - reverse tunnel client
//!
//! Connects to a tunnel server, registers the forwarding rules and keeps the
//! connection alive until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use revtun_client::{ClientConfig, TunnelClient};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const VERSION: &str = concat!(
    env!("GIT_TAG"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
);

/// revtun - expose services through a remote tunnel server
#[derive(Parser, Debug)]
#[command(name = "revtun")]
#[command(version = VERSION)]
#[command(after_help = r#"REMOTES:
  [R:]<local-host>:<local-port>:<remote-host>:<remote-port>[/tcp|/udp]

  Hosts and the local port may be omitted:
    3000                   0.0.0.0:3000 => localhost:3000
    example.com:3000       0.0.0.0:3000 => example.com:3000
    3000:google.com:80     0.0.0.0:3000 => google.com:80
    R:2222:localhost:22    server listens on 2222, forwards to client's localhost:22
    1.1.1.1:53/udp         UDP forwarding
"#)]
struct Cli {
    /// Tunnel server address, e.g. https://tunnel.example.com
    #[arg(env = "REVTUN_SERVER")]
    server: Option<String>,

    /// Forwarding rules
    remotes: Vec<String>,

    /// Expected server fingerprint (a prefix is enough)
    #[arg(long, env = "REVTUN_FINGERPRINT")]
    fingerprint: Option<String>,

    /// Credentials as user:password
    #[arg(long, env = "REVTUN_AUTH", hide_env_values = true)]
    auth: Option<String>,

    /// Keepalive interval, e.g. 25s; 0 disables
    #[arg(long, value_parser = parse_duration)]
    keepalive: Option<Duration>,

    /// Upper bound for the delay between reconnection attempts, e.g. 5m
    #[arg(long, value_parser = parse_duration)]
    max_retry_interval: Option<Duration>,

    /// Skip TLS certificate validation
    #[arg(long)]
    skip_ssl_validation: bool,

    /// YAML configuration file; command line flags take precedence
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn into_config(self) -> Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                serde_yaml::from_str::<ClientConfig>(&raw)
                    .with_context(|| format!("Failed to parse config file {}", path.display()))?
            }
            None => ClientConfig::default(),
        };

        if let Some(server) = self.server {
            config.server = server;
        }
        if !self.remotes.is_empty() {
            config.remotes = self.remotes;
        }
        if self.fingerprint.is_some() {
            config.fingerprint = self.fingerprint;
        }
        if self.auth.is_some() {
            config.auth = self.auth;
        }
        if let Some(keepalive) = self.keepalive {
            config.keepalive = keepalive;
        }
        if let Some(max) = self.max_retry_interval {
            config.max_retry_interval = max;
        }
        if self.skip_ssl_validation {
            config.skip_tls_verify = true;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Parse `500ms`, `25s`, `5m`, `1h` or plain seconds
fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid duration '{}'", raw))?;

    let secs = match unit {
        "ms" => value / 1000.0,
        "" | "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => return Err(format!("unknown duration unit '{}'", other)),
    };
    Duration::try_from_secs_f64(secs).map_err(|e| format!("invalid duration '{}': {}", raw, e))
}

/// Setup logging; RUST_LOG wins over the command line level
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let config = cli.into_config()?;
    info!("revtun {}", VERSION);
    if config.skip_tls_verify {
        warn!("TLS certificate validation disabled");
    }

    let client = TunnelClient::new(config).context("Invalid client configuration")?;
    info!("Server: {}", client.endpoint());
    for rule in client.rules() {
        info!("Remote: {}", rule);
    }

    client.start();
    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            if let Err(e) = client.close().await {
                warn!("Error while closing session: {}", e);
            }
            client.wait().await
        }
        result = client.wait() => result,
    };

    result.context("Tunnel client failed")?;
    info!("revtun stopped");
    Ok(())
}
