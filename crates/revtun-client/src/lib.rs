//! Reverse tunnel client
//!
//! Opens an outbound connection to a tunnel server (optionally through an
//! HTTP proxy), authenticates, sends the forwarding rules and keeps the
//! session alive across network failures.
//!
//! ```ignore
//! let config = ClientConfig::builder()
//!     .server("https://tunnel.example.com")
//!     .auth("user:secret")
//!     .remote("R:2222:localhost:22")
//!     .build()?;
//! let client = TunnelClient::new(config)?;
//! client.run().await?;
//! ```

pub mod backoff;
pub mod client;
pub mod config;
pub mod controller;
pub mod dialer;
pub mod endpoint;
pub mod error;
pub mod handshake;
pub mod keepalive;
pub mod proxy;
pub mod session;
mod tls;
pub mod websocket;

pub use backoff::Backoff;
pub use client::TunnelClient;
pub use config::{ClientConfig, ClientConfigBuilder, Credentials};
pub use controller::ConnectionState;
pub use dialer::{Connector, Dialer};
pub use endpoint::Endpoint;
pub use error::{ErrorClass, TunnelError};
pub use handshake::verify_host_key;
pub use proxy::ProxyEnv;
pub use session::TunnelSession;
pub use websocket::WsFrames;

pub use revtun_proto::{ForwardingRule, PROTOCOL_VERSION};
pub use revtun_session::{BoxTransport, FrameTransport, HostKey};
