//! Tunnel Protocol Definitions
//!
//! This crate defines the forwarding-rule model shared by the tunnel client
//! and server, the wire encoding of the rule set sent in the `config`
//! request, and the protocol constants both sides agree on.

pub mod codec;
pub mod rule;

pub use codec::{decode_config, encode_config, CodecError};
pub use rule::{parse_rules, Binding, ForwardingRule, RuleError, RuleProtocol};

/// Protocol version, offered as the WebSocket subprotocol and in the session hello
pub const PROTOCOL_VERSION: &str = "revtun-v1";

/// Control request carrying the encoded rule set
pub const CONFIG_REQUEST: &str = "config";

/// Control request used for keepalive
pub const PING_REQUEST: &str = "ping";

/// Maximum encoded config size (1MB)
pub const MAX_CONFIG_SIZE: usize = 1024 * 1024;
