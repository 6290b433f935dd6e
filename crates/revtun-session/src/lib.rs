//! Secure multiplexed session
//!
//! An authenticated, encrypted session over any message-oriented transport
//! (a WebSocket, or a byte stream wrapped with [`length_delimited`]).
//!
//! The client side is driven in two steps so the caller can inspect the
//! server's host key before sending credentials:
//!
//! ```ignore
//! let pending = revtun_session::connect(transport, "revtun-v1").await?;
//! check_fingerprint(pending.host_key().fingerprint())?;
//! let (session, incoming) = pending.authenticate("user", "secret").await?;
//! let reply = session.request("config", payload).await?;
//! ```
//!
//! After the handshake every frame on the transport is sealed with
//! ChaCha20-Poly1305. Channel 0 carries control requests; other channels
//! carry data.

pub mod channel;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod session;
pub mod transport;

pub use channel::{Channel, InboundRequest, Incoming};
pub use crypto::{HostKey, ServerIdentity};
pub use error::{SessionError, SessionResult};
pub use handshake::{accept, connect, PendingSession};
pub use session::{ConnectionStats, RequestReply, Session};
pub use transport::{length_delimited, BoxTransport, FrameTransport};
