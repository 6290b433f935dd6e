//! Session handshake
//!
//! 1. client -> server: `ClientHello { version, ephemeral }`
//! 2. server -> client: `ServerHello { version, host_key, ephemeral }`
//! 3. client -> server: sealed `AuthRequest { user, password }`
//! 4. server -> client: sealed `AuthResult { accepted, message }`
//!
//! Hellos travel in the clear; both sides hash them into the key schedule.
//! The client can inspect the host key between steps 2 and 3.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;
use x25519_dalek::PublicKey;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::channel::Incoming;
use crate::crypto::{derive_keys, Ephemeral, HostKey, Opener, Role, Sealer, ServerIdentity};
use crate::error::{SessionError, SessionResult};
use crate::session::Session;
use crate::transport::FrameTransport;

#[derive(Debug, Serialize, Deserialize)]
enum Hello {
    Client {
        version: String,
        ephemeral: [u8; 32],
    },
    Server {
        version: String,
        host_key: [u8; 32],
        ephemeral: [u8; 32],
    },
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct AuthRequest {
    user: String,
    password: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct AuthResult {
    accepted: bool,
    message: String,
}

async fn recv_frame<T: FrameTransport>(transport: &mut T) -> SessionResult<Bytes> {
    match transport.next().await {
        Some(Ok(frame)) => Ok(frame),
        Some(Err(e)) => Err(e.into()),
        None => Err(SessionError::HandshakeInterrupted),
    }
}

/// Start the client side of the handshake
///
/// Returns once the server has presented its host key. Nothing secret has
/// been sent at that point.
pub async fn connect<T: FrameTransport>(
    mut transport: T,
    version: &str,
) -> SessionResult<PendingSession<T>> {
    let ephemeral = Ephemeral::generate();
    let client_hello = bincode::serialize(&Hello::Client {
        version: version.to_string(),
        ephemeral: ephemeral.public_bytes(),
    })?;
    transport.send(Bytes::from(client_hello.clone())).await?;

    let server_hello = recv_frame(&mut transport).await?;
    let (remote_version, host_key, server_ephemeral) = match bincode::deserialize::<Hello>(&server_hello)? {
        Hello::Server {
            version,
            host_key,
            ephemeral,
        } => (version, HostKey::from_bytes(host_key), ephemeral),
        Hello::Client { .. } => {
            return Err(SessionError::Protocol(
                "expected server hello".to_string(),
            ))
        }
    };

    if remote_version != version {
        return Err(SessionError::VersionMismatch {
            local: version.to_string(),
            remote: remote_version,
        });
    }

    let mut transcript = client_hello;
    transcript.extend_from_slice(&server_hello);
    let (sealer, opener) = derive_keys(
        Role::Client,
        &transcript,
        &ephemeral.diffie_hellman(&PublicKey::from(server_ephemeral)),
        &ephemeral.diffie_hellman(&host_key.public_key()),
    )?;

    debug!("Server presented host key {}", host_key.fingerprint());

    Ok(PendingSession {
        transport,
        host_key,
        sealer,
        opener,
    })
}

/// A client handshake waiting for credentials
pub struct PendingSession<T> {
    transport: T,
    host_key: HostKey,
    sealer: Sealer,
    opener: Opener,
}

impl<T> std::fmt::Debug for PendingSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingSession")
            .field("host_key", &self.host_key)
            .finish()
    }
}

impl<T: FrameTransport> PendingSession<T> {
    /// Host key presented by the server
    pub fn host_key(&self) -> &HostKey {
        &self.host_key
    }

    /// Authenticate with a password and start the session
    pub async fn authenticate(
        mut self,
        user: &str,
        password: &str,
    ) -> SessionResult<(Session, Incoming)> {
        let request = AuthRequest {
            user: user.to_string(),
            password: password.to_string(),
        };
        let mut encoded = bincode::serialize(&request)?;
        let sealed = self.sealer.seal(&encoded);
        encoded.zeroize();
        self.transport.send(Bytes::from(sealed?)).await?;

        let reply = recv_frame(&mut self.transport).await?;
        // Only the holder of the host key's secret can seal a valid reply
        let opened = self
            .opener
            .open(&reply)
            .map_err(|_| SessionError::HostKeyProof)?;
        let result: AuthResult = bincode::deserialize(&opened)?;

        if !result.accepted {
            return Err(SessionError::AuthenticationFailed(result.message));
        }

        Ok(Session::spawn(
            self.transport,
            self.sealer,
            self.opener,
            Role::Client,
        ))
    }
}

/// Run the server side of the handshake
///
/// `authorize` decides whether the presented user and password are
/// accepted.
pub async fn accept<T, F>(
    mut transport: T,
    version: &str,
    identity: &ServerIdentity,
    authorize: F,
) -> SessionResult<(Session, Incoming)>
where
    T: FrameTransport,
    F: FnOnce(&str, &str) -> bool,
{
    let client_hello = recv_frame(&mut transport).await?;
    let (remote_version, client_ephemeral) = match bincode::deserialize::<Hello>(&client_hello)? {
        Hello::Client { version, ephemeral } => (version, PublicKey::from(ephemeral)),
        Hello::Server { .. } => {
            return Err(SessionError::Protocol(
                "expected client hello".to_string(),
            ))
        }
    };

    let ephemeral = Ephemeral::generate();
    let server_hello = bincode::serialize(&Hello::Server {
        version: version.to_string(),
        host_key: *identity.host_key().as_bytes(),
        ephemeral: ephemeral.public_bytes(),
    })?;
    transport.send(Bytes::from(server_hello.clone())).await?;

    if remote_version != version {
        return Err(SessionError::VersionMismatch {
            local: version.to_string(),
            remote: remote_version,
        });
    }

    let mut transcript = client_hello.to_vec();
    transcript.extend_from_slice(&server_hello);
    let static_shared = identity.secret().diffie_hellman(&client_ephemeral);
    let (mut sealer, mut opener) = derive_keys(
        Role::Server,
        &transcript,
        &ephemeral.diffie_hellman(&client_ephemeral),
        static_shared.as_bytes(),
    )?;

    let sealed = recv_frame(&mut transport).await?;
    let request: AuthRequest = bincode::deserialize(&opener.open(&sealed)?)?;
    let accepted = authorize(&request.user, &request.password);

    let result = AuthResult {
        accepted,
        message: if accepted {
            String::new()
        } else {
            "invalid credentials".to_string()
        },
    };
    let reply = sealer.seal(&bincode::serialize(&result)?)?;
    transport.send(Bytes::from(reply)).await?;

    if !accepted {
        let _ = transport.close().await;
        return Err(SessionError::AuthenticationFailed(format!(
            "rejected user '{}'",
            request.user
        )));
    }

    debug!("Accepted session for user '{}'", request.user);
    Ok(Session::spawn(transport, sealer, opener, Role::Server))
}
