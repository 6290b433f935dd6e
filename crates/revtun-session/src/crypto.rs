//! Key material and frame sealing
//!
//! The server holds a long-lived X25519 identity (its host key). Each
//! handshake generates an ephemeral keypair per side; the session keys are
//! derived with HKDF-SHA256 from both the ephemeral-ephemeral and the
//! ephemeral-static shared secrets, salted with the hash of the hello
//! transcript. Only a server holding the host key's secret can derive them.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::error::SessionError;

/// HKDF info for frames sent by the client
const CLIENT_TO_SERVER_INFO: &[u8] = b"revtun-session-v1 client->server";

/// HKDF info for frames sent by the server
const SERVER_TO_CLIENT_INFO: &[u8] = b"revtun-session-v1 server->client";

/// Nonce size for ChaCha20-Poly1305.
pub const NONCE_SIZE: usize = 12;

/// A server's public host key
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostKey([u8; 32]);

impl HostKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// SHA-256 of the key as colon-separated lowercase hex pairs
    pub fn fingerprint(&self) -> String {
        Sha256::digest(self.0)
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":")
    }

    pub(crate) fn public_key(&self) -> PublicKey {
        PublicKey::from(self.0)
    }
}

impl fmt::Debug for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HostKey").field(&hex::encode(self.0)).finish()
    }
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fingerprint())
    }
}

/// A server's long-lived identity keypair
pub struct ServerIdentity {
    secret: StaticSecret,
    host_key: HostKey,
}

impl fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("host_key", &self.host_key)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl ServerIdentity {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    /// Reconstruct from raw 32-byte secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, SessionError> {
        let mut arr: [u8; 32] = bytes.try_into().map_err(|_| {
            SessionError::Crypto(format!(
                "invalid key length: expected 32, got {}",
                bytes.len()
            ))
        })?;
        let identity = Self::from_secret(StaticSecret::from(arr));
        arr.zeroize();
        Ok(identity)
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let host_key = HostKey(*PublicKey::from(&secret).as_bytes());
        Self { secret, host_key }
    }

    pub fn host_key(&self) -> HostKey {
        self.host_key
    }

    pub fn fingerprint(&self) -> String {
        self.host_key.fingerprint()
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

/// Per-handshake ephemeral keypair
pub(crate) struct Ephemeral {
    secret: StaticSecret,
    public: [u8; 32],
}

impl Ephemeral {
    pub(crate) fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = *PublicKey::from(&secret).as_bytes();
        Self { secret, public }
    }

    pub(crate) fn public_bytes(&self) -> [u8; 32] {
        self.public
    }

    pub(crate) fn diffie_hellman(&self, peer: &PublicKey) -> [u8; 32] {
        *self.secret.diffie_hellman(peer).as_bytes()
    }
}

/// Which end of the session a key schedule belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Server,
}

/// Derive the sealer/opener pair for one side.
///
/// `ephemeral_shared` and `static_shared` must be computed identically on
/// both ends: DH(client ephemeral, server ephemeral) and
/// DH(client ephemeral, server host key).
pub(crate) fn derive_keys(
    role: Role,
    transcript: &[u8],
    ephemeral_shared: &[u8; 32],
    static_shared: &[u8; 32],
) -> Result<(Sealer, Opener), SessionError> {
    let salt = Sha256::digest(transcript);

    let mut ikm = [0u8; 64];
    ikm[..32].copy_from_slice(ephemeral_shared);
    ikm[32..].copy_from_slice(static_shared);
    let hk = Hkdf::<Sha256>::new(Some(salt.as_slice()), &ikm);
    ikm.zeroize();

    let mut client_key = [0u8; 32];
    let mut server_key = [0u8; 32];
    hk.expand(CLIENT_TO_SERVER_INFO, &mut client_key)
        .and_then(|_| hk.expand(SERVER_TO_CLIENT_INFO, &mut server_key))
        .map_err(|e| SessionError::Crypto(format!("key derivation failed: {}", e)))?;

    let (send_key, recv_key) = match role {
        Role::Client => (&client_key, &server_key),
        Role::Server => (&server_key, &client_key),
    };
    let keys = (Sealer::new(send_key), Opener::new(recv_key));

    client_key.zeroize();
    server_key.zeroize();
    Ok(keys)
}

/// Counter nonce: 4 zero bytes then the big-endian counter
fn counter_nonce(counter: &mut u64) -> Result<[u8; NONCE_SIZE], SessionError> {
    if *counter == u64::MAX {
        return Err(SessionError::NonceExhausted);
    }
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    *counter += 1;
    Ok(nonce)
}

/// Encrypts outgoing frames
pub(crate) struct Sealer {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl Sealer {
    fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            counter: 0,
        }
    }

    pub(crate) fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let nonce = counter_nonce(&mut self.counter)?;
        self.cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| SessionError::Crypto(format!("encryption failed: {}", e)))
    }
}

/// Decrypts incoming frames, which must arrive in order
pub(crate) struct Opener {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl Opener {
    fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            counter: 0,
        }
    }

    pub(crate) fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let nonce = counter_nonce(&mut self.counter)?;
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|e| SessionError::Crypto(format!("decryption failed: {}", e)))
    }
}
