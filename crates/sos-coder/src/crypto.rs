//! Cryptographic utilities for the peer coder.
//!
//! Provides X25519 handshake keys, session key derivation, and
//! ChaCha20-Poly1305 authenticated encryption with associated data.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};

use sos_core::AgreementPublicKey;

use crate::error::{CoderError, Result};

/// Which side of the handshake a coder plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Initiator,
    Acceptor,
}

/// The per-handshake X25519 secret.
///
/// Held as a static secret (not a one-shot ephemeral) so an unanswered hello
/// can be re-sent with the same public value and the acceptor can answer a
/// duplicate hello with the same reply.
#[derive(Clone)]
pub struct HandshakeSecret(StaticSecret);

impl HandshakeSecret {
    /// Generate a new random secret.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(StaticSecret::from(bytes))
    }

    /// Restore from persisted bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    /// Raw secret bytes, for persistence.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Derive the public key sent in the hello.
    pub fn public_key(&self) -> AgreementPublicKey {
        AgreementPublicKey::from(PublicKey::from(&self.0))
    }

    /// Perform key agreement with a peer's handshake public key.
    pub fn diffie_hellman(&self, peer: &AgreementPublicKey) -> [u8; 32] {
        *self.0.diffie_hellman(&peer.to_dalek()).as_bytes()
    }
}

impl fmt::Debug for HandshakeSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandshakeSecret({:?})", self.public_key())
    }
}

/// Identifier of one negotiated session: Blake3(initiator_eph || acceptor_eph).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub [u8; 32]);

impl SessionId {
    /// Derive from both handshake public keys, initiator first.
    pub fn derive(initiator: &AgreementPublicKey, acceptor: &AgreementPublicKey) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"sos-session-v0:");
        hasher.update(initiator.as_bytes());
        hasher.update(acceptor.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({:02x}{:02x}{:02x}{:02x})", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

/// A 256-bit symmetric key for ChaCha20-Poly1305.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Encrypt with associated data.
    pub fn encrypt(&self, plaintext: &[u8], nonce: &Nonce, aad: &[u8]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| CoderError::EncryptionError(e.to_string()))?;
        cipher
            .encrypt(
                chacha20poly1305::Nonce::from_slice(&nonce.0),
                Payload { msg: plaintext, aad },
            )
            .map_err(|e| CoderError::EncryptionError(e.to_string()))
    }

    /// Decrypt and authenticate with associated data.
    pub fn decrypt(&self, ciphertext: &[u8], nonce: &Nonce, aad: &[u8]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| CoderError::DecryptionError(e.to_string()))?;
        cipher
            .decrypt(
                chacha20poly1305::Nonce::from_slice(&nonce.0),
                Payload { msg: ciphertext, aad },
            )
            .map_err(|e| CoderError::DecryptionError(e.to_string()))
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Directional keys for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionKeys {
    pub send: SessionKey,
    pub recv: SessionKey,
}

impl SessionKeys {
    /// Derive both directions from the handshake input keying material.
    ///
    /// `ikm` is `DH(eph, eph) || DH(static, static)`. Each direction gets its
    /// own derivation context so a reflected message never decrypts.
    pub fn derive(role: Role, ikm: &[u8; 64], session: &SessionId) -> Self {
        let key = |context: &str| {
            let mut hasher = blake3::Hasher::new_derive_key(context);
            hasher.update(ikm);
            hasher.update(&session.0);
            SessionKey(*hasher.finalize().as_bytes())
        };
        let i2a = key("sos-coder-v0 initiator->acceptor");
        let a2i = key("sos-coder-v0 acceptor->initiator");
        match role {
            Role::Initiator => Self { send: i2a, recv: a2i },
            Role::Acceptor => Self { send: a2i, recv: i2a },
        }
    }
}

/// A 96-bit nonce for ChaCha20-Poly1305.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nonce(pub [u8; 12]);

impl Nonce {
    /// Generate a new random nonce.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_agreement() {
        let a = HandshakeSecret::generate();
        let b = HandshakeSecret::generate();
        assert_eq!(a.diffie_hellman(&b.public_key()), b.diffie_hellman(&a.public_key()));
    }

    #[test]
    fn test_handshake_secret_persists() {
        let a = HandshakeSecret::generate();
        let restored = HandshakeSecret::from_bytes(a.to_bytes());
        assert_eq!(a.public_key(), restored.public_key());
    }

    #[test]
    fn test_session_keys_mirror() {
        let ikm = [0x42; 64];
        let session = SessionId([7; 32]);
        let init = SessionKeys::derive(Role::Initiator, &ikm, &session);
        let acc = SessionKeys::derive(Role::Acceptor, &ikm, &session);
        assert_eq!(init.send, acc.recv);
        assert_eq!(init.recv, acc.send);
        assert_ne!(init.send, init.recv);
    }

    #[test]
    fn test_encrypt_decrypt_with_aad() {
        let key = SessionKey::from_bytes([9; 32]);
        let nonce = Nonce::generate();
        let ct = key.encrypt(b"delta", &nonce, b"header").unwrap();
        assert_eq!(key.decrypt(&ct, &nonce, b"header").unwrap(), b"delta");
        assert!(key.decrypt(&ct, &nonce, b"other header").is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let nonce = Nonce::generate();
        let ct = SessionKey::from_bytes([1; 32]).encrypt(b"x", &nonce, b"").unwrap();
        assert!(SessionKey::from_bytes([2; 32]).decrypt(&ct, &nonce, b"").is_err());
    }
}
