//! Error types for the peer coder.

use thiserror::Error;

use sos_core::PeerId;

/// Errors that can occur while encoding or decoding peer messages.
///
/// Only authentication failures ([`CoderError::BadSignature`] and
/// [`CoderError::DecryptionError`]) move the coder to `Faulted`.
#[derive(Debug, Error)]
pub enum CoderError {
    /// Handshake signature did not verify.
    #[error("bad handshake signature from {0}")]
    BadSignature(PeerId),

    /// Ciphertext failed authentication.
    #[error("decryption error: {0}")]
    DecryptionError(String),

    /// Encryption failed.
    #[error("encryption error: {0}")]
    EncryptionError(String),

    /// Message is for a session this coder does not hold.
    #[error("message for unknown session")]
    UnknownSession,

    /// Message names a different sender or recipient.
    #[error("message addressed {from} -> {to} delivered to the wrong coder")]
    Misaddressed { from: PeerId, to: PeerId },

    /// Handshake reply does not match the hello we sent.
    #[error("handshake reply does not match our hello")]
    HandshakeMismatch,

    /// Hello is not newer than the last one accepted from this peer.
    #[error("hello counter {counter} is not newer than {last}")]
    StaleHello { counter: u64, last: u64 },

    /// The coder is faulted and needs a fresh handshake.
    #[error("coder is faulted")]
    Faulted,

    /// Sequence counter exhausted.
    #[error("sequence number overflow")]
    SequenceOverflow,

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Core error.
    #[error("core error: {0}")]
    CoreError(#[from] sos_core::CoreError),
}

/// Result type for coder operations.
pub type Result<T> = std::result::Result<T, CoderError>;
