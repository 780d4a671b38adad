//! # SOS Coder
//!
//! Per-peer authenticated encryption for the sync engine.
//!
//! ## Overview
//!
//! Each pair of circle members talks through a [`PeerCoder`]. A coder runs a
//! two-message signed handshake, then wraps every engine payload in an
//! encrypted [`WireMessage::Data`] carrying a sequence number and an ack.
//!
//! ## Handshake
//!
//! 1. The initiator sends `Hello` with a fresh X25519 public key, signed with
//!    its long-term signing key.
//! 2. The acceptor replies `HelloAck` with its own fresh key, signed likewise.
//! 3. Both sides mix the ephemeral agreement with the static agreement of the
//!    two devices and derive one key per direction.
//!
//! The acceptor becomes established on the first data message it decrypts.
//!
//! ## Ordering
//!
//! Sequence numbers start at 1 per session. A message at or below the last
//! accepted number is a [`CoderOutcome::Duplicate`]; a message that skips
//! numbers is decoded with `gap: true` so the engine can ask for a full
//! snapshot.

pub mod coder;
pub mod crypto;
pub mod error;
pub mod message;

pub use coder::{CoderOutcome, CoderSnapshot, CoderState, OutgoingMessage, PeerCoder, SessionSnapshot};
pub use crypto::{HandshakeSecret, Nonce, Role, SessionId, SessionKey, SessionKeys};
pub use error::{CoderError, Result};
pub use message::{limits, WireMessage, WIRE_VERSION};
