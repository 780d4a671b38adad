//! Wire messages exchanged between two peer coders.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use sos_core::{AgreementPublicKey, PeerId, Signature};

use crate::crypto::{Nonce, SessionId};
use crate::error::{CoderError, Result};

/// Current wire version, mixed into every transcript.
pub const WIRE_VERSION: u8 = 0;

/// Message size limits.
pub mod limits {
    /// Max encoded size of a single wire message.
    pub const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;
}

/// A coder-level message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Handshake opener from the initiator.
    Hello {
        from: PeerId,
        to: PeerId,
        /// Strictly increasing per initiator; older hellos are refused.
        counter: u64,
        /// Initiator's handshake public key.
        ephemeral: AgreementPublicKey,
        /// Signature over [`hello_transcript`].
        signature: Signature,
    },

    /// Handshake reply from the acceptor.
    HelloAck {
        from: PeerId,
        to: PeerId,
        /// Echo of the hello being answered.
        initiator_ephemeral: AgreementPublicKey,
        /// Acceptor's handshake public key.
        ephemeral: AgreementPublicKey,
        /// Signature over [`ack_transcript`].
        signature: Signature,
    },

    /// Encrypted payload under an established session.
    Data {
        from: PeerId,
        to: PeerId,
        session: SessionId,
        seq: u64,
        /// Highest sequence number the sender has accepted from us.
        ack: u64,
        nonce: Nonce,
        ciphertext: Bytes,
    },
}

impl WireMessage {
    /// Sender of the message.
    pub fn from(&self) -> &PeerId {
        match self {
            WireMessage::Hello { from, .. }
            | WireMessage::HelloAck { from, .. }
            | WireMessage::Data { from, .. } => from,
        }
    }

    /// Intended recipient of the message.
    pub fn to(&self) -> &PeerId {
        match self {
            WireMessage::Hello { to, .. }
            | WireMessage::HelloAck { to, .. }
            | WireMessage::Data { to, .. } => to,
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Hello { .. } => "hello",
            WireMessage::HelloAck { .. } => "hello-ack",
            WireMessage::Data { .. } => "data",
        }
    }

    /// Serialize to CBOR bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| CoderError::SerializationError(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize from CBOR bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > limits::MAX_MESSAGE_BYTES {
            return Err(CoderError::SerializationError(format!(
                "message of {} bytes exceeds limit",
                bytes.len()
            )));
        }
        ciborium::from_reader(bytes).map_err(|e| CoderError::SerializationError(e.to_string()))
    }
}

/// Bytes signed by the initiator in a hello.
pub fn hello_transcript(
    from: &PeerId,
    to: &PeerId,
    counter: u64,
    ephemeral: &AgreementPublicKey,
) -> Vec<u8> {
    let mut buf = b"sos-hello-v0:".to_vec();
    buf.push(WIRE_VERSION);
    push_str(&mut buf, from.as_str());
    push_str(&mut buf, to.as_str());
    buf.extend_from_slice(&counter.to_be_bytes());
    buf.extend_from_slice(ephemeral.as_bytes());
    buf
}

/// Bytes signed by the acceptor in a hello-ack.
pub fn ack_transcript(
    from: &PeerId,
    to: &PeerId,
    initiator_ephemeral: &AgreementPublicKey,
    ephemeral: &AgreementPublicKey,
) -> Vec<u8> {
    let mut buf = b"sos-hello-ack-v0:".to_vec();
    buf.push(WIRE_VERSION);
    push_str(&mut buf, from.as_str());
    push_str(&mut buf, to.as_str());
    buf.extend_from_slice(initiator_ephemeral.as_bytes());
    buf.extend_from_slice(ephemeral.as_bytes());
    buf
}

/// Associated data authenticated with every data message.
pub fn data_aad(from: &PeerId, to: &PeerId, session: &SessionId, seq: u64, ack: u64) -> Vec<u8> {
    let mut buf = b"sos-data-v0:".to_vec();
    buf.push(WIRE_VERSION);
    push_str(&mut buf, from.as_str());
    push_str(&mut buf, to.as_str());
    buf.extend_from_slice(&session.0);
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(&ack.to_be_bytes());
    buf
}

fn push_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use sos_core::DeviceIdentity;

    #[test]
    fn test_wire_roundtrip() {
        let a = DeviceIdentity::from_seed(&[1; 32]);
        let b = DeviceIdentity::from_seed(&[2; 32]);
        let msg = WireMessage::Data {
            from: a.peer_id(),
            to: b.peer_id(),
            session: SessionId([3; 32]),
            seq: 7,
            ack: 5,
            nonce: Nonce([4; 12]),
            ciphertext: Bytes::from_static(b"ciphertext"),
        };
        let decoded = WireMessage::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(msg, decoded);
        assert_eq!(decoded.kind(), "data");
        assert_eq!(decoded.from(), &a.peer_id());
    }

    #[test]
    fn test_transcripts_are_direction_bound() {
        let a = DeviceIdentity::from_seed(&[1; 32]).peer_id();
        let b = DeviceIdentity::from_seed(&[2; 32]).peer_id();
        let eph = AgreementPublicKey::from_bytes([5; 32]);
        assert_ne!(hello_transcript(&a, &b, 1, &eph), hello_transcript(&b, &a, 1, &eph));
        assert_ne!(hello_transcript(&a, &b, 1, &eph), hello_transcript(&a, &b, 2, &eph));
        assert_ne!(
            data_aad(&a, &b, &SessionId([0; 32]), 1, 0),
            data_aad(&a, &b, &SessionId([0; 32]), 2, 0)
        );
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(WireMessage::from_bytes(b"\xff\x00garbage").is_err());
    }
}
