//! Peer info: a device's self-signed public description.

use ciborium::value::Value;
use serde::{Deserialize, Serialize};

use crate::canonical::{encode_canonical, int_map};
use crate::crypto::{DeviceIdentity, PeerKeys, Signature};
use crate::error::CoreError;
use crate::types::PeerId;

mod keys {
    pub const PEER_ID: u64 = 0;
    pub const DEVICE_NAME: u64 = 1;
    pub const SIGNING: u64 = 2;
    pub const AGREEMENT: u64 = 3;
}

/// A peer's public identity as carried inside a circle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub device_name: String,
    pub keys: PeerKeys,
    pub signature: Signature,
}

impl PeerInfo {
    /// Create and sign a peer info for a local identity.
    pub fn new(identity: &DeviceIdentity, device_name: impl Into<String>) -> Result<Self, CoreError> {
        let keys = identity.public_keys();
        let peer_id = keys.peer_id();
        let device_name = device_name.into();
        let message = signed_bytes(&peer_id, &device_name, &keys)?;
        Ok(Self {
            peer_id,
            device_name,
            keys,
            signature: identity.sign(&message),
        })
    }

    /// Verify that the id matches the keys and the self-signature holds.
    pub fn verify(&self) -> Result<(), CoreError> {
        let derived = self.keys.peer_id();
        if derived != self.peer_id {
            return Err(CoreError::PeerIdMismatch {
                claimed: self.peer_id.clone(),
                derived,
            });
        }
        let message = signed_bytes(&self.peer_id, &self.device_name, &self.keys)?;
        self.keys.signing.verify(&message, &self.signature)
    }

    /// Canonical CBOR value, including the signature.
    pub(crate) fn to_value(&self) -> Value {
        let mut value = unsigned_value(&self.peer_id, &self.device_name, &self.keys);
        if let Value::Map(entries) = &mut value {
            entries.push((
                Value::Integer(4u64.into()),
                Value::Bytes(self.signature.0.to_vec()),
            ));
        }
        value
    }
}

fn unsigned_value(peer_id: &PeerId, device_name: &str, keys: &PeerKeys) -> Value {
    int_map(vec![
        (keys::PEER_ID, Value::Text(peer_id.as_str().to_owned())),
        (keys::DEVICE_NAME, Value::Text(device_name.to_owned())),
        (keys::SIGNING, Value::Bytes(keys.signing.0.to_vec())),
        (keys::AGREEMENT, Value::Bytes(keys.agreement.0.to_vec())),
    ])
}

fn signed_bytes(peer_id: &PeerId, device_name: &str, keys: &PeerKeys) -> Result<Vec<u8>, CoreError> {
    let mut buf = b"sos-peer-info-v0:".to_vec();
    buf.extend(encode_canonical(&unsigned_value(peer_id, device_name, keys))?);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_info_verifies() {
        let identity = DeviceIdentity::from_seed(&[3; 32]);
        let info = PeerInfo::new(&identity, "laptop").unwrap();
        assert_eq!(info.peer_id, identity.peer_id());
        info.verify().unwrap();
    }

    #[test]
    fn test_tampered_name_fails() {
        let identity = DeviceIdentity::from_seed(&[3; 32]);
        let mut info = PeerInfo::new(&identity, "laptop").unwrap();
        info.device_name = "phone".into();
        assert!(matches!(info.verify(), Err(CoreError::InvalidSignature)));
    }

    #[test]
    fn test_swapped_keys_fail() {
        let a = DeviceIdentity::from_seed(&[3; 32]);
        let b = DeviceIdentity::from_seed(&[4; 32]);
        let mut info = PeerInfo::new(&a, "laptop").unwrap();
        info.keys = b.public_keys();
        assert!(matches!(info.verify(), Err(CoreError::PeerIdMismatch { .. })));
    }
}
