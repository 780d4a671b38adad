//! Strong type definitions for SOS.
//!
//! All identifiers are newtypes to prevent misuse at compile time.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;

/// A 32-byte Blake3 digest.
///
/// Identifies a keychain item (hash of its blob) or a manifest (hash of its
/// sorted entry list).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    /// Compute the Blake3 digest of the given data.
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// The zero digest (sentinel).
    pub const ZERO: Self = Self([0u8; 32]);
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for Digest {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for Digest {
    type Error = std::array::TryFromSliceError;

    fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
        let arr: [u8; 32] = slice.try_into()?;
        Ok(Self(arr))
    }
}

/// An opaque keychain item blob.
///
/// The item store encrypts items before they reach the engine, so the sync
/// layer only ever sees ciphertext. Identity is the digest of the blob.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Item(Bytes);

impl Item {
    /// Wrap a blob.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }

    /// The content digest of this item.
    pub fn digest(&self) -> Digest {
        Digest::of(&self.0)
    }

    /// Get the raw blob.
    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }

    /// Blob length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the blob is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Item({}, {} bytes)", self.digest(), self.0.len())
    }
}

impl From<Vec<u8>> for Item {
    fn from(data: Vec<u8>) -> Self {
        Self(Bytes::from(data))
    }
}

impl From<&'static [u8]> for Item {
    fn from(data: &'static [u8]) -> Self {
        Self(Bytes::from_static(data))
    }
}

/// Length of a peer identifier in hex characters.
pub const PEER_ID_LEN: usize = 32;

/// A peer identifier: 32 lowercase hex characters.
///
/// Derived from the peer's signing key (see [`crate::crypto::PublicSigningKey::peer_id`]),
/// so the alphabet never contains the KVS key delimiter.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    /// Parse and validate a peer identifier.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        if s.len() != PEER_ID_LEN {
            return Err(CoreError::InvalidPeerId(format!(
                "expected {} characters, got {}",
                PEER_ID_LEN,
                s.len()
            )));
        }
        if !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(CoreError::InvalidPeerId(format!("non-hex character in {:?}", s)));
        }
        Ok(Self(s.to_owned()))
    }

    /// Build from the first 16 bytes of a key-derived hash.
    pub(crate) fn from_hash(hash: &[u8; 32]) -> Self {
        Self(hex::encode(&hash[..PEER_ID_LEN / 2]))
    }

    /// View as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", &self.0[..8])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PeerId {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.0
    }
}

impl std::str::FromStr for PeerId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_hex_roundtrip() {
        let d = Digest::from_bytes([0x42; 32]);
        let recovered = Digest::from_hex(&d.to_hex()).unwrap();
        assert_eq!(d, recovered);
    }

    #[test]
    fn test_digest_display() {
        let d = Digest::from_bytes([0xab; 32]);
        assert_eq!(format!("{}", d), "abababababababab");
    }

    #[test]
    fn test_item_digest_is_content_address() {
        let a = Item::new(b"password-1".to_vec());
        let b = Item::new(b"password-1".to_vec());
        let c = Item::new(b"password-2".to_vec());
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn test_peer_id_validation() {
        assert!(PeerId::parse("0123456789abcdef0123456789abcdef").is_ok());
        assert!(PeerId::parse("0123456789ABCDEF0123456789abcdef").is_err());
        assert!(PeerId::parse("0123456789abcdef-123456789abcdef").is_err());
        assert!(PeerId::parse("abc").is_err());
    }

    #[test]
    fn test_peer_id_serde_validates() {
        let ok: PeerId = serde_json::from_str("\"0123456789abcdef0123456789abcdef\"").unwrap();
        assert_eq!(ok.as_str(), "0123456789abcdef0123456789abcdef");

        let bad: Result<PeerId, _> = serde_json::from_str("\"not-a-peer\"");
        assert!(bad.is_err());
    }
}
