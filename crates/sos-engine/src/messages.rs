//! Engine payloads carried inside coder data messages.

use serde::{Deserialize, Serialize};

use sos_core::{Digest, Item, Manifest, ManifestDelta};

use crate::error::{EngineError, Result};

/// Current payload version.
pub const PROTOCOL_VERSION: u8 = 0;

/// One reconciliation step from a sender to a receiver.
///
/// With a `base`, the payload is a delta: the receiver rebuilds the sender's
/// manifest as `base.apply(added, removed)` and checks it against
/// `manifest`. Without one it is a full snapshot, which only ever adds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPayload {
    pub version: u8,
    /// Digest of the sender's current local manifest.
    pub manifest: Digest,
    /// Sender manifest the receiver last acknowledged. `None` = full snapshot.
    pub base: Option<Digest>,
    /// Items to add, with their content.
    pub added: Vec<Item>,
    /// Digests to remove (always empty in a full snapshot).
    pub removed: Vec<Digest>,
    /// Digest of the receiver's manifest as the sender last reconstructed it.
    pub ack: Option<Digest>,
    /// The sender cannot reconstruct our manifest and wants a full snapshot.
    pub request_full: bool,
}

impl SyncPayload {
    /// Whether this payload is a full snapshot.
    pub fn is_full(&self) -> bool {
        self.base.is_none()
    }

    /// The manifest delta described by this payload.
    pub fn delta(&self) -> ManifestDelta {
        ManifestDelta {
            added: self.added.iter().map(Item::digest).collect(),
            removed: self.removed.clone(),
        }
    }

    /// Rebuild the sender's manifest, given the base it names.
    ///
    /// Returns `None` if the result does not hash to `manifest`.
    pub fn reconstruct(&self, base: Option<&Manifest>) -> Option<Manifest> {
        let rebuilt = match base {
            Some(base) => base.apply(&self.delta()),
            None => Manifest::new(self.added.iter().map(Item::digest)),
        };
        (rebuilt.digest() == self.manifest).then_some(rebuilt)
    }

    /// Serialize to CBOR bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| EngineError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize from CBOR bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let payload: Self =
            ciborium::from_reader(bytes).map_err(|e| EngineError::Serialization(e.to_string()))?;
        if payload.version != PROTOCOL_VERSION {
            return Err(EngineError::Serialization(format!(
                "unsupported payload version {}",
                payload.version
            )));
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(s: &str) -> Item {
        Item::from(s.as_bytes().to_vec())
    }

    #[test]
    fn test_full_snapshot_reconstructs() {
        let items = vec![item("x"), item("y")];
        let manifest = Manifest::new(items.iter().map(Item::digest));
        let payload = SyncPayload {
            version: PROTOCOL_VERSION,
            manifest: manifest.digest(),
            base: None,
            added: items,
            removed: vec![],
            ack: None,
            request_full: false,
        };
        assert!(payload.is_full());
        assert_eq!(payload.reconstruct(None), Some(manifest));
    }

    #[test]
    fn test_delta_reconstructs_against_base() {
        let base = Manifest::new([item("x").digest(), item("gone").digest()]);
        let target = Manifest::new([item("x").digest(), item("new").digest()]);
        let payload = SyncPayload {
            version: PROTOCOL_VERSION,
            manifest: target.digest(),
            base: Some(base.digest()),
            added: vec![item("new")],
            removed: vec![item("gone").digest()],
            ack: None,
            request_full: false,
        };
        assert_eq!(payload.reconstruct(Some(&base)), Some(target));
        assert_eq!(payload.reconstruct(Some(&Manifest::empty())), None);
    }

    #[test]
    fn test_version_checked() {
        let payload = SyncPayload {
            version: 9,
            manifest: Digest::ZERO,
            base: None,
            added: vec![],
            removed: vec![],
            ack: None,
            request_full: true,
        };
        assert!(SyncPayload::from_bytes(&payload.to_bytes().unwrap()).is_err());
    }
}
