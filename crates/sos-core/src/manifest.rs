//! Manifest: a sorted, content-addressed set of item digests.
//!
//! A manifest describes "what items exist" in a view. Two manifests can be
//! diffed into a minimal add/remove delta, and a delta applied to a manifest
//! reproduces the other side exactly.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::error::CoreError;
use crate::types::Digest;

/// Domain prefix for manifest digests.
const MANIFEST_DOMAIN: &[u8] = b"sos-manifest-v0:";

/// An immutable, strictly ordered set of item digests.
#[derive(Clone, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<Digest>,
    digest: Digest,
}

/// The difference between two manifests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestDelta {
    /// Digests present in the target but not the base (sorted).
    pub added: Vec<Digest>,
    /// Digests present in the base but not the target (sorted).
    pub removed: Vec<Digest>,
}

impl ManifestDelta {
    /// Whether the delta changes nothing.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Number of edits in the delta.
    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len()
    }
}

impl Manifest {
    /// Build a manifest from any collection of digests.
    ///
    /// Sorts and deduplicates the input.
    pub fn new(digests: impl IntoIterator<Item = Digest>) -> Self {
        let mut entries: Vec<Digest> = digests.into_iter().collect();
        entries.sort_unstable();
        entries.dedup();
        Self::from_entries(entries)
    }

    /// The empty manifest.
    pub fn empty() -> Self {
        Self::from_entries(Vec::new())
    }

    /// Build from digests that must already be strictly ascending.
    pub fn from_sorted(entries: Vec<Digest>) -> Result<Self, CoreError> {
        if let Some(i) = entries.windows(2).position(|w| w[0] >= w[1]) {
            return Err(CoreError::UnsortedManifest(i + 1));
        }
        Ok(Self::from_entries(entries))
    }

    fn from_entries(entries: Vec<Digest>) -> Self {
        let digest = compute_digest(&entries);
        Self { entries, digest }
    }

    /// The content identity of this manifest.
    pub fn digest(&self) -> Digest {
        self.digest
    }

    /// Whether the manifest contains an item digest.
    pub fn contains(&self, digest: &Digest) -> bool {
        self.entries.binary_search(digest).is_ok()
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the manifest has no items.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over item digests in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = &Digest> {
        self.entries.iter()
    }

    /// The sorted entries.
    pub fn entries(&self) -> &[Digest] {
        &self.entries
    }

    /// Compute the delta that turns `a` into `b`.
    ///
    /// Two-pointer merge over the sorted entry lists.
    pub fn diff(a: &Manifest, b: &Manifest) -> ManifestDelta {
        let mut delta = ManifestDelta::default();
        if a.digest == b.digest {
            return delta;
        }

        let (mut i, mut j) = (0, 0);
        while i < a.entries.len() && j < b.entries.len() {
            match a.entries[i].cmp(&b.entries[j]) {
                Ordering::Less => {
                    delta.removed.push(a.entries[i]);
                    i += 1;
                }
                Ordering::Greater => {
                    delta.added.push(b.entries[j]);
                    j += 1;
                }
                Ordering::Equal => {
                    i += 1;
                    j += 1;
                }
            }
        }
        delta.removed.extend_from_slice(&a.entries[i..]);
        delta.added.extend_from_slice(&b.entries[j..]);
        delta
    }

    /// Apply a delta: `(self \ removed) ∪ added`.
    pub fn apply(&self, delta: &ManifestDelta) -> Manifest {
        if delta.is_empty() {
            return self.clone();
        }

        let mut removed = delta.removed.clone();
        removed.sort_unstable();
        let mut added = delta.added.clone();
        added.sort_unstable();
        added.dedup();

        let kept = self
            .entries
            .iter()
            .filter(|d| removed.binary_search(d).is_err())
            .copied();

        // Merge two sorted runs, skipping entries present in both.
        let mut out = Vec::with_capacity(self.entries.len() + added.len());
        let mut added_iter = added.into_iter().peekable();
        for d in kept {
            while let Some(a) = added_iter.peek() {
                match a.cmp(&d) {
                    Ordering::Less => {
                        out.push(*a);
                        added_iter.next();
                    }
                    Ordering::Equal => {
                        added_iter.next();
                    }
                    Ordering::Greater => break,
                }
            }
            out.push(d);
        }
        out.extend(added_iter);

        Self::from_entries(out)
    }

    /// Serialize to CBOR bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CoreError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| CoreError::EncodingError(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize from CBOR bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        ciborium::from_reader(bytes).map_err(|e| CoreError::DecodingError(e.to_string()))
    }
}

fn compute_digest(entries: &[Digest]) -> Digest {
    let mut hasher = blake3::Hasher::new();
    hasher.update(MANIFEST_DOMAIN);
    hasher.update(&(entries.len() as u64).to_be_bytes());
    for d in entries {
        hasher.update(&d.0);
    }
    Digest(*hasher.finalize().as_bytes())
}

impl fmt::Debug for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Manifest({}, {} items)", self.digest, self.entries.len())
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self::empty()
    }
}

impl FromIterator<Digest> for Manifest {
    fn from_iter<I: IntoIterator<Item = Digest>>(iter: I) -> Self {
        Self::new(iter)
    }
}

// Only the entry list goes over the wire; the digest is recomputed and the
// ordering re-validated on decode.
impl Serialize for Manifest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.entries.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Manifest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries = Vec::<Digest>::deserialize(deserializer)?;
        Manifest::from_sorted(entries).map_err(serde::de::Error::custom)
    }
}
