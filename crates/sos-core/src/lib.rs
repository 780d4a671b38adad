//! # SOS Core
//!
//! Pure primitives for Secure Object Sync: item and manifest digests, peer
//! identity, circles, and canonicalization.
//!
//! This crate contains no I/O, no storage, no networking. It is pure computation
//! over cryptographic data structures.
//!
//! ## Key Types
//!
//! - [`Manifest`] - Sorted, diffable set of item digests
//! - [`ManifestCache`] - Process-wide, reference-counted manifest interning
//! - [`Circle`] - Signed membership snapshot with a generation counter
//! - [`PeerInfo`] - A device's self-signed public description
//! - [`DeviceIdentity`] - Secret key material (signing + agreement)
//!
//! ## Canonicalization
//!
//! Signed structures are encoded using deterministic CBOR. See [`canonical`] module.

pub mod canonical;
pub mod circle;
pub mod crypto;
pub mod error;
pub mod manifest;
pub mod manifest_cache;
pub mod peer;
pub mod types;

pub use canonical::encode_canonical;
pub use circle::{
    apply_circle_update, Circle, CircleDecision, KeyParameters, PeerStatus, RetirementTicket,
};
pub use crypto::{AgreementPublicKey, DeviceIdentity, PeerKeys, PublicSigningKey, Signature};
pub use error::{CircleError, CoreError};
pub use manifest::{Manifest, ManifestDelta};
pub use manifest_cache::ManifestCache;
pub use peer::PeerInfo;
pub use types::{Digest, Item, PeerId, PEER_ID_LEN};
